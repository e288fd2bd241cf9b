//! Node Configuration
//!
//! Construction-time configuration for a node: device identity, WiFi
//! credentials, MQTT broker, LoRa radio wiring and timing.
//!
//! # Build-time Defaults
//!
//! [`NodeConfig::from_build_env`] reads defaults baked in by `build.rs`:
//!
//! - `DEVICE_NAME` - Device identity (default `fieldlink-node`)
//! - `WIFI_SSID` / `WIFI_PASSWORD` - WiFi credentials
//! - `MQTT_HOST` / `MQTT_PORT` - Broker address (port default 1883)
//! - `MQTT_USER` / `MQTT_PASSWORD` - Broker credentials
//! - `MQTT_LOG` - Publish device log lines remotely (`true`/`false`)
//!
//! # Network Parameters
//!
//! The WiFi and broker settings can also be exposed as runtime parameters
//! (`NET_SSID`, `NET_PASS`, `MQTT_HOST`, `MQTT_PORT`, `MQTT_USER`, `MQTT_PASS`)
//! so an operator can move a device to another network remotely. Passwords are
//! registered HIDDEN and never appear in catalogue broadcasts. See
//! [`NetworkParams`], or `ParamNode::add_network_params` to register them on a
//! running node.

use super::registry::{ParameterRegistry, RegistryError};
use super::storage::PersistentStore;
use super::value::{ParamFlags, ParamString, ParamValue};
use crate::communication::transport::Qos;
use core::fmt;
use heapless::String;

/// Maximum device name length
pub const DEVICE_NAME_LEN: usize = 32;

/// Maximum SSID length (IEEE 802.11 standard)
pub const MAX_SSID_LEN: usize = 32;

/// Maximum WiFi password length (WPA2 standard)
pub const MAX_PASSWORD_LEN: usize = 63;

/// Maximum broker host name length
pub const MAX_HOST_LEN: usize = 63;

/// Maximum broker user name / password length
pub const MAX_CREDENTIAL_LEN: usize = 63;

/// Default MQTT broker port
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Default reconnect interval for WiFi and MQTT
pub const DEFAULT_RETRY_INTERVAL_MS: u32 = 5000;

/// Default catalogue heartbeat interval
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u32 = 60_000;

/// Device identity string
pub type DeviceName = String<DEVICE_NAME_LEN>;

/// Which transport a node runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportMode {
    /// MQTT session over WiFi
    Mqtt,
    /// Local LoRa radio
    LoRa,
}

/// Configuration errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    /// Device name is empty
    EmptyDeviceName,
    /// MQTT mode without a broker host
    EmptyBrokerHost,
    /// MQTT mode without a WiFi SSID
    EmptySsid,
    /// A field exceeds its capacity
    ValueTooLong(&'static str),
    /// Port is not a valid u16
    InvalidPort,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::EmptyDeviceName => write!(f, "device name is empty"),
            ConfigError::EmptyBrokerHost => write!(f, "broker host is empty"),
            ConfigError::EmptySsid => write!(f, "WiFi SSID is empty"),
            ConfigError::ValueTooLong(field) => write!(f, "{} is too long", field),
            ConfigError::InvalidPort => write!(f, "invalid broker port"),
        }
    }
}

/// WiFi credentials
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WifiCredentials {
    pub ssid: String<MAX_SSID_LEN>,
    pub password: String<MAX_PASSWORD_LEN>,
}

impl WifiCredentials {
    pub fn new(ssid: &str, password: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            ssid: bounded(ssid, "ssid")?,
            password: bounded(password, "wifi password")?,
        })
    }

    /// Returns true if an SSID is set
    pub fn is_configured(&self) -> bool {
        !self.ssid.is_empty()
    }
}

/// MQTT broker address and credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub host: String<MAX_HOST_LEN>,
    pub port: u16,
    pub username: String<MAX_CREDENTIAL_LEN>,
    pub password: String<MAX_CREDENTIAL_LEN>,
}

impl BrokerConfig {
    pub fn new(host: &str, port: u16, username: &str, password: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            host: bounded(host, "broker host")?,
            port,
            username: bounded(username, "broker user")?,
            password: bounded(password, "broker password")?,
        })
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_MQTT_PORT,
            username: String::new(),
            password: String::new(),
        }
    }
}

/// LoRa module pin mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LoRaPins {
    pub sck: u8,
    pub miso: u8,
    pub mosi: u8,
    pub ss: u8,
    pub rst: u8,
    pub dio0: u8,
}

/// LoRa radio bring-up parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LoRaConfig {
    /// Carrier frequency in Hz
    pub frequency_hz: u32,
    pub pins: LoRaPins,
}

impl Default for LoRaConfig {
    /// 915 MHz band, wiring of the common SX1276 ESP32 boards
    fn default() -> Self {
        Self {
            frequency_hz: 915_000_000,
            pins: LoRaPins {
                sck: 5,
                miso: 19,
                mosi: 27,
                ss: 18,
                rst: 14,
                dio0: 26,
            },
        }
    }
}

/// Everything a node needs at construction
#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    /// Device identity; names the per-device topics and tags every ack
    pub device_name: DeviceName,
    pub wifi: WifiCredentials,
    pub broker: BrokerConfig,
    /// Publish log lines on `boards/<device>/log` instead of only logging locally
    pub mqtt_log: bool,
    pub retry_interval_ms: u32,
    pub heartbeat_interval_ms: u32,
    pub qos: Qos,
}

impl NodeConfig {
    /// Configuration with default timing and no network credentials
    pub fn new(device_name: &str) -> Result<Self, ConfigError> {
        if device_name.is_empty() {
            return Err(ConfigError::EmptyDeviceName);
        }

        Ok(Self {
            device_name: bounded(device_name, "device name")?,
            wifi: WifiCredentials::default(),
            broker: BrokerConfig::default(),
            mqtt_log: false,
            retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            qos: Qos::ExactlyOnce,
        })
    }

    /// Configuration from the defaults baked in at build time
    pub fn from_build_env() -> Result<Self, ConfigError> {
        let port = env!("MQTT_PORT")
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort)?;

        let mut config = Self::new(env!("DEVICE_NAME"))?
            .with_wifi(env!("WIFI_SSID"), env!("WIFI_PASSWORD"))?
            .with_broker(env!("MQTT_HOST"), port, env!("MQTT_USER"), env!("MQTT_PASSWORD"))?;
        config.mqtt_log = parse_bool(env!("MQTT_LOG")).unwrap_or(false);
        Ok(config)
    }

    pub fn with_wifi(mut self, ssid: &str, password: &str) -> Result<Self, ConfigError> {
        self.wifi = WifiCredentials::new(ssid, password)?;
        Ok(self)
    }

    pub fn with_broker(
        mut self,
        host: &str,
        port: u16,
        username: &str,
        password: &str,
    ) -> Result<Self, ConfigError> {
        self.broker = BrokerConfig::new(host, port, username, password)?;
        Ok(self)
    }

    pub fn with_mqtt_log(mut self, enabled: bool) -> Self {
        self.mqtt_log = enabled;
        self
    }

    /// Check the fields `mode` depends on
    pub fn validate(&self, mode: TransportMode) -> Result<(), ConfigError> {
        if self.device_name.is_empty() {
            return Err(ConfigError::EmptyDeviceName);
        }
        if mode == TransportMode::Mqtt {
            if !self.wifi.is_configured() {
                return Err(ConfigError::EmptySsid);
            }
            if self.broker.host.is_empty() {
                return Err(ConfigError::EmptyBrokerHost);
            }
        }
        Ok(())
    }
}

/// Network settings exposed as runtime parameters
pub struct NetworkParams;

impl NetworkParams {
    /// Register the network parameters, seeded from `config`
    ///
    /// Persisted values win over `config`, like any other parameter. Call
    /// [`NetworkParams::apply_to`] afterwards to pick them up.
    pub fn register<S: PersistentStore>(
        registry: &mut ParameterRegistry<S>,
        config: &NodeConfig,
    ) -> Result<(), RegistryError> {
        registry.register_with_flags("NET_SSID", param_string(&config.wifi.ssid)?, ParamFlags::empty())?;
        registry.register_with_flags("NET_PASS", param_string(&config.wifi.password)?, ParamFlags::HIDDEN)?;
        registry.register_with_flags("MQTT_HOST", param_string(&config.broker.host)?, ParamFlags::empty())?;
        registry.register_with_flags("MQTT_PORT", i32::from(config.broker.port), ParamFlags::empty())?;
        registry.register_with_flags("MQTT_USER", param_string(&config.broker.username)?, ParamFlags::empty())?;
        registry.register_with_flags("MQTT_PASS", param_string(&config.broker.password)?, ParamFlags::HIDDEN)?;
        Ok(())
    }

    /// Overwrite `config` with the current network parameter values
    ///
    /// Values that do not fit their config field are left as they are.
    pub fn apply_to<S: PersistentStore>(registry: &ParameterRegistry<S>, config: &mut NodeConfig) {
        copy_str(registry, "NET_SSID", &mut config.wifi.ssid);
        copy_str(registry, "NET_PASS", &mut config.wifi.password);
        copy_str(registry, "MQTT_HOST", &mut config.broker.host);
        copy_str(registry, "MQTT_USER", &mut config.broker.username);
        copy_str(registry, "MQTT_PASS", &mut config.broker.password);

        if let Some(ParamValue::Int(port)) = registry.value("MQTT_PORT") {
            if let Ok(port) = u16::try_from(*port) {
                config.broker.port = port;
            }
        }
    }
}

fn copy_str<S: PersistentStore, const N: usize>(
    registry: &ParameterRegistry<S>,
    name: &str,
    target: &mut String<N>,
) {
    if let Some(ParamValue::Str(value)) = registry.value(name) {
        if let Ok(value) = String::try_from(value.as_str()) {
            *target = value;
        }
    }
}

fn param_string(value: &str) -> Result<ParamString, RegistryError> {
    ParamString::try_from(value).map_err(|_| RegistryError::ValueTooLong)
}

fn bounded<const N: usize>(value: &str, field: &'static str) -> Result<String<N>, ConfigError> {
    String::try_from(value).map_err(|_| ConfigError::ValueTooLong(field))
}

fn parse_bool(s: &str) -> Option<bool> {
    match s {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}
