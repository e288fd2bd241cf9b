//! LoRa to MQTT gateway
//!
//! A bridge device for nodes that only have a LoRa radio. It joins the MQTT
//! broker over WiFi like any node, then relays in both directions:
//!
//! ```text
//! LoRa node ──packet──► gateway ──publish──► boards/<device>/confirmation  (has "status")
//!                                        └─► boards/registry               (anything else)
//!
//! operator ──boards/<device>──► gateway ──packet {"Device":"<device>",...}──► LoRa nodes
//! ```
//!
//! Every LoRa packet must be a JSON object naming its sender in `Device`. The
//! gateway subscribes to a device's update topic the first time it hears from
//! it, and re-subscribes all known devices whenever the session comes back.

use crate::communication::link::{Link, LinkEvent, LinkEventChannel, SessionControl, WifiRadio};
use crate::communication::topics::{
    confirmation_topic, device_from_topic, update_topic, Topic, REGISTRY_TOPIC,
};
use crate::communication::transport::{
    ConnectOptions, LoRaInboundChannel, LoRaPacket, LoRaRadio, LoRaTransport, MqttSession, Qos,
    Route, Transport, TransportError,
};
use crate::node::NodeError;
use crate::parameters::network::{BrokerConfig, DeviceName, LoRaConfig, NodeConfig, WifiCredentials};
use crate::{log_debug, log_error, log_info, log_warn};
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::mutex::Mutex;
use embedded_hal_async::delay::DelayNs;
use serde_json::{Map, Value};

/// MQTT client id of the gateway
pub const GATEWAY_CLIENT_ID: &str = "LoRaGatewayDevice";

/// Devices the gateway tracks subscriptions for
pub const MAX_GATEWAY_DEVICES: usize = 16;

/// Relay failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GatewayError {
    /// Payload is not a JSON object
    NotJson,
    /// LoRa packet without a string `Device`
    MissingDevice,
    /// Device name exceeds the device name length
    DeviceNameTooLong,
    /// Forwarded packet would not fit a LoRa frame
    PacketTooLarge,
    /// Publish or transmit failed
    Relay(TransportError),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::NotJson => write!(f, "payload is not a JSON object"),
            GatewayError::MissingDevice => write!(f, "packet has no Device"),
            GatewayError::DeviceNameTooLong => write!(f, "device name too long"),
            GatewayError::PacketTooLarge => write!(f, "packet too large for LoRa"),
            GatewayError::Relay(e) => write!(f, "relay failed: {}", e),
        }
    }
}

impl From<TransportError> for GatewayError {
    fn from(error: TransportError) -> Self {
        GatewayError::Relay(error)
    }
}

/// Where a LoRa packet was published
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relayed {
    pub device: DeviceName,
    /// `Confirmation` for acknowledgments, `Registry` for everything else
    pub route: Route,
}

/// Bridge between a LoRa radio and an MQTT session
pub struct LoRaMqttGateway<M: RawMutex, S: MqttSession, R: LoRaRadio> {
    broker: BrokerConfig,
    wifi: WifiCredentials,
    retry_interval_ms: u32,
    qos: Qos,
    session: Mutex<M, S>,
    radio: Mutex<M, LoRaTransport<R>>,
    devices: Mutex<M, heapless::Vec<DeviceName, MAX_GATEWAY_DEVICES>>,
    link: Link<M>,
    lora_inbound: LoRaInboundChannel<M>,
}

impl<M: RawMutex, S: MqttSession, R: LoRaRadio> LoRaMqttGateway<M, S, R> {
    /// Bring the radio up and take the network settings from `config`
    ///
    /// The device name in `config` is not used; the gateway connects as
    /// [`GATEWAY_CLIENT_ID`].
    pub fn new(config: &NodeConfig, session: S, radio: R, lora: &LoRaConfig) -> Result<Self, NodeError> {
        let radio = LoRaTransport::begin(radio, lora).map_err(|e| {
            log_error!("Gateway LoRa init failed: {:?}", e);
            NodeError::RadioInit
        })?;

        Ok(Self {
            broker: config.broker.clone(),
            wifi: config.wifi.clone(),
            retry_interval_ms: config.retry_interval_ms,
            qos: config.qos,
            session: Mutex::new(session),
            radio: Mutex::new(radio),
            devices: Mutex::new(heapless::Vec::new()),
            link: Link::new(),
            lora_inbound: Channel::new(),
        })
    }

    pub fn session(&self) -> &Mutex<M, S> {
        &self.session
    }

    pub fn radio(&self) -> &Mutex<M, LoRaTransport<R>> {
        &self.radio
    }

    pub fn link_events(&self) -> &LinkEventChannel<M> {
        self.link.events()
    }

    pub fn lora_inbound(&self) -> &LoRaInboundChannel<M> {
        &self.lora_inbound
    }

    /// Devices heard from so far
    pub async fn known_devices(&self) -> heapless::Vec<DeviceName, MAX_GATEWAY_DEVICES> {
        self.devices.lock().await.clone()
    }

    /// Publish one LoRa packet to MQTT
    pub async fn handle_lora_packet(&self, packet: &[u8]) -> Result<Relayed, GatewayError> {
        let object = parse_object(packet)?;
        let device = match object.get("Device") {
            Some(Value::String(name)) => {
                DeviceName::try_from(name.as_str()).map_err(|_| GatewayError::DeviceNameTooLong)?
            }
            _ => {
                log_warn!("Rejecting LoRa packet without Device");
                return Err(GatewayError::MissingDevice);
            }
        };

        self.track_device(&device).await;

        let route = if object.contains_key("status") {
            Route::Confirmation
        } else {
            Route::Registry
        };
        let topic = match route {
            Route::Confirmation => confirmation_topic(&device),
            _ => registry_topic(),
        };

        let mut session = self.session.lock().await;
        if !session.is_connected() {
            return Err(GatewayError::Relay(TransportError::Unusable));
        }
        if let Err(e) = session
            .publish(&topic, packet, self.qos, route == Route::Registry)
            .await
        {
            log_warn!("Gateway publish to {} failed: {:?}", topic.as_str(), e);
            let error = if session.is_connected() {
                TransportError::Io
            } else {
                self.link.post(LinkEvent::SessionLost);
                TransportError::Disconnected
            };
            return Err(error.into());
        }

        log_debug!("Relayed LoRa packet from {} to {}", device.as_str(), topic.as_str());
        Ok(Relayed { device, route })
    }

    /// Forward an MQTT update to the LoRa nodes
    ///
    /// Returns `Ok(false)` for topics other than a device update topic.
    pub async fn handle_mqtt_message(&self, topic: &str, payload: &[u8]) -> Result<bool, GatewayError> {
        let Some(device) = device_from_topic(topic) else {
            return Ok(false);
        };
        let device = DeviceName::try_from(device).map_err(|_| GatewayError::DeviceNameTooLong)?;
        if update_topic(&device).as_str() != topic {
            return Ok(false);
        }

        let object = parse_object(payload)?;
        let packet = if object.contains_key("Device") {
            payload.to_vec()
        } else {
            inject_device(payload, &device)?
        };

        let mut radio = self.radio.lock().await;
        match radio.send(Route::Confirmation, &packet).await {
            Ok(()) => {
                log_debug!("Forwarded update for {} over LoRa", device.as_str());
                Ok(true)
            }
            Err(TransportError::PayloadTooLarge) => Err(GatewayError::PacketTooLarge),
            Err(e) => Err(e.into()),
        }
    }

    /// Queue a received LoRa packet for [`LoRaMqttGateway::run_lora_inbound`]
    pub fn post_lora_packet(&self, bytes: &[u8]) -> bool {
        match LoRaPacket::from_slice(bytes) {
            Ok(packet) => self.lora_inbound.try_send(packet).is_ok(),
            Err(_) => false,
        }
    }

    /// Relay the next queued LoRa packet
    pub async fn process_lora_packet(&self) -> Result<Relayed, GatewayError> {
        let packet = self.lora_inbound.receive().await;
        self.handle_lora_packet(&packet).await
    }

    pub async fn run_lora_inbound(&self) -> ! {
        loop {
            if let Err(e) = self.process_lora_packet().await {
                log_warn!("LoRa packet not relayed: {}", e);
            }
        }
    }

    /// WiFi and MQTT retry loops for the gateway's own link
    pub async fn run_connectivity<W: WifiRadio, D: DelayNs>(&self, wifi: &mut W, delay: &mut D) -> ! {
        self.link
            .supervise(wifi, self, &self.wifi, delay, self.retry_interval_ms)
            .await
    }

    /// Remember `device` and subscribe to its update topic once
    async fn track_device(&self, device: &DeviceName) {
        let mut devices = self.devices.lock().await;
        if devices.contains(device) {
            return;
        }

        let mut session = self.session.lock().await;
        if !session.is_connected() {
            return;
        }
        if let Err(e) = session.subscribe(&update_topic(device), self.qos).await {
            log_warn!("Subscribe for {} failed: {:?}", device.as_str(), e);
            return;
        }
        if devices.push(device.clone()).is_err() {
            log_warn!("Device table full, {} will not be re-subscribed", device.as_str());
        } else {
            log_info!("Gateway now serving {}", device.as_str());
        }
    }
}

impl<M: RawMutex, S: MqttSession, R: LoRaRadio> SessionControl for LoRaMqttGateway<M, S, R> {
    async fn session_connected(&self) -> bool {
        self.session.lock().await.is_connected()
    }

    async fn reconnect_session(&self) -> Result<(), TransportError> {
        let devices = self.devices.lock().await;
        let mut session = self.session.lock().await;

        let options = ConnectOptions::new(GATEWAY_CLIENT_ID, &self.broker);
        if let Err(e) = session.connect(&options).await {
            log_warn!("Gateway MQTT connect failed: {:?}", e);
            return Err(TransportError::Disconnected);
        }
        for device in devices.iter() {
            if let Err(e) = session.subscribe(&update_topic(device), self.qos).await {
                log_warn!("Re-subscribe for {} failed: {:?}", device.as_str(), e);
                return Err(TransportError::Io);
            }
        }
        Ok(())
    }

    async fn on_session_established(&self) {
        log_info!("Gateway connected to {}:{}", self.broker.host.as_str(), self.broker.port);
    }
}

fn parse_object(payload: &[u8]) -> Result<Map<String, Value>, GatewayError> {
    serde_json::from_slice(payload).map_err(|_| GatewayError::NotJson)
}

fn registry_topic() -> Topic {
    let mut topic = Topic::new();
    // Fits: REGISTRY_TOPIC is shorter than any device topic
    let _ = topic.push_str(REGISTRY_TOPIC);
    topic
}

/// Prepend `"Device":"<device>"` to a JSON object, leaving the rest untouched
///
/// Works on the text so member order is kept exactly as sent.
fn inject_device(payload: &[u8], device: &DeviceName) -> Result<Vec<u8>, GatewayError> {
    let text = core::str::from_utf8(payload).map_err(|_| GatewayError::NotJson)?;
    let body = text
        .trim_start()
        .strip_prefix('{')
        .ok_or(GatewayError::NotJson)?;
    let name = serde_json::to_string(device.as_str()).map_err(|_| GatewayError::NotJson)?;

    let mut packet = Vec::with_capacity(payload.len() + name.len() + 12);
    packet.extend_from_slice(b"{\"Device\":");
    packet.extend_from_slice(name.as_bytes());
    if !body.trim_start().starts_with('}') {
        packet.push(b',');
    }
    packet.extend_from_slice(body.as_bytes());
    Ok(packet)
}
