//! Mock transports and drivers for testing
//!
//! - [`MockTransport`] records every [`Route`]-addressed send
//! - [`MockSession`] stands in for an external MQTT client
//! - [`MockRadio`] stands in for a LoRa radio driver

use super::lora::LoRaRadio;
use super::mqtt::{ConnectOptions, MqttSession, Qos};
use super::{Route, Transport, TransportError};
use crate::parameters::network::LoRaConfig;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

/// Error returned by the mock drivers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockError;

/// One message accepted by [`MockTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub route: Route,
    pub payload: Vec<u8>,
}

/// Mock transport
///
/// Usable by default, carries every route, and records sends in order.
#[derive(Debug)]
pub struct MockTransport {
    usable: bool,
    carries_log: bool,
    sent: Vec<SentMessage>,
    unusable_after: Option<usize>,
    send_error: Option<TransportError>,
    reconnect_result: Result<(), TransportError>,
    reconnect_attempts: u32,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            usable: true,
            carries_log: true,
            sent: Vec::new(),
            unusable_after: None,
            send_error: None,
            reconnect_result: Ok(()),
            reconnect_attempts: 0,
        }
    }

    pub fn set_usable(&mut self, usable: bool) {
        self.usable = usable;
    }

    /// Stop carrying `Route::Log`, like a LoRa link
    pub fn set_carries_log(&mut self, carries: bool) {
        self.carries_log = carries;
    }

    /// Become unusable once `count` messages have been sent
    pub fn go_unusable_after(&mut self, count: usize) {
        self.unusable_after = Some(count);
    }

    /// Fail every send with `error` until cleared
    pub fn set_send_error(&mut self, error: Option<TransportError>) {
        self.send_error = error;
    }

    /// Outcome of subsequent `reconnect()` calls
    pub fn set_reconnect_result(&mut self, result: Result<(), TransportError>) {
        self.reconnect_result = result;
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    /// Messages sent so far
    pub fn sent(&self) -> &[SentMessage] {
        &self.sent
    }

    /// Payloads sent on `route`, as text
    pub fn sent_payloads(&self, route: Route) -> Vec<String> {
        self.sent
            .iter()
            .filter(|m| m.route == route)
            .map(|m| String::from_utf8_lossy(&m.payload).into_owned())
            .collect()
    }

    pub fn clear_sent(&mut self) {
        self.sent.clear();
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn is_usable(&self) -> bool {
        self.usable
    }

    fn carries(&self, route: Route) -> bool {
        route != Route::Log || self.carries_log
    }

    async fn send(&mut self, route: Route, payload: &[u8]) -> Result<(), TransportError> {
        if !self.usable {
            return Err(TransportError::Unusable);
        }
        if let Some(error) = self.send_error {
            return Err(error);
        }

        self.sent.push(SentMessage {
            route,
            payload: payload.to_vec(),
        });

        if self.unusable_after.is_some_and(|n| self.sent.len() >= n) {
            self.usable = false;
        }
        Ok(())
    }

    async fn reconnect(&mut self) -> Result<(), TransportError> {
        self.reconnect_attempts += 1;
        if self.reconnect_result.is_ok() {
            self.usable = true;
        }
        self.reconnect_result
    }
}

/// One publish accepted by [`MockSession`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
    pub retain: bool,
}

/// Mock MQTT session
///
/// Starts disconnected; `connect` succeeds unless told otherwise.
#[derive(Debug)]
pub struct MockSession {
    connected: bool,
    connect_ok: bool,
    drop_on_publish: bool,
    connect_attempts: u32,
    last_client_id: Option<String>,
    subscriptions: Vec<String>,
    published: Vec<Published>,
}

impl MockSession {
    pub fn new() -> Self {
        Self {
            connected: false,
            connect_ok: true,
            drop_on_publish: false,
            connect_attempts: 0,
            last_client_id: None,
            subscriptions: Vec::new(),
            published: Vec::new(),
        }
    }

    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    pub fn set_connect_ok(&mut self, ok: bool) {
        self.connect_ok = ok;
    }

    /// Make the next publishes fail and drop the session
    pub fn drop_on_publish(&mut self, enabled: bool) {
        self.drop_on_publish = enabled;
    }

    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts
    }

    pub fn last_client_id(&self) -> Option<&str> {
        self.last_client_id.as_deref()
    }

    pub fn subscriptions(&self) -> &[String] {
        &self.subscriptions
    }

    pub fn published(&self) -> &[Published] {
        &self.published
    }

    /// Payloads published on `topic`, as text
    pub fn published_to(&self, topic: &str) -> Vec<String> {
        self.published
            .iter()
            .filter(|p| p.topic == topic)
            .map(|p| String::from_utf8_lossy(&p.payload).into_owned())
            .collect()
    }
}

impl Default for MockSession {
    fn default() -> Self {
        Self::new()
    }
}

impl MqttSession for MockSession {
    type Error = MockError;

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn connect(&mut self, options: &ConnectOptions<'_>) -> Result<(), MockError> {
        self.connect_attempts += 1;
        self.last_client_id = Some(options.client_id.to_string());
        if !self.connect_ok {
            return Err(MockError);
        }
        self.connected = true;
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str, _qos: Qos) -> Result<(), MockError> {
        if !self.connected {
            return Err(MockError);
        }
        if !self.subscriptions.iter().any(|t| t == topic) {
            self.subscriptions.push(topic.to_string());
        }
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: Qos,
        retain: bool,
    ) -> Result<(), MockError> {
        if self.drop_on_publish {
            self.connected = false;
            return Err(MockError);
        }
        if !self.connected {
            return Err(MockError);
        }
        self.published.push(Published {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
            retain,
        });
        Ok(())
    }
}

/// Mock LoRa radio
#[derive(Debug)]
pub struct MockRadio {
    begin_ok: bool,
    transmit_ok: bool,
    frequency_hz: Option<u32>,
    transmitted: Vec<Vec<u8>>,
}

impl MockRadio {
    pub fn new() -> Self {
        Self {
            begin_ok: true,
            transmit_ok: true,
            frequency_hz: None,
            transmitted: Vec::new(),
        }
    }

    pub fn set_begin_ok(&mut self, ok: bool) {
        self.begin_ok = ok;
    }

    pub fn set_transmit_ok(&mut self, ok: bool) {
        self.transmit_ok = ok;
    }

    /// Frequency passed to the last successful `begin`
    pub fn frequency_hz(&self) -> Option<u32> {
        self.frequency_hz
    }

    /// Packets transmitted so far
    pub fn transmitted(&self) -> &[Vec<u8>] {
        &self.transmitted
    }

    pub fn clear_transmitted(&mut self) {
        self.transmitted.clear();
    }

    /// Transmitted packets as text
    pub fn transmitted_text(&self) -> Vec<String> {
        self.transmitted
            .iter()
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .collect()
    }
}

impl Default for MockRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl LoRaRadio for MockRadio {
    type Error = MockError;

    fn begin(&mut self, config: &LoRaConfig) -> Result<(), MockError> {
        if !self.begin_ok {
            return Err(MockError);
        }
        self.frequency_hz = Some(config.frequency_hz);
        Ok(())
    }

    async fn transmit(&mut self, packet: &[u8]) -> Result<(), MockError> {
        if !self.transmit_ok {
            return Err(MockError);
        }
        self.transmitted.push(packet.to_vec());
        Ok(())
    }
}
