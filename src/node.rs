//! Parameter node
//!
//! [`ParamNode`] is the device-side facade: it owns the parameter registry,
//! the outbound log queue, the transport and the connectivity supervisor, and
//! exposes the operations device code and the receive paths call.
//!
//! # Tasks
//!
//! ```text
//! run_connectivity ── WiFi/MQTT retry loops (MQTT mode)
//! run_heartbeat    ── periodic catalogue broadcast
//! run_lora_inbound ── packets posted by the LoRa receive callback (LoRa mode)
//! MQTT receive     ── calls handle_mqtt_message
//! ```
//!
//! # Lock Order
//!
//! registry → queue → transport. The supervisor lock is only taken for state
//! transitions and never held across another lock.

use crate::communication::catalogue::Catalogue;
use crate::communication::link::{Link, LinkEvent, LinkEventChannel, SessionControl, WifiRadio};
use crate::communication::protocol::{self, DropReason, InboundOutcome, UpdateResult};
use crate::communication::topics::Topics;
use crate::communication::transport::{
    LoRaInboundChannel, LoRaPacket, LoRaRadio, LoRaTransport, MqttSession, MqttTransport, Route,
    Transport, TransportError,
};
use crate::core::outbound::OutboundQueue;
use crate::parameters::network::{ConfigError, LoRaConfig, NetworkParams, NodeConfig, TransportMode};
use crate::parameters::registry::{ApplyError, ParamHandle, ParameterRegistry, RegistryError};
use crate::parameters::storage::PersistentStore;
use crate::parameters::value::{ParamFlags, Parameter};
use crate::{log_debug, log_error, log_info, log_warn};
use alloc::vec;
use core::fmt;
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::mutex::Mutex;
use embedded_hal_async::delay::DelayNs;

/// Node start-up errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NodeError {
    /// LoRa radio bring-up failed; the node has no link and should halt
    RadioInit,
    /// Configuration is incomplete for the chosen transport
    Config(ConfigError),
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeError::RadioInit => write!(f, "LoRa radio initialization failed"),
            NodeError::Config(e) => write!(f, "configuration error: {}", e),
        }
    }
}

impl From<ConfigError> for NodeError {
    fn from(error: ConfigError) -> Self {
        NodeError::Config(error)
    }
}

/// Device-side parameter node
pub struct ParamNode<M: RawMutex, S: PersistentStore, T: Transport> {
    config: NodeConfig,
    topics: Topics,
    registry: Mutex<M, ParameterRegistry<S>>,
    queue: Mutex<M, OutboundQueue>,
    transport: Mutex<M, T>,
    link: Link<M>,
    lora_inbound: LoRaInboundChannel<M>,
}

impl<M: RawMutex, S: PersistentStore, Sess: MqttSession> ParamNode<M, S, MqttTransport<Sess>> {
    /// Node on an MQTT session over WiFi
    ///
    /// The session is opened by [`ParamNode::run_connectivity`].
    pub fn start_mqtt(config: NodeConfig, store: S, session: Sess) -> Result<Self, NodeError> {
        config.validate(TransportMode::Mqtt)?;
        let transport = MqttTransport::new(session, &config);
        log_info!("Node '{}' starting in MQTT mode", config.device_name.as_str());
        Ok(Self::new(config, store, transport))
    }
}

impl<M: RawMutex, S: PersistentStore, R: LoRaRadio> ParamNode<M, S, LoRaTransport<R>> {
    /// Node on a LoRa radio
    ///
    /// Brings the radio up once. There is no retry on failure.
    pub fn start_lora(
        config: NodeConfig,
        store: S,
        radio: R,
        lora: &LoRaConfig,
    ) -> Result<Self, NodeError> {
        config.validate(TransportMode::LoRa)?;
        let transport = LoRaTransport::begin(radio, lora).map_err(|e| {
            log_error!("LoRa init failed at {} Hz: {:?}", lora.frequency_hz, e);
            NodeError::RadioInit
        })?;
        log_info!(
            "Node '{}' starting in LoRa mode at {} Hz",
            config.device_name.as_str(),
            lora.frequency_hz
        );
        Ok(Self::new(config, store, transport))
    }
}

impl<M: RawMutex, S: PersistentStore, T: Transport> ParamNode<M, S, T> {
    /// Assemble a node from parts
    pub fn new(config: NodeConfig, store: S, transport: T) -> Self {
        Self {
            topics: Topics::for_device(&config.device_name),
            config,
            registry: Mutex::new(ParameterRegistry::new(store)),
            queue: Mutex::new(OutboundQueue::new()),
            transport: Mutex::new(transport),
            link: Link::new(),
            lora_inbound: Channel::new(),
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn device_name(&self) -> &str {
        &self.config.device_name
    }

    pub fn registry(&self) -> &Mutex<M, ParameterRegistry<S>> {
        &self.registry
    }

    pub fn queue(&self) -> &Mutex<M, OutboundQueue> {
        &self.queue
    }

    pub fn transport(&self) -> &Mutex<M, T> {
        &self.transport
    }

    /// Tear the node down, keeping its store
    pub fn into_store(self) -> S {
        self.registry.into_inner().into_store()
    }

    pub fn link(&self) -> &Link<M> {
        &self.link
    }

    /// Channel WiFi and MQTT client callbacks post to
    pub fn link_events(&self) -> &LinkEventChannel<M> {
        self.link.events()
    }

    /// Channel the LoRa receive callback posts to
    pub fn lora_inbound(&self) -> &LoRaInboundChannel<M> {
        &self.lora_inbound
    }

    /// Register a parameter and announce the new catalogue
    pub async fn add_parameter<P: Parameter>(
        &self,
        name: &str,
        initial: P,
    ) -> Result<ParamHandle<P>, RegistryError> {
        self.add_parameter_with_flags(name, initial, ParamFlags::empty())
            .await
    }

    /// Register a parameter with flags and announce the new catalogue
    pub async fn add_parameter_with_flags<P: Parameter>(
        &self,
        name: &str,
        initial: P,
        flags: ParamFlags,
    ) -> Result<ParamHandle<P>, RegistryError> {
        let ip = self.link.state().await.ip();
        let mut registry = self.registry.lock().await;
        let handle = registry.register_with_flags(name, initial, flags)?;
        log_debug!("Registered parameter {}", name);
        self.send_catalogue(&registry, ip).await;
        Ok(handle)
    }

    /// Expose the WiFi and broker settings as parameters and announce them
    ///
    /// Returns the node configuration with any persisted network values
    /// applied; a node started from it connects with the operator's settings.
    pub async fn add_network_params(&self) -> Result<NodeConfig, RegistryError> {
        let ip = self.link.state().await.ip();
        let mut registry = self.registry.lock().await;
        NetworkParams::register(&mut registry, &self.config)?;

        let mut effective = self.config.clone();
        NetworkParams::apply_to(&registry, &mut effective);
        self.send_catalogue(&registry, ip).await;
        Ok(effective)
    }

    /// Current value behind `handle`
    pub async fn get<P: Parameter>(&self, handle: &ParamHandle<P>) -> Option<P> {
        self.registry.lock().await.get(handle)
    }

    /// Change a parameter from device code
    pub async fn set<P: Parameter>(&self, handle: &ParamHandle<P>, value: P) -> Result<(), ApplyError> {
        self.registry.lock().await.set(handle, value)
    }

    /// Decode, apply and acknowledge one update message
    ///
    /// The registry stays locked for the whole sequence, so concurrent
    /// requests are applied one after the other.
    pub async fn handle_inbound(&self, payload: &[u8]) -> InboundOutcome {
        let mut registry = self.registry.lock().await;

        let request = match protocol::decode(payload) {
            Ok(request) => request,
            Err(e) => {
                log_debug!("Dropping inbound message: {}", e);
                return InboundOutcome::Dropped(DropReason::Malformed(e));
            }
        };
        if !request.addresses(self.device_name()) {
            log_debug!("Update {} addressed to another device", request.id.as_str());
            return InboundOutcome::Dropped(DropReason::NotAddressed);
        }

        let report = protocol::apply(&mut registry, &request);
        log_info!(
            "Update {}: {} applied, {} skipped, status {:?}",
            request.id.as_str(),
            report.applied,
            report.skipped,
            report.status
        );

        let ack = UpdateResult {
            id: &request.id,
            device: self.device_name(),
            status: report.status,
        };
        let ack_sent = match ack.encode() {
            Ok(bytes) => self.send(Route::Confirmation, &bytes).await.is_ok(),
            Err(_) => {
                log_error!("Failed to encode acknowledgment for {}", request.id.as_str());
                false
            }
        };

        InboundOutcome::Acknowledged {
            status: report.status,
            ack_sent,
        }
    }

    /// Entry point for the MQTT receive path
    ///
    /// Returns `None` for topics this node does not consume.
    pub async fn handle_mqtt_message(&self, topic: &str, payload: &[u8]) -> Option<InboundOutcome> {
        if topic != self.topics.update.as_str() {
            log_debug!("Ignoring message on {}", topic);
            return None;
        }
        Some(self.handle_inbound(payload).await)
    }

    /// Queue a received LoRa packet for [`ParamNode::run_lora_inbound`]
    ///
    /// Returns false if the packet is too large or the queue is full.
    pub fn post_lora_packet(&self, bytes: &[u8]) -> bool {
        let Ok(packet) = LoRaPacket::from_slice(bytes) else {
            log_warn!("LoRa packet of {} bytes dropped: too large", bytes.len());
            return false;
        };
        if self.lora_inbound.try_send(packet).is_err() {
            log_warn!("LoRa inbound queue full, packet dropped");
            return false;
        }
        true
    }

    /// Handle the next queued LoRa packet
    pub async fn process_lora_packet(&self) -> InboundOutcome {
        let packet = self.lora_inbound.receive().await;
        self.handle_inbound(&packet).await
    }

    /// LoRa inbound pump
    pub async fn run_lora_inbound(&self) -> ! {
        loop {
            self.process_lora_packet().await;
        }
    }

    /// Emit a device log line
    ///
    /// The line always goes to the local log. With `mqtt_log` enabled on a
    /// transport that carries logs, it is also sent remotely: directly if the
    /// link is up and nothing is queued ahead of it, otherwise via the queue.
    pub async fn log(&self, message: &str) {
        log_info!("{}", message);
        if !self.config.mqtt_log {
            return;
        }

        let mut queue = self.queue.lock().await;
        let mut transport = self.transport.lock().await;
        if !transport.carries(Route::Log) {
            return;
        }

        if transport.is_usable() && queue.is_empty() {
            match transport.send(Route::Log, message.as_bytes()).await {
                Ok(()) => return,
                Err(e) => self.note_send_error(e),
            }
        }
        queue.enqueue(message);
    }

    /// Deliver queued log lines; returns how many went out
    pub async fn flush_outbound(&self) -> usize {
        let mut queue = self.queue.lock().await;
        let mut transport = self.transport.lock().await;
        let sent = queue.drain_into(&mut *transport).await;
        if sent > 0 {
            log_debug!("Flushed {} queued log lines, {} remain", sent, queue.len());
        }
        sent
    }

    /// Send the catalogue on the registry route
    ///
    /// Skipped when the transport is not usable. Returns whether it went out.
    pub async fn broadcast_catalogue(&self) -> bool {
        let ip = self.link.state().await.ip();
        let registry = self.registry.lock().await;
        self.send_catalogue(&registry, ip).await
    }

    /// Sleep one heartbeat interval, then broadcast the catalogue
    pub async fn heartbeat<D: DelayNs>(&self, delay: &mut D) -> bool {
        delay.delay_ms(self.config.heartbeat_interval_ms).await;
        self.broadcast_catalogue().await
    }

    /// Periodic catalogue broadcast
    pub async fn run_heartbeat<D: DelayNs>(&self, delay: &mut D) -> ! {
        loop {
            self.heartbeat(delay).await;
        }
    }

    /// WiFi and MQTT retry loops
    pub async fn run_connectivity<W: WifiRadio, D: DelayNs>(&self, wifi: &mut W, delay: &mut D) -> ! {
        self.link
            .supervise(wifi, self, &self.config.wifi, delay, self.config.retry_interval_ms)
            .await
    }

    async fn send_catalogue(&self, registry: &ParameterRegistry<S>, ip: Option<[u8; 4]>) -> bool {
        let mut transport = self.transport.lock().await;
        if !transport.is_usable() {
            log_debug!("Transport down, catalogue broadcast skipped");
            return false;
        }

        let catalogue = Catalogue::from_registry(self.device_name(), ip, registry);
        let frames = match transport.max_payload() {
            Some(max) => catalogue.encode_split(max),
            None => catalogue.encode().map(|bytes| vec![bytes]),
        };
        let frames = match frames {
            Ok(frames) => frames,
            Err(_) => {
                log_error!("Failed to encode catalogue");
                return false;
            }
        };

        for frame in &frames {
            if let Err(e) = transport.send(Route::Registry, frame).await {
                self.note_send_error(e);
                return false;
            }
        }
        true
    }

    /// Fire-and-forget send
    async fn send(&self, route: Route, payload: &[u8]) -> Result<(), TransportError> {
        let result = self.transport.lock().await.send(route, payload).await;
        if let Err(e) = result {
            self.note_send_error(e);
        }
        result
    }

    fn note_send_error(&self, error: TransportError) {
        log_warn!("Send failed: {}", error);
        if error == TransportError::Disconnected {
            self.link.post(LinkEvent::SessionLost);
        }
    }
}

impl<M: RawMutex, S: PersistentStore, T: Transport> SessionControl for ParamNode<M, S, T> {
    async fn session_connected(&self) -> bool {
        self.transport.lock().await.is_usable()
    }

    async fn reconnect_session(&self) -> Result<(), TransportError> {
        self.transport.lock().await.reconnect().await
    }

    /// Deliver the backlog and re-announce the catalogue
    async fn on_session_established(&self) {
        self.flush_outbound().await;
        self.broadcast_catalogue().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::protocol::UpdateStatus;
    use crate::communication::transport::mock::{MockRadio, MockSession, MockTransport};
    use crate::parameters::storage::MemoryStore;
    use crate::parameters::value::{ParamString, ParamValue};
    use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

    type TestNode = ParamNode<CriticalSectionRawMutex, MemoryStore, MockTransport>;

    fn node(mqtt_log: bool) -> TestNode {
        let config = NodeConfig::new("pump-7").unwrap().with_mqtt_log(mqtt_log);
        ParamNode::new(config, MemoryStore::new(), MockTransport::new())
    }

    async fn set_usable(node: &TestNode, usable: bool) {
        node.transport().lock().await.set_usable(usable);
    }

    #[tokio::test]
    async fn test_add_parameter_broadcasts_catalogue() {
        let node = node(false);
        node.add_parameter("threshold", 10i32).await.unwrap();

        let transport = node.transport().lock().await;
        assert_eq!(
            transport.sent_payloads(Route::Registry),
            [r#"{"Device":"pump-7","parameters":[{"threshold":"10"}]}"#]
        );
    }

    #[tokio::test]
    async fn test_add_parameter_skips_broadcast_when_down() {
        let node = node(false);
        set_usable(&node, false).await;
        let handle = node.add_parameter("threshold", 10i32).await.unwrap();

        assert_eq!(node.get(&handle).await, Some(10));
        assert!(node.transport().lock().await.sent().is_empty());
        assert!(node.queue().lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_update_acknowledged() {
        let node = node(false);
        let handle = node.add_parameter("threshold", 10i32).await.unwrap();

        let outcome = node
            .handle_inbound(br#"{"id":"r1","parameters":{"threshold":42}}"#)
            .await;

        assert_eq!(
            outcome,
            InboundOutcome::Acknowledged {
                status: UpdateStatus::Updated,
                ack_sent: true
            }
        );
        assert_eq!(node.get(&handle).await, Some(42));
        assert_eq!(
            node.transport().lock().await.sent_payloads(Route::Confirmation),
            [r#"{"id":"r1","Device":"pump-7","status":"updated"}"#]
        );
    }

    #[tokio::test]
    async fn test_malformed_update_dropped() {
        let node = node(false);
        node.add_parameter("threshold", 10i32).await.unwrap();

        let outcome = node.handle_inbound(b"{not json").await;
        assert!(matches!(
            outcome,
            InboundOutcome::Dropped(DropReason::Malformed(_))
        ));
        assert!(node
            .transport()
            .lock()
            .await
            .sent_payloads(Route::Confirmation)
            .is_empty());
    }

    #[tokio::test]
    async fn test_update_for_other_device_dropped() {
        let node = node(false);
        let handle = node.add_parameter("threshold", 10i32).await.unwrap();

        let outcome = node
            .handle_inbound(br#"{"id":"r1","Device":"pump-8","parameters":{"threshold":42}}"#)
            .await;
        assert_eq!(outcome, InboundOutcome::Dropped(DropReason::NotAddressed));
        assert_eq!(node.get(&handle).await, Some(10));
    }

    #[tokio::test]
    async fn test_ack_failure_still_applies() {
        let node = node(false);
        let handle = node.add_parameter("threshold", 10i32).await.unwrap();
        set_usable(&node, false).await;

        let outcome = node
            .handle_inbound(br#"{"id":"r1","parameters":{"threshold":42}}"#)
            .await;
        assert_eq!(
            outcome,
            InboundOutcome::Acknowledged {
                status: UpdateStatus::Updated,
                ack_sent: false
            }
        );
        assert_eq!(node.get(&handle).await, Some(42));
    }

    #[tokio::test]
    async fn test_disconnect_during_ack_posts_session_lost() {
        let node = node(false);
        node.add_parameter("threshold", 10i32).await.unwrap();
        node.transport()
            .lock()
            .await
            .set_send_error(Some(TransportError::Disconnected));

        node.handle_inbound(br#"{"id":"r1","parameters":{"threshold":42}}"#)
            .await;
        assert!(matches!(
            node.link_events().try_receive(),
            Ok(LinkEvent::SessionLost)
        ));
    }

    #[tokio::test]
    async fn test_mqtt_message_topic_filter() {
        let node = node(false);
        node.add_parameter("threshold", 10i32).await.unwrap();

        let payload = br#"{"id":"r1","parameters":{"threshold":42}}"#;
        assert_eq!(node.handle_mqtt_message("boards/pump-8", payload).await, None);
        assert!(node
            .handle_mqtt_message("boards/pump-7", payload)
            .await
            .is_some());
    }

    #[tokio::test]
    async fn test_log_local_only_without_mqtt_log() {
        let node = node(false);
        node.log("hello").await;
        assert!(node.transport().lock().await.sent().is_empty());
        assert!(node.queue().lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_log_direct_when_usable() {
        let node = node(true);
        node.log("hello").await;
        assert_eq!(
            node.transport().lock().await.sent_payloads(Route::Log),
            ["hello"]
        );
    }

    #[tokio::test]
    async fn test_log_queued_then_flushed_in_order() {
        let node = node(true);
        set_usable(&node, false).await;
        node.log("one").await;
        node.log("two").await;
        assert_eq!(node.queue().lock().await.len(), 2);
        assert!(node.transport().lock().await.sent().is_empty());

        // Link back, but the queue is not empty: a new line must wait its turn
        set_usable(&node, true).await;
        node.log("three").await;
        assert!(node.transport().lock().await.sent().is_empty());

        assert_eq!(node.flush_outbound().await, 3);
        assert_eq!(
            node.transport().lock().await.sent_payloads(Route::Log),
            ["one", "two", "three"]
        );
    }

    #[tokio::test]
    async fn test_log_not_carried_stays_local() {
        let node = node(true);
        node.transport().lock().await.set_carries_log(false);
        node.log("hello").await;
        assert!(node.transport().lock().await.sent().is_empty());
        assert!(node.queue().lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_network_params_announced_and_applied() {
        let config = NodeConfig::new("pump-7")
            .unwrap()
            .with_wifi("FieldNet", "secret")
            .unwrap()
            .with_broker("broker.local", 1883, "node", "pw")
            .unwrap();
        let mut store = MemoryStore::new();
        let moved = ParamString::try_from("BackupNet").unwrap();
        store.save("NET_SSID", &ParamValue::Str(moved)).unwrap();
        let node: TestNode = ParamNode::new(config, store, MockTransport::new());

        let effective = node.add_network_params().await.unwrap();
        assert_eq!(effective.wifi.ssid.as_str(), "BackupNet");
        assert_eq!(effective.broker.host.as_str(), "broker.local");
        assert_eq!(node.config().wifi.ssid.as_str(), "FieldNet");

        let transport = node.transport().lock().await;
        let payloads = transport.sent_payloads(Route::Registry);
        let catalogue = &payloads[0];
        assert!(catalogue.contains(r#"{"NET_SSID":"BackupNet"}"#));
        assert!(catalogue.contains(r#"{"MQTT_PORT":"1883"}"#));
        assert!(!catalogue.contains("NET_PASS"));
        assert!(!catalogue.contains("secret"));
    }

    #[tokio::test]
    async fn test_session_established_flushes_and_announces() {
        let node = node(true);
        set_usable(&node, false).await;
        node.add_parameter("threshold", 10i32).await.unwrap();
        node.log("queued").await;

        set_usable(&node, true).await;
        node.on_session_established().await;

        let transport = node.transport().lock().await;
        assert_eq!(transport.sent()[0].route, Route::Log);
        assert_eq!(transport.sent()[1].route, Route::Registry);
    }

    #[tokio::test]
    async fn test_lora_packet_pump() {
        let node = node(false);
        let handle = node.add_parameter("threshold", 10i32).await.unwrap();

        assert!(node.post_lora_packet(br#"{"id":"r1","Device":"pump-7","parameters":{"threshold":5}}"#));
        let outcome = node.process_lora_packet().await;
        assert!(matches!(
            outcome,
            InboundOutcome::Acknowledged {
                status: UpdateStatus::Updated,
                ..
            }
        ));
        assert_eq!(node.get(&handle).await, Some(5));
    }

    #[tokio::test]
    async fn test_lora_packet_too_large() {
        let node = node(false);
        let big = [b' '; 300];
        assert!(!node.post_lora_packet(&big));
    }

    #[test]
    fn test_start_lora_radio_failure() {
        let mut radio = MockRadio::new();
        radio.set_begin_ok(false);
        let config = NodeConfig::new("pump-7").unwrap();

        let result = ParamNode::<CriticalSectionRawMutex, _, _>::start_lora(
            config,
            MemoryStore::new(),
            radio,
            &LoRaConfig::default(),
        );
        assert!(matches!(result, Err(NodeError::RadioInit)));
    }

    #[test]
    fn test_start_mqtt_requires_broker() {
        let config = NodeConfig::new("pump-7").unwrap();
        let result = ParamNode::<CriticalSectionRawMutex, _, _>::start_mqtt(
            config,
            MemoryStore::new(),
            MockSession::new(),
        );
        assert!(matches!(
            result,
            Err(NodeError::Config(ConfigError::EmptySsid))
        ));
    }
}
