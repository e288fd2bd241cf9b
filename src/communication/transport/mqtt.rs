//! MQTT transport
//!
//! Adapts an external MQTT client ([`MqttSession`]) to the [`Transport`]
//! trait. Routes map to the per-device topics; catalogue broadcasts are
//! published retained so late subscribers see the latest catalogue.

use super::{Route, Transport, TransportError};
use crate::communication::topics::{Topics, REGISTRY_TOPIC};
use crate::parameters::network::{BrokerConfig, DeviceName, NodeConfig};
use crate::{log_info, log_warn};
use core::fmt;

/// MQTT delivery guarantee
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl Qos {
    pub fn level(self) -> u8 {
        match self {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }
}

/// Session connect parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions<'a> {
    pub client_id: &'a str,
    pub host: &'a str,
    pub port: u16,
    pub username: Option<&'a str>,
    pub password: Option<&'a str>,
}

impl<'a> ConnectOptions<'a> {
    /// Options for `client_id` against `broker`; empty credentials are omitted
    pub fn new(client_id: &'a str, broker: &'a BrokerConfig) -> Self {
        Self {
            client_id,
            host: &broker.host,
            port: broker.port,
            username: (!broker.username.is_empty()).then_some(broker.username.as_str()),
            password: (!broker.password.is_empty()).then_some(broker.password.as_str()),
        }
    }
}

/// External MQTT client session
///
/// Implemented by board support code over whatever MQTT stack the target
/// uses. Inbound publishes are not part of this trait: the receive path hands
/// them to [`crate::node::ParamNode::handle_mqtt_message`].
#[allow(async_fn_in_trait)]
pub trait MqttSession {
    type Error: fmt::Debug;

    /// Whether the broker session is currently established
    fn is_connected(&self) -> bool;

    /// Open a session to the broker
    async fn connect(&mut self, options: &ConnectOptions<'_>) -> Result<(), Self::Error>;

    async fn subscribe(&mut self, topic: &str, qos: Qos) -> Result<(), Self::Error>;

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: Qos,
        retain: bool,
    ) -> Result<(), Self::Error>;
}

/// [`Transport`] over an MQTT session
pub struct MqttTransport<S: MqttSession> {
    session: S,
    client_id: DeviceName,
    broker: BrokerConfig,
    topics: Topics,
    qos: Qos,
}

impl<S: MqttSession> MqttTransport<S> {
    /// Wrap `session`, using the device name as client id
    pub fn new(session: S, config: &NodeConfig) -> Self {
        Self {
            session,
            client_id: config.device_name.clone(),
            broker: config.broker.clone(),
            topics: Topics::for_device(&config.device_name),
            qos: config.qos,
        }
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut S {
        &mut self.session
    }
}

impl<S: MqttSession> Transport for MqttTransport<S> {
    fn is_usable(&self) -> bool {
        self.session.is_connected()
    }

    async fn send(&mut self, route: Route, payload: &[u8]) -> Result<(), TransportError> {
        if !self.session.is_connected() {
            return Err(TransportError::Unusable);
        }

        let retain = route == Route::Registry;
        let topic: &str = match route {
            Route::Confirmation => &self.topics.confirmation,
            Route::Log => &self.topics.log,
            Route::Registry => REGISTRY_TOPIC,
        };

        match self.session.publish(topic, payload, self.qos, retain).await {
            Ok(()) => Ok(()),
            Err(e) => {
                log_warn!("MQTT publish to {} failed: {:?}", topic, e);
                if self.session.is_connected() {
                    Err(TransportError::Io)
                } else {
                    Err(TransportError::Disconnected)
                }
            }
        }
    }

    /// Connect to the broker and subscribe to the update topic
    async fn reconnect(&mut self) -> Result<(), TransportError> {
        let options = ConnectOptions::new(&self.client_id, &self.broker);
        if let Err(e) = self.session.connect(&options).await {
            log_warn!(
                "MQTT connect to {}:{} failed: {:?}",
                options.host,
                options.port,
                e
            );
            return Err(TransportError::Disconnected);
        }
        log_info!("Connected to MQTT broker {}:{}", options.host, options.port);

        if let Err(e) = self.session.subscribe(&self.topics.update, self.qos).await {
            log_warn!("Subscribe to {} failed: {:?}", self.topics.update.as_str(), e);
            return Err(TransportError::Io);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::transport::mock::MockSession;

    fn config() -> NodeConfig {
        NodeConfig::new("pump-7")
            .unwrap()
            .with_wifi("FieldNet", "secret")
            .unwrap()
            .with_broker("broker.local", 1884, "node", "")
            .unwrap()
    }

    #[test]
    fn test_connect_options_omit_empty_credentials() {
        let config = config();
        let options = ConnectOptions::new("pump-7", &config.broker);
        assert_eq!(options.username, Some("node"));
        assert_eq!(options.password, None);
        assert_eq!(options.port, 1884);
    }

    #[tokio::test]
    async fn test_send_routes_to_topics() {
        let mut session = MockSession::new();
        session.set_connected(true);
        let mut transport = MqttTransport::new(session, &config());

        transport.send(Route::Confirmation, b"ack").await.unwrap();
        transport.send(Route::Log, b"line").await.unwrap();
        transport.send(Route::Registry, b"cat").await.unwrap();

        let published = transport.session().published();
        assert_eq!(published[0].topic, "boards/pump-7/confirmation");
        assert!(!published[0].retain);
        assert_eq!(published[1].topic, "boards/pump-7/log");
        assert_eq!(published[2].topic, "boards/registry");
        assert!(published[2].retain);
        assert!(published.iter().all(|p| p.qos == Qos::ExactlyOnce));
    }

    #[tokio::test]
    async fn test_send_when_disconnected() {
        let mut transport = MqttTransport::new(MockSession::new(), &config());
        assert!(!transport.is_usable());
        assert_eq!(
            transport.send(Route::Log, b"x").await,
            Err(TransportError::Unusable)
        );
        assert!(transport.session().published().is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_maps_to_disconnected() {
        let mut session = MockSession::new();
        session.set_connected(true);
        session.drop_on_publish(true);
        let mut transport = MqttTransport::new(session, &config());

        assert_eq!(
            transport.send(Route::Log, b"x").await,
            Err(TransportError::Disconnected)
        );
    }

    #[tokio::test]
    async fn test_reconnect_subscribes_update_topic() {
        let mut transport = MqttTransport::new(MockSession::new(), &config());
        transport.reconnect().await.unwrap();

        assert!(transport.is_usable());
        assert_eq!(transport.session().subscriptions(), ["boards/pump-7"]);
        assert_eq!(transport.session().last_client_id(), Some("pump-7"));
    }

    #[tokio::test]
    async fn test_reconnect_failure() {
        let mut session = MockSession::new();
        session.set_connect_ok(false);
        let mut transport = MqttTransport::new(session, &config());

        assert_eq!(transport.reconnect().await, Err(TransportError::Disconnected));
        assert!(!transport.is_usable());
        assert!(transport.session().subscriptions().is_empty());
    }
}
