//! Transport Abstraction
//!
//! A trait-based abstraction over the two wire technologies a node can use to
//! reach its operator: an MQTT session over WiFi, or a LoRa radio.
//!
//! # Design Pattern
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │  ParamNode (update protocol, queue,  │
//! │  catalogue broadcast)                │
//! └──────────┬───────────────────────────┘
//!            │ send(Route, payload) / is_usable()
//!            ▼
//! ┌─────────────────────┬────────────────────┐
//! │ MqttTransport<S>    │ LoRaTransport<R>   │
//! │ route → topic       │ route → packet     │
//! └─────────┬───────────┴─────────┬──────────┘
//!           ▼                     ▼
//!      MqttSession            LoRaRadio        (external drivers)
//! ```
//!
//! Messages are addressed by [`Route`], not by topic, so the protocol layer never
//! needs to know which transport is active.

pub mod lora;
pub mod mqtt;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

use core::fmt;

pub use lora::{
    LoRaInboundChannel, LoRaPacket, LoRaRadio, LoRaTransport, LORA_INBOUND_QUEUE_SIZE, LORA_MAX_PACKET,
};
pub use mqtt::{ConnectOptions, MqttSession, MqttTransport, Qos};

/// Logical destination of an outbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Route {
    /// Update acknowledgments
    Confirmation,
    /// Device log lines
    Log,
    /// Catalogue broadcasts on the shared registry channel
    Registry,
}

/// Message-oriented, unreliable transport
///
/// # Implementation Guidelines
///
/// - `is_usable()` must be cheap; it is consulted before every send
/// - `send()` is one whole message; no partial writes
/// - `reconnect()` re-establishes the session if the transport has one
#[allow(async_fn_in_trait)]
pub trait Transport {
    /// Whether a send is expected to go out right now
    fn is_usable(&self) -> bool;

    /// Whether this transport delivers messages for `route` at all
    fn carries(&self, route: Route) -> bool {
        let _ = route;
        true
    }

    /// Largest payload one `send` accepts, if bounded
    fn max_payload(&self) -> Option<usize> {
        None
    }

    /// Send one message
    ///
    /// # Returns
    ///
    /// - `Ok(())` - Message handed to the underlying driver
    /// - `Err(TransportError)` - Not usable, disconnected, or driver failure
    async fn send(&mut self, route: Route, payload: &[u8]) -> Result<(), TransportError>;

    /// Re-establish the session
    ///
    /// Stateless transports succeed immediately.
    async fn reconnect(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Transport error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportError {
    /// Transport is not usable right now (link down)
    Unusable,
    /// Session dropped while sending
    Disconnected,
    /// Driver-level failure
    Io,
    /// Payload exceeds the transport's frame size
    PayloadTooLarge,
    /// Route not carried by this transport
    Unsupported,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Unusable => write!(f, "Transport not usable"),
            TransportError::Disconnected => write!(f, "Transport disconnected"),
            TransportError::Io => write!(f, "I/O error"),
            TransportError::PayloadTooLarge => write!(f, "Payload too large"),
            TransportError::Unsupported => write!(f, "Route not supported"),
        }
    }
}
