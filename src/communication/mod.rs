//! Communication
//!
//! Everything between the parameter registry and the wire.
//!
//! # Modules
//!
//! - `transport` - [`Transport`](transport::Transport) trait with MQTT and LoRa implementations
//! - `link` - WiFi/MQTT connectivity supervision
//! - `protocol` - Update request decode, apply and acknowledge
//! - `catalogue` - Catalogue broadcast document
//! - `topics` - MQTT topic naming
//! - `gateway` - LoRa to MQTT bridge
//!
//! # Message Formats
//!
//! ```text
//! update   {"id":"<id>","parameters":{"<name>":<value>,...},"Device"?:"<device>"}
//! ack      {"id":"<id>","Device":"<device>","status":"updated"|"failed"}
//! catalog  {"Device":"<device>","Ip"?:"a.b.c.d","parameters":[{"<name>":"<text>"},...]}
//! ```

pub mod catalogue;
pub mod gateway;
pub mod link;
pub mod protocol;
pub mod topics;
pub mod transport;

pub use catalogue::Catalogue;
pub use gateway::LoRaMqttGateway;
pub use link::{ConnectivitySupervisor, Link, LinkEvent, LinkState, SessionControl, WifiRadio};
pub use protocol::{InboundOutcome, UpdateRequest, UpdateResult, UpdateStatus};
pub use transport::{Route, Transport, TransportError};
