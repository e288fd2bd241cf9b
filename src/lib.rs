#![cfg_attr(not(test), no_std)]

//! fieldlink - Remotely updatable device parameters for embedded nodes
//!
//! A node registers named, typed parameters that survive reboot in flash, and
//! exposes them to an operator over WiFi+MQTT or LoRa. Operators send JSON
//! update requests and get an acknowledgment for each; nodes announce their
//! parameter catalogue on a shared registry channel.

extern crate alloc;

// Flash abstraction and mocks
pub mod platform;

// Logging macros and outbound queue
pub mod core;

// Typed parameters, persistence and node configuration
pub mod parameters;

// Transports, connectivity supervision and the update protocol
pub mod communication;

// Device facade
pub mod node;

pub use node::{NodeError, ParamNode};
