//! Core infrastructure
//!
//! Logging macros and the outbound message queue shared by every transport.

pub mod logging;
pub mod outbound;

pub use outbound::{OutboundQueue, PendingMessage, OUTBOUND_MSG_SIZE, OUTBOUND_QUEUE_SIZE};
