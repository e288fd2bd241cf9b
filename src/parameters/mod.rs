//! Parameter System
//!
//! Named, typed runtime parameters mirrored into durable storage.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────┐
//! │     Update protocol / device code      │
//! └──────────────┬─────────────────────────┘
//!                │ register / apply_typed / get
//!                ▼
//! ┌────────────────────────────────────────┐
//! │        ParameterRegistry                │
//! │  - Insertion-ordered typed slots        │
//! │  - Write-through persistence            │
//! └──────────────┬─────────────────────────┘
//!                │ PersistentStore
//!                ▼
//! ┌────────────────────┬───────────────────┐
//! │   MemoryStore      │  FlashStore<F>    │
//! └────────────────────┴───────────────────┘
//! ```
//!
//! # Parameter Types
//!
//! - `Int` - 32-bit signed integer
//! - `Float` - 32-bit floating point
//! - `Double` - 64-bit floating point
//! - `Bool` - Boolean value
//! - `Str` - Bounded string (max 63 bytes)

pub mod network;
pub mod registry;
pub mod storage;
pub mod value;

pub use network::{NetworkParams, NodeConfig};
pub use registry::{ApplyError, ParamHandle, ParameterRegistry, ParameterSlot, RegistryError};
pub use storage::{FlashStore, MemoryStore, PersistentStore, StoreError};
pub use value::{ParamFlags, ParamKind, ParamString, ParamValue, Parameter};
