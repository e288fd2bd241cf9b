//! Platform abstraction layer
//!
//! Hardware access needed by the parameter store. Network stacks and radios are
//! not platform concerns here; they are reached through the traits in
//! [`crate::communication`].

pub mod error;
pub mod traits;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

// Re-export commonly used types
pub use error::{FlashError, PlatformError, Result};
pub use traits::FlashInterface;
