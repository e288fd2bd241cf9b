//! Platform traits
//!
//! Interfaces that board support code implements for this crate.

pub mod flash;

pub use flash::FlashInterface;
