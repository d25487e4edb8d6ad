//! Shared types for the smtprelay engine: configuration documents,
//! the error/reason taxonomy, and the delivery event record.

pub mod config;
pub mod error;
pub mod event;

pub use error::{Reason, RelayError};

/// Result type alias for smtprelay
pub type Result<T> = std::result::Result<T, RelayError>;
