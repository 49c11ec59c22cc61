//! Shared configuration, error types, and identifiers for quarry crates.
//!
//! Architecture role:
//! - defines the session configuration passed across planning layers
//! - provides common [`QuarryError`] / [`Result`] contracts
//! - hosts the typed id vocabulary used by the fragment builder
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]

pub mod config;
pub mod error;
pub mod ids;

pub use config::{SessionConfig, StreamingPreAggMode};
pub use error::{QuarryError, Result};
pub use ids::*;
