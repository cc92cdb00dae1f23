//! # GalleonFS Common
//!
//! Shared types for the GalleonFS replica resilience services: identifiers and
//! the pool/group/file data model, the event and command contracts exchanged
//! with pools and metadata services, errors and configuration.

pub mod config;
pub mod error;
pub mod messages;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use config::{ConfigLoader, ResilienceConfig};
pub use error::{GalleonError, Result};
pub use messages::*;
pub use types::*;

/// Current version of the resilience message contracts
pub const GALLEON_PROTOCOL_VERSION: u32 = 1;
