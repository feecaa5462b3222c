//! Node-wide configuration and error types shared by every trailnode crate.

pub mod config;
pub mod error;

pub use config::{CommandsConfig, DatabaseConfig, NodeConfig};
pub use error::{NodeError, Result};
