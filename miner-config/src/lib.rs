//! Configuration library for the miner agent.
//!
//! Resolution order is defaults, then an optional TOML file, then `.env` and
//! the process environment. The binary loads a [`Config`] once at start-up
//! and hands it to the core through the agent context.

pub mod constants;
pub mod loader;
pub mod models;
pub mod util;

pub use loader::{ConfigLoader, ConfigLoaderOptions, error::ConfigLoadError};
pub use models::sources::{EnvConfig, FileConfig};
pub use models::{Config, ConfigMetadata};
