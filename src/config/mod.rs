//! Configuration Module
//!
//! TOML file loading, environment overrides, CLI merging, validation.

pub mod manager;
pub mod types;

pub use manager::ConfigManager;
pub use types::{Config, FleetConfig, IoConfig, ListenConfig, TimeoutConfig};
