//! Configuration System
//!
//! This module provides configuration management using Figment.
//!
//! # Configuration Sources
//!
//! Configuration is loaded from (in order of precedence):
//! 1. Environment variables prefixed with `WAVELOCK_`
//! 2. TOML configuration file (default: `config/wavelock.toml`)
//! 3. Built-in defaults
//!
//! # Example
//!
//! ```no_run
//! use wavelock::config::Settings;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = Settings::load_from("config/wavelock.toml")?;
//!     println!("Arbiter listens on {}", settings.arbiter.bind);
//!     println!("Known clients: {}", settings.arbiter.channels.len());
//!     Ok(())
//! }
//! ```
//!
//! # Environment Variables
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! WAVELOCK_APPLICATION__LOG_LEVEL=debug
//! WAVELOCK_ARBITER__MAX_INACTIVITY_SECS=30
//! WAVELOCK_SWITCH__PORT=/dev/ttyUSB0
//! ```

pub mod settings;

pub use settings::{
    ApplicationConfig, ArbiterConfig, ConfigError, LaserDefinition, LaserKind, LockConfig,
    NameServerConfig, Settings, SwitchBackend, SwitchConfig, WavemeterBackend, WavemeterConfig,
};
