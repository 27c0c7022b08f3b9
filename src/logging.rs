//! Tracing initialisation.
//!
//! The filter comes from `RUST_LOG` when it is set and falls back to
//! `application.log_level` otherwise. `application.log_format` selects
//! between human-readable and JSON lines.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::Settings;

/// Install the global subscriber described by `settings`.
///
/// # Errors
///
/// Fails if the level does not parse as a filter directive or a global
/// subscriber is already installed.
pub fn init_from_config(settings: &Settings) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&settings.application.log_level)?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    match settings.application.log_format.as_str() {
        "json" => registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init()?,
        _ => registry.with(fmt::layer().with_target(true)).try_init()?,
    }

    tracing::debug!(
        level = %settings.application.log_level,
        format = %settings.application.log_format,
        "tracing initialised"
    );
    Ok(())
}
