//! Configuration loading using Figment
//!
//! Strongly-typed settings for the wavemeter server, the optical switch, the
//! name server and the laser locks. Every field has a default, so an empty
//! (or missing) TOML file yields a working simulated setup.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::error_recovery::RetryPolicy;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Figment could not load or extract the configuration.
    #[error("Configuration load error: {0}")]
    Load(#[from] figment::Error),
    /// The configuration parsed but is semantically invalid.
    #[error("Configuration validation error: {0}")]
    Validation(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Wavemeter time-sharing server
    #[serde(default)]
    pub arbiter: ArbiterConfig,
    /// Optical switch hardware
    #[serde(default)]
    pub switch: SwitchConfig,
    /// Wavemeter hardware
    #[serde(default)]
    pub wavemeter: WavemeterConfig,
    /// Service discovery
    #[serde(default)]
    pub nameserver: NameServerConfig,
    /// Laser lock loop
    #[serde(default)]
    pub lock: LockConfig,
    /// Lasers that can be locked from this host
    #[serde(default)]
    pub lasers: Vec<LaserDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "wavelock".to_string(),
            log_level: "info".to_string(),
            log_format: default_log_format(),
        }
    }
}

/// Wavemeter time-sharing server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbiterConfig {
    /// Address the RPC surface binds to
    pub bind: String,
    /// Name registered on the name server
    pub share_name: String,
    /// Scheduler tick, also the minimum fairness granularity
    pub scheduler_tick_ms: u64,
    /// Wait after switching before readings are attributed
    pub settle_delay_ms: u64,
    /// Wavemeter polling cadence
    pub read_interval_ms: u64,
    /// Sleep between checks while a query waits for its slot
    pub query_poll_ms: u64,
    /// Slot length granted when a client does not ask for one
    pub default_slot_secs: f64,
    /// Sessions idle longer than this are evicted
    pub max_inactivity_secs: f64,
    /// Reconnect-and-retry policy for the optical switch
    #[serde(default)]
    pub switch_retry: RetryPolicy,
    /// Fixed client enumeration: client name to switch input
    pub channels: BTreeMap<String, u8>,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        let channels = [
            ("CTL1", 1),
            ("CTL2", 2),
            ("TSL550", 3),
            ("TLB2", 4),
            ("TLB1", 5),
            ("CTL3", 6),
            ("NV", 7),
            ("TEST2", 8),
        ]
        .into_iter()
        .map(|(name, ch)| (name.to_string(), ch))
        .collect();

        Self {
            bind: "127.0.0.1:9092".to_string(),
            share_name: "wsserver".to_string(),
            scheduler_tick_ms: 100,
            settle_delay_ms: 50,
            read_interval_ms: 100,
            query_poll_ms: 20,
            default_slot_secs: 0.5,
            max_inactivity_secs: 60.0,
            switch_retry: RetryPolicy::default(),
            channels,
        }
    }
}

impl ArbiterConfig {
    /// Scheduler tick as a Duration
    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_millis(self.scheduler_tick_ms)
    }

    /// Post-switch settle delay as a Duration
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Wavemeter polling interval as a Duration
    pub fn read_interval(&self) -> Duration {
        Duration::from_millis(self.read_interval_ms)
    }

    /// Query poll interval as a Duration
    pub fn query_poll(&self) -> Duration {
        Duration::from_millis(self.query_poll_ms)
    }

    /// Default slot length as a Duration
    pub fn default_slot(&self) -> Duration {
        Duration::from_secs_f64(self.default_slot_secs)
    }

    /// Inactivity timeout as a Duration
    pub fn max_inactivity(&self) -> Duration {
        Duration::from_secs_f64(self.max_inactivity_secs)
    }
}

/// Optical switch backends
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchBackend {
    Mock,
    Sercalo,
}

/// Optical switch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchConfig {
    /// Which driver to use
    pub backend: SwitchBackend,
    /// Serial port (e.g., "COM4", "/dev/ttyUSB0")
    pub port: String,
    /// Baud rate
    #[serde(default = "default_switch_baud_rate")]
    pub baud_rate: u32,
    /// Read timeout in milliseconds
    #[serde(default = "default_switch_timeout")]
    pub timeout_ms: u64,
    /// Number of switch inputs
    #[serde(default = "default_number_of_channels")]
    pub number_of_channels: u8,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            backend: SwitchBackend::Mock,
            port: "COM4".to_string(),
            baud_rate: default_switch_baud_rate(),
            timeout_ms: default_switch_timeout(),
            number_of_channels: default_number_of_channels(),
        }
    }
}

/// Wavemeter backends
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WavemeterBackend {
    Simulated,
}

/// Wavemeter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WavemeterConfig {
    /// Which driver to use
    pub backend: WavemeterBackend,
    /// Reading noise of the simulated wavemeter (RMS, MHz)
    #[serde(default = "default_noise_mhz")]
    pub noise_mhz: f64,
    /// Reading on simulated inputs with no laser attached (nm)
    #[serde(default = "default_idle_wavelength")]
    pub idle_wavelength_nm: f64,
}

impl Default for WavemeterConfig {
    fn default() -> Self {
        Self {
            backend: WavemeterBackend::Simulated,
            noise_mhz: default_noise_mhz(),
            idle_wavelength_nm: default_idle_wavelength(),
        }
    }
}

/// Name server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NameServerConfig {
    /// Whether services register themselves by name
    pub enabled: bool,
    /// Address of the name server
    pub address: String,
    /// Start an in-process name server when none answers
    pub start_if_missing: bool,
}

impl Default for NameServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: "127.0.0.1:9090".to_string(),
            start_if_missing: true,
        }
    }
}

/// Laser lock configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Share name of the wavemeter server to read from
    pub arbiter_name: String,
    /// Direct arbiter address, bypassing the name server when set
    #[serde(default)]
    pub arbiter_address: Option<String>,
    /// Address the lock's remote-control surface binds to
    pub bind: String,
    /// Tick cadence of the lock loop
    pub update_interval_ms: u64,
    /// Warm-up window during which jump rejection is disabled
    pub initial_wait_check_secs: f64,
    /// Readings further than this from the setpoint are discarded
    pub max_jump_mhz: f64,
    /// Samples kept for display
    pub history_capacity: usize,
    /// Bound on coarse-setting corrections
    pub coarse_max_iterations: u32,
    /// How long one reading query may wait for its slot
    pub query_timeout_secs: f64,
    /// Slot length requested from the wavemeter server
    pub slot_length_secs: f64,
    /// Reconnect attempts towards the wavemeter server
    pub wlm_reconnect_tries: u32,
    /// Wait between reconnect attempts
    pub wlm_reconnect_wait_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            arbiter_name: "wsserver".to_string(),
            arbiter_address: None,
            bind: "127.0.0.1:0".to_string(),
            update_interval_ms: 200,
            initial_wait_check_secs: 30.0,
            max_jump_mhz: 500.0,
            history_capacity: 20,
            coarse_max_iterations: 20,
            query_timeout_secs: 10.0,
            slot_length_secs: 0.5,
            wlm_reconnect_tries: 5,
            wlm_reconnect_wait_ms: 2000,
        }
    }
}

impl LockConfig {
    /// Tick cadence as a Duration
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }

    /// Warm-up window as a Duration
    pub fn initial_wait_check(&self) -> Duration {
        Duration::from_secs_f64(self.initial_wait_check_secs)
    }

    /// Query timeout as a Duration
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.query_timeout_secs)
    }

    /// Requested slot length as a Duration
    pub fn slot_length(&self) -> Duration {
        Duration::from_secs_f64(self.slot_length_secs)
    }

    /// Reconnect policy towards the wavemeter server
    pub fn reconnect_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.wlm_reconnect_tries,
            backoff_ms: self.wlm_reconnect_wait_ms,
        }
    }
}

/// Laser driver types
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaserKind {
    TopticaDlcPro,
    Simulated,
}

/// Laser definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaserDefinition {
    /// Laser name, also its client name on the wavemeter server
    pub name: String,
    /// Driver type
    pub r#type: LaserKind,
    /// Network address of the laser controller
    #[serde(default)]
    pub address: Option<String>,
    /// Command port of the laser controller
    #[serde(default = "default_laser_port")]
    pub port: u16,
    /// Proportional gain
    #[serde(default)]
    pub pid_p: f64,
    /// Integral gain
    #[serde(default = "default_pid_i")]
    pub pid_i: f64,
    /// Lower feedback limit (V)
    #[serde(default = "default_min_out")]
    pub min_out: f64,
    /// Upper feedback limit (V)
    #[serde(default = "default_max_out")]
    pub max_out: f64,
    /// Shortest settable wavelength (nm)
    #[serde(default = "default_wl_min")]
    pub wl_min: f64,
    /// Longest settable wavelength (nm)
    #[serde(default = "default_wl_max")]
    pub wl_max: f64,
    /// How close coarse setting must land (MHz)
    #[serde(default = "default_coarse_accuracy")]
    pub coarse_accuracy_mhz: f64,
    /// Piezo voltage with zero feedback applied (V)
    #[serde(default = "default_piezo_offset")]
    pub piezo_offset: f64,
}

impl Default for LaserDefinition {
    fn default() -> Self {
        Self {
            name: "laser".to_string(),
            r#type: LaserKind::Simulated,
            address: None,
            port: default_laser_port(),
            pid_p: 0.0,
            pid_i: default_pid_i(),
            min_out: default_min_out(),
            max_out: default_max_out(),
            wl_min: default_wl_min(),
            wl_max: default_wl_max(),
            coarse_accuracy_mhz: default_coarse_accuracy(),
            piezo_offset: default_piezo_offset(),
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_switch_baud_rate() -> u32 {
    115200
}

fn default_switch_timeout() -> u64 {
    1000
}

fn default_number_of_channels() -> u8 {
    8
}

fn default_noise_mhz() -> f64 {
    1.0
}

fn default_idle_wavelength() -> f64 {
    1550.0
}

fn default_laser_port() -> u16 {
    1998
}

fn default_pid_i() -> f64 {
    -1000.0
}

fn default_min_out() -> f64 {
    -10.0
}

fn default_max_out() -> f64 {
    10.0
}

fn default_wl_min() -> f64 {
    1460.0
}

fn default_wl_max() -> f64 {
    1570.0
}

fn default_coarse_accuracy() -> f64 {
    500.0
}

fn default_piezo_offset() -> f64 {
    70.0
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load configuration from `config/wavelock.toml` and environment variables
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config/wavelock.toml")
    }

    /// Load configuration from a specific file path
    ///
    /// Precedence (highest first): `WAVELOCK_` environment variables, the
    /// TOML file, built-in defaults. A missing file is not an error.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file is malformed or validation fails.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let settings: Self = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("WAVELOCK_").split("__"))
            .extract()
            .map_err(ConfigError::Load)?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    ///
    /// # Errors
    ///
    /// Returns a ConfigError with a descriptive message for any validation failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::Validation(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(ConfigError::Validation(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        self.validate_arbiter()?;
        self.validate_lock()?;

        let mut names = HashSet::new();
        for laser in &self.lasers {
            if !names.insert(laser.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate laser name: '{}'",
                    laser.name
                )));
            }
            Self::validate_laser(laser)?;
        }

        Ok(())
    }

    fn validate_arbiter(&self) -> Result<(), ConfigError> {
        let arbiter = &self.arbiter;
        if arbiter.channels.is_empty() {
            return Err(ConfigError::Validation(
                "arbiter.channels must name at least one client".to_string(),
            ));
        }

        let mut used = HashSet::new();
        for (name, &channel) in &arbiter.channels {
            if channel == 0 || channel > self.switch.number_of_channels {
                return Err(ConfigError::Validation(format!(
                    "Client '{}' maps to channel {}, switch has channels 1-{}",
                    name, channel, self.switch.number_of_channels
                )));
            }
            if !used.insert(channel) {
                return Err(ConfigError::Validation(format!(
                    "Channel {} is assigned to more than one client",
                    channel
                )));
            }
        }

        let intervals = [
            ("scheduler_tick_ms", arbiter.scheduler_tick_ms),
            ("read_interval_ms", arbiter.read_interval_ms),
            ("query_poll_ms", arbiter.query_poll_ms),
        ];
        for (key, value) in intervals {
            if value == 0 {
                return Err(ConfigError::Validation(format!(
                    "arbiter.{} must be > 0",
                    key
                )));
            }
        }

        if !(arbiter.default_slot_secs > 0.0 && arbiter.default_slot_secs.is_finite()) {
            return Err(ConfigError::Validation(format!(
                "arbiter.default_slot_secs must be > 0, got {}",
                arbiter.default_slot_secs
            )));
        }
        if !(arbiter.max_inactivity_secs > 0.0 && arbiter.max_inactivity_secs.is_finite()) {
            return Err(ConfigError::Validation(format!(
                "arbiter.max_inactivity_secs must be > 0, got {}",
                arbiter.max_inactivity_secs
            )));
        }

        Ok(())
    }

    fn validate_lock(&self) -> Result<(), ConfigError> {
        let lock = &self.lock;
        if lock.update_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "lock.update_interval_ms must be > 0".to_string(),
            ));
        }
        if lock.history_capacity == 0 {
            return Err(ConfigError::Validation(
                "lock.history_capacity must be > 0".to_string(),
            ));
        }
        let positive = [
            ("initial_wait_check_secs", lock.initial_wait_check_secs, true),
            ("max_jump_mhz", lock.max_jump_mhz, false),
            ("query_timeout_secs", lock.query_timeout_secs, false),
            ("slot_length_secs", lock.slot_length_secs, false),
        ];
        for (key, value, zero_ok) in positive {
            let ok = value.is_finite() && (value > 0.0 || (zero_ok && value == 0.0));
            if !ok {
                return Err(ConfigError::Validation(format!(
                    "lock.{} must be > 0, got {}",
                    key, value
                )));
            }
        }
        Ok(())
    }

    fn validate_laser(laser: &LaserDefinition) -> Result<(), ConfigError> {
        if laser.name.is_empty() {
            return Err(ConfigError::Validation(
                "Laser name cannot be empty".to_string(),
            ));
        }
        if laser.wl_min >= laser.wl_max {
            return Err(ConfigError::Validation(format!(
                "Laser '{}': wl_min ({}) must be below wl_max ({})",
                laser.name, laser.wl_min, laser.wl_max
            )));
        }
        if laser.min_out >= laser.max_out {
            return Err(ConfigError::Validation(format!(
                "Laser '{}': min_out ({}) must be below max_out ({})",
                laser.name, laser.min_out, laser.max_out
            )));
        }
        if laser.r#type == LaserKind::TopticaDlcPro
            && laser.address.as_deref().map_or(true, str::is_empty)
        {
            return Err(ConfigError::Validation(format!(
                "Toptica laser '{}': 'address' cannot be empty",
                laser.name
            )));
        }
        Ok(())
    }

    /// Look up a configured laser by name
    pub fn laser(&self, name: &str) -> Option<&LaserDefinition> {
        self.lasers.iter().find(|laser| laser.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn toptica(name: &str) -> LaserDefinition {
        LaserDefinition {
            name: name.to_string(),
            r#type: LaserKind::TopticaDlcPro,
            address: Some("192.168.1.20".to_string()),
            port: 1998,
            pid_p: 0.0,
            pid_i: -1000.0,
            min_out: -10.0,
            max_out: 10.0,
            wl_min: 1460.0,
            wl_max: 1570.0,
            coarse_accuracy_mhz: 500.0,
            piezo_offset: 70.0,
        }
    }

    #[test]
    fn test_config_validation_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.arbiter.channels.len(), 8);
        assert_eq!(settings.arbiter.channels["CTL2"], 2);
    }

    #[test]
    fn test_invalid_log_level() {
        let mut settings = Settings::default();
        settings.application.log_level = "invalid".to_string();

        let result = settings.validate();
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Invalid log_level"));
    }

    #[test]
    fn test_channel_out_of_range() {
        let mut settings = Settings::default();
        settings.arbiter.channels.insert("EXTRA".to_string(), 9);

        let err = settings.validate().unwrap_err().to_string();
        assert!(err.contains("switch has channels 1-8"), "{err}");
    }

    #[test]
    fn test_duplicate_channel() {
        let mut settings = Settings::default();
        settings.arbiter.channels.insert("EXTRA".to_string(), 2);

        let err = settings.validate().unwrap_err().to_string();
        assert!(err.contains("more than one client"), "{err}");
    }

    #[test]
    fn test_duplicate_laser_names() {
        let mut settings = Settings::default();
        settings.lasers = vec![toptica("CTL2"), toptica("CTL2")];

        let err = settings.validate().unwrap_err().to_string();
        assert!(err.contains("Duplicate laser name"), "{err}");
    }

    #[test]
    fn test_toptica_requires_address() {
        let mut settings = Settings::default();
        let mut laser = toptica("CTL2");
        laser.address = None;
        settings.lasers = vec![laser];

        let err = settings.validate().unwrap_err().to_string();
        assert!(err.contains("'address' cannot be empty"), "{err}");
    }

    #[test]
    fn test_inverted_wavelength_range() {
        let mut settings = Settings::default();
        let mut laser = toptica("CTL1");
        laser.wl_min = 1600.0;
        settings.lasers = vec![laser];

        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[arbiter]
max_inactivity_secs = 12.5

[arbiter.channels]
A = 1
B = 2

[lock]
max_jump_mhz = 250.0

[[lasers]]
name = "A"
type = "simulated"
"#
        )
        .unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.arbiter.max_inactivity_secs, 12.5);
        assert_eq!(settings.arbiter.channels.len(), 2);
        // Untouched keys keep their defaults.
        assert_eq!(settings.arbiter.scheduler_tick_ms, 100);
        assert_eq!(settings.lock.max_jump_mhz, 250.0);
        assert_eq!(settings.laser("A").map(|l| l.r#type), Some(LaserKind::Simulated));
        assert_eq!(settings.laser("A").map(|l| l.pid_i), Some(-1000.0));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let settings = Settings::load_from("/nonexistent/wavelock.toml").unwrap();
        assert_eq!(settings.arbiter.share_name, "wsserver");
        assert_eq!(settings.lock.update_interval(), Duration::from_millis(200));
    }
}
