//! Bench configuration using Figment.
//!
//! Settings are layered, lowest to highest precedence:
//! 1. Built-in defaults
//! 2. TOML file (default: `psu-bench.toml`)
//! 3. Environment variables prefixed with `BENCH_`, nesting separated by `__`
//!
//! ```text
//! BENCH_APPLICATION__LOG_LEVEL=debug
//! BENCH_SERIAL__BAUD_RATE=19200
//! BENCH_TABLES__DEVICES="configs/bench2 config_dev.csv"
//! ```
//!
//! The device and step tables themselves are CSV files, see [`tables`].
//!
//! # Example
//!
//! ```no_run
//! use psu_bench::config::Settings;
//!
//! let settings = Settings::load_from("psu-bench.toml")?;
//! println!("Report dir: {}", settings.application.report_dir.display());
//! # Ok::<(), psu_bench::error::BenchError>(())
//! ```

pub mod tables;

pub use tables::{Assignment, DeviceRow, DeviceTable, StepTable};

use crate::error::{AppResult, BenchError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default settings file looked up by [`Settings::load`].
pub const DEFAULT_SETTINGS_FILE: &str = "psu-bench.toml";

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Serial line defaults shared by all devices
    #[serde(default)]
    pub serial: SerialConfig,
    /// Locations of the CSV tables
    #[serde(default)]
    pub tables: TablesConfig,
}

/// Application-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Directory receiving text reports
    #[serde(default = "default_report_dir")]
    pub report_dir: PathBuf,
}

/// Serial timing and framing defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Baud rate for every port
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Transport read timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Sleep after each frame in milliseconds
    #[serde(default = "default_command_delay_ms")]
    pub command_delay_ms: u64,
    /// Wait after opening a port in milliseconds
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// Identity probe byte for the binary device
    #[serde(default)]
    pub binary_probe: u8,
}

/// Paths of the device and step tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TablesConfig {
    /// Device table (label, port, address)
    #[serde(default = "default_devices_table")]
    pub devices: PathBuf,
    /// Step table (step id, one cell per device)
    #[serde(default = "default_steps_table")]
    pub steps: PathBuf,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_name() -> String {
    "psu-bench".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_report_dir() -> PathBuf {
    PathBuf::from("Report_info")
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_command_delay_ms() -> u64 {
    15
}

fn default_settle_delay_ms() -> u64 {
    2000
}

fn default_devices_table() -> PathBuf {
    PathBuf::from("configs/config_dev.csv")
}

fn default_steps_table() -> PathBuf {
    PathBuf::from("configs/config_test.csv")
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            report_dir: default_report_dir(),
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: default_baud_rate(),
            timeout_ms: default_timeout_ms(),
            command_delay_ms: default_command_delay_ms(),
            settle_delay_ms: default_settle_delay_ms(),
            binary_probe: 0,
        }
    }
}

impl Default for TablesConfig {
    fn default() -> Self {
        Self {
            devices: default_devices_table(),
            steps: default_steps_table(),
        }
    }
}

impl SerialConfig {
    /// Transport read timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Inter-command delay.
    pub fn command_delay(&self) -> Duration {
        Duration::from_millis(self.command_delay_ms)
    }

    /// Wait after opening a port.
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load from [`DEFAULT_SETTINGS_FILE`] and the environment.
    ///
    /// # Errors
    /// A [`BenchError::Config`] if extraction fails, or [`BenchError::Configuration`] if
    /// validation fails.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_SETTINGS_FILE)
    }

    /// Load from a specific TOML file and the environment. A missing file leaves the
    /// defaults in place.
    ///
    /// # Errors
    /// See [`Settings::load`].
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Self = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("BENCH_").split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate values that parse but make no sense.
    ///
    /// # Errors
    /// [`BenchError::Configuration`] describing the first problem found.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(BenchError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.serial.baud_rate == 0 {
            return Err(BenchError::Configuration(
                "serial.baud_rate must be greater than zero".to_string(),
            ));
        }

        if self.serial.timeout_ms == 0 {
            return Err(BenchError::Configuration(
                "serial.timeout_ms must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_missing_file_gives_defaults() {
        let settings = Settings::load_from("/nonexistent/psu-bench.toml").unwrap();
        assert_eq!(settings.serial.baud_rate, 9600);
        assert_eq!(settings.serial.command_delay(), Duration::from_millis(15));
        assert_eq!(settings.serial.settle_delay(), Duration::from_secs(2));
        assert_eq!(settings.application.report_dir, PathBuf::from("Report_info"));
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
log_level = "debug"

[serial]
baud_rate = 19200
binary_probe = 12

[tables]
devices = "bench/devices.csv"
"#
        )
        .unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.application.log_level, "debug");
        assert_eq!(settings.serial.baud_rate, 19200);
        assert_eq!(settings.serial.binary_probe, 12);
        assert_eq!(settings.serial.timeout_ms, 1000);
        assert_eq!(settings.tables.devices, PathBuf::from("bench/devices.csv"));
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let mut settings = Settings::default();
        settings.application.log_level = "loud".to_string();
        assert!(matches!(
            settings.validate(),
            Err(BenchError::Configuration(_))
        ));
    }

    #[test]
    fn test_zero_baud_rejected() {
        let mut settings = Settings::default();
        settings.serial.baud_rate = 0;
        assert!(settings.validate().is_err());
    }
}
