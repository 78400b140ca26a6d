//! Custom error types for the bench.
//!
//! This module defines the primary error type, `BenchError`, for the whole crate.
//! Using the `thiserror` crate, it provides one consistent way to report failures,
//! from serial port problems to configuration mistakes in the device and step tables.
//!
//! ## Error Hierarchy
//!
//! - **`PortUnavailable`**: the physical port could not be opened (missing, held by another
//!   process, permission denied). Raised while a driver is being built and treated as a
//!   per-slot failure by the session, never as a process abort.
//! - **`UnknownModel`**: a model name in the device table does not map to a known family.
//! - **`SessionBlocked`**: a run was requested while not every device answered its probe.
//!   [`TestSession::run_step`](crate::session::TestSession::run_step) reports this as
//!   `StepOutcome::Blocked`; `StepOutcome::into_result` turns it into this error.
//! - **`Transport`**: I/O failure on an already open port.
//! - **`Configuration`** / **`Config`** / **`Csv`**: semantic and parse errors in settings and
//!   tables.
//!
//! An empty identity answer is not an error at all: the driver is built with
//! `connected = false` and the session shows the slot as unreachable.
//!
//! By using `#[from]`, `BenchError` can be created from the underlying error types with `?`.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, BenchError>;

#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum BenchError {
    #[error("Port {port} is unavailable: {reason}")]
    PortUnavailable { port: String, reason: String },

    #[error("Unknown device model '{0}'")]
    UnknownModel(String),

    #[error("Session blocked: some devices are not connected")]
    SessionBlocked,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Step index {index} out of range ({len} steps loaded)")]
    StepOutOfRange { index: usize, len: usize },

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Table error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,
}

impl BenchError {
    /// Shorthand for a [`BenchError::PortUnavailable`] from any displayable cause.
    pub fn port_unavailable(port: &str, reason: impl std::fmt::Display) -> Self {
        BenchError::PortUnavailable {
            port: port.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BenchError::port_unavailable("COM7", "access denied");
        assert_eq!(err.to_string(), "Port COM7 is unavailable: access denied");
    }

    #[test]
    fn test_io_error_converts() {
        fn fails() -> AppResult<()> {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"))?;
            Ok(())
        }
        assert!(matches!(fails(), Err(BenchError::Io(_))));
    }
}
