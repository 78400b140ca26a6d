//! Byte transports underneath the connection registry.
//!
//! A [`Transport`] is one open serial line. Drivers never see it directly: they go through
//! the [`PortLink`](super::connection::PortLink) owned by the registry entry. Opening is done
//! by a [`PortOpener`], so tests can swap the real `serialport` backend for an in-memory one.

use crate::error::{AppResult, BenchError};
use async_trait::async_trait;
use std::time::Duration;

#[cfg(feature = "instrument_serial")]
use std::sync::Arc;
#[cfg(feature = "instrument_serial")]
use tokio::sync::Mutex;

#[cfg(feature = "instrument_serial")]
use serialport::SerialPort;

/// Identifies a physical serial line and how to open it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortSettings {
    /// Platform port name (e.g., "COM3", "/dev/ttyUSB0")
    pub name: String,
    /// Baud rate (9600, 115200, etc.)
    pub baud_rate: u32,
    /// Read timeout enforced by the transport
    pub timeout: Duration,
}

impl PortSettings {
    /// Create port settings with the given name, baud rate and read timeout.
    pub fn new(name: impl Into<String>, baud_rate: u32, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            baud_rate,
            timeout,
        }
    }
}

/// An open, byte-oriented serial line.
#[async_trait]
pub trait Transport: Send {
    /// Write every byte of `data`.
    async fn write_all(&mut self, data: &[u8]) -> AppResult<()>;

    /// Read up to `buf.len()` bytes.
    ///
    /// Returns `Ok(0)` when the read timeout elapsed without data; callers treat that the
    /// same as an instrument that chose not to answer.
    async fn read(&mut self, buf: &mut [u8]) -> AppResult<usize>;
}

/// Opens transports for the [`ConnectionRegistry`](super::ConnectionRegistry).
pub trait PortOpener: Send + Sync {
    /// Open the line described by `settings`.
    ///
    /// # Errors
    /// Returns [`BenchError::PortUnavailable`] if the port is missing, busy or not permitted.
    fn open(&self, settings: &PortSettings) -> AppResult<Box<dyn Transport>>;
}

/// Opens real serial ports through the `serialport` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialOpener;

impl PortOpener for SerialOpener {
    #[cfg(feature = "instrument_serial")]
    fn open(&self, settings: &PortSettings) -> AppResult<Box<dyn Transport>> {
        let mut port = serialport::new(&settings.name, settings.baud_rate)
            .timeout(settings.timeout)
            .open()
            .map_err(|e| BenchError::port_unavailable(&settings.name, e))?;

        // Instrument firmware resets on DTR; the registry waits out the boot time.
        if let Err(e) = port.write_data_terminal_ready(true) {
            tracing::warn!(port = %settings.name, error = %e, "Could not assert DTR");
        }

        tracing::debug!(
            port = %settings.name,
            baud_rate = settings.baud_rate,
            "Serial port opened"
        );
        Ok(Box::new(SerialTransport {
            name: settings.name.clone(),
            port: Arc::new(Mutex::new(port)),
        }))
    }

    #[cfg(not(feature = "instrument_serial"))]
    fn open(&self, _settings: &PortSettings) -> AppResult<Box<dyn Transport>> {
        Err(BenchError::SerialFeatureDisabled)
    }
}

/// Serial line backed by `serialport`.
///
/// `serialport` I/O is blocking, so every call runs on Tokio's blocking executor.
#[cfg(feature = "instrument_serial")]
pub struct SerialTransport {
    name: String,
    port: Arc<Mutex<Box<dyn SerialPort>>>,
}

#[cfg(feature = "instrument_serial")]
#[async_trait]
impl Transport for SerialTransport {
    async fn write_all(&mut self, data: &[u8]) -> AppResult<()> {
        let port = self.port.clone();
        let data = data.to_vec();
        let name = self.name.clone();

        tokio::task::spawn_blocking(move || -> AppResult<()> {
            use std::io::Write;

            let mut port_guard = port.blocking_lock();
            port_guard
                .write_all(&data)
                .and_then(|_| port_guard.flush())
                .map_err(|e| BenchError::Transport(format!("write to {} failed: {}", name, e)))
        })
        .await
        .map_err(|e| BenchError::Transport(format!("serial I/O task panicked: {}", e)))?
    }

    async fn read(&mut self, buf: &mut [u8]) -> AppResult<usize> {
        let port = self.port.clone();
        let len = buf.len();
        let name = self.name.clone();

        let chunk = tokio::task::spawn_blocking(move || -> AppResult<Vec<u8>> {
            use std::io::Read;

            let mut port_guard = port.blocking_lock();
            let mut chunk = vec![0u8; len];
            match port_guard.read(&mut chunk) {
                Ok(n) => {
                    chunk.truncate(n);
                    Ok(chunk)
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(Vec::new()),
                Err(e) => Err(BenchError::Transport(format!(
                    "read from {} failed: {}",
                    name, e
                ))),
            }
        })
        .await
        .map_err(|e| BenchError::Transport(format!("serial I/O task panicked: {}", e)))??;

        buf[..chunk.len()].copy_from_slice(&chunk);
        Ok(chunk.len())
    }
}
