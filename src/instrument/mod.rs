//! Device drivers for the bench instruments.
//!
//! Every instrument is reached through the [`DeviceDriver`] trait. Three variants exist:
//!
//! - [`AddressableDriver`]: supplies that share one port and are picked by an address-select
//!   frame (TDK-Lambda Zup).
//! - [`DirectDriver`]: supplies with a port of their own (TDK-Lambda Genesys, Agilent N3300).
//! - [`BinaryDriver`]: the device under test, driven with single-byte commands.
//!
//! Drivers are built from a [`DeviceDescriptor`] by [`registry::build_driver`]. Construction
//! probes the instrument identity once; an empty answer leaves the driver usable with
//! `is_connected() == false`.

pub mod addressable;
pub mod binary;
pub mod direct;
pub mod framing;
pub mod registry;

pub use addressable::AddressableDriver;
pub use binary::BinaryDriver;
pub use direct::DirectDriver;
pub use framing::{CommandKind, Framing, Separator};
pub use registry::{build_driver, DeviceFamily, DriverKind};

use crate::error::AppResult;
use crate::hardware::{PortLink, PortSettings};
use async_trait::async_trait;
use std::time::Duration;

/// Protocol settle time between commands when the configuration does not say otherwise.
pub const DEFAULT_COMMAND_DELAY: Duration = Duration::from_millis(15);

/// Everything needed to build one driver.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceDescriptor {
    /// Slot label used in results and reports
    pub label: String,
    /// Resolved model family
    pub family: DeviceFamily,
    /// Physical port
    pub port: PortSettings,
    /// Bus address, required for addressable families
    pub address: Option<u8>,
    /// Sleep after every transmitted frame
    pub command_delay: Duration,
    /// Text framing tokens
    pub framing: Framing,
    /// Identity probe byte, used by binary devices only
    pub probe_byte: u8,
}

impl DeviceDescriptor {
    /// Descriptor with the family's framing and default timing.
    pub fn new(label: impl Into<String>, family: DeviceFamily, port: PortSettings) -> Self {
        Self {
            label: label.into(),
            family,
            port,
            address: None,
            command_delay: DEFAULT_COMMAND_DELAY,
            framing: family.framing(),
            probe_byte: 0,
        }
    }

    /// Set the bus address.
    pub fn with_address(mut self, address: u8) -> Self {
        self.address = Some(address);
        self
    }

    /// Set the inter-command delay.
    pub fn with_command_delay(mut self, delay: Duration) -> Self {
        self.command_delay = delay;
        self
    }

    /// Set the binary identity probe byte.
    pub fn with_probe_byte(mut self, probe: u8) -> Self {
        self.probe_byte = probe;
        self
    }
}

/// One live instrument.
#[async_trait]
pub trait DeviceDriver: Send {
    /// Descriptor the driver was built from.
    fn descriptor(&self) -> &DeviceDescriptor;

    /// Slot label.
    fn label(&self) -> &str {
        &self.descriptor().label
    }

    /// Whether the identity probe at construction got an answer.
    fn is_connected(&self) -> bool;

    /// Frame and send a command, then wait the inter-command delay.
    async fn write(&mut self, command: &str) -> AppResult<()>;

    /// Read one response.
    async fn read(&mut self) -> AppResult<String>;

    /// Send a command and read its response as one exchange.
    async fn query(&mut self, command: &str) -> AppResult<String>;
}

/// Shared text-protocol state for addressable and direct drivers.
#[derive(Debug)]
pub(crate) struct TextLine {
    framing: Framing,
    delay: Duration,
    last_command: Option<String>,
}

impl TextLine {
    pub(crate) fn new(descriptor: &DeviceDescriptor) -> Self {
        Self {
            framing: descriptor.framing.clone(),
            delay: descriptor.command_delay,
            last_command: None,
        }
    }

    /// A write repeating this driver's last non-query command is skipped.
    pub(crate) fn is_repeat(&self, command: &str) -> bool {
        CommandKind::classify(command) == CommandKind::Write
            && self.last_command.as_deref() == Some(command)
    }

    pub(crate) fn remember(&mut self, command: &str) {
        if CommandKind::classify(command) == CommandKind::Write {
            self.last_command = Some(command.to_string());
        }
    }

    pub(crate) fn frame(&self, command: &str) -> Vec<u8> {
        self.framing.frame(command)
    }

    pub(crate) async fn send(&self, link: &mut PortLink, command: &str) -> AppResult<()> {
        link.write_frame(&self.framing.frame(command)).await?;
        self.settle().await;
        Ok(())
    }

    pub(crate) async fn settle(&self) {
        tokio::time::sleep(self.delay).await;
    }

    pub(crate) async fn receive(&self, link: &mut PortLink) -> AppResult<String> {
        let line = link.read_line().await?;
        Ok(decode(&line))
    }
}

/// Decode a response as text, dropping surrounding whitespace and line terminators.
pub(crate) fn decode(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim().to_string()
}

/// Run the identity probe and turn the answer into a `connected` flag.
///
/// Transport failures during the probe count as "no answer".
pub(crate) fn probe_outcome(label: &str, result: AppResult<String>) -> bool {
    match result {
        Ok(identity) if !identity.is_empty() => {
            tracing::info!(device = %label, identity = %identity, "Device answered identity query");
            true
        }
        Ok(_) => {
            tracing::warn!(device = %label, "No answer to identity query");
            false
        }
        Err(e) => {
            tracing::warn!(device = %label, error = %e, "Identity query failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> DeviceDescriptor {
        DeviceDescriptor::new(
            "Zup",
            DeviceFamily::ZupSupply,
            PortSettings::new("COM1", 9600, Duration::from_secs(1)),
        )
    }

    #[test]
    fn test_descriptor_defaults_follow_family() {
        let d = descriptor().with_address(3);
        assert_eq!(d.framing, Framing::new(":", "", ";"));
        assert_eq!(d.command_delay, DEFAULT_COMMAND_DELAY);
        assert_eq!(d.address, Some(3));
    }

    #[test]
    fn test_text_line_dedup_ignores_queries() {
        let mut line = TextLine::new(&descriptor());
        assert!(!line.is_repeat("OUT 1"));
        line.remember("OUT 1");
        assert!(line.is_repeat("OUT 1"));
        line.remember("VOL?");
        assert!(line.is_repeat("OUT 1"));
        assert!(!line.is_repeat("VOL?"));
    }

    #[test]
    fn test_decode_trims_terminators() {
        assert_eq!(decode(b"Z36-6\r\n"), "Z36-6");
        assert_eq!(decode(b""), "");
    }
}
