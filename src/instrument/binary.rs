//! Device under test with a single-byte command protocol.
//!
//! Commands are integers in `0..=255` sent as one raw byte; every response is a fixed
//! eight-byte block decoded as text. There is no framing, addressing or de-duplication.
//!
//! Text commands coming from the step table are parsed with [`BinaryDriver::parse_command`]:
//! `"5"` sends byte 5, `"5?"` sends byte 5 and reads the response.

use super::framing::QUERY_MARKER;
use super::{probe_outcome, DeviceDescriptor, DeviceDriver};
use crate::error::{AppResult, BenchError};
use crate::hardware::{ConnectionRegistry, PortLease};
use async_trait::async_trait;
use std::time::Duration;

/// Length of every response block.
pub const RESPONSE_LEN: usize = 8;

/// Driver for the binary device under test.
pub struct BinaryDriver {
    descriptor: DeviceDescriptor,
    lease: PortLease,
    connected: bool,
}

impl BinaryDriver {
    /// Open the descriptor's port exclusively and send the probe byte.
    ///
    /// # Errors
    /// [`BenchError::PortUnavailable`] if the port cannot be opened.
    pub async fn connect(
        descriptor: DeviceDescriptor,
        registry: &ConnectionRegistry,
    ) -> AppResult<Self> {
        let lease = registry.acquire_exclusive(&descriptor.port).await?;
        let mut driver = Self {
            descriptor,
            lease,
            connected: false,
        };
        let probe = driver.descriptor.probe_byte;
        let identity = driver.query_byte(probe).await;
        driver.connected = probe_outcome(&driver.descriptor.label, identity);
        Ok(driver)
    }

    /// Parse a table command into its byte value.
    ///
    /// # Errors
    /// [`BenchError::InvalidCommand`] unless the command is an integer in `0..=255`.
    pub fn parse_command(raw: &str) -> AppResult<u8> {
        let digits = raw.trim().trim_end_matches(QUERY_MARKER).trim();
        digits.parse::<u8>().map_err(|_| {
            BenchError::InvalidCommand(format!(
                "'{}' is not a byte command (expected 0-255)",
                raw
            ))
        })
    }

    /// Send one command byte.
    pub async fn write_byte(&mut self, command: u8) -> AppResult<()> {
        let mut link = self.lease.lock().await;
        link.write_frame(&[command]).await?;
        tokio::time::sleep(self.delay()).await;
        Ok(())
    }

    /// Read one eight-byte response (shorter if the transport times out).
    pub async fn read_block(&mut self) -> AppResult<String> {
        let mut link = self.lease.lock().await;
        let block = link.read_bytes(RESPONSE_LEN).await?;
        Ok(String::from_utf8_lossy(&block).into_owned())
    }

    /// Send one command byte and read its response block.
    pub async fn query_byte(&mut self, command: u8) -> AppResult<String> {
        let mut link = self.lease.lock().await;
        link.write_frame(&[command]).await?;
        tokio::time::sleep(self.delay()).await;
        let block = link.read_bytes(RESPONSE_LEN).await?;
        Ok(String::from_utf8_lossy(&block).into_owned())
    }

    fn delay(&self) -> Duration {
        self.descriptor.command_delay
    }
}

#[async_trait]
impl DeviceDriver for BinaryDriver {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn write(&mut self, command: &str) -> AppResult<()> {
        let byte = Self::parse_command(command)?;
        self.write_byte(byte).await
    }

    async fn read(&mut self) -> AppResult<String> {
        self.read_block().await
    }

    async fn query(&mut self, command: &str) -> AppResult<String> {
        let byte = Self::parse_command(command)?;
        self.query_byte(byte).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockOpener;
    use crate::hardware::PortSettings;
    use crate::instrument::DeviceFamily;
    use std::sync::Arc;

    fn tester() -> DeviceDescriptor {
        DeviceDescriptor::new(
            "Test",
            DeviceFamily::BinaryTester,
            PortSettings::new("COM5", 9600, Duration::from_millis(50)),
        )
        .with_command_delay(Duration::ZERO)
    }

    fn registry(opener: &MockOpener) -> ConnectionRegistry {
        ConnectionRegistry::with_opener(Arc::new(opener.clone())).with_settle_delay(Duration::ZERO)
    }

    #[test]
    fn test_parse_command() {
        assert_eq!(BinaryDriver::parse_command("5").unwrap(), 5);
        assert_eq!(BinaryDriver::parse_command(" 255? ").unwrap(), 255);
        assert!(matches!(
            BinaryDriver::parse_command("256"),
            Err(BenchError::InvalidCommand(_))
        ));
        assert!(BinaryDriver::parse_command("OUT").is_err());
    }

    #[tokio::test]
    async fn test_probe_uses_probe_byte() {
        let opener = MockOpener::new();
        opener.respond("COM5", [0x07], "READY-01");
        let registry = registry(&opener);

        let driver = BinaryDriver::connect(tester().with_probe_byte(0x07), &registry)
            .await
            .unwrap();
        assert!(driver.is_connected());
        assert_eq!(opener.written("COM5"), vec![vec![0x07]]);
    }

    #[tokio::test]
    async fn test_write_sends_single_byte() {
        let opener = MockOpener::new();
        let registry = registry(&opener);
        let mut driver = BinaryDriver::connect(tester(), &registry).await.unwrap();
        opener.clear_written("COM5");

        driver.write_byte(5).await.unwrap();
        assert_eq!(opener.written("COM5"), vec![vec![5u8]]);
    }

    #[tokio::test]
    async fn test_read_returns_eight_chars() {
        let opener = MockOpener::new();
        opener.respond("COM5", [0x05], "ABCDEFGHIJ");
        let registry = registry(&opener);
        let mut driver = BinaryDriver::connect(tester(), &registry).await.unwrap();

        driver.write("5").await.unwrap();
        let block = driver.read().await.unwrap();
        assert_eq!(block, "ABCDEFGH");
        assert_eq!(block.chars().count(), RESPONSE_LEN);
    }

    #[tokio::test]
    async fn test_repeated_writes_not_deduplicated() {
        let opener = MockOpener::new();
        let registry = registry(&opener);
        let mut driver = BinaryDriver::connect(tester(), &registry).await.unwrap();
        opener.clear_written("COM5");

        driver.write("9").await.unwrap();
        driver.write("9").await.unwrap();
        assert_eq!(opener.written("COM5").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_waits_command_delay() {
        let opener = MockOpener::new();
        let registry = registry(&opener);
        let delay = Duration::from_millis(15);
        let mut driver = BinaryDriver::connect(tester().with_command_delay(delay), &registry)
            .await
            .unwrap();

        let start = tokio::time::Instant::now();
        driver.write("5").await.unwrap();
        assert!(start.elapsed() >= delay);
    }
}
