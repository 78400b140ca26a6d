//! TDK-Lambda Zup supplies sharing one serial line
//!
//! Several Zup units hang off the same port and are told apart by address. Before talking,
//! a driver checks which address was last selected on its port and, if it is not its own,
//! writes the select frame `:ADR<NN>;` first. Select frame and command go out under the same
//! port lock, so no other driver can slip a frame in between.
//!
//! ## Frame format
//!
//! ```text
//! :ADR01;      select unit 1
//! :OUT1;       "OUT 1" (whitespace removed)
//! :MDL?;       identity query, answered with one line
//! ```

use super::{probe_outcome, DeviceDescriptor, DeviceDriver, TextLine};
use crate::error::{AppResult, BenchError};
use crate::hardware::{ConnectionRegistry, PortLease, PortLink};
use async_trait::async_trait;

/// Driver for one addressable supply on a shared port.
pub struct AddressableDriver {
    descriptor: DeviceDescriptor,
    address: u8,
    lease: PortLease,
    line: TextLine,
    connected: bool,
}

impl AddressableDriver {
    /// Identity query sent once at construction.
    pub const IDENTITY_QUERY: &'static str = "MDL?";

    /// Join the shared connection for the descriptor's port and probe the unit.
    ///
    /// # Errors
    /// - [`BenchError::Configuration`] if the descriptor carries no address
    /// - [`BenchError::PortUnavailable`] if the port cannot be opened
    pub async fn connect(
        descriptor: DeviceDescriptor,
        registry: &ConnectionRegistry,
    ) -> AppResult<Self> {
        let address = descriptor.address.ok_or_else(|| {
            BenchError::Configuration(format!(
                "'{}' is an addressable supply but has no address",
                descriptor.label
            ))
        })?;
        let lease = registry.acquire(&descriptor.port).await?;

        let mut driver = Self {
            line: TextLine::new(&descriptor),
            descriptor,
            address,
            lease,
            connected: false,
        };
        let identity = driver.query(Self::IDENTITY_QUERY).await;
        driver.connected = probe_outcome(&driver.descriptor.label, identity);
        Ok(driver)
    }

    /// Bus address of this unit.
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Select frame for this unit.
    pub fn select_frame(&self) -> Vec<u8> {
        self.line.frame(&format!("ADR{:02}", self.address))
    }

    async fn select(&self, link: &mut PortLink) -> AppResult<()> {
        if link.selected_address() == Some(self.address) {
            return Ok(());
        }
        tracing::debug!(
            device = %self.descriptor.label,
            port = %self.lease.port(),
            previous = ?link.selected_address(),
            address = self.address,
            "Selecting address"
        );
        link.write_frame(&self.select_frame()).await?;
        self.line.settle().await;
        link.mark_selected(self.address);
        Ok(())
    }
}

#[async_trait]
impl DeviceDriver for AddressableDriver {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn write(&mut self, command: &str) -> AppResult<()> {
        if self.line.is_repeat(command) {
            tracing::debug!(device = %self.descriptor.label, command, "Skipping repeated command");
            return Ok(());
        }
        {
            let mut link = self.lease.lock().await;
            self.select(&mut link).await?;
            self.line.send(&mut link, command).await?;
        }
        self.line.remember(command);
        Ok(())
    }

    async fn read(&mut self) -> AppResult<String> {
        let mut link = self.lease.lock().await;
        self.line.receive(&mut link).await
    }

    async fn query(&mut self, command: &str) -> AppResult<String> {
        let response = {
            let mut link = self.lease.lock().await;
            self.select(&mut link).await?;
            self.line.send(&mut link, command).await?;
            self.line.receive(&mut link).await?
        };
        self.line.remember(command);
        tracing::debug!(device = %self.descriptor.label, command, response = %response, "Query answered");
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockOpener;
    use crate::hardware::PortSettings;
    use crate::instrument::DeviceFamily;
    use std::sync::Arc;
    use std::time::Duration;

    fn setup() -> (MockOpener, ConnectionRegistry) {
        let opener = MockOpener::new();
        opener.respond("COM1", "MDL?", "Z36-6\r\n");
        let registry = ConnectionRegistry::with_opener(Arc::new(opener.clone()))
            .with_settle_delay(Duration::ZERO);
        (opener, registry)
    }

    fn zup(address: u8) -> DeviceDescriptor {
        DeviceDescriptor::new(
            format!("Zup ({})", address),
            DeviceFamily::ZupSupply,
            PortSettings::new("COM1", 9600, Duration::from_millis(50)),
        )
        .with_address(address)
        .with_command_delay(Duration::ZERO)
    }

    #[tokio::test]
    async fn test_probe_selects_then_queries() {
        let (opener, registry) = setup();
        let driver = AddressableDriver::connect(zup(1), &registry).await.unwrap();

        assert!(driver.is_connected());
        assert_eq!(opener.written_text("COM1"), vec![":ADR01;", ":MDL?;"]);
    }

    #[tokio::test]
    async fn test_missing_address_is_config_error() {
        let (_opener, registry) = setup();
        let mut descriptor = zup(1);
        descriptor.address = None;

        let result = AddressableDriver::connect(descriptor, &registry).await;
        assert!(matches!(result, Err(BenchError::Configuration(_))));
        assert!(!registry.is_open("COM1"));
    }

    #[tokio::test]
    async fn test_silent_unit_is_not_connected() {
        let opener = MockOpener::new();
        let registry = ConnectionRegistry::with_opener(Arc::new(opener.clone()))
            .with_settle_delay(Duration::ZERO);

        let driver = AddressableDriver::connect(zup(4), &registry).await.unwrap();
        assert!(!driver.is_connected());
        assert!(registry.is_open("COM1"));
    }

    #[tokio::test]
    async fn test_repeated_write_sent_once() {
        let (opener, registry) = setup();
        let mut driver = AddressableDriver::connect(zup(1), &registry).await.unwrap();
        opener.clear_written("COM1");

        driver.write("OUT1").await.unwrap();
        driver.write("OUT1").await.unwrap();
        assert_eq!(opener.written_text("COM1"), vec![":OUT1;"]);
    }

    #[tokio::test]
    async fn test_repeated_query_always_sent() {
        let (opener, registry) = setup();
        let mut driver = AddressableDriver::connect(zup(1), &registry).await.unwrap();
        opener.clear_written("COM1");

        driver.query("OUT1?").await.unwrap();
        driver.query("OUT1?").await.unwrap();
        assert_eq!(opener.written_text("COM1"), vec![":OUT1?;", ":OUT1?;"]);
    }

    #[tokio::test]
    async fn test_alternating_units_reselect_once_per_switch() {
        let (opener, registry) = setup();
        let mut first = AddressableDriver::connect(zup(1), &registry).await.unwrap();
        let mut second = AddressableDriver::connect(zup(2), &registry).await.unwrap();
        opener.clear_written("COM1");

        first.write("OUT 1").await.unwrap();
        first.write("VOL 5").await.unwrap();
        second.write("OUT 1").await.unwrap();
        first.write("CUR 1").await.unwrap();

        assert_eq!(
            opener.written_text("COM1"),
            vec![":ADR01;", ":OUT1;", ":VOL5;", ":ADR02;", ":OUT1;", ":ADR01;", ":CUR1;"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_delay_after_select_and_command() {
        let (opener, registry) = setup();
        let delay = Duration::from_millis(15);
        let mut first = AddressableDriver::connect(zup(1).with_command_delay(delay), &registry)
            .await
            .unwrap();
        let _second = AddressableDriver::connect(zup(2).with_command_delay(delay), &registry)
            .await
            .unwrap();
        opener.clear_written("COM1");

        let start = tokio::time::Instant::now();
        first.write("OUT 1").await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= delay * 2, "select and command each wait: {:?}", elapsed);
        assert!(elapsed < delay * 3);

        let repeat = tokio::time::Instant::now();
        first.write("OUT 1").await.unwrap();
        assert!(repeat.elapsed() < Duration::from_millis(1));
        assert_eq!(opener.written_text("COM1"), vec![":ADR01;", ":OUT1;"]);
    }
}
