//! Supplies on a dedicated serial line (TDK-Lambda Genesys, Agilent N3300).
//!
//! No addressing step: the driver holds the port exclusively and sends SCPI-style text
//! commands with a space separator and no start/end tokens.

use super::{probe_outcome, DeviceDescriptor, DeviceDriver, TextLine};
use crate::error::AppResult;
use crate::hardware::{ConnectionRegistry, PortLease};
use async_trait::async_trait;

/// Driver for a supply that owns its port.
pub struct DirectDriver {
    descriptor: DeviceDescriptor,
    lease: PortLease,
    line: TextLine,
    connected: bool,
}

impl DirectDriver {
    /// Identity query sent once at construction.
    pub const IDENTITY_QUERY: &'static str = "*IDN?";

    /// Open the descriptor's port exclusively and probe the instrument.
    ///
    /// # Errors
    /// [`BenchError::PortUnavailable`](crate::error::BenchError::PortUnavailable) if the port
    /// cannot be opened or is already in use by another driver.
    pub async fn connect(
        descriptor: DeviceDescriptor,
        registry: &ConnectionRegistry,
    ) -> AppResult<Self> {
        let lease = registry.acquire_exclusive(&descriptor.port).await?;
        let mut driver = Self {
            line: TextLine::new(&descriptor),
            descriptor,
            lease,
            connected: false,
        };
        let identity = driver.query(Self::IDENTITY_QUERY).await;
        driver.connected = probe_outcome(&driver.descriptor.label, identity);
        Ok(driver)
    }
}

#[async_trait]
impl DeviceDriver for DirectDriver {
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
            self.line.send(&mut link, command).await?;
            self.line.receive(&mut link).await?
        };
        self.line.remember(command);
        Ok(response)
    }
}
