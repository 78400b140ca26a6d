//! Reference-counted serial connections shared between device drivers.
//!
//! The [`ConnectionRegistry`] owns at most one [`ConnectionEntry`] per physical port. Drivers
//! hold a [`PortLease`] into that entry; the transport is opened on the first lease and closed
//! when the last lease is dropped, on every exit path including failed driver construction.
//!
//! All traffic on a port goes through [`PortLease::lock`], which hands out the entry's
//! [`PortLink`]. The guard covers the transport and the "last selected address" marker, so an
//! address-select frame and the command that follows it are written as one unit.

use super::transport::{PortOpener, PortSettings, SerialOpener, Transport};
use crate::error::{AppResult, BenchError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};
use tokio::time::Instant;

/// Boot time instrument firmware needs after the port is opened (DTR asserted).
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Size of a single transport read when filling the receive buffer.
const READ_CHUNK: usize = 64;

/// Live state of one physical port, reached through [`PortLease::lock`].
pub struct PortLink {
    transport: Box<dyn Transport>,
    selected_address: Option<u8>,
    pending: Vec<u8>,
    port: String,
    timeout: Duration,
}

impl PortLink {
    fn new(settings: &PortSettings, transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            selected_address: None,
            pending: Vec::new(),
            port: settings.name.clone(),
            timeout: settings.timeout,
        }
    }

    /// Address most recently selected on this port by an address-select frame.
    pub fn selected_address(&self) -> Option<u8> {
        self.selected_address
    }

    /// Record that an address-select frame for `address` has been written.
    pub fn mark_selected(&mut self, address: u8) {
        self.selected_address = Some(address);
    }

    /// Write one frame to the port.
    pub async fn write_frame(&mut self, frame: &[u8]) -> AppResult<()> {
        tracing::debug!(
            port = %self.port,
            bytes = frame.len(),
            frame = %String::from_utf8_lossy(frame),
            "Writing frame"
        );
        self.transport.write_all(frame).await
    }

    /// Read one line, including its terminator if one arrived.
    ///
    /// The port timeout bounds the whole read. If it runs out first, whatever was received so
    /// far is returned (possibly nothing).
    pub async fn read_line(&mut self) -> AppResult<Vec<u8>> {
        let deadline = Instant::now() + self.timeout;
        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
                return Ok(self.pending.drain(..=pos).collect());
            }
            if !self.fill(deadline).await? {
                return Ok(std::mem::take(&mut self.pending));
            }
        }
    }

    /// Read exactly `len` bytes, or fewer if the port timeout runs out.
    pub async fn read_bytes(&mut self, len: usize) -> AppResult<Vec<u8>> {
        let deadline = Instant::now() + self.timeout;
        while self.pending.len() < len {
            if !self.fill(deadline).await? {
                break;
            }
        }
        let take = len.min(self.pending.len());
        Ok(self.pending.drain(..take).collect())
    }

    /// Pull one chunk from the transport. Returns `false` once `deadline` has passed or the
    /// transport itself times out.
    async fn fill(&mut self, deadline: Instant) -> AppResult<bool> {
        if Instant::now() >= deadline {
            tracing::debug!(port = %self.port, pending = self.pending.len(), "Read deadline reached");
            return Ok(false);
        }
        let mut chunk = [0u8; READ_CHUNK];
        let n = match tokio::time::timeout_at(deadline, self.transport.read(&mut chunk)).await {
            Ok(read) => read?,
            Err(_) => 0,
        };
        if n == 0 {
            tracing::debug!(port = %self.port, "Read timed out");
            return Ok(false);
        }
        self.pending.extend_from_slice(&chunk[..n]);
        Ok(true)
    }
}

/// One open physical port, shared by every lease on it.
pub struct ConnectionEntry {
    settings: PortSettings,
    exclusive: bool,
    link: AsyncMutex<PortLink>,
}

impl ConnectionEntry {
    /// Settings the port was opened with.
    pub fn settings(&self) -> &PortSettings {
        &self.settings
    }

    /// Whether a single driver owns this port.
    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }
}

struct Slot {
    entry: Arc<ConnectionEntry>,
    ref_count: usize,
}

type EntryMap = Arc<Mutex<HashMap<String, Slot>>>;

/// Owns physical serial connections keyed by port name.
///
/// Cloning is cheap; clones share the same set of entries.
#[derive(Clone)]
pub struct ConnectionRegistry {
    opener: Arc<dyn PortOpener>,
    settle_delay: Duration,
    entries: EntryMap,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    /// Registry that opens real serial ports.
    pub fn new() -> Self {
        Self::with_opener(Arc::new(SerialOpener))
    }

    /// Registry backed by a custom opener.
    pub fn with_opener(opener: Arc<dyn PortOpener>) -> Self {
        Self {
            opener,
            settle_delay: DEFAULT_SETTLE_DELAY,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Override the wait after opening a port.
    pub fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = settle_delay;
        self
    }

    /// Acquire a shared lease on a port, opening it on first use.
    ///
    /// # Errors
    /// [`BenchError::PortUnavailable`] if the port cannot be opened or is held exclusively.
    pub async fn acquire(&self, settings: &PortSettings) -> AppResult<PortLease> {
        self.acquire_with(settings, false).await
    }

    /// Acquire a lease that no other driver may share.
    ///
    /// # Errors
    /// [`BenchError::PortUnavailable`] if the port cannot be opened or already has an entry.
    pub async fn acquire_exclusive(&self, settings: &PortSettings) -> AppResult<PortLease> {
        self.acquire_with(settings, true).await
    }

    async fn acquire_with(&self, settings: &PortSettings, exclusive: bool) -> AppResult<PortLease> {
        let (entry, opened) = {
            let mut entries = lock_entries(&self.entries);
            match entries.get_mut(&settings.name) {
                Some(slot) => {
                    if exclusive || slot.entry.exclusive {
                        return Err(BenchError::port_unavailable(
                            &settings.name,
                            "already in use by another device",
                        ));
                    }
                    if slot.entry.settings != *settings {
                        tracing::warn!(
                            port = %settings.name,
                            open_baud = slot.entry.settings.baud_rate,
                            requested_baud = settings.baud_rate,
                            "Port already open with different settings, sharing existing connection"
                        );
                    }
                    slot.ref_count += 1;
                    (slot.entry.clone(), false)
                }
                None => {
                    let transport = self.opener.open(settings)?;
                    let entry = Arc::new(ConnectionEntry {
                        settings: settings.clone(),
                        exclusive,
                        link: AsyncMutex::new(PortLink::new(settings, transport)),
                    });
                    entries.insert(
                        settings.name.clone(),
                        Slot {
                            entry: entry.clone(),
                            ref_count: 1,
                        },
                    );
                    (entry, true)
                }
            }
        };

        let lease = PortLease {
            entry,
            entries: self.entries.clone(),
        };

        if opened {
            tracing::info!(
                port = %settings.name,
                baud_rate = settings.baud_rate,
                exclusive,
                "Opened port, waiting {:?} for instrument boot",
                self.settle_delay
            );
            tokio::time::sleep(self.settle_delay).await;
        }

        Ok(lease)
    }

    /// Whether a connection for `port` is currently open.
    pub fn is_open(&self, port: &str) -> bool {
        lock_entries(&self.entries).contains_key(port)
    }

    /// Number of live leases on `port` (0 if closed).
    pub fn ref_count(&self, port: &str) -> usize {
        lock_entries(&self.entries)
            .get(port)
            .map(|slot| slot.ref_count)
            .unwrap_or(0)
    }

    /// Names of every open port, sorted.
    pub fn open_ports(&self) -> Vec<String> {
        let mut ports: Vec<String> = lock_entries(&self.entries).keys().cloned().collect();
        ports.sort();
        ports
    }
}

fn lock_entries(entries: &EntryMap) -> std::sync::MutexGuard<'_, HashMap<String, Slot>> {
    entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A driver's claim on a port. Dropping it releases the claim.
pub struct PortLease {
    entry: Arc<ConnectionEntry>,
    entries: EntryMap,
}

impl PortLease {
    /// Lock the port for a sequence of frames.
    pub async fn lock(&self) -> MutexGuard<'_, PortLink> {
        self.entry.link.lock().await
    }

    /// Port name this lease refers to.
    pub fn port(&self) -> &str {
        &self.entry.settings.name
    }

    /// The shared entry behind this lease.
    pub fn entry(&self) -> &ConnectionEntry {
        &self.entry
    }

    /// Release the lease now instead of at end of scope.
    pub fn release(self) {}
}

impl Drop for PortLease {
    fn drop(&mut self) {
        let mut entries = lock_entries(&self.entries);
        let name = &self.entry.settings.name;

        let closing = match entries.get_mut(name) {
            Some(slot) if Arc::ptr_eq(&slot.entry, &self.entry) => {
                slot.ref_count -= 1;
                slot.ref_count == 0
            }
            _ => false,
        };

        if closing {
            // The transport closes once this lease's Arc goes away as well.
            entries.remove(name);
            tracing::info!(port = %name, "Last lease released, closing port");
        } else {
            tracing::debug!(port = %name, "Lease released");
        }
    }
}
