//! In-memory serial ports for testing without a bench.
//!
//! [`MockOpener`] hands out [`MockTransport`]s that record every written frame and answer
//! from scripted rules. Clones of the opener share state, so a test can keep one clone for
//! inspection while the registry owns another.
//!
//! # Example
//!
//! ```
//! use psu_bench::hardware::mock::MockOpener;
//!
//! let opener = MockOpener::new();
//! // Reply to any frame containing "MDL?" with a model string.
//! opener.respond("COM1", "MDL?", "Z36-6\r\n");
//! assert_eq!(opener.open_count("COM1"), 0);
//! ```

use super::transport::{PortOpener, PortSettings, Transport};
use crate::error::{AppResult, BenchError};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
struct MockPort {
    opens: usize,
    open: bool,
    fail: bool,
    writes: Vec<Vec<u8>>,
    rx: VecDeque<u8>,
    rules: Vec<(Vec<u8>, Vec<u8>)>,
}

type PortMap = Arc<Mutex<HashMap<String, MockPort>>>;

fn lock(ports: &PortMap) -> MutexGuard<'_, HashMap<String, MockPort>> {
    ports.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Opener for simulated ports.
#[derive(Clone, Default)]
pub struct MockOpener {
    ports: PortMap,
}

impl MockOpener {
    /// Opener where every port exists and nothing answers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make opening `port` fail as if it did not exist.
    pub fn fail_port(&self, port: &str) {
        lock(&self.ports).entry(port.to_string()).or_default().fail = true;
    }

    /// Reply with `reply` whenever a frame containing `needle` is written to `port`.
    ///
    /// Rules are checked in the order they were added; the first match wins.
    pub fn respond(&self, port: &str, needle: impl AsRef<[u8]>, reply: impl AsRef<[u8]>) {
        lock(&self.ports)
            .entry(port.to_string())
            .or_default()
            .rules
            .push((needle.as_ref().to_vec(), reply.as_ref().to_vec()));
    }

    /// Put bytes in the receive buffer of `port` right away.
    pub fn queue_response(&self, port: &str, bytes: impl AsRef<[u8]>) {
        lock(&self.ports)
            .entry(port.to_string())
            .or_default()
            .rx
            .extend(bytes.as_ref());
    }

    /// How many times `port` has been opened.
    pub fn open_count(&self, port: &str) -> usize {
        lock(&self.ports).get(port).map(|p| p.opens).unwrap_or(0)
    }

    /// Whether `port` was opened and has since been closed.
    pub fn is_closed(&self, port: &str) -> bool {
        lock(&self.ports)
            .get(port)
            .map(|p| p.opens > 0 && !p.open)
            .unwrap_or(false)
    }

    /// Every frame written to `port`, oldest first.
    pub fn written(&self, port: &str) -> Vec<Vec<u8>> {
        lock(&self.ports)
            .get(port)
            .map(|p| p.writes.clone())
            .unwrap_or_default()
    }

    /// Frames written to `port`, decoded as text.
    pub fn written_text(&self, port: &str) -> Vec<String> {
        self.written(port)
            .iter()
            .map(|frame| String::from_utf8_lossy(frame).into_owned())
            .collect()
    }

    /// Forget recorded frames on `port`.
    pub fn clear_written(&self, port: &str) {
        if let Some(p) = lock(&self.ports).get_mut(port) {
            p.writes.clear();
        }
    }
}

impl PortOpener for MockOpener {
    fn open(&self, settings: &PortSettings) -> AppResult<Box<dyn Transport>> {
        let mut ports = lock(&self.ports);
        let port = ports.entry(settings.name.clone()).or_default();
        if port.fail {
            return Err(BenchError::port_unavailable(
                &settings.name,
                "no such port (mock)",
            ));
        }
        if port.open {
            return Err(BenchError::port_unavailable(
                &settings.name,
                "port is busy (mock)",
            ));
        }
        port.open = true;
        port.opens += 1;

        Ok(Box::new(MockTransport {
            name: settings.name.clone(),
            ports: self.ports.clone(),
        }))
    }
}

/// One simulated open port.
pub struct MockTransport {
    name: String,
    ports: PortMap,
}

#[async_trait]
impl Transport for MockTransport {
    async fn write_all(&mut self, data: &[u8]) -> AppResult<()> {
        let mut ports = lock(&self.ports);
        let port = ports
            .get_mut(&self.name)
            .ok_or_else(|| BenchError::Transport(format!("{} vanished", self.name)))?;

        port.writes.push(data.to_vec());
        let reply = port
            .rules
            .iter()
            .find(|(needle, _)| contains(data, needle))
            .map(|(_, reply)| reply.clone());
        if let Some(reply) = reply {
            port.rx.extend(reply);
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> AppResult<usize> {
        let mut ports = lock(&self.ports);
        let Some(port) = ports.get_mut(&self.name) else {
            return Ok(0);
        };
        let n = buf.len().min(port.rx.len());
        for (slot, byte) in buf.iter_mut().zip(port.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        if let Some(port) = lock(&self.ports).get_mut(&self.name) {
            port.open = false;
        }
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_rules_reply_to_matching_frames() {
        let opener = MockOpener::new();
        opener.respond("COM1", "*IDN?", "GEN60-12\r\n");
        let settings = PortSettings::new("COM1", 9600, Duration::from_millis(10));
        let mut transport = opener.open(&settings).unwrap();

        transport.write_all(b"OUT 1").await.unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(transport.read(&mut buf).await.unwrap(), 0);

        transport.write_all(b"*IDN?").await.unwrap();
        let n = transport.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"GEN60-12\r\n");
        assert_eq!(opener.written_text("COM1"), vec!["OUT 1", "*IDN?"]);
    }

    #[test]
    fn test_second_open_is_busy() {
        let opener = MockOpener::new();
        let settings = PortSettings::new("COM1", 9600, Duration::from_millis(10));
        let _first = opener.open(&settings).unwrap();
        assert!(opener.open(&settings).is_err());
    }
}
