//! Test session: connect the bench, then run the step table against it.
//!
//! A [`TestSession`] owns the live driver set for one bench layout. The life cycle is
//!
//! ```text
//! Idle -> DevicesChecked -> Running -> StepComplete -> (Running -> StepComplete)* -> Idle
//! ```
//!
//! [`TestSession::check_connections`] rebuilds every driver and records a per-slot status.
//! Steps only run while every slot reports [`SlotStatus::Connected`]; otherwise
//! [`TestSession::run_step`] returns [`StepOutcome::Blocked`] without touching any port.

use crate::config::{DeviceRow, SerialConfig};
use crate::error::{AppResult, BenchError};
use crate::hardware::ConnectionRegistry;
use crate::instrument::{build_driver, CommandKind, DeviceDriver};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One row of the step table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestStep {
    /// Step identifier as written in the table
    pub id: String,
    /// Commands per device slot, in layout order
    pub groups: Vec<Vec<String>>,
}

impl TestStep {
    /// New step.
    pub fn new(id: impl Into<String>, groups: Vec<Vec<String>>) -> Self {
        Self {
            id: id.into(),
            groups,
        }
    }

    /// Commands for `slot`; empty if the row has no cell for it.
    pub fn group(&self, slot: usize) -> &[String] {
        self.groups.get(slot).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Query responses of one device, in first-recorded order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceResponses {
    entries: Vec<(String, String)>,
}

impl DeviceResponses {
    /// Record a response. A repeated command keeps its position and takes the new response.
    pub fn record(&mut self, command: impl Into<String>, response: impl Into<String>) {
        let command = command.into();
        let response = response.into();
        match self.entries.iter_mut().find(|(c, _)| *c == command) {
            Some(entry) => entry.1 = response,
            None => self.entries.push((command, response)),
        }
    }

    /// Response recorded for `command`.
    pub fn get(&self, command: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(c, _)| c == command)
            .map(|(_, r)| r.as_str())
    }

    /// `(command, response)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(c, r)| (c.as_str(), r.as_str()))
    }

    /// Number of distinct commands recorded.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Nothing recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for DeviceResponses {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (command, response) in &self.entries {
            map.serialize_entry(command, response)?;
        }
        map.end()
    }
}

/// Responses collected during one step, per device label.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StepResult {
    /// Step identifier
    pub step_id: String,
    #[serde(serialize_with = "serialize_devices")]
    devices: Vec<(String, DeviceResponses)>,
}

fn serialize_devices<S: Serializer>(
    devices: &[(String, DeviceResponses)],
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_map(devices.iter().map(|(label, responses)| (label, responses)))
}

impl StepResult {
    /// Empty result for `step_id`.
    pub fn new(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            devices: Vec::new(),
        }
    }

    /// Add one device's responses. Devices without responses are left out.
    pub fn insert(&mut self, label: &str, responses: DeviceResponses) {
        if responses.is_empty() {
            return;
        }
        match self.devices.iter_mut().find(|(l, _)| l == label) {
            Some((_, existing)) => {
                for (command, response) in responses.iter() {
                    existing.record(command, response);
                }
            }
            None => self.devices.push((label.to_string(), responses)),
        }
    }

    /// Responses of one device.
    pub fn device(&self, label: &str) -> Option<&DeviceResponses> {
        self.devices
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, r)| r)
    }

    /// Devices in layout order.
    pub fn devices(&self) -> impl Iterator<Item = (&str, &DeviceResponses)> {
        self.devices.iter().map(|(l, r)| (l.as_str(), r))
    }

    /// No device produced a response.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// Where a session is in its life cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SessionState {
    /// No connection check since construction or the last reset
    Idle,
    /// Drivers built, statuses known
    DevicesChecked,
    /// A step is executing
    Running,
    /// The last step finished
    StepComplete,
}

/// Outcome of building one slot's driver.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum SlotStatus {
    /// Identity probe answered
    Connected,
    /// Port opened but the probe got no answer
    Unreachable,
    /// The port could not be opened
    PortUnavailable(String),
    /// The label names no known family
    UnknownModel,
    /// The row cannot describe a driver
    ConfigError(String),
}

impl SlotStatus {
    fn from_error(error: BenchError) -> Self {
        match error {
            BenchError::PortUnavailable { reason, .. } => SlotStatus::PortUnavailable(reason),
            BenchError::UnknownModel(_) => SlotStatus::UnknownModel,
            other => SlotStatus::ConfigError(other.to_string()),
        }
    }
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotStatus::Connected => write!(f, "connected"),
            SlotStatus::Unreachable => write!(f, "no answer"),
            SlotStatus::PortUnavailable(reason) => write!(f, "port unavailable ({})", reason),
            SlotStatus::UnknownModel => write!(f, "unknown model"),
            SlotStatus::ConfigError(reason) => write!(f, "configuration error ({})", reason),
        }
    }
}

/// Status of one slot after a connection check.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SlotReport {
    /// Slot label
    pub label: String,
    /// Port name as resolved from the table
    pub port: String,
    /// Check outcome
    pub status: SlotStatus,
}

/// Result of asking for one step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// Every command went out; responses attached
    Completed(StepResult),
    /// Not every device is connected; nothing was sent
    Blocked,
}

impl StepOutcome {
    /// The step result, or [`BenchError::SessionBlocked`] if the step was gated.
    ///
    /// # Errors
    /// [`BenchError::SessionBlocked`] for [`StepOutcome::Blocked`].
    pub fn into_result(self) -> AppResult<StepResult> {
        match self {
            StepOutcome::Completed(result) => Ok(result),
            StepOutcome::Blocked => Err(BenchError::SessionBlocked),
        }
    }
}

/// Why [`TestSession::run_all`] stopped early.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum StopReason {
    /// Gate closed before the step at `index`
    Blocked {
        /// Step index
        index: usize,
    },
    /// Transport or command error in the step at `index`
    Failed {
        /// Step index
        index: usize,
        /// Error message
        error: String,
    },
}

/// Results of [`TestSession::run_all`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Completed steps in order
    pub completed: Vec<StepResult>,
    /// Set when the run did not reach the last step
    pub stopped: Option<StopReason>,
}

impl RunSummary {
    /// Every step ran.
    pub fn is_success(&self) -> bool {
        self.stopped.is_none()
    }
}

/// Live bench plus its step table.
pub struct TestSession {
    registry: ConnectionRegistry,
    serial: SerialConfig,
    layout: Vec<DeviceRow>,
    steps: Vec<TestStep>,
    drivers: Vec<Option<Box<dyn DeviceDriver>>>,
    slots: Vec<SlotReport>,
    state: SessionState,
}

impl TestSession {
    /// Session over `layout` and `steps`. No port is opened until
    /// [`check_connections`](Self::check_connections).
    pub fn new(
        registry: ConnectionRegistry,
        serial: SerialConfig,
        layout: Vec<DeviceRow>,
        steps: Vec<TestStep>,
    ) -> Self {
        Self {
            registry,
            serial,
            layout,
            steps,
            drivers: Vec::new(),
            slots: Vec::new(),
            state: SessionState::Idle,
        }
    }

    /// Current life-cycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Slot statuses from the last check, in layout order.
    pub fn slots(&self) -> &[SlotReport] {
        &self.slots
    }

    /// Loaded steps.
    pub fn steps(&self) -> &[TestStep] {
        &self.steps
    }

    /// Device layout.
    pub fn layout(&self) -> &[DeviceRow] {
        &self.layout
    }

    /// Whether the last check found every slot connected.
    pub fn all_connected(&self) -> bool {
        self.state != SessionState::Idle
            && self.slots.len() == self.layout.len()
            && self
                .slots
                .iter()
                .all(|slot| slot.status == SlotStatus::Connected)
    }

    /// Replace the layout. Drivers are dropped and the session returns to `Idle`.
    pub fn set_layout(&mut self, layout: Vec<DeviceRow>) {
        self.layout = layout;
        self.reset();
    }

    /// Replace the step table.
    pub fn set_steps(&mut self, steps: Vec<TestStep>) {
        self.steps = steps;
    }

    /// Drop every driver, closing ports nobody else holds.
    pub fn reset(&mut self) {
        self.drivers.clear();
        self.slots.clear();
        self.state = SessionState::Idle;
    }

    /// Rebuild every driver from the layout and record how each slot fared.
    ///
    /// Previous drivers are dropped first so their ports are free to reopen. A failing slot
    /// never prevents the others from being checked.
    pub async fn check_connections(&mut self) -> &[SlotReport] {
        self.reset();

        for row in &self.layout {
            let port = row.port_name();
            let (driver, status) = match row.descriptor(&self.serial) {
                Ok(descriptor) => match build_driver(descriptor, &self.registry).await {
                    Ok(driver) if driver.is_connected() => (Some(driver), SlotStatus::Connected),
                    Ok(driver) => (Some(driver), SlotStatus::Unreachable),
                    Err(e) => (None, SlotStatus::from_error(e)),
                },
                Err(e) => (None, SlotStatus::from_error(e)),
            };

            if status == SlotStatus::Connected {
                tracing::info!(device = %row.label, port = %port, "Slot ready");
            } else {
                tracing::warn!(device = %row.label, port = %port, status = %status, "Slot not ready");
            }
            self.drivers.push(driver);
            self.slots.push(SlotReport {
                label: row.label.clone(),
                port,
                status,
            });
        }

        self.state = SessionState::DevicesChecked;
        tracing::info!(
            slots = self.slots.len(),
            all_connected = self.all_connected(),
            "Connection check finished"
        );
        &self.slots
    }

    /// Run the step at `index` (zero-based).
    ///
    /// Per slot in layout order and per command in cell order, commands containing `?` are
    /// queried and their responses recorded; the rest are written.
    ///
    /// # Errors
    /// - [`BenchError::StepOutOfRange`] for a bad index
    /// - any driver error; the step is abandoned at that command
    pub async fn run_step(&mut self, index: usize) -> AppResult<StepOutcome> {
        let step = self
            .steps
            .get(index)
            .cloned()
            .ok_or(BenchError::StepOutOfRange {
                index,
                len: self.steps.len(),
            })?;

        if !self.all_connected() {
            tracing::warn!(step = %step.id, "Step blocked: not every device is connected");
            return Ok(StepOutcome::Blocked);
        }

        if step.groups.len() > self.drivers.len() {
            tracing::warn!(
                step = %step.id,
                cells = step.groups.len(),
                slots = self.drivers.len(),
                "Step has more cells than devices; extra cells ignored"
            );
        }

        self.state = SessionState::Running;
        tracing::info!(step = %step.id, "Running step");
        match execute(&mut self.drivers, &step).await {
            Ok(result) => {
                self.state = SessionState::StepComplete;
                tracing::info!(step = %step.id, devices = result.devices.len(), "Step complete");
                Ok(StepOutcome::Completed(result))
            }
            Err(e) => {
                self.state = SessionState::DevicesChecked;
                tracing::error!(step = %step.id, error = %e, "Step failed");
                Err(e)
            }
        }
    }

    /// Run every step in order, stopping at the first blocked or failed one.
    pub async fn run_all(&mut self) -> RunSummary {
        let mut summary = RunSummary::default();
        for index in 0..self.steps.len() {
            match self.run_step(index).await {
                Ok(StepOutcome::Completed(result)) => summary.completed.push(result),
                Ok(StepOutcome::Blocked) => {
                    summary.stopped = Some(StopReason::Blocked { index });
                    break;
                }
                Err(e) => {
                    summary.stopped = Some(StopReason::Failed {
                        index,
                        error: e.to_string(),
                    });
                    break;
                }
            }
        }
        summary
    }
}

async fn execute(
    drivers: &mut [Option<Box<dyn DeviceDriver>>],
    step: &TestStep,
) -> AppResult<StepResult> {
    let mut result = StepResult::new(step.id.clone());
    for (slot, driver) in drivers.iter_mut().enumerate() {
        let Some(driver) = driver else { continue };
        let mut responses = DeviceResponses::default();
        for command in step.group(slot) {
            match CommandKind::classify(command) {
                CommandKind::Query => {
                    let response = driver.query(command).await?;
                    responses.record(command.as_str(), response);
                }
                CommandKind::Write => driver.write(command).await?,
            }
        }
        result.insert(driver.label(), responses);
    }
    Ok(result)
}
