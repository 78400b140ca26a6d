//! CSV device and step tables.
//!
//! Both tables start with a header row that is kept verbatim so a saved table reads back the
//! same. Rows may have any number of cells.
//!
//! ```text
//! # device table            # step table
//! Device,COM,Address        Step,Zup (1),Zup (2),Test
//! TDK-Lambda Zup (1),1,1    1,OUT 1;VOL 5,OUT 1,3
//! TDK-Lambda Zup (2),1,2    2,MDL?,VOL?,3?
//! Test,5,                   3,OUT 0,OUT 0,
//! ```

use super::SerialConfig;
use crate::error::{AppResult, BenchError};
use crate::hardware::PortSettings;
use crate::instrument::{DeviceDescriptor, DeviceFamily};
use crate::session::TestStep;
use serde::Serialize;
use std::fs::File;
use std::io::{Read, Write};
use std::ops::RangeInclusive;
use std::path::Path;

/// Values accepted for port numbers and addresses when reassigning slots.
pub const ASSIGNABLE_RANGE: RangeInclusive<u8> = 1..=32;

/// Separator between commands inside one step cell.
pub const COMMAND_SEPARATOR: char = ';';

fn reader<R: Read>(input: R) -> csv::Reader<R> {
    csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(input)
}

/// Non-empty records, each cell trimmed. The first one is the header.
fn records<R: Read>(input: R) -> AppResult<Vec<Vec<String>>> {
    let mut rows = Vec::new();
    for record in reader(input).records() {
        let record = record?;
        let cells: Vec<String> = record.iter().map(|c| c.trim().to_string()).collect();
        if cells.iter().all(String::is_empty) {
            continue;
        }
        rows.push(cells);
    }
    Ok(rows)
}

// ============================================================================
// Device table
// ============================================================================

/// One slot of the bench layout.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeviceRow {
    /// Slot label, also the model name matched against the known families
    pub label: String,
    /// Port as written in the table (`3` or `/dev/ttyUSB0`)
    pub port: String,
    /// Bus address, if any
    pub address: Option<u8>,
}

impl DeviceRow {
    /// Platform port name. A bare number `N` means `COM<N>`.
    pub fn port_name(&self) -> String {
        if !self.port.is_empty() && self.port.chars().all(|c| c.is_ascii_digit()) {
            format!("COM{}", self.port)
        } else {
            self.port.clone()
        }
    }

    /// Build a driver descriptor for this slot.
    ///
    /// # Errors
    /// [`BenchError::UnknownModel`] if the label names no known family.
    pub fn descriptor(&self, serial: &SerialConfig) -> AppResult<DeviceDescriptor> {
        let family = DeviceFamily::resolve(&self.label)
            .ok_or_else(|| BenchError::UnknownModel(self.label.clone()))?;
        let port = PortSettings::new(self.port_name(), serial.baud_rate, serial.timeout());
        let mut descriptor = DeviceDescriptor::new(self.label.clone(), family, port)
            .with_command_delay(serial.command_delay())
            .with_probe_byte(serial.binary_probe);
        if let Some(address) = self.address {
            descriptor = descriptor.with_address(address);
        }
        Ok(descriptor)
    }

    fn from_record(cells: &[String]) -> AppResult<Self> {
        let cell = |i: usize| cells.get(i).cloned().unwrap_or_default();
        let label = cell(0);
        let address = match cell(2).as_str() {
            "" => None,
            raw => Some(raw.parse::<u8>().map_err(|_| {
                BenchError::Configuration(format!(
                    "Device '{}': address '{}' is not a number",
                    label, raw
                ))
            })?),
        };
        Ok(Self {
            label,
            port: cell(1),
            address,
        })
    }
}

/// One requested change of a slot's port and address, as typed by an operator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Assignment {
    /// Row index, zero-based
    pub slot: usize,
    /// Port number
    pub port: String,
    /// Bus address
    pub address: String,
}

impl Assignment {
    /// New assignment.
    pub fn new(slot: usize, port: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            slot,
            port: port.into(),
            address: address.into(),
        }
    }
}

fn assignable(field: &str, raw: &str) -> AppResult<u8> {
    raw.trim()
        .parse::<u8>()
        .ok()
        .filter(|v| ASSIGNABLE_RANGE.contains(v))
        .ok_or_else(|| {
            BenchError::Configuration(format!(
                "{} '{}' must be an integer between {} and {}",
                field,
                raw,
                ASSIGNABLE_RANGE.start(),
                ASSIGNABLE_RANGE.end()
            ))
        })
}

/// Device table: which instrument sits on which port.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceTable {
    header: Vec<String>,
    rows: Vec<DeviceRow>,
}

impl DeviceTable {
    /// Load from a CSV file.
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let file = File::open(path.as_ref()).map_err(|e| {
            BenchError::Configuration(format!(
                "Cannot open device table {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_reader(file)
    }

    /// Parse from any reader.
    pub fn from_reader<R: Read>(input: R) -> AppResult<Self> {
        let mut records = records(input)?.into_iter();
        let header = records.next().unwrap_or_default();
        let rows = records
            .map(|cells| DeviceRow::from_record(&cells))
            .collect::<AppResult<Vec<_>>>()?;
        Ok(Self { header, rows })
    }

    /// Slots in layout order.
    pub fn rows(&self) -> &[DeviceRow] {
        &self.rows
    }

    /// Apply operator assignments. Every value is checked before any row changes.
    ///
    /// # Errors
    /// [`BenchError::Configuration`] naming the first bad slot or value; the table is left
    /// untouched.
    pub fn reassign(&mut self, assignments: &[Assignment]) -> AppResult<()> {
        let mut checked = Vec::with_capacity(assignments.len());
        for assignment in assignments {
            if assignment.slot >= self.rows.len() {
                return Err(BenchError::Configuration(format!(
                    "Slot {} does not exist ({} devices configured)",
                    assignment.slot,
                    self.rows.len()
                )));
            }
            let port = assignable("Port", &assignment.port)?;
            let address = assignable("Address", &assignment.address)?;
            checked.push((assignment.slot, port, address));
        }

        for (slot, port, address) in checked {
            let row = &mut self.rows[slot];
            tracing::info!(device = %row.label, port, address, "Slot reassigned");
            row.port = port.to_string();
            row.address = Some(address);
        }
        Ok(())
    }

    /// Write the table to a CSV file, replacing it.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> AppResult<()> {
        let file = File::create(path.as_ref())?;
        self.write_to(file)
    }

    /// Write the table as CSV.
    pub fn write_to<W: Write>(&self, output: W) -> AppResult<()> {
        let mut writer = csv::WriterBuilder::new()
            .flexible(true)
            .from_writer(output);
        if !self.header.is_empty() {
            writer.write_record(&self.header)?;
        }
        for row in &self.rows {
            let address = row.address.map(|a| a.to_string()).unwrap_or_default();
            writer.write_record([row.label.as_str(), row.port.as_str(), address.as_str()])?;
        }
        writer.flush()?;
        Ok(())
    }
}

// ============================================================================
// Step table
// ============================================================================

/// Split one step cell into its commands.
pub fn split_cell(cell: &str) -> Vec<String> {
    cell.split(COMMAND_SEPARATOR)
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}

/// Step table: one row per test step, one cell per device slot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StepTable {
    header: Vec<String>,
    steps: Vec<TestStep>,
}

impl StepTable {
    /// Load from a CSV file.
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let file = File::open(path.as_ref()).map_err(|e| {
            BenchError::Configuration(format!(
                "Cannot open step table {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_reader(file)
    }

    /// Parse from any reader.
    pub fn from_reader<R: Read>(input: R) -> AppResult<Self> {
        let mut records = records(input)?.into_iter();
        let header = records.next().unwrap_or_default();
        let steps = records
            .map(|cells| {
                let id = cells.first().cloned().unwrap_or_default();
                let groups = cells.iter().skip(1).map(|c| split_cell(c)).collect();
                TestStep::new(id, groups)
            })
            .collect();
        Ok(Self { header, steps })
    }

    /// Column titles.
    pub fn header(&self) -> &[String] {
        &self.header
    }

    /// Steps in table order.
    pub fn steps(&self) -> &[TestStep] {
        &self.steps
    }

    /// Take the steps out of the table.
    pub fn into_steps(self) -> Vec<TestStep> {
        self.steps
    }
}
