//! Step reports.
//!
//! Every executed step becomes one text block:
//!
//! ```text
//! ---------- Test #3 ----------
//! TDK-Lambda Zup (1):
//!     MDL?: Z36-6
//!     VOL?: 5.00
//! ```
//!
//! Blocks are appended to `Report_<timestamp>.txt` in the report directory by [`ReportFile`].
//! A report that never received a step with data is deleted when finished. [`SessionReport`]
//! keeps the same results in memory for JSON export.

use crate::error::AppResult;
use crate::session::{RunSummary, SlotReport, StepResult, StopReason};
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Line written for a step where no device returned anything.
pub const NO_DATA: &str = "No data to display";

/// Render one step as a text block, newline-terminated.
pub fn render_step(result: &StepResult) -> String {
    let mut text = format!("{0} Test #{1} {0}\n", "-".repeat(10), result.step_id);
    if result.is_empty() {
        text.push_str(NO_DATA);
        text.push('\n');
        return text;
    }
    for (device, responses) in result.devices() {
        text.push_str(device);
        text.push_str(":\n");
        for (command, response) in responses.iter() {
            text.push_str(&format!("\t{}: {}\n", command, response));
        }
    }
    text
}

/// Results of one session, serializable.
#[derive(Clone, Debug, Serialize)]
pub struct SessionReport {
    /// Session start
    pub started: DateTime<Utc>,
    /// Slot statuses at the time the steps ran
    pub slots: Vec<SlotReport>,
    /// Executed steps, in order
    pub steps: Vec<StepResult>,
    /// Set when a run stopped before its last step
    pub stopped: Option<StopReason>,
}

impl SessionReport {
    /// Empty report stamped now.
    pub fn new(slots: Vec<SlotReport>) -> Self {
        Self {
            started: Utc::now(),
            slots,
            steps: Vec::new(),
            stopped: None,
        }
    }

    /// Record one executed step.
    pub fn push(&mut self, result: StepResult) {
        self.steps.push(result);
    }

    /// Take over the results of a full run.
    pub fn extend_from(&mut self, summary: RunSummary) {
        self.steps.extend(summary.completed);
        self.stopped = summary.stopped;
    }

    /// All step blocks.
    pub fn render(&self) -> String {
        self.steps.iter().map(render_step).collect()
    }

    /// Pretty JSON export.
    pub fn to_json(&self) -> AppResult<String> {
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::from)?;
        Ok(json)
    }
}

/// Text report on disk.
pub struct ReportFile {
    path: PathBuf,
    writer: BufWriter<File>,
    has_data: bool,
}

impl ReportFile {
    /// Create `Report_<timestamp>.txt` in `dir`, creating the directory if needed.
    ///
    /// An existing report is never reopened: if the name is taken, a `_<n>` suffix is added.
    pub fn create<P: AsRef<Path>>(dir: P) -> AppResult<Self> {
        let dir = dir.as_ref();
        if !dir.exists() {
            std::fs::create_dir_all(dir)?;
        }
        let stamp = Local::now().format("%Y-%m-%dT%H_%M_%S_%3f").to_string();
        let (path, file) = create_unique(dir, &stamp)?;
        tracing::info!(path = %path.display(), "Report file opened");
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            has_data: false,
        })
    }

    /// Report path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether any appended step carried responses.
    pub fn has_data(&self) -> bool {
        self.has_data
    }

    /// Append one step block and return the text written.
    pub fn append(&mut self, result: &StepResult) -> AppResult<String> {
        let text = render_step(result);
        self.writer.write_all(text.as_bytes())?;
        self.has_data |= !result.is_empty();
        Ok(text)
    }

    /// Flush and close. The file is removed if no step had data.
    ///
    /// Returns the path if the report was kept.
    pub fn finish(mut self) -> AppResult<Option<PathBuf>> {
        self.writer.flush()?;
        drop(self.writer);
        if self.has_data {
            tracing::info!(path = %self.path.display(), "Report saved");
            Ok(Some(self.path))
        } else {
            std::fs::remove_file(&self.path)?;
            tracing::debug!(path = %self.path.display(), "Empty report removed");
            Ok(None)
        }
    }
}

fn create_unique(dir: &Path, stamp: &str) -> AppResult<(PathBuf, File)> {
    let mut suffix = 1u32;
    loop {
        let file_name = if suffix == 1 {
            format!("Report_{}.txt", stamp)
        } else {
            format!("Report_{}_{}.txt", stamp, suffix)
        };
        let path = dir.join(file_name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => suffix += 1,
            Err(e) => return Err(e.into()),
        }
    }
}
