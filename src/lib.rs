//! Core library for the psu-bench test stand.
//!
//! A bench is a handful of serial lab power supplies plus one device under test. The library
//! opens each physical port once ([`hardware::ConnectionRegistry`]), lets several drivers share
//! it where the instrument supports addressing ([`instrument`]), and runs a table of test steps
//! against the connected bench ([`session::TestSession`]). Results are rendered by [`report`].
//!
//! ```no_run
//! use psu_bench::config::{DeviceTable, Settings, StepTable};
//! use psu_bench::hardware::ConnectionRegistry;
//! use psu_bench::session::TestSession;
//!
//! # async fn demo() -> psu_bench::error::AppResult<()> {
//! let settings = Settings::load()?;
//! let devices = DeviceTable::load(&settings.tables.devices)?;
//! let steps = StepTable::load(&settings.tables.steps)?;
//! let registry = ConnectionRegistry::new().with_settle_delay(settings.serial.settle_delay());
//!
//! let mut session = TestSession::new(
//!     registry,
//!     settings.serial.clone(),
//!     devices.rows().to_vec(),
//!     steps.into_steps(),
//! );
//! session.check_connections().await;
//! let summary = session.run_all().await;
//! println!("{} steps completed", summary.completed.len());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod hardware;
pub mod instrument;
pub mod report;
pub mod session;
