//! CLI entry point for psu-bench
//!
//! ```bash
//! psu-bench check                 # probe every device in the device table
//! psu-bench list                  # show the layout and the step table
//! psu-bench run --step 3          # run the third step of the step table
//! psu-bench run-all               # run every step, stop at the first failure
//! psu-bench assign --slot 2 --port 4 --address 7
//! ```
//!
//! Settings come from `psu-bench.toml` (override with `--config`) and `BENCH_*` variables.
//! Log verbosity follows `RUST_LOG`, falling back to `application.log_level`.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use psu_bench::config::{Assignment, DeviceTable, Settings, StepTable, DEFAULT_SETTINGS_FILE};
use psu_bench::error::BenchError;
use psu_bench::hardware::ConnectionRegistry;
use psu_bench::report::{ReportFile, SessionReport};
use psu_bench::session::{StepOutcome, StopReason, TestSession};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "psu-bench")]
#[command(about = "Serial power-supply test bench", long_about = None)]
struct Cli {
    /// Settings file (TOML)
    #[arg(long, global = true, default_value = DEFAULT_SETTINGS_FILE)]
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to every device and report which ones answer
    Check,

    /// Print the device layout and the loaded steps
    List,

    /// Run a single step
    Run {
        /// Step number, starting at 1
        #[arg(long)]
        step: usize,

        /// Also write the results as JSON
        #[arg(long)]
        json: Option<PathBuf>,
    },

    /// Run every step in order
    RunAll {
        /// Also write the results as JSON
        #[arg(long)]
        json: Option<PathBuf>,
    },

    /// Change the port and address of one device slot and save the device table
    Assign {
        /// Slot number, starting at 1
        #[arg(long)]
        slot: usize,
        /// Port number (1-32)
        #[arg(long)]
        port: String,
        /// Bus address (1-32)
        #[arg(long)]
        address: String,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("Failed to load settings from {}", cli.config.display()))?;
    init_logging(&settings, cli.json_logs);

    tracing::info!(app = %settings.application.name, config = %cli.config.display(), "Starting");

    match cli.command {
        Commands::Check => check(&settings).await,
        Commands::List => list(&settings),
        Commands::Run { step, json } => run_one(&settings, step, json).await,
        Commands::RunAll { json } => run_all(&settings, json).await,
        Commands::Assign {
            slot,
            port,
            address,
        } => assign(&settings, slot, port, address),
    }
}

fn init_logging(settings: &Settings, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.application.log_level));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_session(settings: &Settings) -> Result<TestSession> {
    let devices = DeviceTable::load(&settings.tables.devices)
        .with_context(|| format!("Failed to load {}", settings.tables.devices.display()))?;
    let steps = StepTable::load(&settings.tables.steps)
        .with_context(|| format!("Failed to load {}", settings.tables.steps.display()))?;
    let registry = ConnectionRegistry::new().with_settle_delay(settings.serial.settle_delay());
    Ok(TestSession::new(
        registry,
        settings.serial.clone(),
        devices.rows().to_vec(),
        steps.into_steps(),
    ))
}

async fn connect(session: &mut TestSession) -> bool {
    for slot in session.check_connections().await {
        println!("{:<28} {:<14} {}", slot.label, slot.port, slot.status);
    }
    session.all_connected()
}

async fn check(settings: &Settings) -> Result<ExitCode> {
    let mut session = load_session(settings)?;
    if connect(&mut session).await {
        println!("All devices connected");
    } else {
        println!("Not every device is connected");
    }
    Ok(ExitCode::SUCCESS)
}

fn list(settings: &Settings) -> Result<ExitCode> {
    let devices = DeviceTable::load(&settings.tables.devices)?;
    for (i, row) in devices.rows().iter().enumerate() {
        let address = row
            .address
            .map(|a| a.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("{:>2}. {:<28} {:<14} {}", i + 1, row.label, row.port_name(), address);
    }

    let steps = StepTable::load(&settings.tables.steps)?;
    println!();
    for (i, step) in steps.steps().iter().enumerate() {
        let cells: Vec<String> = step.groups.iter().map(|g| g.join("; ")).collect();
        println!("{:>2}. Test #{}: {}", i + 1, step.id, cells.join(" | "));
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_one(settings: &Settings, step: usize, json: Option<PathBuf>) -> Result<ExitCode> {
    let index = step
        .checked_sub(1)
        .context("Step numbers start at 1")?;
    let mut session = load_session(settings)?;
    connect(&mut session).await;

    let mut report = SessionReport::new(session.slots().to_vec());
    let mut file = ReportFile::create(&settings.application.report_dir)?;
    let code = match session.run_step(index).await.and_then(StepOutcome::into_result) {
        Ok(result) => {
            print!("{}", file.append(&result)?);
            report.push(result);
            ExitCode::SUCCESS
        }
        Err(e @ BenchError::SessionBlocked) => {
            report.stopped = Some(StopReason::Blocked { index });
            eprintln!("Step {}: {}", step, e);
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("Step {} failed: {}", step, e);
            report.stopped = Some(StopReason::Failed {
                index,
                error: e.to_string(),
            });
            ExitCode::FAILURE
        }
    };
    finish(file, &report, json)?;
    Ok(code)
}

async fn run_all(settings: &Settings, json: Option<PathBuf>) -> Result<ExitCode> {
    let mut session = load_session(settings)?;
    connect(&mut session).await;

    let mut report = SessionReport::new(session.slots().to_vec());
    let mut file = ReportFile::create(&settings.application.report_dir)?;
    let summary = session.run_all().await;
    for result in &summary.completed {
        print!("{}", file.append(result)?);
    }
    let success = summary.is_success();
    match &summary.stopped {
        Some(StopReason::Blocked { index }) => {
            eprintln!("Stopped before step {}: not every device is connected", index + 1)
        }
        Some(StopReason::Failed { index, error }) => {
            eprintln!("Step {} failed: {}", index + 1, error)
        }
        None => {}
    }
    report.extend_from(summary);
    finish(file, &report, json)?;

    Ok(if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn finish(file: ReportFile, report: &SessionReport, json: Option<PathBuf>) -> Result<()> {
    if let Some(path) = file.finish()? {
        println!("Report written to {}", path.display());
    }
    if let Some(path) = json {
        std::fs::write(&path, report.to_json()?)
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }
    Ok(())
}

fn assign(settings: &Settings, slot: usize, port: String, address: String) -> Result<ExitCode> {
    let index = slot.checked_sub(1).context("Slot numbers start at 1")?;
    let mut devices = DeviceTable::load(&settings.tables.devices)?;
    devices.reassign(&[Assignment::new(index, port, address)])?;
    devices
        .save(&settings.tables.devices)
        .with_context(|| format!("Failed to save {}", settings.tables.devices.display()))?;
    println!("Device table updated");
    Ok(ExitCode::SUCCESS)
}
