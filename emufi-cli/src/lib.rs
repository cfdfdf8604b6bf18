#![warn(missing_docs)]
//! emufi CLI Library
//!
//! Command-line front end of the orchestrator. Use `emufi_cli::run()` in a
//! main function to get the full CLI:
//!
//! - `emufi experiment` runs fault-injection experiments on one emulator
//! - `emufi calibrate` measures boot and workload times under parallel load
//! - `emufi init` prints a default `emufi.toml`

mod calibration;
mod config;
mod experiment;

pub use calibration::{
    CalibSpec, CalibrationCoordinator, CalibrationError, CalibrationInstance, EmulatorInstance,
    RunTimings, SpecError, parse_levels,
};
pub use config::*;
pub use experiment::{EmulatedTarget, ExperimentError, IOSCHED_SPEC_FILE, iosched_name};

use anyhow::Context;
use clap::{Parser, Subcommand};
use emufi_core::EmulatorFactory;
use emufi_ipc::{Collector, ExperimentResult, TcpCollector};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// emufi CLI arguments
#[derive(Parser, Debug)]
#[command(name = "emufi")]
#[command(author, version, about = "emufi - fault-injection experiments on emulated Android devices")]
pub struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (default: emufi.toml discovered upwards from the
    /// current directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// CLI subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run fault-injection experiments on one emulator
    Experiment {
        /// Number of experiment runs
        #[arg(long, default_value = "1")]
        runs: u32,

        /// Give up waiting for a verdict after this long (e.g. "45m")
        #[arg(long, default_value = "1h")]
        verdict_timeout: String,
    },
    /// Calibrate detection timings with parallel emulators
    Calibrate {
        /// Session as "<module> <levels> <repetitions>", e.g. "fi.ko 1-4 10".
        /// Fetched from the collector when omitted.
        #[arg(long)]
        spec: Option<String>,

        /// Hide the progress bar
        #[arg(long)]
        no_progress: bool,
    },
    /// Print a default emufi.toml
    Init,
}

/// Run the emufi CLI with the process arguments.
///
/// # Returns
/// Returns `Ok(())` on success, or an error if something goes wrong.
pub fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    run_with_cli(cli)
}

/// Run the emufi CLI with pre-parsed arguments.
pub fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    if let Commands::Init = cli.command {
        print!("{}", EmufiConfig::default_toml());
        return Ok(());
    }

    // Initialize logging
    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("emufi=debug")
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("emufi=info")
            .init();
    }

    let config = match &cli.config {
        Some(path) => EmufiConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => EmufiConfig::discover().unwrap_or_default(),
    };

    match cli.command {
        Commands::Experiment {
            runs,
            ref verdict_timeout,
        } => run_experiments(&config, runs, verdict_timeout),
        Commands::Calibrate {
            ref spec,
            no_progress,
        } => run_calibration(&config, spec.as_deref(), !no_progress),
        Commands::Init => Ok(()),
    }
}

fn factory(config: &EmufiConfig) -> EmulatorFactory {
    EmulatorFactory::with_base_port(Arc::new(config.settings()), config.emulator.base_port)
}

fn connect(config: &EmufiConfig, id: u32) -> anyhow::Result<Arc<TcpCollector>> {
    let reply_timeout = EmufiConfig::parse_duration(&config.collector.reply_timeout)?;
    let collector = TcpCollector::connect(config.collector.addr_for(id), reply_timeout)?;
    Ok(Arc::new(collector))
}

fn run_experiments(config: &EmufiConfig, runs: u32, verdict_timeout: &str) -> anyhow::Result<()> {
    let verdict_timeout = EmufiConfig::parse_duration(verdict_timeout)?;
    let timings = config.detection_timings()?;
    let emulator = Arc::new(factory(config).create()?);
    let collector = connect(config, emulator.id())?;

    let target = EmulatedTarget::new(
        emulator,
        collector,
        timings,
        config.device.clone(),
        config.detection.failure_delay_periods,
    );

    for run in 1..=runs {
        info!("Experiment run {run}/{runs}");
        match target.execute(verdict_timeout)? {
            Some(verdict) => info!("Run {run} ended with {verdict}"),
            None => warn!("No verdict for run {run} within {verdict_timeout:?}"),
        }
    }

    target.stop()?;
    Ok(())
}

fn run_calibration(config: &EmufiConfig, spec: Option<&str>, progress: bool) -> anyhow::Result<()> {
    let collector = connect(config, 0)?;
    let raw = match spec {
        Some(spec) => spec.to_string(),
        None => collector
            .configuration()
            .context("Failed to retrieve calibration configuration")?,
    };

    let spec = match CalibSpec::parse(&raw) {
        Ok(spec) => spec,
        Err(e) => {
            error!("Invalid calibration configuration: {e}");
            if let Err(e) = collector.send_experiment_finished(ExperimentResult::ExperimentFailure, "") {
                error!("Failed to signal calibration failure: {e}");
            }
            collector.disconnect();
            return Err(e.into());
        }
    };

    info!("Preparing {} emulator instances for calibration", spec.max_level());
    let instances = factory(config)
        .create_many(spec.max_level() as usize)?
        .into_iter()
        .map(|emulator| {
            Arc::new(EmulatorInstance::new(
                Arc::new(emulator),
                config.device.module_dir.clone(),
                config.device.workload_flag_file.clone(),
            )) as Arc<dyn CalibrationInstance>
        })
        .collect();

    let coordinator = CalibrationCoordinator::new(
        instances,
        collector.clone(),
        config.calibration.results_file.clone(),
        EmufiConfig::parse_duration(&config.calibration.run_timeout)?,
        config.calibration.max_failures,
    )
    .with_progress(progress && std::io::stderr().is_terminal());

    let outcome = coordinator.calibrate(&spec);
    collector.disconnect();
    outcome?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["emufi", "--verbose", "experiment", "--runs", "3"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Experiment { runs: 3, .. }));

        let cli = Cli::try_parse_from([
            "emufi",
            "calibrate",
            "--spec",
            "fi.ko 1-4 10",
            "--config",
            "emufi.toml",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("emufi.toml")));
        match cli.command {
            Commands::Calibrate { spec, no_progress } => {
                assert_eq!(spec.as_deref(), Some("fi.ko 1-4 10"));
                assert!(!no_progress);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["emufi"]).is_err());
    }
}
