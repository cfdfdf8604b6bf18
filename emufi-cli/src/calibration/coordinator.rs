//! Parallel calibration batches
//!
//! A batch runs `P` instances at once on a worker pool. Every run reports
//! back over a channel whether it succeeded or not, which makes the channel a
//! counting barrier: once `P` reports arrived the batch is over. The barrier
//! wait has a wall-clock ceiling; on timeout every run of the batch is
//! aborted and the coordinator blocks until all of them confirmed shutdown.
//! A level is given up after `max_failures` failed batches in a row.

use super::instance::CalibrationInstance;
use super::spec::CalibSpec;
use super::CalibrationError;
use crossbeam_channel as chan;
use emufi_core::CancelSource;
use emufi_ipc::{Collector, ExperimentResult};
use emufi_report::{CalibrationResult, CsvWriter};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Emulator id and how its run ended
type Outcome = (u32, Result<CalibrationResult, CalibrationError>);

/// How often aborts are repeated while cancelled runs wind down
const ABORT_RETRY: Duration = Duration::from_millis(250);

/// Runs a calibration session over a fixed set of instances
pub struct CalibrationCoordinator {
    instances: Vec<Arc<dyn CalibrationInstance>>,
    collector: Arc<dyn Collector>,
    results_file: PathBuf,
    run_timeout: Duration,
    max_failures: u32,
    show_progress: bool,
}

impl CalibrationCoordinator {
    /// Coordinator over `instances`; batches of `P` use the first `P` of them
    pub fn new(
        instances: Vec<Arc<dyn CalibrationInstance>>,
        collector: Arc<dyn Collector>,
        results_file: impl Into<PathBuf>,
        run_timeout: Duration,
        max_failures: u32,
    ) -> Self {
        Self {
            instances,
            collector,
            results_file: results_file.into(),
            run_timeout,
            max_failures,
            show_progress: false,
        }
    }

    /// Show a progress bar on the terminal
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Run the session and report its outcome to the collector as
    /// `Finished` or `ExperimentFailure`.
    pub fn calibrate(&self, spec: &CalibSpec) -> Result<Vec<CalibrationResult>, CalibrationError> {
        info!("Calibration configuration in use: {spec}");
        let outcome = self.run_session(spec);
        let verdict = match &outcome {
            Ok(_) => {
                info!("Calibration finished");
                ExperimentResult::Finished
            }
            Err(e) => {
                error!("Calibration failed: {e}");
                ExperimentResult::ExperimentFailure
            }
        };
        if let Err(e) = self.collector.send_experiment_finished(verdict, "") {
            error!("Failed to report calibration outcome: {e}");
        }
        outcome
    }

    /// Every level, every repetition. Results are written and logged after
    /// each successful batch.
    pub fn run_session(&self, spec: &CalibSpec) -> Result<Vec<CalibrationResult>, CalibrationError> {
        let needed = spec.max_level();
        if needed as usize > self.instances.len() {
            return Err(CalibrationError::NotEnoughInstances {
                needed,
                available: self.instances.len(),
            });
        }

        let pool = ThreadPoolBuilder::new()
            .num_threads(needed.max(1) as usize)
            .thread_name(|i| format!("calib-{i}"))
            .build()?;
        let mut writer = CsvWriter::open(&self.results_file)?;
        self.collector.send_log(CalibrationResult::csv_header())?;

        let pb = self.progress_bar(spec.total_batches());
        let mut all = Vec::new();
        for &level in &spec.levels {
            let mut failures = 0;
            let mut run = 0;
            while run < spec.repetitions {
                let retries = if failures > 0 {
                    format!(", failed in a row: {failures} (max: {})", self.max_failures)
                } else {
                    String::new()
                };
                info!(
                    "Starting calibration run: {level} parallel emus, repetition {}{retries}",
                    run + 1
                );
                pb.set_message(format!("P={level} run {}", run + 1));

                match self.execute_batch(&pool, level, run, &spec.module) {
                    Ok(results) => {
                        for result in &results {
                            debug!("{result}");
                        }
                        let text = writer.write_batch(&results)?;
                        self.collector.send_log(&text)?;
                        all.extend(results);
                        failures = 0;
                        run += 1;
                        pb.inc(1);
                    }
                    Err(e) => {
                        failures += 1;
                        if failures >= self.max_failures.max(1) {
                            error!("Run failed! No remaining retries: {failures}. Last error: {e}");
                            pb.abandon_with_message("Failed");
                            return Err(CalibrationError::RetriesExhausted { level, failures });
                        }
                        warn!("Calibration run with {level} emulators failed, retrying: {e}");
                    }
                }
            }
        }

        pb.finish_with_message("Complete");
        info!("Finished all calibration runs");
        Ok(all)
    }

    /// Run the first `level` instances in parallel once
    fn execute_batch(
        &self,
        pool: &ThreadPool,
        level: u32,
        run: u32,
        module: &str,
    ) -> Result<Vec<CalibrationResult>, CalibrationError> {
        let batch = &self.instances[..level as usize];
        let cancel = CancelSource::new();
        let (done_tx, done_rx) = chan::bounded::<Outcome>(batch.len());

        for instance in batch {
            let instance = Arc::clone(instance);
            let done_tx = done_tx.clone();
            let signal = cancel.signal();
            let module = module.to_string();
            pool.spawn(move || {
                let id = instance.id();
                let outcome = instance
                    .run_once(&module, &signal)
                    .map(|t| CalibrationResult::new(level, run, id, t.sysinit, t.workload));
                let _ = done_tx.send((id, outcome));
            });
        }
        drop(done_tx);

        debug!("Waiting until {level} calibration runs have finished");
        let deadline = Instant::now() + self.run_timeout;
        let mut results = Vec::with_capacity(batch.len());
        let mut pending: BTreeSet<u32> = batch.iter().map(|i| i.id()).collect();
        let mut failed = 0;
        while !pending.is_empty() {
            match done_rx.recv_deadline(deadline) {
                Ok((id, outcome)) => {
                    pending.remove(&id);
                    match outcome {
                        Ok(result) => results.push(result),
                        Err(e) => {
                            debug!("Calibration run on emulator {id} failed: {e}");
                            failed += 1;
                        }
                    }
                }
                Err(chan::RecvTimeoutError::Timeout) => {
                    error!("Failed to wait for {level} calibration runs. Timed out.");
                    self.cancel_batch(batch, &cancel, &done_rx, pending);
                    return Err(CalibrationError::Timeout {
                        count: level,
                        after: self.run_timeout,
                    });
                }
                Err(chan::RecvTimeoutError::Disconnected) => {
                    failed += pending.len() as u32;
                    break;
                }
            }
        }
        debug!("All {level} calibration runs have finished");

        if failed > 0 {
            return Err(CalibrationError::BatchFailed {
                failed,
                count: level,
            });
        }
        results.sort_by_key(|r| r.emu);
        Ok(results)
    }

    fn cancel_batch(
        &self,
        batch: &[Arc<dyn CalibrationInstance>],
        cancel: &CancelSource,
        done_rx: &chan::Receiver<Outcome>,
        mut pending: BTreeSet<u32>,
    ) {
        info!("Canceling started emulator runs: {}", batch.len());
        cancel.cancel();
        for instance in batch {
            warn!("Cancel run on emulator {}", instance.id());
            instance.abort();
        }

        // Aborted runs still tear down and report. A command started just
        // after an abort is caught by the next one.
        let deadline = Instant::now() + self.run_timeout;
        while !pending.is_empty() {
            match done_rx.recv_timeout(ABORT_RETRY) {
                Ok((id, _)) => {
                    pending.remove(&id);
                }
                Err(chan::RecvTimeoutError::Timeout) if Instant::now() < deadline => {
                    for instance in batch.iter().filter(|i| pending.contains(&i.id())) {
                        instance.abort();
                    }
                }
                Err(chan::RecvTimeoutError::Timeout) => {
                    error!("Cancelled calibration runs did not report: emulators {pending:?}");
                    break;
                }
                Err(chan::RecvTimeoutError::Disconnected) => break,
            }
        }

        for instance in batch {
            instance.await_shutdown();
            debug!("Emulator {} shutdown complete", instance.id());
        }
        info!("Completed emulator canceling");
    }

    fn progress_bar(&self, total: u64) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(total);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        pb
    }
}
