//! Result detection engine
//!
//! A [`ResultDetector`] runs a set of periodic probes against one target and
//! turns the first conclusive observation into the verdict of the run. The
//! detector must be armed before probes can start; delivering a verdict
//! disarms it, so every arming yields at most one verdict no matter how many
//! probes fire at the same time.

use crate::mutation::MutationLog;
use crate::probes;
use crate::target::ProbeTarget;
use crate::timings::DetectionTimings;
use crossbeam_channel as chan;
use emufi_core::{CancelSignal, CancelSource};
use emufi_ipc::{Collector, ExperimentResult};
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Detection engine failures
#[derive(Debug, Error)]
pub enum DetectError {
    #[error("Failed to spawn probe thread: {0}")]
    Spawn(#[from] io::Error),
}

/// Probes the engine can run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeKind {
    /// Fires once if boot never reaches the workload
    SysinitHang,
    /// Records fault sites printed on the console
    Mutation,
    /// Kernel panic, emulator death or oops
    SystemCrash,
    /// Device stops answering
    SystemHang,
    /// Workload reported success
    AppFinished,
    /// Workload missing or reported failure
    AppFailure,
    /// Device answers but the workload never finished
    AppHang,
    /// Experiment-level failure after a grace period
    DelayedFailure,
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProbeKind::SysinitHang => "sysinit-hang",
            ProbeKind::Mutation => "mutation",
            ProbeKind::SystemCrash => "system-crash",
            ProbeKind::SystemHang => "system-hang",
            ProbeKind::AppFinished => "app-finished",
            ProbeKind::AppFailure => "app-failure",
            ProbeKind::AppHang => "app-hang",
            ProbeKind::DelayedFailure => "delayed-failure",
        };
        f.write_str(name)
    }
}

struct Probe {
    kind: ProbeKind,
    cancel: CancelSource,
}

#[derive(Default)]
struct State {
    armed: bool,
    generation: u64,
    probes: Vec<Probe>,
    mutations: Option<Arc<MutationLog>>,
}

impl State {
    fn cancel_probes(&mut self, keep: impl Fn(ProbeKind) -> bool) {
        self.probes.retain(|probe| {
            if keep(probe.kind) {
                return true;
            }
            probe.cancel.cancel();
            debug!("Stopped {} probe", probe.kind);
            false
        });
    }
}

struct Inner {
    target: Arc<dyn ProbeTarget>,
    sink: Arc<dyn Collector>,
    timings: DetectionTimings,
    state: Mutex<State>,
    verdict_tx: chan::Sender<ExperimentResult>,
    verdict_rx: chan::Receiver<ExperimentResult>,
}

type Check = Box<dyn Fn(&Inner) -> Option<ExperimentResult> + Send>;

/// Kind, initial delay, period (`None` runs once) and check of one probe
type ProbeSpec = (ProbeKind, Duration, Option<Duration>, Check);

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Deliver `verdict` unless the run already has one.
    fn signal(&self, generation: u64, cancel: &CancelSignal, verdict: ExperimentResult) {
        let emu = self.target.log_id();
        let mutations = {
            let mut state = self.lock();
            if !state.armed || state.generation != generation || cancel.is_cancelled() {
                debug!(emu = %emu, "Dropping late verdict {verdict}");
                return;
            }
            state.armed = false;
            state.cancel_probes(|_| false);
            state.mutations.clone()
        };

        let metadata = match mutations {
            Some(log) => {
                log.scan(&self.target.console_output(), emu);
                log.metadata()
            }
            None => String::new(),
        };

        info!(emu = %emu, "Experiment result: {verdict}");
        if let Err(e) = self.sink.send_experiment_finished(verdict, &metadata) {
            error!(emu = %emu, "Failed to report result {verdict}: {e}");
        }
        let _ = self.verdict_tx.send(verdict);
    }
}

/// Verdict engine for one emulator
pub struct ResultDetector {
    inner: Arc<Inner>,
}

impl ResultDetector {
    /// Create a disarmed detector observing `target` and reporting to `sink`
    pub fn new(
        target: Arc<dyn ProbeTarget>,
        sink: Arc<dyn Collector>,
        timings: DetectionTimings,
    ) -> Self {
        let (verdict_tx, verdict_rx) = chan::unbounded();
        Self {
            inner: Arc::new(Inner {
                target,
                sink,
                timings,
                state: Mutex::new(State::default()),
                verdict_tx,
                verdict_rx,
            }),
        }
    }

    /// Timings in use
    pub fn timings(&self) -> &DetectionTimings {
        &self.inner.timings
    }

    /// Prepare for a new run: stop leftover probes, forget fault sites and
    /// any undelivered verdict, then allow probes to start.
    pub fn rearm(&self) {
        let mut state = self.inner.lock();
        state.cancel_probes(|_| false);
        state.mutations = None;
        state.generation += 1;
        state.armed = true;
        while self.inner.verdict_rx.try_recv().is_ok() {}
        debug!(emu = %self.inner.target.log_id(), "Detector armed (generation {})", state.generation);
    }

    /// Whether a verdict may still be delivered
    pub fn is_armed(&self) -> bool {
        self.inner.lock().armed
    }

    /// Probes currently running
    pub fn active_probes(&self) -> Vec<ProbeKind> {
        self.inner.lock().probes.iter().map(|p| p.kind).collect()
    }

    /// Fault sites seen since the system detectors started, sorted
    pub fn mutations(&self) -> Vec<String> {
        self.inner
            .lock()
            .mutations
            .as_ref()
            .map(|log| log.sites())
            .unwrap_or_default()
    }

    /// Start the boot watchdog
    pub fn start_sysinit_detector(&self) -> Result<(), DetectError> {
        let delay = self.inner.timings.sysinit_hang_delay;
        self.start(vec![(
            ProbeKind::SysinitHang,
            delay,
            None,
            Box::new(|inner: &Inner| probes::assume_sysinit_hang(inner.target.as_ref())) as Check,
        )])
    }

    /// Stop the boot watchdog, leaving other probes running
    pub fn stop_sysinit_detector(&self) {
        self.inner
            .lock()
            .cancel_probes(|kind| kind != ProbeKind::SysinitHang);
    }

    /// Start fault-site tracking, crash detection and the system hang assumer
    pub fn start_system_detectors(&self) -> Result<(), DetectError> {
        let t = &self.inner.timings;
        let log = Arc::new(MutationLog::new());
        let scan_log = Arc::clone(&log);
        let probes: Vec<ProbeSpec> = vec![
            (
                ProbeKind::Mutation,
                Duration::ZERO,
                Some(t.period),
                Box::new(move |inner: &Inner| {
                    scan_log.scan(&inner.target.console_output(), inner.target.log_id());
                    None
                }) as Check,
            ),
            (
                ProbeKind::SystemCrash,
                t.period,
                Some(t.period),
                Box::new(|inner: &Inner| probes::check_system_crash(inner.target.as_ref())) as Check,
            ),
            (
                ProbeKind::SystemHang,
                t.system_hang_delay,
                Some(t.system_hang_period),
                Box::new(|inner: &Inner| {
                    probes::check_system_hang(inner.target.as_ref(), inner.timings.bridge_timeout)
                }) as Check,
            ),
        ];

        let mut state = self.inner.lock();
        if !self.ready(&state, "system detectors") {
            return Ok(());
        }
        state.mutations = Some(log);
        self.spawn_all(&mut state, probes)
    }

    /// Start workload success, failure and hang detection
    pub fn start_application_detectors(&self) -> Result<(), DetectError> {
        let t = &self.inner.timings;
        self.start(vec![
            (
                ProbeKind::AppFinished,
                t.period,
                Some(t.period),
                Box::new(|inner: &Inner| {
                    probes::check_app_finished(inner.target.as_ref(), &inner.timings.flag_file)
                }) as Check,
            ),
            (
                ProbeKind::AppFailure,
                t.period,
                Some(t.period),
                Box::new(|inner: &Inner| {
                    probes::check_app_failure(inner.target.as_ref(), &inner.timings.flag_file)
                }) as Check,
            ),
            (
                ProbeKind::AppHang,
                t.app_hang_delay,
                Some(t.app_hang_delay),
                Box::new(|inner: &Inner| {
                    probes::check_app_hang(inner.target.as_ref(), inner.timings.bridge_timeout)
                }) as Check,
            ),
        ])
    }

    /// Report an experiment failure after `times` detection periods unless
    /// another verdict arrives first
    pub fn signal_delayed_failure(&self, times: u32) -> Result<(), DetectError> {
        let delay = self.inner.timings.period.saturating_mul(times);
        self.start(vec![(
            ProbeKind::DelayedFailure,
            delay,
            None,
            Box::new(|_: &Inner| Some(ExperimentResult::ExperimentFailure)) as Check,
        )])
    }

    /// Stop every probe. The detector stays armed.
    pub fn stop_all(&self) {
        self.inner.lock().cancel_probes(|_| false);
    }

    /// Block until a verdict is delivered or `timeout` passes
    pub fn wait_for_verdict(&self, timeout: Duration) -> Option<ExperimentResult> {
        self.inner.verdict_rx.recv_timeout(timeout).ok()
    }

    fn start(
        &self,
        probes: Vec<ProbeSpec>,
    ) -> Result<(), DetectError> {
        let mut state = self.inner.lock();
        let what = probes
            .iter()
            .map(|p| p.0.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        if !self.ready(&state, &what) {
            return Ok(());
        }
        self.spawn_all(&mut state, probes)
    }

    fn ready(&self, state: &State, what: &str) -> bool {
        if !state.armed {
            warn!(emu = %self.inner.target.log_id(), "Not starting {what}: detector is not armed");
        }
        state.armed
    }

    fn spawn_all(
        &self,
        state: &mut State,
        probes: Vec<ProbeSpec>,
    ) -> Result<(), DetectError> {
        for (kind, delay, period, check) in probes {
            let cancel = CancelSource::new();
            let signal = cancel.signal();
            let inner = Arc::clone(&self.inner);
            let generation = state.generation;

            thread::Builder::new()
                .name(format!("probe-{kind}"))
                .spawn(move || run_probe(&inner, generation, &signal, delay, period, check))?;

            debug!(emu = %self.inner.target.log_id(), "Started {kind} probe");
            state.probes.push(Probe { kind, cancel });
        }
        Ok(())
    }
}

impl Drop for ResultDetector {
    fn drop(&mut self) {
        self.stop_all();
    }
}

fn run_probe(
    inner: &Inner,
    generation: u64,
    cancel: &CancelSignal,
    delay: Duration,
    period: Option<Duration>,
    check: Check,
) {
    if cancel.sleep(delay) {
        return;
    }
    loop {
        if let Some(verdict) = check(inner) {
            inner.signal(generation, cancel, verdict);
            return;
        }
        match period {
            Some(period) if !cancel.sleep(period) => {}
            _ => return,
        }
    }
}
