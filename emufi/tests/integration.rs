//! Integration tests for emufi
//!
//! These tests drive the orchestrator end to end. Small shell scripts stand
//! in for `adb`, the device shell wrapper and the accounting wrapper, so the
//! whole stack (process tracking, console capture, probes, collector
//! reporting, calibration batches) runs without an emulator.

use emufi::{
    CalibSpec, CalibrationCoordinator, CalibrationError, CalibrationInstance, CancelSource,
    CircularBuffer, Collector, DetectionTimings, DeviceLayout, EmufiConfig, EmulatedTarget,
    Emulator, EmulatorFactory, EmulatorInstance, ExperimentResult, ExperimentSettings,
    HostTools, ImageSet, MemoryCollector,
};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Accounting wrapper: starts a long-running "emulator" child, prints the
/// boot markers and, once the child is killed, the accounting block.
const GETDELAYS: &str = r#"sleep 30 &
child=$!
echo "Child pid: $child"
echo 'Kernel command line: test'
wait $child
echo "PID $child"
echo '(cpu: 1;)'"#;

fn script(path: &Path, body: &str) -> PathBuf {
    std::fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_path_buf()
}

/// adb stand-in. `adb -s <dev> <cmd> ...`: device waits succeed unless
/// `no-device` exists and never return while `hang-device` exists, logcat
/// replays the workload lifecycle (or stays silent with `no-workload`) and
/// `pull` copies `<dir>/flag` if present.
fn fake_adb(dir: &Path) -> PathBuf {
    let root = dir.display();
    script(
        &dir.join("adb"),
        &format!(
            r#"case "$3" in
  wait-for-device) [ -e {root}/hang-device ] && exec sleep 30; [ -e {root}/no-device ] && exit 1; exit 0 ;;
  logcat) [ -e {root}/no-workload ] && exec sleep 30; echo 'D/Workload: workload_started'; echo 'D/Workload: workload_finished'; exec sleep 30 ;;
  get-state) echo device ;;
  pull) [ -e {root}/flag ] || exit 1; cp {root}/flag "$5" ;;
  *) exit 0 ;;
esac"#
        ),
    )
}

fn settings_in(dir: &TempDir) -> ExperimentSettings {
    let root = dir.path();
    for name in ["userdata.img", "sdcard.img"] {
        std::fs::write(root.join(name), b"vanilla").unwrap();
    }

    ExperimentSettings {
        tools: HostTools {
            adb: fake_adb(root),
            adb_shell: script(&root.join("adbshell"), "exit 0"),
            emulator: PathBuf::from("emulator"),
            getdelays: script(&root.join("getdelays"), GETDELAYS),
        },
        images: ImageSet {
            kernel: root.join("kernel-qemu"),
            system_vanilla: root.join("system.img"),
            userdata: root.join("userdata-qemu.img"),
            userdata_vanilla: root.join("userdata.img"),
            sdcard: root.join("sdcard-qemu.img"),
            sdcard_vanilla: root.join("sdcard.img"),
        },
        device: DeviceLayout::default(),
        console_capacity: 4096,
        poll_interval: Duration::from_millis(20),
        scan_interval: Duration::from_millis(20),
    }
}

fn fast_timings() -> DetectionTimings {
    DetectionTimings {
        period: Duration::from_millis(200),
        sysinit_hang_delay: Duration::from_secs(20),
        app_hang_delay: Duration::from_secs(60),
        system_hang_delay: Duration::from_secs(60),
        system_hang_period: Duration::from_secs(60),
        bridge_timeout: Duration::from_secs(1),
        flag_file: DeviceLayout::default().workload_flag_file,
    }
}

fn target_in(dir: &TempDir, base_port: u16, collector: Arc<MemoryCollector>) -> EmulatedTarget {
    target_with(dir, base_port, collector, fast_timings())
}

fn target_with(
    dir: &TempDir,
    base_port: u16,
    collector: Arc<MemoryCollector>,
    timings: DetectionTimings,
) -> EmulatedTarget {
    let factory = EmulatorFactory::with_base_port(Arc::new(settings_in(dir)), base_port);
    let emulator = Arc::new(factory.create().unwrap());
    EmulatedTarget::new(
        emulator,
        collector,
        timings,
        EmufiConfig::default().device,
        2,
    )
}

fn short_sysinit() -> DetectionTimings {
    DetectionTimings {
        sysinit_hang_delay: Duration::from_secs(1),
        ..fast_timings()
    }
}

fn calibration_instance(dir: &TempDir, base_port: u16) -> (Arc<Emulator>, Arc<EmulatorInstance>) {
    let factory = EmulatorFactory::with_base_port(Arc::new(settings_in(dir)), base_port);
    let emulator = Arc::new(factory.create().unwrap());
    let instance = Arc::new(EmulatorInstance::new(
        emulator.clone(),
        "/data/local/modules".to_string(),
        "/data/local/tmp/workload_flag".to_string(),
    ));
    (emulator, instance)
}

#[test]
fn test_experiment_reports_finished_workload() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("flag"), "workload_finished\n").unwrap();
    let collector = Arc::new(MemoryCollector::new("fi_mod.i_open_1.ko 1 1"));
    let target = target_in(&dir, 6554, collector.clone());

    target.run_experiment();
    assert_eq!(
        target.wait_for_verdict(Duration::from_secs(20)),
        Some(ExperimentResult::Finished)
    );
    assert!(!target.detector().is_armed());

    target.reset().unwrap();
    target.stop().unwrap();
    assert!(!target.emulator().is_accounting_running());
    assert_eq!(
        collector.verdicts(),
        vec![(ExperimentResult::Finished, String::new())]
    );
    assert_eq!(collector.logs(), vec!["(cpu: 1;)".to_string()]);
}

#[test]
fn test_experiment_failure_is_reported_late() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("no-device"), "").unwrap();
    let collector = Arc::new(MemoryCollector::new("fi_mod.ko"));
    let target = target_in(&dir, 6654, collector.clone());

    target.run_experiment();
    assert_eq!(
        target.wait_for_verdict(Duration::from_secs(20)),
        Some(ExperimentResult::ExperimentFailure)
    );
    target.reset().unwrap();
    assert_eq!(collector.verdicts().len(), 1);
}

#[test]
fn test_boot_hang_ends_in_teardown() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("hang-device"), "").unwrap();
    let collector = Arc::new(MemoryCollector::new("fi_mod.ko"));
    let target = target_with(&dir, 6854, collector.clone(), short_sysinit());

    let started = Instant::now();
    assert_eq!(
        target.execute(Duration::from_secs(20)).unwrap(),
        Some(ExperimentResult::SysinitHangAssumed)
    );
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(!target.emulator().is_accounting_running());
    assert_eq!(target.emulator().bridge().tracked_processes(), 0);
    assert_eq!(
        collector.verdicts(),
        vec![(ExperimentResult::SysinitHangAssumed, String::new())]
    );
    assert_eq!(collector.logs(), vec!["(cpu: 1;)".to_string()]);
    target.stop().unwrap();
}

#[test]
fn test_workload_that_never_starts_ends_in_teardown() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("no-workload"), "").unwrap();
    let collector = Arc::new(MemoryCollector::new("fi_mod.ko"));
    let target = target_with(&dir, 6954, collector.clone(), short_sysinit());

    let started = Instant::now();
    assert_eq!(
        target.execute(Duration::from_secs(20)).unwrap(),
        Some(ExperimentResult::SysinitHangAssumed)
    );
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(!target.emulator().is_accounting_running());
    assert_eq!(target.emulator().bridge().tracked_processes(), 0);
    assert_eq!(collector.verdicts().len(), 1);
}

#[test]
fn test_verdict_timeout_aborts_the_run() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("hang-device"), "").unwrap();
    let collector = Arc::new(MemoryCollector::new("fi_mod.ko"));
    let target = target_in(&dir, 7054, collector.clone());

    let started = Instant::now();
    assert_eq!(target.execute(Duration::from_millis(500)).unwrap(), None);
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(!target.emulator().is_accounting_running());
    assert_eq!(target.emulator().bridge().tracked_processes(), 0);
    assert!(collector.verdicts().is_empty());
}

#[test]
fn test_cancelled_calibration_run_returns_promptly() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("hang-device"), "").unwrap();
    let (emulator, instance) = calibration_instance(&dir, 7154);

    // Cancelled before the run starts
    let cancelled = CancelSource::new();
    cancelled.cancel();
    let started = Instant::now();
    assert!(matches!(
        instance.run_once("fi_mod.ko", &cancelled.signal()),
        Err(CalibrationError::Cancelled(0))
    ));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!emulator.is_accounting_running());

    // Cancelled while the device wait is blocked
    let cancel = CancelSource::new();
    let started = Instant::now();
    let signal = cancel.signal();
    thread::scope(|scope| {
        let run = scope.spawn(|| instance.run_once("fi_mod.ko", &signal));
        thread::sleep(Duration::from_millis(300));
        cancel.cancel();
        assert!(run.join().unwrap().is_err());
    });
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(!emulator.is_accounting_running());
    assert_eq!(emulator.bridge().tracked_processes(), 0);
}

#[test]
fn test_calibration_timeout_shuts_down_emulators() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("hang-device"), "").unwrap();
    let (emulator, instance) = calibration_instance(&dir, 7254);

    let collector = Arc::new(MemoryCollector::default());
    let coordinator = CalibrationCoordinator::new(
        vec![instance as Arc<dyn CalibrationInstance>],
        collector.clone(),
        dir.path().join("calibration-results.txt"),
        Duration::from_secs(1),
        1,
    );

    let started = Instant::now();
    let spec = CalibSpec::parse("fi_mod.ko 1 1").unwrap();
    let err = coordinator.calibrate(&spec).unwrap_err();
    assert!(matches!(err, CalibrationError::RetriesExhausted { level: 1, failures: 1 }));
    assert!(started.elapsed() < Duration::from_secs(15));
    assert!(!emulator.is_accounting_running());
    assert_eq!(emulator.bridge().tracked_processes(), 0);
    assert_eq!(
        collector.verdicts(),
        vec![(ExperimentResult::ExperimentFailure, String::new())]
    );
}

#[test]
fn test_calibration_session_with_emulators() {
    let dir = TempDir::new().unwrap();
    let factory = EmulatorFactory::with_base_port(Arc::new(settings_in(&dir)), 6754);
    let instances: Vec<Arc<dyn CalibrationInstance>> = factory
        .create_many(2)
        .unwrap()
        .into_iter()
        .map(|emulator| {
            Arc::new(EmulatorInstance::new(
                Arc::new(emulator),
                "/data/local/modules".to_string(),
                "/data/local/tmp/workload_flag".to_string(),
            )) as Arc<dyn CalibrationInstance>
        })
        .collect();

    let collector = Arc::new(MemoryCollector::default());
    let results_file = dir.path().join("calibration-results.txt");
    let coordinator = CalibrationCoordinator::new(
        instances,
        collector.clone(),
        &results_file,
        Duration::from_secs(30),
        1,
    );

    let spec = CalibSpec::parse("fi_mod.ko 1-2 1").unwrap();
    let results = coordinator.calibrate(&spec).unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(
        results.iter().map(|r| (r.p_level, r.emu)).collect::<Vec<_>>(),
        vec![(1, 0), (2, 0), (2, 1)]
    );

    let csv = std::fs::read_to_string(&results_file).unwrap();
    assert!(csv.starts_with("P-Level,Run,Emu,SysInit,Workload\n"));
    assert_eq!(csv.lines().count(), 4);
    assert_eq!(
        collector.verdicts(),
        vec![(ExperimentResult::Finished, String::new())]
    );
}

#[test]
fn test_collector_configuration_drives_calibration_spec() {
    let collector = MemoryCollector::new("fi.ko 3-1,2 5");
    let spec = CalibSpec::parse(&collector.configuration().unwrap()).unwrap();
    assert_eq!(spec.levels, vec![1, 2, 3]);
    assert_eq!(spec.repetitions, 5);
}

#[test]
fn test_console_window_search_across_wrap() {
    let buffer = CircularBuffer::with_capacity(16);
    buffer.put("boot ok\n");
    buffer.put("Kernel panic - not syncing\n");
    assert!(buffer.contains("not syncing"));
    assert!(!buffer.contains("boot ok"));
    assert_eq!(buffer.len(), 16);
}
