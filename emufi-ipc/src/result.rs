//! Experiment verdicts

use std::fmt;
use thiserror::Error;

/// Unknown verdict id on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Unknown experiment result id {0}")]
pub struct UnknownResult(pub i16);

/// Terminal outcome of one experiment run. Discriminants are the wire ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum ExperimentResult {
    /// The orchestration itself failed
    ExperimentFailure = -1,
    /// No verdict
    None = 0,
    /// The workload completed
    Finished = 1,
    /// The kernel reported a hang
    SystemHangDetected = 2,
    /// The device stopped responding
    SystemHangAssumed = 3,
    /// The kernel panicked or the emulator died
    SystemCrashDetected = 4,
    /// The application reported a hang
    ApplicationHangDetected = 5,
    /// The device responds but the workload never finished
    ApplicationHangAssumed = 6,
    /// The workload reported a failure
    ApplicationFaultDetected = 7,
    /// The workload never started
    SysinitHangAssumed = 8,
    /// The kernel logged an oops
    SystemOopsDetected = 9,
}

impl ExperimentResult {
    /// Every verdict, in id order
    pub const ALL: [ExperimentResult; 11] = [
        ExperimentResult::ExperimentFailure,
        ExperimentResult::None,
        ExperimentResult::Finished,
        ExperimentResult::SystemHangDetected,
        ExperimentResult::SystemHangAssumed,
        ExperimentResult::SystemCrashDetected,
        ExperimentResult::ApplicationHangDetected,
        ExperimentResult::ApplicationHangAssumed,
        ExperimentResult::ApplicationFaultDetected,
        ExperimentResult::SysinitHangAssumed,
        ExperimentResult::SystemOopsDetected,
    ];

    /// Wire id
    pub fn id(self) -> i16 {
        self as i16
    }

    /// Look up a verdict by wire id
    pub fn from_id(id: i16) -> Result<Self, UnknownResult> {
        Self::ALL
            .into_iter()
            .find(|r| r.id() == id)
            .ok_or(UnknownResult(id))
    }

    /// Stable upper-snake name
    pub fn name(self) -> &'static str {
        match self {
            ExperimentResult::ExperimentFailure => "EXPERIMENT_FAILURE",
            ExperimentResult::None => "NONE",
            ExperimentResult::Finished => "FINISHED",
            ExperimentResult::SystemHangDetected => "SYSTEM_HANG_DETECTED",
            ExperimentResult::SystemHangAssumed => "SYSTEM_HANG_ASSUMED",
            ExperimentResult::SystemCrashDetected => "SYSTEM_CRASH_DETECTED",
            ExperimentResult::ApplicationHangDetected => "APPLICATION_HANG_DETECTED",
            ExperimentResult::ApplicationHangAssumed => "APPLICATION_HANG_ASSUMED",
            ExperimentResult::ApplicationFaultDetected => "APPLICATION_FAULT_DETECTED",
            ExperimentResult::SysinitHangAssumed => "SYSINIT_HANG_ASSUMED",
            ExperimentResult::SystemOopsDetected => "SYSTEM_OOPS_DETECTED",
        }
    }
}

impl fmt::Display for ExperimentResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_ids() {
        assert_eq!(ExperimentResult::ExperimentFailure.id(), -1);
        assert_eq!(ExperimentResult::Finished.id(), 1);
        assert_eq!(ExperimentResult::SysinitHangAssumed.id(), 8);
        assert_eq!(ExperimentResult::SystemOopsDetected.id(), 9);
        for result in ExperimentResult::ALL {
            assert_eq!(ExperimentResult::from_id(result.id()), Ok(result));
        }
    }

    #[test]
    fn test_unknown_id() {
        assert_eq!(ExperimentResult::from_id(10), Err(UnknownResult(10)));
        assert_eq!(ExperimentResult::from_id(-2), Err(UnknownResult(-2)));
    }
}
