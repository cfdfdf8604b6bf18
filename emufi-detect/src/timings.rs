//! Detection intervals

use std::time::Duration;

/// Delays and periods of every probe. All of them are explicit so tests can
/// run the engine at millisecond scale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectionTimings {
    /// Period of the console and flag-file probes
    pub period: Duration,
    /// Delay before a boot that never reached the workload is assumed hung
    pub sysinit_hang_delay: Duration,
    /// Delay (and period) of the application hang assumer
    pub app_hang_delay: Duration,
    /// Initial delay of the system hang assumer
    pub system_hang_delay: Duration,
    /// Period of the system hang assumer
    pub system_hang_period: Duration,
    /// How long the device may take to answer a responsiveness check
    pub bridge_timeout: Duration,
    /// Device file the workload writes its final state into
    pub flag_file: String,
}

impl Default for DetectionTimings {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(5),
            sysinit_hang_delay: Duration::from_secs(240),
            app_hang_delay: Duration::from_secs(300),
            system_hang_delay: Duration::from_secs(120),
            system_hang_period: Duration::from_secs(30),
            bridge_timeout: Duration::from_secs(10),
            flag_file: "/data/local/tmp/workload_flag".to_string(),
        }
    }
}
