#![warn(missing_docs)]
//! emufi Core - Emulator Runtime
//!
//! Host-side machinery for driving emulated Android devices:
//! - `CircularBuffer` and `OutputCapturer` for console output
//! - `DeviceBridge` for adb commands with tracked, cancellable processes
//! - `Emulator` lifecycle management and the `EmulatorFactory` allocator
//! - `race` for waits that must give up when the emulator dies

mod bridge;
mod cancel;
mod capture;
mod emulator;
mod factory;
pub mod process;
mod ring;
mod settings;

pub use bridge::{ADB_SHELL_TRANSPORT_ERROR, BridgeError, DeviceBridge, RESPONSE_POLL};
pub use cancel::{CancelSignal, CancelSource, Race, race};
pub use capture::{CaptureError, OutputCapturer};
pub use emulator::{
    BOOT_GIVE_UP_MARKER, CHILD_PID_MARKER, Emulator, EmulatorConfig, EmulatorError,
    IMAGE_MAP_MARKER, Phase, collect_accounting_stats, marker_value,
};
pub use factory::{AllocatorError, BASE_CONSOLE_PORT, EmulatorFactory};
pub use process::ProcessError;
pub use ring::{CircularBuffer, DEFAULT_CAPACITY};
pub use settings::{DeviceLayout, ExperimentSettings, HostTools, ImageSet};
