//! Emulator allocation
//!
//! Hands out instance ids and console ports. Each instance takes two
//! consecutive ports (console, adb), so ports advance by two.

use crate::emulator::{Emulator, EmulatorConfig};
use crate::settings::ExperimentSettings;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// First console port handed out by default
pub const BASE_CONSOLE_PORT: u16 = 5554;

/// Allocation failures
#[derive(Debug, Error)]
pub enum AllocatorError {
    #[error("No console ports left after {last}")]
    PortsExhausted { last: u16 },
}

#[derive(Debug)]
struct Allocation {
    next_id: u32,
    next_port: u16,
}

/// Allocator for emulator instances. Ids start at 0, console ports at the
/// base port; neither is ever reused by the same factory.
#[derive(Debug)]
pub struct EmulatorFactory {
    settings: Arc<ExperimentSettings>,
    next: Mutex<Allocation>,
}

impl EmulatorFactory {
    /// Factory starting at [`BASE_CONSOLE_PORT`]
    pub fn new(settings: Arc<ExperimentSettings>) -> Self {
        Self::with_base_port(settings, BASE_CONSOLE_PORT)
    }

    /// Factory starting at `base_port`
    pub fn with_base_port(settings: Arc<ExperimentSettings>, base_port: u16) -> Self {
        Self {
            settings,
            next: Mutex::new(Allocation {
                next_id: 0,
                next_port: base_port,
            }),
        }
    }

    /// Settings every created instance is derived from
    pub fn settings(&self) -> &ExperimentSettings {
        &self.settings
    }

    /// Reserve the next id and port pair.
    pub fn allocate(&self) -> Result<EmulatorConfig, AllocatorError> {
        let mut next = self.next.lock().unwrap_or_else(|e| e.into_inner());
        // The adb port (console + 1) must fit as well.
        if next.next_port.checked_add(1).is_none() {
            return Err(AllocatorError::PortsExhausted {
                last: next.next_port,
            });
        }
        let config = EmulatorConfig::new(next.next_id, next.next_port, &self.settings);
        next.next_id += 1;
        next.next_port = next.next_port.saturating_add(2);
        Ok(config)
    }

    /// Allocate and construct one emulator instance.
    pub fn create(&self) -> Result<Emulator, AllocatorError> {
        let config = self.allocate()?;
        Ok(Emulator::new(config, &self.settings))
    }

    /// Allocate `count` instances in id order.
    pub fn create_many(&self, count: usize) -> Result<Vec<Emulator>, AllocatorError> {
        (0..count).map(|_| self.create()).collect()
    }
}
