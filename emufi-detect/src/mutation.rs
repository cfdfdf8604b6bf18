//! Fault-site tracking
//!
//! Instrumented modules print `<module>-fault injection (<site>)` when an
//! injected fault is reached. The log keeps every distinct site seen.

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::{LazyLock, Mutex};
use tracing::{debug, info};

static MUTATION_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.+)-fault injection (\(.*\))$").unwrap_or_else(|e| {
        unreachable!("mutation pattern is a valid regex: {e}")
    })
});

/// Distinct fault sites observed on the console
#[derive(Debug, Default)]
pub struct MutationLog {
    seen: Mutex<BTreeSet<String>>,
}

impl MutationLog {
    /// Empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Record every fault site mentioned in `console`. Returns how many
    /// sites were new.
    pub fn scan(&self, console: &str, log_id: &str) -> usize {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        let mut fresh = 0;
        for caps in console.lines().filter_map(|line| MUTATION_LINE.captures(line)) {
            let site = &caps[2];
            if seen.insert(site.to_string()) {
                info!(emu = %log_id, "Mutation '{site}' was stimulated");
                fresh += 1;
            } else {
                debug!(emu = %log_id, "Saw mutation '{site}' again");
            }
        }
        fresh
    }

    /// Sites seen so far, sorted
    pub fn sites(&self) -> Vec<String> {
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Sorted sites joined with `,` (empty if none)
    pub fn metadata(&self) -> String {
        self.sites().join(",")
    }
}
