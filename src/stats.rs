//! Process-wide runtime counters.
//!
//! One [`RuntimeStatistics`] is built at startup and shared as an `Arc`
//! between the controller, the patcher and the sampler. All counters are
//! relaxed atomics; a [`StatsSnapshot`] is a plain copy for reporting.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct RuntimeStatistics {
    pub global_samples: AtomicU64,
    pub compiled_samples: AtomicU64,
    pub interpreted_samples: AtomicU64,
    pub invocations_counted: AtomicU64,
    pub recompilations_induced: AtomicU64,
    pub submissions: AtomicU64,
    pub scheduling_failures: AtomicU64,
    pub compile_failures: AtomicU64,
    pub discarded_results: AtomicU64,
    pub bodies_installed: AtomicU64,
    pub patches_applied: AtomicU64,
    pub sites_unpatched: AtomicU64,
    pub trampolines_created: AtomicU64,
    pub trampolines_repointed: AtomicU64,
    pub trampoline_exhaustions: AtomicU64,
    pub unrecognized_sites: AtomicU64,
    pub invalidations: AtomicU64,
    counting_disabled: AtomicBool,
}

/// Increment a counter by one.
pub fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn get(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

impl RuntimeStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the counting fast path may still be used.
    pub fn counting_supported(&self) -> bool {
        !self.counting_disabled.load(Ordering::Acquire)
    }

    /// Disable counting for the rest of the process. Returns true for the
    /// call that actually flipped the flag.
    pub fn disable_counting(&self) -> bool {
        !self.counting_disabled.swap(true, Ordering::AcqRel)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            global_samples: get(&self.global_samples),
            compiled_samples: get(&self.compiled_samples),
            interpreted_samples: get(&self.interpreted_samples),
            invocations_counted: get(&self.invocations_counted),
            recompilations_induced: get(&self.recompilations_induced),
            submissions: get(&self.submissions),
            scheduling_failures: get(&self.scheduling_failures),
            compile_failures: get(&self.compile_failures),
            discarded_results: get(&self.discarded_results),
            bodies_installed: get(&self.bodies_installed),
            patches_applied: get(&self.patches_applied),
            sites_unpatched: get(&self.sites_unpatched),
            trampolines_created: get(&self.trampolines_created),
            trampolines_repointed: get(&self.trampolines_repointed),
            trampoline_exhaustions: get(&self.trampoline_exhaustions),
            unrecognized_sites: get(&self.unrecognized_sites),
            invalidations: get(&self.invalidations),
            counting_disabled: !self.counting_supported(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub global_samples: u64,
    pub compiled_samples: u64,
    pub interpreted_samples: u64,
    pub invocations_counted: u64,
    pub recompilations_induced: u64,
    pub submissions: u64,
    pub scheduling_failures: u64,
    pub compile_failures: u64,
    pub discarded_results: u64,
    pub bodies_installed: u64,
    pub patches_applied: u64,
    pub sites_unpatched: u64,
    pub trampolines_created: u64,
    pub trampolines_repointed: u64,
    pub trampoline_exhaustions: u64,
    pub unrecognized_sites: u64,
    pub invalidations: u64,
    pub counting_disabled: bool,
}

impl StatsSnapshot {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "==== Runtime Statistics ====")?;
        writeln!(
            f,
            "Samples:          {} ({} compiled, {} interpreted)",
            self.global_samples, self.compiled_samples, self.interpreted_samples
        )?;
        writeln!(f, "Invocations:      {}", self.invocations_counted)?;
        writeln!(
            f,
            "Recompilations:   {} induced, {} submitted, {} installed",
            self.recompilations_induced, self.submissions, self.bodies_installed
        )?;
        writeln!(
            f,
            "Failures:         {} scheduling, {} compile, {} discarded",
            self.scheduling_failures, self.compile_failures, self.discarded_results
        )?;
        writeln!(
            f,
            "Patches:          {} applied, {} sites unpatched, {} unrecognized",
            self.patches_applied, self.sites_unpatched, self.unrecognized_sites
        )?;
        writeln!(
            f,
            "Trampolines:      {} created, {} repointed, {} exhaustions",
            self.trampolines_created, self.trampolines_repointed, self.trampoline_exhaustions
        )?;
        writeln!(f, "Invalidations:    {}", self.invalidations)?;
        write!(
            f,
            "Counting:         {}",
            if self.counting_disabled { "disabled" } else { "enabled" }
        )
    }
}
