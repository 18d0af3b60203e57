//! Per-worker tick-loop counters.
//!
//! Single-writer: only the owning worker increments, so all updates are
//! relaxed. Snapshots may be taken from any thread.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::Relaxed;

#[derive(Debug, Default)]
pub(crate) struct WorkerCounters {
    ticks: AtomicU64,
    completions: AtomicU64,
    general_tasks: AtomicU64,
    timer_fired: AtomicU64,
    aod_fired: AtomicU64,
}

/// Point-in-time copy of one worker's counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerMetrics {
    pub ticks: u64,
    pub completions: u64,
    pub general_tasks: u64,
    pub timer_fired: u64,
    pub aod_fired: u64,
}

impl WorkerCounters {
    pub fn add_ticks(&self, n: u64) {
        self.ticks.fetch_add(n, Relaxed);
    }

    pub fn add_completions(&self, n: u64) {
        self.completions.fetch_add(n, Relaxed);
    }

    pub fn add_general_tasks(&self, n: u64) {
        self.general_tasks.fetch_add(n, Relaxed);
    }

    pub fn add_timer_fired(&self, n: u64) {
        self.timer_fired.fetch_add(n, Relaxed);
    }

    pub fn add_aod_fired(&self, n: u64) {
        self.aod_fired.fetch_add(n, Relaxed);
    }

    pub fn snapshot(&self) -> WorkerMetrics {
        WorkerMetrics {
            ticks: self.ticks.load(Relaxed),
            completions: self.completions.load(Relaxed),
            general_tasks: self.general_tasks.load(Relaxed),
            timer_fired: self.timer_fired.load(Relaxed),
            aod_fired: self.aod_fired.load(Relaxed),
        }
    }
}
