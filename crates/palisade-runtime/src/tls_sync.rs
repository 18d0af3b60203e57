//! Single-writer broadcast of thread-local updates.
//!
//! A publisher registers an update; every participating worker applies it
//! from inside its own tick, so the update runs on the worker's thread with
//! its TLS visible. The core only reserves the tick slot; what updates do
//! is up to the caller.

use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::{Acquire, Release};

use crate::group::WorkerGroup;
use crate::worker::Worker;

pub type SyncFn = std::sync::Arc<dyn Fn(&Worker, &WorkerGroup) + Send + Sync>;

#[derive(Default)]
pub struct TlsSyncSystem {
    generation: AtomicU64,
    entries: Mutex<Vec<(u64, SyncFn)>>,
}

impl TlsSyncSystem {
    pub fn new() -> TlsSyncSystem {
        TlsSyncSystem::default()
    }

    /// Publish an update to be applied on every participating worker.
    pub fn publish(&self, f: SyncFn) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let generation = self.generation.load(Acquire) + 1;
        entries.push((generation, f));
        self.generation.store(generation, Release);
    }

    /// Apply everything published so far; worker-start slot.
    pub(crate) fn tls_initialize(&self, seen: &mut u64, worker: &Worker, group: &WorkerGroup) {
        self.apply_newer(seen, worker, group);
    }

    /// Apply updates published since this worker's last pass; tick slot.
    pub(crate) fn tls_tick(&self, seen: &mut u64, worker: &Worker, group: &WorkerGroup) {
        if self.generation.load(Acquire) > *seen {
            self.apply_newer(seen, worker, group);
        }
    }

    fn apply_newer(&self, seen: &mut u64, worker: &Worker, group: &WorkerGroup) {
        let pending: Vec<SyncFn> = {
            let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries
                .iter()
                .filter(|(generation, _)| *generation > *seen)
                .map(|(_, f)| f.clone())
                .collect()
        };

        for f in pending {
            f(worker, group);
        }
        *seen = self.generation.load(Acquire);
    }
}
