//! Cross-group routing of delayed work.
//!
//! A delayed task produced on a thread whose group cannot host it is handed
//! to a worker of a capable group: round-robin over the cached group list,
//! then round-robin over that group's workers, then a push into the
//! worker's matching MPSC inbox. The cursors live in the producing thread's
//! TLS, so routing never contends.

use tracing::error;

use crate::aod::AodLane;
use crate::aod::tls::AodTls;
use crate::context::ServerTls;
use crate::task::TaskRef;
use crate::tuning::{ASSUME_GROUP_COUNT_POW2, ASSUME_WORKER_COUNT_POW2, USE_IF_INSTEAD_OF_MODULO};

/// Advance a round-robin cursor over `len` slots. The arithmetic variants
/// are interchangeable; the bitmask one additionally assumes `len` is a
/// power of two.
pub(crate) fn rr_next(counter: &mut u32, len: usize, assume_pow2: bool) -> usize {
    debug_assert!(len > 0);

    if assume_pow2 {
        debug_assert!(len.is_power_of_two());
        let index = (*counter as usize) & (len - 1);
        *counter = counter.wrapping_add(1);
        return index;
    }

    if USE_IF_INSTEAD_OF_MODULO {
        let mut index = *counter as usize;
        if index >= len {
            index = 0;
            *counter = 0;
        }
        *counter += 1;
        return index;
    }

    let index = (*counter as usize) % len;
    *counter = counter.wrapping_add(1);
    index
}

/// Route a delayed free task to a worker of a timer-capable group.
pub(crate) fn route_free(tls: &mut ServerTls, task: TaskRef) {
    if tls.timer_groups.is_empty() {
        error!("no worker group handles timer tasks, delayed task dropped");
        return;
    }

    let group_index = rr_next(&mut tls.rr_group, tls.timer_groups.len(), ASSUME_GROUP_COUNT_POW2);
    let group = &tls.timer_groups[group_index];

    let workers = group.workers();
    let worker_index = rr_next(&mut tls.rr_worker, workers.len(), ASSUME_WORKER_COUNT_POW2);
    workers[worker_index].defer_delayed(task);
}

/// Route a delayed object-bound task to a worker of an AOD-capable group.
pub(crate) fn route_aod(tls: &mut AodTls, lane: AodLane, task: TaskRef) {
    if tls.aod_groups.is_empty() {
        error!("no worker group hosts AOD timers, delayed task dropped");
        return;
    }

    let group_index = rr_next(&mut tls.rr_group, tls.aod_groups.len(), ASSUME_GROUP_COUNT_POW2);
    let group = &tls.aod_groups[group_index];

    let workers = group.workers();
    let worker_index = rr_next(&mut tls.rr_worker, workers.len(), ASSUME_WORKER_COUNT_POW2);
    workers[worker_index].defer_aod(lane, task);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modulo_cycle_visits_every_slot() {
        let mut counter = 0;
        let picks: Vec<_> = (0..9).map(|_| rr_next(&mut counter, 3, false)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn pow2_mask_matches_modulo() {
        let mut masked = 0;
        let mut modulo = 0;
        for _ in 0..32 {
            assert_eq!(rr_next(&mut masked, 4, true), rr_next(&mut modulo, 4, false));
        }
    }

    #[test]
    fn counter_wrap_stays_in_bounds() {
        let mut counter = u32::MAX - 1;
        for _ in 0..8 {
            assert!(rr_next(&mut counter, 3, false) < 3);
        }
    }
}
