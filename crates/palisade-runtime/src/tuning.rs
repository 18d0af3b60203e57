//! Compile-time tuning knobs for the scheduler core.
//!
//! Flipping any of these must not change observable semantics, only the
//! shape of the generated code. The round-robin arithmetic switches select
//! between modulo, a predicted branch, and a bitmask; the power-of-two
//! assumptions are only valid when the deployment guarantees the respective
//! counts.

use std::time::Duration;

/// Drain async IO completions in batches instead of one per call.
pub const DEQUEUE_COMPLETIONS_IN_BATCHES: bool = true;

/// Upper bound of completions dispatched per worker tick.
pub const MAX_COMPLETIONS_PER_TICK: usize = 64;

/// Cap general-task execution per tick instead of draining the inbox dry.
pub const THROTTLE_GENERAL_TASKS: bool = true;

/// Max general tasks executed per tick when throttling is on.
pub const MAX_GENERAL_TASKS_PER_TICK: usize = 32;

/// Assume the count of timer/AOD-capable groups is a power of two.
pub const ASSUME_GROUP_COUNT_POW2: bool = false;

/// Assume each routed group's worker count is a power of two.
pub const ASSUME_WORKER_COUNT_POW2: bool = false;

/// Use a predicted branch instead of modulo in the round-robin pick.
pub const USE_IF_INSTEAD_OF_MODULO: bool = false;

/// Assume every group handles timer tasks, skipping the routing path.
pub const ASSUME_ALL_GROUPS_HANDLE_TIMERS: bool = false;

/// Assume every group hosts AOD, skipping the AOD routing path.
pub const ASSUME_ALL_GROUPS_HANDLE_AOD: bool = false;

/// Window before a precise-sleep deadline spent spinning instead of
/// sleeping.
pub const PRECISE_SLEEP_SPIN_WINDOW: Duration = Duration::from_millis(2);
