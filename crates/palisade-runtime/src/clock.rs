//! Monotonic uptime ticks and the sleep primitive used by active workers.
//!
//! All due-times in the runtime are absolute millisecond counts measured
//! from a process-wide epoch captured on first use. Comparing two due-times
//! never involves wall-clock time.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use crate::tuning::PRECISE_SLEEP_SPIN_WINDOW;

/// Absolute due-time: milliseconds since the process epoch.
pub type Ticks = u64;

static EPOCH: OnceLock<Instant> = OnceLock::new();

fn epoch() -> Instant {
    *EPOCH.get_or_init(Instant::now)
}

/// Milliseconds elapsed since the process epoch.
pub fn uptime_millis() -> Ticks {
    epoch().elapsed().as_millis() as Ticks
}

/// Absolute due-time `after` milliseconds from now.
pub fn due_after(after: Duration) -> Ticks {
    uptime_millis() + after.as_millis() as Ticks
}

/// Sleep close to `duration` without the full jitter of a plain
/// `thread::sleep`: coarse-sleep up to the spin window before the deadline,
/// then spin the remainder.
pub fn precise_sleep(duration: Duration) {
    let deadline = Instant::now() + duration;

    loop {
        let now = Instant::now();
        if now >= deadline {
            return;
        }

        let remaining = deadline - now;
        if remaining > PRECISE_SLEEP_SPIN_WINDOW {
            std::thread::sleep(remaining - PRECISE_SLEEP_SPIN_WINDOW);
        } else {
            std::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uptime_is_monotonic() {
        let a = uptime_millis();
        let b = uptime_millis();
        assert!(b >= a);
    }

    #[test]
    fn precise_sleep_hits_deadline() {
        let start = Instant::now();
        precise_sleep(Duration::from_millis(20));
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_millis(20));
        // generous upper bound, CI schedulers are noisy
        assert!(elapsed < Duration::from_millis(120));
    }
}
