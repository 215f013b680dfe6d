//! Timestamp source for the recorder.
//!
//! `CLOCK_MONOTONIC` is thread-agnostic, so timestamps taken on different
//! threads live on one timeline; within a thread they never decrease.
//! The call goes through the vDSO and never blocks, which keeps it safe on
//! the probe hot path.

use nix::time::{clock_gettime, ClockId};

/// Current monotonic time in nanoseconds.
#[inline]
pub fn now() -> u64 {
    match clock_gettime(ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => (ts.tv_sec() as u64) * 1_000_000_000 + (ts.tv_nsec() as u64),
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_forward() {
        let a = now();
        assert!(a > 0);
        let b = now();
        assert!(b >= a);
    }

    #[test]
    fn nanosecond_resolution() {
        // two calls separated by a sleep must be at least that far apart
        let a = now();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = now();
        assert!(b - a >= 2_000_000);
    }
}
