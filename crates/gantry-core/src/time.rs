//! Compact monotonic time for liveness tracking.
//!
//! Watchdog touches and drain timestamps are plain `u64` milliseconds on a
//! process-local monotonic clock, so they fit in one atomic and are immune
//! to wall-clock jumps.

use std::sync::OnceLock;
use std::time::Instant;

/// Returns monotonic time in milliseconds since the first call in this
/// process.
#[inline]
pub fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_never_decreases() {
        let a = monotonic_ms();
        let b = monotonic_ms();
        assert!(b >= a);
    }

    #[test]
    fn advances_with_real_time() {
        let a = monotonic_ms();
        std::thread::sleep(std::time::Duration::from_millis(15));
        let b = monotonic_ms();
        assert!(b >= a + 10);
    }
}
