//! Drain manager: a time-based gate for graceful connection close.
//!
//! Owners poll [`DrainManager::drain_close`] (roughly once per second per
//! connection) while considering graceful close. Before the drain sequence
//! starts it always answers false; afterwards it answers true with a
//! probability that ramps linearly from 0 to 1 over the drain window.
//! Polling is cheap and connections self-terminate without any central
//! traversal, so closes spread naturally over the window.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::Rng;

use crate::dispatcher::AbortOnDrop;
use crate::time::monotonic_ms;

/// Sentinel for "drain not started".
const NOT_DRAINING: u64 = u64::MAX;

/// Decides, per poll, whether a connection should close now.
/// Shared across worker threads; all state is atomic.
pub struct DrainManager {
    start_ms: AtomicU64,
    drain_window: Duration,
}

impl DrainManager {
    /// `drain_window` is the horizon over which the close probability
    /// ramps to 1.
    pub fn new(drain_window: Duration) -> Self {
        Self {
            start_ms: AtomicU64::new(NOT_DRAINING),
            drain_window,
        }
    }

    /// Begins the drain sequence. Idempotent: only the first call records
    /// the start instant.
    pub fn start_drain_sequence(&self) {
        let _ = self.start_ms.compare_exchange(
            NOT_DRAINING,
            monotonic_ms(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Whether the drain sequence has started.
    pub fn draining(&self) -> bool {
        self.start_ms.load(Ordering::Acquire) != NOT_DRAINING
    }

    /// Should the polling connection close now?
    pub fn drain_close(&self) -> bool {
        self.drain_close_at(monotonic_ms())
    }

    fn drain_close_at(&self, now_ms: u64) -> bool {
        let start = self.start_ms.load(Ordering::Acquire);
        if start == NOT_DRAINING {
            return false;
        }
        let elapsed = now_ms.saturating_sub(start);
        let window = self.drain_window.as_millis().max(1) as u64;
        let p = (elapsed as f64 / window as f64).min(1.0);
        rand::rng().random::<f64>() < p
    }

    /// Schedules `on_timeout` to run after `delay` on the current loop.
    /// Only meaningful on a successor process: the callback tells hot
    /// restart to terminate the lingering parent. Dropping the returned
    /// handle cancels the timer.
    pub fn start_parent_shutdown_sequence(
        &self,
        delay: Duration,
        on_timeout: impl FnOnce() + 'static,
    ) -> AbortOnDrop {
        tokio::task::spawn_local(async move {
            tokio::time::sleep(delay).await;
            on_timeout();
        })
        .into()
    }
}
