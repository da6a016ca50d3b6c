//! Stats store: named counters and gauges with flush support.
//!
//! The hot path is a single atomic op. The registry itself is a
//! `Mutex<BTreeMap>` of shared handles — acquired only when a stat is
//! first created or when the flush loop snapshots the set, so contention
//! is negligible. `BTreeMap` keeps `/stats` output and sink flushes in a
//! stable order.
//!
//! Counters carry two cells: the running total and a pending delta that
//! [`Counter::latch`] drains — sinks receive deltas, admin output shows
//! totals. Stats that were never written report `used() == false` and are
//! skipped at flush time so sinks don't see hundreds of zero lines.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// A monotonically increasing counter.
pub struct Counter {
    name: String,
    value: AtomicU64,
    pending: AtomicU64,
    used: AtomicBool,
}

impl Counter {
    fn new(name: String) -> Self {
        Self {
            name,
            value: AtomicU64::new(0),
            pending: AtomicU64::new(0),
            used: AtomicBool::new(false),
        }
    }

    /// Fully qualified stat name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds one.
    pub fn inc(&self) {
        self.add(1);
    }

    /// Adds `amount` to both the running total and the pending delta.
    pub fn add(&self, amount: u64) {
        self.used.store(true, Ordering::Relaxed);
        self.value.fetch_add(amount, Ordering::Relaxed);
        self.pending.fetch_add(amount, Ordering::Relaxed);
    }

    /// Running total since process start.
    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Returns the delta accumulated since the previous latch and resets
    /// it. Called by the flush loop.
    pub fn latch(&self) -> u64 {
        self.pending.swap(0, Ordering::Relaxed)
    }

    /// Whether this counter has ever been written.
    pub fn used(&self) -> bool {
        self.used.load(Ordering::Relaxed)
    }
}

/// A last-value-wins gauge.
pub struct Gauge {
    name: String,
    value: AtomicU64,
    used: AtomicBool,
}

impl Gauge {
    fn new(name: String) -> Self {
        Self {
            name,
            value: AtomicU64::new(0),
            used: AtomicBool::new(false),
        }
    }

    /// Fully qualified stat name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sets the gauge to `value`.
    pub fn set(&self, value: u64) {
        self.used.store(true, Ordering::Relaxed);
        self.value.store(value, Ordering::Relaxed);
    }

    /// Adds `amount` to the gauge.
    pub fn add(&self, amount: u64) {
        self.used.store(true, Ordering::Relaxed);
        self.value.fetch_add(amount, Ordering::Relaxed);
    }

    /// Subtracts `amount`, saturating at zero.
    pub fn sub(&self, amount: u64) {
        self.used.store(true, Ordering::Relaxed);
        let mut current = self.value.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(amount);
            match self.value.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Current value.
    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Whether this gauge has ever been written.
    pub fn used(&self) -> bool {
        self.used.load(Ordering::Relaxed)
    }
}

/// A destination for flushed stats (statsd, test capture, ...).
pub trait Sink: Send {
    /// Receives the delta a counter accumulated since the previous flush.
    fn flush_counter(&self, name: &str, delta: u64);
    /// Receives a gauge's current value.
    fn flush_gauge(&self, name: &str, value: u64);
}

struct StoreInner {
    counters: Mutex<BTreeMap<String, Arc<Counter>>>,
    gauges: Mutex<BTreeMap<String, Arc<Gauge>>>,
}

/// Process-wide stat registry. Clones share the same registry.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

/// Recovers a usable guard from a poisoned registry lock. A panic while
/// holding it can only have happened between map operations that leave
/// the map consistent.
fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StoreInner {
                counters: Mutex::new(BTreeMap::new()),
                gauges: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    /// Returns the counter named `name`, creating it on first use.
    pub fn counter(&self, name: &str) -> Arc<Counter> {
        let mut counters = lock_or_recover(&self.inner.counters);
        Arc::clone(
            counters
                .entry(name.to_owned())
                .or_insert_with(|| Arc::new(Counter::new(name.to_owned()))),
        )
    }

    /// Returns the gauge named `name`, creating it on first use.
    pub fn gauge(&self, name: &str) -> Arc<Gauge> {
        let mut gauges = lock_or_recover(&self.inner.gauges);
        Arc::clone(
            gauges
                .entry(name.to_owned())
                .or_insert_with(|| Arc::new(Gauge::new(name.to_owned()))),
        )
    }

    /// Snapshot of every counter, in name order.
    pub fn counters(&self) -> Vec<Arc<Counter>> {
        lock_or_recover(&self.inner.counters)
            .values()
            .cloned()
            .collect()
    }

    /// Snapshot of every gauge, in name order.
    pub fn gauges(&self) -> Vec<Arc<Gauge>> {
        lock_or_recover(&self.inner.gauges)
            .values()
            .cloned()
            .collect()
    }

    /// Returns a prefixed view of this store.
    pub fn scope(&self, prefix: &str) -> Scope {
        Scope {
            store: self.clone(),
            prefix: prefix.to_owned(),
        }
    }
}

/// A prefix view of a [`Store`]: `store.scope("server.")` names stats
/// `server.foo`.
#[derive(Clone)]
pub struct Scope {
    store: Store,
    prefix: String,
}

impl Scope {
    pub fn counter(&self, name: &str) -> Arc<Counter> {
        self.store.counter(&format!("{}{name}", self.prefix))
    }

    pub fn gauge(&self, name: &str) -> Arc<Gauge> {
        self.store.gauge(&format!("{}{name}", self.prefix))
    }

    /// Nested scope: `scope("server.").scope("restart.")` prefixes with
    /// `server.restart.`.
    pub fn scope(&self, prefix: &str) -> Scope {
        self.store.scope(&format!("{}{prefix}", self.prefix))
    }
}
