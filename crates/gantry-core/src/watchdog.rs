//! Liveness watchdogs over cooperative event loops.
//!
//! Each guarded thread owns a [`WatchDog`] it touches from inside its loop
//! on a recurring timer; the [`GuardDog`] runs its own OS thread, polls
//! every registered watchdog, and escalates from counters (miss, mega
//! miss) to aborting the process when a loop has been stuck past the kill
//! timeout. An abort leaves a core dump that captures the stuck thread.
//!
//! All comparisons use the process-local monotonic clock — a wall-clock
//! jump must never fire the dog. The multikill threshold requires at least
//! two threads to be stalled at once: a single slow thread may just be a
//! slow filter, while a process-wide stall is a deadlock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use tracing::error;

use crate::stats::{Counter, Scope};
use crate::time::monotonic_ms;

/// Per-thread liveness token. The owning thread writes `touch`; the guard
/// dog thread reads.
pub struct WatchDog {
    thread_id: ThreadId,
    label: String,
    last_touch_ms: AtomicU64,
    missed: AtomicBool,
    mega_missed: AtomicBool,
}

impl WatchDog {
    fn new(thread_id: ThreadId, label: &str) -> Self {
        Self {
            thread_id,
            label: label.to_owned(),
            last_touch_ms: AtomicU64::new(monotonic_ms()),
            missed: AtomicBool::new(false),
            mega_missed: AtomicBool::new(false),
        }
    }

    /// Records "I am alive" from the guarded loop.
    pub fn touch(&self) {
        self.last_touch_ms.store(monotonic_ms(), Ordering::Release);
    }

    /// The guarded thread's id.
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// Label used in stall reports ("main", "worker_0", ...).
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Milliseconds-since-start of the most recent touch.
    pub fn last_touch_ms(&self) -> u64 {
        self.last_touch_ms.load(Ordering::Acquire)
    }
}

/// Margins and timeouts for the guard dog. `None` disables a stage.
#[derive(Debug, Clone)]
pub struct GuardDogConfig {
    /// Idle time after which a thread counts one miss.
    pub miss_margin: Duration,
    /// Idle time after which a thread counts one mega miss.
    pub megamiss_margin: Duration,
    /// Idle time after which a single stuck thread aborts the process.
    pub kill_timeout: Option<Duration>,
    /// Idle time after which two or more simultaneously stuck threads
    /// abort the process.
    pub multikill_timeout: Option<Duration>,
}

impl Default for GuardDogConfig {
    fn default() -> Self {
        Self {
            miss_margin: Duration::from_millis(200),
            megamiss_margin: Duration::from_secs(1),
            kill_timeout: None,
            multikill_timeout: None,
        }
    }
}

/// A stall severe enough to abort on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StallEvent {
    /// One thread exceeded the kill timeout.
    Kill { label: String },
    /// `stalled` threads simultaneously exceeded the multikill timeout.
    MultiKill { stalled: usize },
}

type KillAction = Box<dyn Fn(StallEvent) + Send + Sync>;

struct GuardInner {
    config: GuardDogConfig,
    dogs: Mutex<Vec<Arc<WatchDog>>>,
    stopping: Mutex<bool>,
    stop_cv: Condvar,
    miss_counter: Arc<Counter>,
    megamiss_counter: Arc<Counter>,
    kill_action: KillAction,
}

/// Background thread polling all registered watchdogs.
pub struct GuardDog {
    inner: Arc<GuardInner>,
    thread: Option<JoinHandle<()>>,
}

impl GuardDog {
    /// Spawns the guard dog thread. Stall escalation aborts the process.
    pub fn new(scope: &Scope, config: GuardDogConfig) -> Self {
        Self::with_kill_action(
            scope,
            config,
            Box::new(|event| {
                error!(?event, "watchdog stall, aborting for core dump");
                std::process::abort();
            }),
        )
    }

    /// Same as [`GuardDog::new`] with the escalation action injected.
    pub fn with_kill_action(scope: &Scope, config: GuardDogConfig, action: KillAction) -> Self {
        let inner = Arc::new(GuardInner {
            config,
            dogs: Mutex::new(Vec::new()),
            stopping: Mutex::new(false),
            stop_cv: Condvar::new(),
            miss_counter: scope.counter("watchdog_miss"),
            megamiss_counter: scope.counter("watchdog_mega_miss"),
            kill_action: action,
        });

        let loop_inner = Arc::clone(&inner);
        let thread = thread::Builder::new()
            .name("guarddog".to_owned())
            .spawn(move || guard_loop(&loop_inner))
            .expect("failed to spawn guarddog thread");

        Self {
            inner,
            thread: Some(thread),
        }
    }

    /// Registers a watchdog for `thread_id` and starts guarding it.
    pub fn create_watch_dog(&self, thread_id: ThreadId, label: &str) -> Arc<WatchDog> {
        let dog = Arc::new(WatchDog::new(thread_id, label));
        self.inner.dogs.lock().unwrap().push(Arc::clone(&dog));
        dog
    }

    /// Deregisters a watchdog. The guarded thread is typically exiting.
    pub fn stop_watching(&self, dog: &Arc<WatchDog>) {
        self.inner
            .dogs
            .lock()
            .unwrap()
            .retain(|registered| !Arc::ptr_eq(registered, dog));
    }
}

impl Drop for GuardDog {
    fn drop(&mut self) {
        *self.inner.stopping.lock().unwrap() = true;
        self.inner.stop_cv.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn guard_loop(inner: &GuardInner) {
    let config = &inner.config;
    let period = config
        .miss_margin
        .min(config.megamiss_margin)
        .checked_div(2)
        .unwrap_or(config.miss_margin)
        .max(Duration::from_millis(1));

    loop {
        {
            let stopping = inner.stopping.lock().unwrap();
            if *stopping {
                return;
            }
            let (stopping, _) = inner.stop_cv.wait_timeout(stopping, period).unwrap();
            if *stopping {
                return;
            }
        }

        // snapshot under the lock, evaluate outside it
        let dogs: Vec<Arc<WatchDog>> = inner.dogs.lock().unwrap().clone();
        let now = monotonic_ms();
        let mut multikill_stalled = 0usize;

        for dog in &dogs {
            let idle = Duration::from_millis(now.saturating_sub(dog.last_touch_ms()));

            // count one miss per transition into the breached state
            if idle > config.miss_margin {
                if !dog.missed.swap(true, Ordering::Relaxed) {
                    inner.miss_counter.inc();
                }
            } else {
                dog.missed.store(false, Ordering::Relaxed);
            }

            if idle > config.megamiss_margin {
                if !dog.mega_missed.swap(true, Ordering::Relaxed) {
                    inner.megamiss_counter.inc();
                }
            } else {
                dog.mega_missed.store(false, Ordering::Relaxed);
            }

            if let Some(kill_timeout) = config.kill_timeout {
                if idle > kill_timeout {
                    (inner.kill_action)(StallEvent::Kill {
                        label: dog.label().to_owned(),
                    });
                }
            }

            if let Some(multikill_timeout) = config.multikill_timeout {
                if idle > multikill_timeout {
                    multikill_stalled += 1;
                }
            }
        }

        if multikill_stalled >= 2 {
            (inner.kill_action)(StallEvent::MultiKill {
                stalled: multikill_stalled,
            });
        }
    }
}
