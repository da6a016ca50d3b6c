//! Per-thread event loop.
//!
//! ## one loop, one owner
//!
//! Every long-lived object in the server is "home" to exactly one
//! dispatcher and is only touched from that dispatcher's thread. The sole
//! cross-thread primitive is [`DispatcherHandle::post`], which enqueues a
//! closure onto the owning loop and wakes it. Posts to a single dispatcher
//! run in FIFO order; there is no ordering across dispatchers.
//!
//! ## tokio rendition
//!
//! A dispatcher is a current-thread tokio runtime driving a [`LocalSet`].
//! The posted-task queue is one local task among many: code running on the
//! loop is free to `tokio::task::spawn_local` accept loops, timers, and
//! signal listeners, and they all make progress inside [`Dispatcher::run`].
//! `exit` is itself a queue item, so tasks posted before it still run.
//!
//! Workers need their handle before their OS thread exists, so the queue
//! can be created up front with [`queue`] and the loop built around it
//! later on the owning thread with [`Dispatcher::from_parts`].

use std::future::Future;
use std::io;

use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, LocalSet};
use tracing::trace;

enum Event {
    Task(Box<dyn FnOnce() + Send + 'static>),
    Exit,
}

/// Sending half of a dispatcher's event queue. Cheap to clone, safe to
/// share across threads.
#[derive(Clone)]
pub struct DispatcherHandle {
    tx: mpsc::UnboundedSender<Event>,
}

impl DispatcherHandle {
    /// Enqueues `task` to run on the owning loop.
    ///
    /// Posting to a loop that has already exited is a no-op — by then the
    /// owner is tearing down and the work is moot.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        let _ = self.tx.send(Event::Task(Box::new(task)));
    }

    /// Asks the loop to return from [`Dispatcher::run`]. Tasks posted
    /// before the exit still run.
    pub fn exit(&self) {
        let _ = self.tx.send(Event::Exit);
    }
}

/// Receiving half of a dispatcher's event queue, created by [`queue`].
pub struct TaskQueue {
    rx: mpsc::UnboundedReceiver<Event>,
}

/// Creates an unbound event queue for a dispatcher that will be built
/// later (on its owning thread) with [`Dispatcher::from_parts`].
pub fn queue() -> (TaskQueue, DispatcherHandle) {
    let (tx, rx) = mpsc::unbounded_channel();
    (TaskQueue { rx }, DispatcherHandle { tx })
}

/// A single-threaded cooperative event loop.
pub struct Dispatcher {
    name: String,
    rt: Runtime,
    local: LocalSet,
    queue: TaskQueue,
    handle: DispatcherHandle,
}

impl Dispatcher {
    /// Builds a dispatcher with a fresh event queue.
    pub fn new(name: &str) -> io::Result<Self> {
        let (queue, handle) = queue();
        Self::from_parts(name, queue, handle)
    }

    /// Builds a dispatcher around a queue created earlier with [`queue`].
    /// Must be called on the thread that will run the loop.
    pub fn from_parts(name: &str, queue: TaskQueue, handle: DispatcherHandle) -> io::Result<Self> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Self {
            name: name.to_owned(),
            rt,
            local: LocalSet::new(),
            queue,
            handle,
        })
    }

    /// Returns a handle for posting work onto this loop.
    pub fn handle(&self) -> DispatcherHandle {
        self.handle.clone()
    }

    /// Spawns a future onto the loop's local task set. Callable before
    /// `run`; the task makes progress once the loop is driven.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        self.local.spawn_local(future)
    }

    /// Drives the loop inline until a future completes, servicing local
    /// tasks meanwhile. Used for blocking on async work during start-up,
    /// before the main `run` loop takes over.
    pub fn block_on<F: Future>(&mut self, future: F) -> F::Output {
        self.rt.block_on(self.local.run_until(future))
    }

    /// Runs the loop until [`DispatcherHandle::exit`] is observed.
    pub fn run(&mut self) {
        let Self {
            name,
            rt,
            local,
            queue,
            ..
        } = self;
        trace!(dispatcher = %name, "entering event loop");
        rt.block_on(local.run_until(async {
            while let Some(event) = queue.rx.recv().await {
                match event {
                    Event::Task(task) => task(),
                    Event::Exit => break,
                }
            }
        }));
        trace!(dispatcher = %name, "event loop exited");
    }
}

/// A local task handle that aborts the task when dropped. Used for timers
/// and background loops whose lifetime is tied to their owner — dropping
/// the handle is the cancellation.
pub struct AbortOnDrop<T = ()>(JoinHandle<T>);

impl<T> From<JoinHandle<T>> for AbortOnDrop<T> {
    fn from(handle: JoinHandle<T>) -> Self {
        Self(handle)
    }
}

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[test]
    fn posted_tasks_run_in_order() {
        let mut dispatcher = Dispatcher::new("test").unwrap();
        let handle = dispatcher.handle();

        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let seen = Arc::clone(&seen);
            handle.post(move || seen.lock().unwrap().push(i));
        }
        handle.exit();
        dispatcher.run();

        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn tasks_posted_before_exit_still_run() {
        let mut dispatcher = Dispatcher::new("test").unwrap();
        let handle = dispatcher.handle();

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        handle.post(move || flag.store(true, Ordering::SeqCst));
        handle.exit();

        let late = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&late);
        handle.post(move || flag.store(true, Ordering::SeqCst));

        dispatcher.run();
        assert!(ran.load(Ordering::SeqCst));
        assert!(!late.load(Ordering::SeqCst));
    }

    #[test]
    fn post_from_another_thread_wakes_the_loop() {
        let mut dispatcher = Dispatcher::new("test").unwrap();
        let handle = dispatcher.handle();

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let poster = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            handle.post(move || flag.store(true, Ordering::SeqCst));
        });

        let exit = dispatcher.handle();
        dispatcher.spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            exit.exit();
        });
        dispatcher.run();
        poster.join().unwrap();

        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn spawned_futures_progress_during_run() {
        let mut dispatcher = Dispatcher::new("test").unwrap();
        let handle = dispatcher.handle();

        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        dispatcher.spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            flag.store(true, Ordering::SeqCst);
            handle.exit();
        });
        dispatcher.run();

        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn from_parts_runs_on_a_worker_thread() {
        let (queue, handle) = queue();
        let external = handle.clone();

        let thread = std::thread::spawn(move || {
            let mut dispatcher = Dispatcher::from_parts("worker", queue, handle).unwrap();
            dispatcher.run();
        });

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        external.post(move || flag.store(true, Ordering::SeqCst));
        external.exit();
        thread.join().unwrap();

        assert!(ran.load(Ordering::SeqCst));
    }
}
