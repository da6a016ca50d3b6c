//! Initialization barrier.
//!
//! Converts a fan-out of asynchronous start-up jobs (first-round DNS
//! resolution, warming caches) into a single continuation: register
//! targets, call [`InitManager::initialize`] once, and the stored callback
//! fires when the last target reports completion.
//!
//! The manager lives on the main loop and every completion callback is
//! delivered there, so its state transitions are serialized without locks.
//! Targets have no failure channel: one that cannot initialize must retry
//! internally or take the process down itself.

use std::cell::RefCell;
use std::rc::Rc;

/// Something with an asynchronous initialize step the server must await
/// before accepting traffic.
pub trait InitTarget {
    /// Begins initialization. `done` must be invoked exactly once, on the
    /// main loop, when the target is ready. Invoking it synchronously is
    /// allowed.
    fn initialize(&self, done: Box<dyn FnOnce()>);
}

/// Barrier state. Advances monotonically; `Initialized` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    NotInitialized,
    Initializing,
    Initialized,
}

struct Inner {
    state: InitState,
    next_id: u64,
    /// Registered targets not yet complete.
    pending: Vec<(u64, Rc<dyn InitTarget>)>,
    done: Option<Box<dyn FnOnce()>>,
}

/// Collects init targets and fires one callback when all have completed.
/// Clones share the same barrier. Main-loop only (not `Send`).
#[derive(Clone)]
pub struct InitManager {
    inner: Rc<RefCell<Inner>>,
}

impl Default for InitManager {
    fn default() -> Self {
        Self::new()
    }
}

impl InitManager {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                state: InitState::NotInitialized,
                next_id: 0,
                pending: Vec::new(),
                done: None,
            })),
        }
    }

    pub fn state(&self) -> InitState {
        self.inner.borrow().state
    }

    /// Adds a target to the pending set. Only legal before `initialize`.
    pub fn register_target(&self, target: Rc<dyn InitTarget>) {
        let mut inner = self.inner.borrow_mut();
        assert_eq!(
            inner.state,
            InitState::NotInitialized,
            "init target registered after initialization began"
        );
        let id = inner.next_id;
        inner.next_id += 1;
        inner.pending.push((id, target));
    }

    /// Starts every registered target and stores `done` to fire when the
    /// pending set empties. With no targets, `done` fires synchronously
    /// before this returns. Must be called exactly once.
    pub fn initialize(&self, done: impl FnOnce() + 'static) {
        let targets = {
            let mut inner = self.inner.borrow_mut();
            assert_eq!(
                inner.state,
                InitState::NotInitialized,
                "initialize called twice"
            );
            if inner.pending.is_empty() {
                inner.state = InitState::Initialized;
                drop(inner);
                done();
                return;
            }
            inner.state = InitState::Initializing;
            inner.done = Some(Box::new(done));
            // snapshot: a target completing synchronously mutates the
            // pending set while we are still starting the others
            inner.pending.clone()
        };

        for (id, target) in targets {
            let inner = Rc::clone(&self.inner);
            target.initialize(Box::new(move || complete(&inner, id)));
        }
    }
}

fn complete(inner: &Rc<RefCell<Inner>>, id: u64) {
    let done = {
        let mut inner = inner.borrow_mut();
        let before = inner.pending.len();
        inner.pending.retain(|(pending_id, _)| *pending_id != id);
        assert!(
            inner.pending.len() < before,
            "completion from an unknown init target"
        );
        if inner.pending.is_empty() {
            inner.state = InitState::Initialized;
            inner.done.take()
        } else {
            None
        }
    };
    if let Some(done) = done {
        done();
    }
}
