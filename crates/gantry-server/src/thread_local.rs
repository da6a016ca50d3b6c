//! Thread-local slot registry.
//!
//! Shared subsystems (runtime snapshots, per-worker caches) publish a
//! value once and every event-loop thread reads its own copy lock-free.
//! Slot reservation and thread registration happen on the main thread
//! before any worker thread starts; updates fan out as posted tasks to
//! each registered loop, so a thread's copy becomes visible once its loop
//! runs.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use gantry_core::dispatcher::DispatcherHandle;

thread_local! {
    static SLOTS: RefCell<Vec<Option<Rc<dyn Any>>>> = const { RefCell::new(Vec::new()) };
}

fn store_local(index: usize, value: Rc<dyn Any>) {
    SLOTS.with(|slots| {
        let mut slots = slots.borrow_mut();
        if slots.len() <= index {
            slots.resize_with(index + 1, || None);
        }
        slots[index] = Some(value);
    });
}

struct RegistryInner {
    dispatchers: Vec<DispatcherHandle>,
    next_slot: usize,
}

/// Process-wide registry of event-loop threads and allocated slots.
/// Clones share the registry.
#[derive(Clone)]
pub struct SlotRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl Default for SlotRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                dispatchers: Vec::new(),
                next_slot: 0,
            })),
        }
    }

    /// Registers a loop to receive slot updates. Main thread and workers
    /// alike; must happen before values are published.
    pub fn register_thread(&self, handle: DispatcherHandle) {
        self.inner.lock().unwrap().dispatchers.push(handle);
    }

    /// Reserves a slot index.
    pub fn allocate_slot(&self) -> Slot {
        let mut inner = self.inner.lock().unwrap();
        let index = inner.next_slot;
        inner.next_slot += 1;
        Slot {
            index,
            registry: self.clone(),
        }
    }

    /// Clears the calling thread's slot values. Each loop thread calls
    /// this on its way out.
    pub fn shutdown_thread() {
        SLOTS.with(|slots| slots.borrow_mut().clear());
    }
}

/// A reserved slot. `set` publishes to every registered loop; `get` reads
/// the calling thread's copy.
pub struct Slot {
    index: usize,
    registry: SlotRegistry,
}

impl Slot {
    /// Publishes `make()`'s value to every registered loop. The factory
    /// runs once per thread, on that thread.
    pub fn set<T, F>(&self, make: F)
    where
        T: 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let make = Arc::new(make);
        let handles = self.registry.inner.lock().unwrap().dispatchers.clone();
        for handle in handles {
            let make = Arc::clone(&make);
            let index = self.index;
            handle.post(move || store_local(index, Rc::new(make())));
        }
    }

    /// The calling thread's copy, if one has been published and the
    /// loop has run since.
    pub fn get<T: 'static>(&self) -> Option<Rc<T>> {
        SLOTS.with(|slots| {
            slots
                .borrow()
                .get(self.index)
                .and_then(|value| value.clone())
                .and_then(|value| value.downcast::<T>().ok())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::dispatcher::Dispatcher;
    use std::sync::mpsc;

    #[test]
    fn values_fan_out_to_registered_loops() {
        let registry = SlotRegistry::new();
        let slot = Arc::new(registry.allocate_slot());

        let (queue, handle) = gantry_core::dispatcher::queue();
        let exit = handle.clone();
        registry.register_thread(handle.clone());

        let (tx, rx) = mpsc::channel::<Option<u32>>();
        let reader_slot = Arc::clone(&slot);
        let worker = std::thread::spawn(move || {
            let mut dispatcher = Dispatcher::from_parts("worker", queue, handle).unwrap();
            dispatcher.run();
            // the loop has drained its queue; read this thread's copy
            tx.send(reader_slot.get::<u32>().map(|v| *v)).unwrap();
            SlotRegistry::shutdown_thread();
        });

        slot.set(|| 7u32);

        // exit lands behind the set in the queue, so the store runs first
        exit.exit();
        worker.join().unwrap();

        assert_eq!(rx.recv().unwrap(), Some(7));
    }

    #[test]
    fn unpublished_slot_reads_none() {
        let registry = SlotRegistry::new();
        let slot = registry.allocate_slot();
        assert!(slot.get::<u32>().is_none());
    }

    #[test]
    fn slots_are_independent() {
        let registry = SlotRegistry::new();
        let a = registry.allocate_slot();
        let b = registry.allocate_slot();

        // publish directly into this thread's table
        store_local(a.index, Rc::new(1u32));
        store_local(b.index, Rc::new("two".to_owned()));

        assert_eq!(a.get::<u32>().as_deref(), Some(&1));
        assert_eq!(b.get::<String>().as_deref(), Some(&"two".to_owned()));
        // wrong type reads back as absent rather than panicking
        assert!(a.get::<String>().is_none());

        SlotRegistry::shutdown_thread();
        assert!(a.get::<u32>().is_none());
    }
}
