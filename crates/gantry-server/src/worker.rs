//! Worker threads.
//!
//! A worker is one OS thread running one dispatcher with one connection
//! handler. Construction happens on the main thread (reserving the event
//! queue and the thread-local registration) with no OS thread yet;
//! `initialize_configuration` prepares the accepting sockets — so a lost
//! listen-time port race surfaces to the caller — and then spawns the
//! thread, which guards itself with a watchdog, arms every listener, and
//! runs its loop until `exit`.
//!
//! Control flows to a running worker over a small typed channel
//! (close listeners / close connections) consumed by a loop-local task;
//! everything else crosses threads via the dispatcher handle.

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use gantry_core::dispatcher::{self, AbortOnDrop, Dispatcher, DispatcherHandle, TaskQueue};
use gantry_core::drain::DrainManager;
use gantry_core::stats::Store;
use gantry_core::watchdog::GuardDog;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::{ListenerConfig, ListenerId, ServerConfig};
use crate::error::CreateListenerError;
use crate::filter::{self, BlackholeFactory};
use crate::handler::ConnectionHandler;
use crate::listener::ListenSocket;
use crate::thread_local::SlotRegistry;

enum WorkerMessage {
    CloseListeners,
    CloseConnections,
}

/// One worker thread and its cross-thread handles.
pub struct Worker {
    name: String,
    handle: DispatcherHandle,
    queue: Option<TaskQueue>,
    control_tx: mpsc::UnboundedSender<WorkerMessage>,
    control_rx: Option<mpsc::UnboundedReceiver<WorkerMessage>>,
    connection_count: Arc<AtomicU64>,
    store: Store,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    /// Constructs the worker (no OS thread yet) and registers its
    /// future loop with the thread-local registry.
    pub fn new(index: usize, registry: &SlotRegistry, store: Store) -> Self {
        let (queue, handle) = dispatcher::queue();
        registry.register_thread(handle.clone());
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Self {
            name: format!("worker_{index}"),
            handle,
            queue: Some(queue),
            control_tx,
            control_rx: Some(control_rx),
            connection_count: Arc::new(AtomicU64::new(0)),
            store,
            thread: None,
        }
    }

    /// Handle for posting onto this worker's loop.
    pub fn dispatcher(&self) -> DispatcherHandle {
        self.handle.clone()
    }

    /// Live connections on this worker.
    pub fn num_connections(&self) -> u64 {
        self.connection_count.load(Ordering::Relaxed)
    }

    /// Asks the worker to stop accepting. Live connections continue.
    pub fn close_listeners(&self) {
        let _ = self.control_tx.send(WorkerMessage::CloseListeners);
    }

    /// Asks the worker to close every live connection.
    pub fn close_connections(&self) {
        let _ = self.control_tx.send(WorkerMessage::CloseConnections);
    }

    /// Prepares accepting handles for every configured listener and
    /// spawns the worker thread. A `listen` failure here is the port race
    /// the caller resolves with an orderly shutdown.
    pub fn initialize_configuration(
        &mut self,
        config: &ServerConfig,
        socket_map: &HashMap<ListenerId, Arc<ListenSocket>>,
        guard_dog: Arc<GuardDog>,
        drain: Arc<DrainManager>,
    ) -> Result<(), CreateListenerError> {
        assert!(self.thread.is_none(), "worker initialized twice");

        let mut prepared = Vec::new();
        for listener_config in &config.listeners {
            let Some(socket) = socket_map.get(&listener_config.id) else {
                debug_assert!(false, "listener config without a listen socket");
                continue;
            };
            let accept = socket
                .listen_handle()
                .map_err(|source| CreateListenerError {
                    address: socket.address(),
                    source,
                })?;
            prepared.push((Arc::clone(listener_config), accept));
        }

        let queue = self.queue.take().expect("worker queue already consumed");
        let control_rx = self
            .control_rx
            .take()
            .expect("worker control channel already consumed");
        let setup = ThreadSetup {
            name: self.name.clone(),
            handle: self.handle.clone(),
            prepared,
            store: self.store.clone(),
            connection_count: Arc::clone(&self.connection_count),
            guard_dog,
            drain,
            touch_interval: config.watchdog.touch_interval(),
        };

        let thread = std::thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || worker_thread(setup, queue, control_rx))
            .expect("failed to spawn worker thread");
        self.thread = Some(thread);
        Ok(())
    }

    /// Posts loop-exit and joins the thread. Idempotent.
    pub fn exit(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.handle.exit();
            if thread.join().is_err() {
                error!(worker = %self.name, "worker thread panicked");
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.exit();
    }
}

struct ThreadSetup {
    name: String,
    handle: DispatcherHandle,
    prepared: Vec<(Arc<ListenerConfig>, std::net::TcpListener)>,
    store: Store,
    connection_count: Arc<AtomicU64>,
    guard_dog: Arc<GuardDog>,
    drain: Arc<DrainManager>,
    touch_interval: Duration,
}

fn worker_thread(
    setup: ThreadSetup,
    queue: TaskQueue,
    mut control_rx: mpsc::UnboundedReceiver<WorkerMessage>,
) {
    let mut dispatcher = match Dispatcher::from_parts(&setup.name, queue, setup.handle) {
        Ok(dispatcher) => dispatcher,
        Err(error) => {
            error!(worker = %setup.name, %error, "failed to build worker event loop");
            return;
        }
    };

    let watchdog = setup
        .guard_dog
        .create_watch_dog(std::thread::current().id(), &setup.name);
    let touch_dog = Arc::clone(&watchdog);
    let touch_interval = setup.touch_interval;
    let _touch_task: AbortOnDrop = dispatcher
        .spawn(async move {
            let mut tick = tokio::time::interval(touch_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                touch_dog.touch();
            }
        })
        .into();

    let handler = ConnectionHandler::with_count(setup.drain, setup.connection_count);
    let listener_count = setup.prepared.len();
    for (listener_config, accept) in setup.prepared {
        let factory = filter::factory_for(&listener_config.filter).unwrap_or_else(|| {
            warn!(
                filter = %listener_config.filter,
                address = %listener_config.address,
                "unknown filter chain, using blackhole"
            );
            Rc::new(BlackholeFactory)
        });
        let scope = setup
            .store
            .scope(&format!("listener.{}.", listener_config.address));
        handler.add_listener(&dispatcher, listener_config, accept, scope, factory);
    }

    let control_handler = handler.clone();
    let _control_task: AbortOnDrop = dispatcher
        .spawn(async move {
            while let Some(message) = control_rx.recv().await {
                match message {
                    WorkerMessage::CloseListeners => control_handler.close_listeners(),
                    WorkerMessage::CloseConnections => control_handler.close_connections(),
                }
            }
        })
        .into();

    info!(worker = %setup.name, listeners = listener_count, "worker started");
    dispatcher.run();
    info!(worker = %setup.name, "worker exiting");

    setup.guard_dog.stop_watching(&watchdog);
    SlotRegistry::shutdown_thread();
}
