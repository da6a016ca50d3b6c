//! Per-loop connection handler.
//!
//! One handler lives on each event loop and owns that loop's active
//! listeners and live connections. Everything here runs on the owning
//! thread — the only piece visible across threads is the atomic
//! connection count the server sums for its gauges.
//!
//! An active listener is an accept-loop task; dropping it (via
//! [`ConnectionHandler::close_listeners`]) stops accepting while live
//! connections keep running. Each connection races its filter-chain
//! future against a close signal and a once-per-second drain poll, so
//! draining needs no central traversal: connections excuse themselves.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gantry_core::dispatcher::{AbortOnDrop, Dispatcher};
use gantry_core::drain::DrainManager;
use gantry_core::stats::{Counter, Gauge, Scope};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::{ListenerConfig, ListenerId};
use crate::filter::{ConnectionFuture, FilterChainFactory};

struct ListenerStats {
    cx_total: Arc<Counter>,
    cx_active: Arc<Gauge>,
    cx_destroy: Arc<Counter>,
    accept_errors: Arc<Counter>,
}

impl ListenerStats {
    fn new(scope: &Scope) -> Rc<Self> {
        Rc::new(Self {
            cx_total: scope.counter("downstream_cx_total"),
            cx_active: scope.gauge("downstream_cx_active"),
            cx_destroy: scope.counter("downstream_cx_destroy"),
            accept_errors: scope.counter("downstream_accept_errors"),
        })
    }
}

struct ActiveListener {
    address: SocketAddr,
    _accept_task: AbortOnDrop,
}

struct ConnectionEntry {
    close_tx: watch::Sender<bool>,
}

struct HandlerState {
    listeners: HashMap<ListenerId, ActiveListener>,
    connections: HashMap<u64, ConnectionEntry>,
    next_connection_id: u64,
}

/// Owner of one loop's listeners and connections. Clones share state.
#[derive(Clone)]
pub struct ConnectionHandler {
    state: Rc<RefCell<HandlerState>>,
    num_connections: Arc<AtomicU64>,
    drain: Arc<DrainManager>,
}

impl ConnectionHandler {
    pub fn new(drain: Arc<DrainManager>) -> Self {
        Self::with_count(drain, Arc::new(AtomicU64::new(0)))
    }

    /// Builds a handler around an externally owned connection counter, so
    /// the main thread can read a worker's count without touching the
    /// worker's state.
    pub fn with_count(drain: Arc<DrainManager>, count: Arc<AtomicU64>) -> Self {
        Self {
            state: Rc::new(RefCell::new(HandlerState {
                listeners: HashMap::new(),
                connections: HashMap::new(),
                next_connection_id: 0,
            })),
            num_connections: count,
            drain,
        }
    }

    /// Live connection count on this loop.
    pub fn num_connections(&self) -> u64 {
        self.num_connections.load(Ordering::Relaxed)
    }

    /// Cross-thread handle to the live count.
    pub fn connection_count_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.num_connections)
    }

    /// Arms accept on `listener` and registers the result under the
    /// config's identity. Each accepted connection runs `factory`'s chain.
    pub fn add_listener(
        &self,
        dispatcher: &Dispatcher,
        config: Arc<ListenerConfig>,
        listener: std::net::TcpListener,
        scope: Scope,
        factory: Rc<dyn FilterChainFactory>,
    ) {
        let stats = ListenerStats::new(&scope);
        let address = config.address;
        let task = dispatcher.spawn(accept_loop(listener, address, self.clone(), factory, stats));
        self.state.borrow_mut().listeners.insert(
            config.id,
            ActiveListener {
                address,
                _accept_task: task.into(),
            },
        );
    }

    /// Stops accepting everywhere. Live connections continue until they
    /// close or drain out.
    pub fn close_listeners(&self) {
        let mut state = self.state.borrow_mut();
        for listener in state.listeners.values() {
            debug!(address = %listener.address, "closing listener");
        }
        state.listeners.clear();
    }

    /// Signals every live connection to close.
    pub fn close_connections(&self) {
        let state = self.state.borrow();
        for entry in state.connections.values() {
            let _ = entry.close_tx.send(true);
        }
    }

    fn track(&self, service: ConnectionFuture, stats: Rc<ListenerStats>) {
        let (id, close_rx) = {
            let mut state = self.state.borrow_mut();
            let id = state.next_connection_id;
            state.next_connection_id += 1;
            let (close_tx, close_rx) = watch::channel(false);
            state.connections.insert(id, ConnectionEntry { close_tx });
            (id, close_rx)
        };
        self.num_connections.fetch_add(1, Ordering::Relaxed);
        stats.cx_total.inc();
        stats.cx_active.add(1);

        let handler = self.clone();
        tokio::task::spawn_local(async move {
            run_connection(service, close_rx, Arc::clone(&handler.drain)).await;
            handler.state.borrow_mut().connections.remove(&id);
            handler.num_connections.fetch_sub(1, Ordering::Relaxed);
            stats.cx_active.sub(1);
            stats.cx_destroy.inc();
        });
    }
}

async fn accept_loop(
    listener: std::net::TcpListener,
    address: SocketAddr,
    handler: ConnectionHandler,
    factory: Rc<dyn FilterChainFactory>,
    stats: Rc<ListenerStats>,
) {
    let listener = match tokio::net::TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(error) => {
            warn!(%address, %error, "failed to register listener with the event loop");
            return;
        }
    };
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let _ = stream.set_nodelay(true);
                let service = factory.create(stream, peer);
                handler.track(service, Rc::clone(&stats));
            }
            Err(error) => {
                // transient (EMFILE and friends): count, back off, keep
                // the listener armed
                stats.accept_errors.inc();
                warn!(%address, %error, "accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

async fn run_connection(
    mut service: ConnectionFuture,
    mut close_rx: watch::Receiver<bool>,
    drain: Arc<DrainManager>,
) {
    let mut drain_tick = tokio::time::interval(Duration::from_secs(1));
    drain_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            result = &mut service => {
                if let Err(error) = result {
                    debug!(%error, "connection ended with error");
                }
                return;
            }
            _ = close_rx.changed() => return,
            _ = drain_tick.tick() => {
                if drain.drain_close() {
                    return;
                }
            }
        }
    }
}
