//! The server instance: phased initialization, the main dispatch loop,
//! hot-restart dialogue, draining, and shutdown.
//!
//! Construction runs entirely on the main thread: fingerprint and stats
//! first, then the hot-restart sockets, configuration, admin listener,
//! workers (threads not yet spawned, so their thread-local registrations
//! land before any other thread exists), runtime, clusters, and the
//! shared listen sockets — inherited from a parent when hot restarting,
//! bound fresh otherwise. Workers only start once every cluster finishes
//! its first initialization; at that point the parent is told to drain
//! and a timer bounds how long it may linger.
//!
//! There is exactly one exit path: SIGTERM. `/quitquitquit`, worker
//! listener races, and operator signals all funnel into it, so teardown
//! ordering lives in one place ([`ServerInstance::run`]).

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use gantry_core::dispatcher::{AbortOnDrop, Dispatcher, DispatcherHandle};
use gantry_core::drain::DrainManager;
use gantry_core::init::InitManager;
use gantry_core::stats::{Gauge, Scope, Sink, Store};
use gantry_core::watchdog::{GuardDog, WatchDog};
use gantry_restart::{HotRestart, ParentStats, RpcHandler};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info, warn};

use crate::access_log::AccessLogManager;
use crate::admin::{AdminApi, AdminFactory};
use crate::config::{ListenerConfig, ListenerId, Options, ServerConfig};
use crate::handler::ConnectionHandler;
use crate::listener::ListenSocket;
use crate::memory;
use crate::runtime::RuntimeLoader;
use crate::stats_sink::StatsdSink;
use crate::thread_local::SlotRegistry;
use crate::upstream::ClusterManager;
use crate::version;
use crate::worker::Worker;
use crate::ServerError;

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

struct ServerStats {
    live: Arc<Gauge>,
    uptime: Arc<Gauge>,
    version: Arc<Gauge>,
    concurrency: Arc<Gauge>,
    memory_allocated: Arc<Gauge>,
    parent_connections: Arc<Gauge>,
    total_connections: Arc<Gauge>,
}

impl ServerStats {
    fn new(scope: &Scope) -> Self {
        Self {
            live: scope.gauge("live"),
            uptime: scope.gauge("uptime"),
            version: scope.gauge("version"),
            concurrency: scope.gauge("concurrency"),
            memory_allocated: scope.gauge("memory_allocated"),
            parent_connections: scope.gauge("parent_connections"),
            total_connections: scope.gauge("total_connections"),
        }
    }
}

/// Main-thread server state, shared (via `Rc`) with the admin service,
/// the hot-restart serving task, signal handlers, and timers. Everything
/// mutable is interior: all access happens on the main loop.
struct ServerCore {
    config: ServerConfig,
    stats: Store,
    server_stats: ServerStats,
    drain: Arc<DrainManager>,
    handle: DispatcherHandle,
    restarter: HotRestart,
    handler: ConnectionHandler,
    admin_socket: RefCell<Option<ListenSocket>>,
    workers: RefCell<Vec<Worker>>,
    socket_map: HashMap<ListenerId, Arc<ListenSocket>>,
    sinks: RefCell<Vec<Box<dyn Sink>>>,
    flush_task: RefCell<Option<AbortOnDrop>>,
    parent_shutdown_task: RefCell<Option<AbortOnDrop>>,
    access_logs: AccessLogManager,
    cluster_manager: ClusterManager,
    init_manager: InitManager,
    guard_dog: Arc<GuardDog>,
    runtime: RuntimeLoader,
    original_start_time: Cell<u64>,
}

impl ServerCore {
    /// Sum of live connections across worker handlers.
    fn num_connections(&self) -> u64 {
        self.workers
            .borrow()
            .iter()
            .map(Worker::num_connections)
            .sum()
    }

    fn fail_healthcheck(&self, fail: bool) {
        if fail {
            warn!("health check forced to failing");
        }
        self.server_stats.live.set(u64::from(!fail));
    }

    /// Publishes derived gauges, then pushes latch deltas and gauge
    /// values to every sink. Unused stats are skipped.
    fn flush_stats(&self) {
        debug!("flushing stats");
        let parent = self.restarter.get_parent_stats();
        self.server_stats
            .uptime
            .set(epoch_secs().saturating_sub(self.original_start_time.get()));
        self.server_stats
            .memory_allocated
            .set(memory::allocated_bytes() + parent.memory_allocated);
        self.server_stats
            .parent_connections
            .set(parent.num_connections);
        self.server_stats
            .total_connections
            .set(self.num_connections() + parent.num_connections);

        let sinks = self.sinks.borrow();
        for counter in self.stats.counters() {
            let delta = counter.latch();
            if counter.used() {
                for sink in sinks.iter() {
                    sink.flush_counter(counter.name(), delta);
                }
            }
        }
        for gauge in self.stats.gauges() {
            if gauge.used() {
                for sink in sinks.iter() {
                    sink.flush_gauge(gauge.name(), gauge.value());
                }
            }
        }
    }

    /// The single exit path: every shutdown trigger becomes SIGTERM.
    fn shutdown(&self) {
        warn!("shutdown invoked, sending SIGTERM to self");
        unsafe {
            libc::kill(libc::getpid(), libc::SIGTERM);
        }
    }

    /// Stop accepting everywhere and begin the drain ramp.
    fn drain_listeners(&self) {
        warn!("closing and draining listeners");
        for worker in self.workers.borrow().iter() {
            worker.close_listeners();
        }
        self.drain.start_drain_sequence();
    }

    /// Fired once the init barrier opens: bring every worker up, then
    /// hand the parent its marching orders.
    fn start_workers(self: &Rc<Self>) {
        warn!("all dependencies initialized, starting workers");
        {
            let mut workers = self.workers.borrow_mut();
            for worker in workers.iter_mut() {
                if let Err(error) = worker.initialize_configuration(
                    &self.config,
                    &self.socket_map,
                    Arc::clone(&self.guard_dog),
                    Arc::clone(&self.drain),
                ) {
                    // lost the port race to another process; exit in an
                    // orderly fashion and let the remaining workers spin
                    // up in the meantime
                    error!(%error, "shutting down due to worker listener setup failure");
                    self.shutdown();
                }
            }
        }

        self.restarter.drain_parent_listeners();
        let core = Rc::clone(self);
        let timer = self.drain.start_parent_shutdown_sequence(
            self.config.parent_shutdown_time,
            move || core.restarter.terminate_parent(),
        );
        *self.parent_shutdown_task.borrow_mut() = Some(timer);
    }
}

impl RpcHandler for ServerCore {
    fn shutdown_admin(&self) -> u64 {
        warn!("shutting down admin due to child startup");
        // the child owns stats flushing from here on
        self.flush_task.borrow_mut().take();
        self.handler.close_listeners();
        self.admin_socket.borrow_mut().take();
        // a hot restart chain can be three deep for a moment; our own
        // parent has definitely been superseded now
        self.restarter.terminate_parent();
        self.original_start_time.get()
    }

    fn duplicate_listen_socket(&self, address: &str) -> Option<OwnedFd> {
        let socket = self
            .socket_map
            .values()
            .find(|socket| socket.url() == address)?;
        match socket.duplicate() {
            Ok(fd) => {
                info!(address, "duplicated listen socket for child");
                Some(fd)
            }
            Err(error) => {
                warn!(address, %error, "failed to duplicate listen socket");
                None
            }
        }
    }

    fn stats(&self) -> ParentStats {
        ParentStats {
            memory_allocated: memory::allocated_bytes(),
            num_connections: self.num_connections(),
        }
    }

    fn drain_listeners(&self) {
        ServerCore::drain_listeners(self);
    }

    fn terminate(&self) {
        warn!("child requested termination");
        ServerCore::shutdown(self);
    }
}

impl AdminApi for ServerCore {
    fn stats_text(&self) -> String {
        let mut out = String::new();
        for counter in self.stats.counters() {
            if counter.used() {
                out.push_str(&format!("{}: {}\n", counter.name(), counter.value()));
            }
        }
        for gauge in self.stats.gauges() {
            if gauge.used() {
                out.push_str(&format!("{}: {}\n", gauge.name(), gauge.value()));
            }
        }
        out
    }

    fn shutdown(&self) {
        ServerCore::shutdown(self);
    }

    fn fail_healthcheck(&self, fail: bool) {
        ServerCore::fail_healthcheck(self, fail);
    }

    fn health_check_failed(&self) -> bool {
        self.server_stats.live.value() == 0
    }

    fn hot_restart_version(&self) -> String {
        self.restarter.version().to_owned()
    }

    fn server_info(&self) -> serde_json::Value {
        serde_json::json!({
            "version": version::VERSION,
            "build_sha": version::BUILD_SHA,
            "state": if self.drain.draining() { "DRAINING" } else { "LIVE" },
            "healthy": !self.health_check_failed(),
            "uptime_seconds": epoch_secs().saturating_sub(self.original_start_time.get()),
            "restart_epoch": self.restarter.epoch(),
            "hot_restart_version": self.restarter.version(),
            "concurrency": self.workers.borrow().len(),
            "runtime_entries": self.runtime.snapshot().len(),
        })
    }
}

/// The composed server. Owns the main dispatcher and the core.
pub struct ServerInstance {
    core: Rc<ServerCore>,
    dispatcher: Dispatcher,
}

impl ServerInstance {
    /// Phased initialization. On error the process should exit with
    /// status 1; thread-local state is already torn down.
    pub fn new(options: Options) -> Result<Self, ServerError> {
        let dispatcher = Dispatcher::new("main")?;
        match Self::initialize(options, dispatcher) {
            Ok(server) => Ok(server),
            Err(error) => {
                error!(%error, "error initializing server");
                SlotRegistry::shutdown_thread();
                Err(error)
            }
        }
    }

    fn initialize(options: Options, dispatcher: Dispatcher) -> Result<Self, ServerError> {
        // -- phase 1: preamble --
        let stats = Store::new();
        let scope = stats.scope("server.");
        let server_stats = ServerStats::new(&scope);
        server_stats.live.set(1);
        server_stats.version.set(version::fingerprint()?);

        let start_time = epoch_secs();

        let restarter = HotRestart::new(&options.base_dir, options.restart_epoch)
            .map_err(ServerError::HotRestart)?;
        warn!(
            epoch = options.restart_epoch,
            hot_restart_version = restarter.version(),
            "initializing"
        );

        let config = ServerConfig::load(&options.config_path)?;
        let drain = Arc::new(DrainManager::new(config.drain_time));

        // the parent closes its admin before we open ours, and hands its
        // original start time forward so uptime stays monotonic
        let original_start_time = restarter
            .shutdown_parent_admin()
            .unwrap_or(start_time);

        let admin_socket = ListenSocket::bind(config.admin.address, true)?;
        let admin_accept = admin_socket
            .listen_handle()
            .map_err(|source| ServerError::Bind {
                address: admin_socket.address(),
                source,
            })?;
        info!("admin address: {}", admin_socket.address());
        if let Some(path) = &options.admin_address_path {
            std::fs::write(path, admin_socket.address().to_string())?;
        }

        let access_logs = AccessLogManager::new(&stats);
        let admin_log = match &config.admin.access_log_path {
            Some(path) => match access_logs.open(path) {
                Ok(file) => Some(file),
                Err(error) => {
                    warn!(path = %path.display(), %error, "cannot open admin access log");
                    None
                }
            },
            None => None,
        };

        if let Some(flags) = &config.flags_path {
            info!(path = %flags.display(), "server flags path");
            if flags.join("drain").exists() {
                warn!("starting server in drain mode");
                server_stats.live.set(0);
            }
        }

        // -- phase 2: wiring --
        // workers are constructed first (no OS threads yet) so their
        // thread-local registrations happen before any thread exists
        let tls = SlotRegistry::new();
        let concurrency = options.concurrency.max(1);
        let workers: Vec<Worker> = (0..concurrency)
            .map(|index| Worker::new(index, &tls, stats.clone()))
            .collect();
        server_stats.concurrency.set(concurrency as u64);

        // the main thread participates too, so shared code can run on
        // either main or workers
        tls.register_thread(dispatcher.handle());

        let runtime = match &config.runtime_path {
            Some(root) => RuntimeLoader::file(root, tls.allocate_slot())?,
            None => RuntimeLoader::null(tls.allocate_slot()),
        };

        let cluster_manager = ClusterManager::new(&config.clusters, &stats.scope("cluster."));

        // one listen socket per configured listener, inherited from the
        // parent when it has one, bound fresh otherwise
        let mut socket_map = HashMap::new();
        for listener_config in &config.listeners {
            let url = listener_config.url();
            let socket = match restarter.duplicate_parent_listen_socket(&url) {
                Some(fd) => {
                    info!(address = %url, "obtained listen socket from parent");
                    ListenSocket::from_fd(fd)?
                }
                None => ListenSocket::bind(listener_config.address, listener_config.bind_to_port)?,
            };
            socket_map.insert(listener_config.id, Arc::new(socket));
        }

        let guard_dog = Arc::new(GuardDog::new(&scope, config.watchdog.to_guard_config()));
        let handler = ConnectionHandler::new(Arc::clone(&drain));

        let mut sinks: Vec<Box<dyn Sink>> = Vec::new();
        if let Some(address) = config.statsd_udp_address {
            info!(%address, "statsd UDP sink enabled");
            sinks.push(Box::new(StatsdSink::new(address, &stats)?));
        }

        let core = Rc::new(ServerCore {
            config,
            stats,
            server_stats,
            drain,
            handle: dispatcher.handle(),
            restarter,
            handler: handler.clone(),
            admin_socket: RefCell::new(Some(admin_socket)),
            workers: RefCell::new(workers),
            socket_map,
            sinks: RefCell::new(sinks),
            flush_task: RefCell::new(None),
            parent_shutdown_task: RefCell::new(None),
            access_logs,
            cluster_manager,
            init_manager: InitManager::new(),
            guard_dog,
            runtime,
            original_start_time: Cell::new(original_start_time),
        });

        // admin is an ordinary listener whose filter chain is the admin
        // HTTP service
        let admin_listener_config = Arc::new(ListenerConfig {
            id: ListenerId(u64::MAX),
            address: core
                .admin_socket
                .borrow()
                .as_ref()
                .map(ListenSocket::address)
                .unwrap_or(core.config.admin.address),
            bind_to_port: true,
            use_original_dst: false,
            filter: "admin".to_owned(),
        });
        handler.add_listener(
            &dispatcher,
            admin_listener_config,
            admin_accept,
            core.stats.scope("listener.admin."),
            Rc::new(AdminFactory::new(
                Rc::clone(&core) as Rc<dyn AdminApi>,
                admin_log,
            )),
        );

        // start answering our own future child
        core.restarter
            .initialize(&dispatcher, Rc::clone(&core) as Rc<dyn RpcHandler>);

        Self::install_signal_handlers(&dispatcher, &core);
        Self::arm_timers(&dispatcher, &core, &options);

        // workers start only once every cluster finishes its first
        // initialization; the callback may fire on the first loop tick
        // when nothing is asynchronous
        let init_core = Rc::clone(&core);
        dispatcher.spawn(async move {
            let start_core = Rc::clone(&init_core);
            init_core.cluster_manager.set_initialized_cb(move || {
                warn!("all clusters initialized, running init manager");
                let run_core = Rc::clone(&start_core);
                start_core
                    .init_manager
                    .initialize(move || run_core.start_workers());
            });
        });

        Ok(Self { core, dispatcher })
    }

    fn install_signal_handlers(dispatcher: &Dispatcher, core: &Rc<ServerCore>) {
        let term_core = Rc::clone(core);
        dispatcher.spawn(async move {
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(stream) => stream,
                Err(error) => {
                    error!(%error, "cannot install SIGTERM handler");
                    return;
                }
            };
            sigterm.recv().await;
            warn!("caught SIGTERM");
            term_core.restarter.terminate_parent();
            term_core.handle.exit();
        });

        let usr1_core = Rc::clone(core);
        dispatcher.spawn(async move {
            let Ok(mut sigusr1) = signal(SignalKind::user_defined1()) else {
                return;
            };
            loop {
                sigusr1.recv().await;
                warn!("caught SIGUSR1, reopening access logs");
                usr1_core.access_logs.reopen_all();
            }
        });

        dispatcher.spawn(async move {
            let Ok(mut sighup) = signal(SignalKind::hangup()) else {
                return;
            };
            loop {
                sighup.recv().await;
                warn!("caught and eating SIGHUP; use hot restart to reload configuration");
            }
        });
    }

    fn arm_timers(dispatcher: &Dispatcher, core: &Rc<ServerCore>, options: &Options) {
        // stats flush; the handle is cleared if our admin is handed to a
        // child, which also disables the final flush at exit
        let flush_core = Rc::clone(core);
        let flush_interval = core.config.stats_flush_interval;
        let flush_task = dispatcher.spawn(async move {
            loop {
                tokio::time::sleep(flush_interval).await;
                flush_core.flush_stats();
            }
        });
        *core.flush_task.borrow_mut() = Some(flush_task.into());

        let log_core = Rc::clone(core);
        let log_interval = options.file_flush_interval;
        dispatcher.spawn(async move {
            loop {
                tokio::time::sleep(log_interval).await;
                log_core.access_logs.flush_all();
            }
        });
    }

    /// Handle for posting onto the main loop (tests, embedding).
    pub fn dispatcher(&self) -> DispatcherHandle {
        self.dispatcher.handle()
    }

    /// The admin listener's bound address, until handed off to a child.
    pub fn admin_address(&self) -> Option<SocketAddr> {
        self.core
            .admin_socket
            .borrow()
            .as_ref()
            .map(ListenSocket::address)
    }

    /// Bound addresses of the shared data listen sockets.
    pub fn listener_addresses(&self) -> Vec<SocketAddr> {
        self.core
            .socket_map
            .values()
            .map(|socket| socket.address())
            .collect()
    }

    /// Live connections across all workers.
    pub fn num_connections(&self) -> u64 {
        self.core.num_connections()
    }

    /// Runs the main dispatch loop to completion, then tears the process
    /// down: workers exit and join, stats get a final flush (unless the
    /// admin was handed to a child), clusters shut down, thread-locals
    /// clear.
    pub fn run(&mut self) {
        warn!("starting main dispatch loop");
        let watchdog: Arc<WatchDog> = self
            .core
            .guard_dog
            .create_watch_dog(std::thread::current().id(), "main");
        let touch_dog = Arc::clone(&watchdog);
        let touch_interval = self.core.config.watchdog.touch_interval();
        let touch_task: AbortOnDrop = self
            .dispatcher
            .spawn(async move {
                let mut tick = tokio::time::interval(touch_interval);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tick.tick().await;
                    touch_dog.touch();
                }
            })
            .into();

        self.dispatcher.run();
        warn!("main dispatch loop exited");
        drop(touch_task);
        self.core.guard_dog.stop_watching(&watchdog);

        for worker in self.core.workers.borrow_mut().iter_mut() {
            worker.exit();
        }

        // final flush — unless the flush timer was cleared when our admin
        // listener was handed to a child
        if self.core.flush_task.borrow().is_some() {
            self.core.flush_stats();
        }
        self.core.cluster_manager.shutdown();
        self.core.handler.close_connections();
        self.core.access_logs.flush_all();
        self.core.restarter.shutdown();
        SlotRegistry::shutdown_thread();
        warn!("exiting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::time::Duration;

    fn options_for(dir: &std::path::Path, config: &str, concurrency: usize) -> Options {
        let config_path = dir.join("server.json");
        std::fs::write(&config_path, config).unwrap();
        Options {
            config_path,
            restart_epoch: 0,
            base_dir: dir.join("restart"),
            concurrency,
            admin_address_path: Some(dir.join("admin_address")),
            file_flush_interval: Duration::from_millis(100),
        }
    }

    fn http_get(address: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(address).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        write!(
            stream,
            "GET {path} HTTP/1.1\r\nHost: admin\r\nConnection: close\r\n\r\n"
        )
        .unwrap();
        let mut response = String::new();
        let _ = stream.read_to_string(&mut response);
        response
    }

    #[test]
    fn boots_serves_and_exits_with_two_workers() {
        let dir = tempfile::tempdir().unwrap();
        let config = r#"{
            "admin": {"address": "tcp://127.0.0.1:0"},
            "listeners": [{"address": "tcp://127.0.0.1:0", "filter": "echo"}],
            "clusters": [
                {"name": "local", "type": "static", "address": "tcp://127.0.0.1:9000"}
            ]
        }"#;
        let mut server =
            ServerInstance::new(options_for(dir.path(), config, 2)).unwrap();

        let admin = server.admin_address().unwrap();
        let data = server.listener_addresses()[0];
        let exit = server.dispatcher();

        let driver = std::thread::spawn(move || {
            // admin answers once the loop is up
            let mut health = String::new();
            for _ in 0..100 {
                health = http_get(admin, "/healthcheck");
                if health.contains("200") {
                    break;
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            assert!(health.contains("200"), "admin never became healthy: {health}");

            // workers come up behind the init barrier; retry the echo
            let mut echoed = false;
            for _ in 0..100 {
                let mut stream = TcpStream::connect(data).unwrap();
                stream
                    .set_read_timeout(Some(Duration::from_millis(200)))
                    .unwrap();
                stream.write_all(b"ping").unwrap();
                let mut buf = [0u8; 4];
                if stream.read_exact(&mut buf).is_ok() {
                    assert_eq!(&buf, b"ping");
                    echoed = true;
                    break;
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            assert!(echoed, "workers never served the echo listener");

            let stats = http_get(admin, "/stats");
            assert!(stats.contains("server.live: 1"), "stats missing live gauge: {stats}");

            let info = http_get(admin, "/server_info");
            assert!(info.contains("\"state\": \"LIVE\""), "unexpected server info: {info}");

            exit.exit();
        });

        server.run();
        driver.join().unwrap();
        assert_eq!(server.num_connections(), 0);

        // admin address file was written for discovery
        let written = std::fs::read_to_string(dir.path().join("admin_address")).unwrap();
        assert_eq!(written, admin.to_string());
    }

    #[test]
    fn missing_config_fails_initialization() {
        let dir = tempfile::tempdir().unwrap();
        let options = Options {
            config_path: dir.path().join("nope.json"),
            restart_epoch: 0,
            base_dir: dir.path().join("restart"),
            concurrency: 1,
            admin_address_path: None,
            file_flush_interval: Duration::from_secs(10),
        };
        assert!(matches!(
            ServerInstance::new(options),
            Err(ServerError::ConfigRead { .. })
        ));
    }

    #[test]
    fn drain_flag_file_starts_health_failed() {
        let dir = tempfile::tempdir().unwrap();
        let flags = dir.path().join("flags");
        std::fs::create_dir_all(&flags).unwrap();
        std::fs::write(flags.join("drain"), "").unwrap();

        let config = format!(
            r#"{{
                "admin": {{"address": "tcp://127.0.0.1:0"}},
                "flags_path": "{}"
            }}"#,
            flags.display()
        );
        let mut server =
            ServerInstance::new(options_for(dir.path(), &config, 1)).unwrap();

        let admin = server.admin_address().unwrap();
        let exit = server.dispatcher();
        let driver = std::thread::spawn(move || {
            let mut health = String::new();
            for _ in 0..100 {
                health = http_get(admin, "/healthcheck");
                if !health.is_empty() {
                    break;
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            assert!(health.contains("503"), "expected failing health: {health}");
            exit.exit();
        });

        server.run();
        driver.join().unwrap();
    }
}
