//! The hot-restart object: client toward the parent process, server
//! toward a future child.
//!
//! Each process binds two datagram sockets under the restart base
//! directory: `gantry_restart_{epoch}.sock` services the next epoch's
//! requests, and `gantry_restart_{epoch}.client.sock` carries this
//! process's own requests to epoch − 1. Epoch 0 has no parent and every
//! client call degrades to its default.
//!
//! Client calls are synchronous with a short timeout — they happen a
//! handful of times during start-up and shutdown, and a parent that has
//! already exited must not wedge its successor. The serving side runs as
//! a task on the main dispatcher and hands each request to the
//! [`RpcHandler`] capability trait.

use std::cell::Cell;
use std::io;
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use gantry_core::dispatcher::Dispatcher;
use tokio::io::unix::AsyncFd;
use tracing::{debug, info, warn};

use crate::fdpass::{self, MAX_DATAGRAM};
use crate::message::RestartMessage;

/// Protocol fingerprint. Parent and child must agree for an upgrade to be
/// safe; exposed on the admin endpoint so operators can check first.
pub const HOT_RESTART_VERSION: &str = "gantry.restart.v1";

/// How long a client call waits for the parent before giving up.
const RPC_TIMEOUT: Duration = Duration::from_secs(1);

/// Stats a parent reports for aggregation into its successor's gauges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParentStats {
    pub memory_allocated: u64,
    pub num_connections: u64,
}

/// What the serving side needs from the server. Implemented by the server
/// core; all calls arrive on the main loop.
pub trait RpcHandler {
    /// Close the admin listener for the child; returns this process's
    /// original start time (epoch seconds) to carry forward.
    fn shutdown_admin(&self) -> u64;

    /// Duplicate the listen socket bound to `address`
    /// (`tcp://ip:port`), if this process has one.
    fn duplicate_listen_socket(&self, address: &str) -> Option<OwnedFd>;

    /// Current stats for parent aggregation.
    fn stats(&self) -> ParentStats;

    /// Stop accepting and start draining; the child's workers are up.
    fn drain_listeners(&self);

    /// Exit now; the child has fully taken over.
    fn terminate(&self);
}

struct ClientLink {
    sock: UnixDatagram,
    parent_path: PathBuf,
}

/// Hot-restart endpoint for one process.
pub struct HotRestart {
    epoch: u32,
    server_path: PathBuf,
    client_path: Option<PathBuf>,
    server_sock: Cell<Option<UnixDatagram>>,
    client: Option<ClientLink>,
    parent_terminated: Cell<bool>,
}

fn server_socket_path(base_dir: &Path, epoch: u32) -> PathBuf {
    base_dir.join(format!("gantry_restart_{epoch}.sock"))
}

impl HotRestart {
    /// Binds this epoch's sockets under `base_dir`. Stale socket files
    /// from a crashed previous run at the same epoch are replaced.
    pub fn new(base_dir: &Path, epoch: u32) -> io::Result<Self> {
        std::fs::create_dir_all(base_dir)?;

        let server_path = server_socket_path(base_dir, epoch);
        let _ = std::fs::remove_file(&server_path);
        let server_sock = UnixDatagram::bind(&server_path)?;
        server_sock.set_nonblocking(true)?;

        let (client, client_path) = if epoch > 0 {
            let client_path = base_dir.join(format!("gantry_restart_{epoch}.client.sock"));
            let _ = std::fs::remove_file(&client_path);
            let sock = UnixDatagram::bind(&client_path)?;
            sock.set_read_timeout(Some(RPC_TIMEOUT))?;
            let link = ClientLink {
                sock,
                parent_path: server_socket_path(base_dir, epoch - 1),
            };
            (Some(link), Some(client_path))
        } else {
            (None, None)
        };

        Ok(Self {
            epoch,
            server_path,
            client_path,
            server_sock: Cell::new(Some(server_sock)),
            client,
            parent_terminated: Cell::new(false),
        })
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    /// This build's hot-restart protocol version.
    pub fn version(&self) -> &'static str {
        HOT_RESTART_VERSION
    }

    /// Starts servicing requests from the next epoch on `dispatcher`.
    /// Subsequent calls are no-ops.
    pub fn initialize(&self, dispatcher: &Dispatcher, handler: Rc<dyn RpcHandler>) {
        if let Some(sock) = self.server_sock.take() {
            dispatcher.spawn(serve(sock, handler));
        }
    }

    /// Whether there is still a parent worth talking to. Once terminate
    /// has been sent the parent is gone (or going), and every further
    /// call degrades to its default instead of paying the RPC timeout.
    fn parent_alive(&self) -> bool {
        self.client.is_some() && !self.parent_terminated.get()
    }

    fn call(&self, request: &RestartMessage) -> io::Result<(RestartMessage, Option<OwnedFd>)> {
        let link = self
            .client
            .as_ref()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;

        let mut buf = vec![0u8; MAX_DATAGRAM];

        // a previously timed-out call may have left its late reply queued;
        // drain those so this request pairs with its own answer
        link.sock.set_nonblocking(true)?;
        loop {
            match fdpass::recv_from_with_fd(&link.sock, &mut buf) {
                Ok(stale) => debug!(len = stale.len, "discarding stale hot restart reply"),
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) => {
                    link.sock.set_nonblocking(false)?;
                    return Err(error);
                }
            }
        }
        link.sock.set_nonblocking(false)?;

        fdpass::send_to_with_fd(&link.sock, &request.encode(), &link.parent_path, None)?;
        let received = fdpass::recv_from_with_fd(&link.sock, &mut buf)?;
        let reply = RestartMessage::decode(&buf[..received.len])
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok((reply, received.fd))
    }

    /// Asks the parent to close its admin listener; returns the original
    /// start time to inherit, or `None` without a (living) parent.
    pub fn shutdown_parent_admin(&self) -> Option<u64> {
        if !self.parent_alive() {
            return None;
        }
        match self.call(&RestartMessage::ShutdownAdmin) {
            Ok((
                RestartMessage::ShutdownAdminReply {
                    original_start_time,
                },
                _,
            )) => Some(original_start_time),
            Ok((other, _)) => {
                warn!(?other, "unexpected reply to admin shutdown");
                None
            }
            Err(error) => {
                warn!(%error, "parent did not answer admin shutdown");
                None
            }
        }
    }

    /// Requests the parent's listen socket for `address`. `None` means
    /// bind fresh.
    pub fn duplicate_parent_listen_socket(&self, address: &str) -> Option<OwnedFd> {
        if !self.parent_alive() {
            return None;
        }
        match self.call(&RestartMessage::DuplicateSocket {
            address: address.to_owned(),
        }) {
            Ok((RestartMessage::DuplicateSocketReply { ok: true }, Some(fd))) => Some(fd),
            Ok((RestartMessage::DuplicateSocketReply { ok: true }, None)) => {
                warn!(address, "parent claimed a socket but sent no descriptor");
                None
            }
            Ok((RestartMessage::DuplicateSocketReply { ok: false }, _)) => None,
            Ok((other, _)) => {
                warn!(?other, "unexpected reply to socket duplication");
                None
            }
            Err(error) => {
                warn!(address, %error, "parent did not answer socket duplication");
                None
            }
        }
    }

    /// The parent's stats, zeroed when there is no parent to ask.
    pub fn get_parent_stats(&self) -> ParentStats {
        if !self.parent_alive() {
            return ParentStats::default();
        }
        match self.call(&RestartMessage::Stats) {
            Ok((
                RestartMessage::StatsReply {
                    memory_allocated,
                    num_connections,
                },
                _,
            )) => ParentStats {
                memory_allocated,
                num_connections,
            },
            Ok((other, _)) => {
                warn!(?other, "unexpected reply to stats request");
                ParentStats::default()
            }
            Err(error) => {
                debug!(%error, "parent did not answer stats request");
                ParentStats::default()
            }
        }
    }

    /// The parent's hot-restart protocol version, if it answers.
    pub fn parent_version(&self) -> Option<String> {
        if !self.parent_alive() {
            return None;
        }
        match self.call(&RestartMessage::Version) {
            Ok((RestartMessage::VersionReply { version }, _)) => Some(version),
            _ => None,
        }
    }

    /// Tells the parent its listeners can stop accepting.
    pub fn drain_parent_listeners(&self) {
        if !self.parent_alive() {
            return;
        }
        match self.call(&RestartMessage::DrainListeners) {
            Ok((RestartMessage::DrainListenersReply, _)) => {
                info!("parent is draining its listeners");
            }
            Ok((other, _)) => warn!(?other, "unexpected reply to listener drain"),
            Err(error) => warn!(%error, "parent did not answer listener drain"),
        }
    }

    /// Tells the parent to exit. Idempotent; no reply is expected.
    pub fn terminate_parent(&self) {
        let Some(link) = &self.client else {
            return;
        };
        if self.parent_terminated.replace(true) {
            return;
        }
        info!("terminating parent process");
        if let Err(error) = fdpass::send_to_with_fd(
            &link.sock,
            &RestartMessage::Terminate.encode(),
            &link.parent_path,
            None,
        ) {
            warn!(%error, "failed to send terminate to parent");
        }
    }

    /// Removes this epoch's socket files.
    pub fn shutdown(&self) {
        let _ = std::fs::remove_file(&self.server_path);
        if let Some(path) = &self.client_path {
            let _ = std::fs::remove_file(path);
        }
    }
}

async fn serve(sock: UnixDatagram, handler: Rc<dyn RpcHandler>) {
    let afd = match AsyncFd::new(sock) {
        Ok(afd) => afd,
        Err(error) => {
            warn!(%error, "hot restart serving disabled");
            return;
        }
    };
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let mut guard = match afd.readable().await {
            Ok(guard) => guard,
            Err(_) => return,
        };
        let received = match guard.try_io(|inner| fdpass::recv_from_with_fd(inner.get_ref(), &mut buf)) {
            Ok(Ok(received)) => received,
            Ok(Err(error)) => {
                warn!(%error, "hot restart receive failed");
                continue;
            }
            Err(_would_block) => continue,
        };

        let Some(peer) = received.peer else {
            debug!("dropping hot restart datagram from unbound sender");
            continue;
        };
        match RestartMessage::decode(&buf[..received.len]) {
            Ok(request) => respond(afd.get_ref(), &peer, request, &handler),
            Err(error) => warn!(%error, "dropping undecodable hot restart datagram"),
        }
    }
}

fn respond(sock: &UnixDatagram, peer: &Path, request: RestartMessage, handler: &Rc<dyn RpcHandler>) {
    debug!(?request, "hot restart request");
    let (reply, fd) = match request {
        RestartMessage::ShutdownAdmin => (
            Some(RestartMessage::ShutdownAdminReply {
                original_start_time: handler.shutdown_admin(),
            }),
            None,
        ),
        RestartMessage::DuplicateSocket { address } => {
            let fd = handler.duplicate_listen_socket(&address);
            (
                Some(RestartMessage::DuplicateSocketReply { ok: fd.is_some() }),
                fd,
            )
        }
        RestartMessage::Stats => {
            let stats = handler.stats();
            (
                Some(RestartMessage::StatsReply {
                    memory_allocated: stats.memory_allocated,
                    num_connections: stats.num_connections,
                }),
                None,
            )
        }
        RestartMessage::DrainListeners => {
            handler.drain_listeners();
            (Some(RestartMessage::DrainListenersReply), None)
        }
        RestartMessage::Terminate => {
            handler.terminate();
            (None, None)
        }
        RestartMessage::Version => (
            Some(RestartMessage::VersionReply {
                version: HOT_RESTART_VERSION.to_owned(),
            }),
            None,
        ),
        other => {
            debug!(?other, "ignoring reply-only hot restart message");
            (None, None)
        }
    };

    if let Some(reply) = reply {
        let borrowed = fd.as_ref().map(|fd| fd.as_fd());
        if let Err(error) = fdpass::send_to_with_fd(sock, &reply.encode(), peer, borrowed) {
            warn!(%error, "failed to send hot restart reply");
        }
    }
}
