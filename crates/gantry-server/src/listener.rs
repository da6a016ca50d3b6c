//! Listen sockets shared across worker threads.
//!
//! One [`ListenSocket`] exists per configured IP listener, created exactly
//! once: either bound fresh here or adopted from the parent process's
//! descriptor during hot restart. Every worker turns it into its own
//! accepting handle by duplicating the descriptor and calling `listen` —
//! the duplicates share one open file description, so the kernel
//! load-balances accepts across worker event loops and the underlying
//! socket closes only when the last duplicate is released.
//!
//! `bind` and `listen` are deliberately split: binding failures are fatal
//! configuration errors on the main thread, while a lost `listen`-time
//! port race surfaces per worker as [`CreateListenerError`] and triggers
//! an orderly self-shutdown.

use std::io;
use std::net::SocketAddr;
use std::os::fd::OwnedFd;

use socket2::{Domain, Protocol, SockRef, Socket, Type};

use crate::error::ServerError;

/// Accept queue depth requested by each worker's `listen`.
pub const LISTEN_BACKLOG: i32 = 128;

/// A bound (or inherited) listening-socket descriptor.
#[derive(Debug)]
pub struct ListenSocket {
    fd: OwnedFd,
    address: SocketAddr,
}

impl ListenSocket {
    /// Creates the socket and, unless `bind_to_port` is off, binds it.
    /// The recorded address is the actual bound one, so port 0 resolves
    /// to the kernel-assigned port.
    pub fn bind(address: SocketAddr, bind_to_port: bool) -> Result<Self, ServerError> {
        let domain = Domain::for_address(address);
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .map_err(|source| ServerError::Bind { address, source })?;
        socket
            .set_reuse_address(true)
            .map_err(|source| ServerError::Bind { address, source })?;

        let mut bound = address;
        if bind_to_port {
            socket
                .bind(&address.into())
                .map_err(|source| ServerError::Bind { address, source })?;
            bound = socket
                .local_addr()
                .ok()
                .and_then(|addr| addr.as_socket())
                .unwrap_or(address);
        }

        Ok(Self {
            fd: socket.into(),
            address: bound,
        })
    }

    /// Adopts a descriptor inherited from the parent process. The address
    /// is read back from the descriptor itself.
    pub fn from_fd(fd: OwnedFd) -> io::Result<Self> {
        let address = SockRef::from(&fd)
            .local_addr()?
            .as_socket()
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "inherited fd is not an IP socket")
            })?;
        Ok(Self { fd, address })
    }

    /// The bound address.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// The `tcp://` URL form, as used by hot-restart duplication.
    pub fn url(&self) -> String {
        format!("tcp://{}", self.address)
    }

    /// Duplicates the raw descriptor for handing to a child process.
    pub fn duplicate(&self) -> io::Result<OwnedFd> {
        self.fd.try_clone()
    }

    /// Produces a worker-private accepting handle: a duplicated
    /// descriptor with `listen` applied and non-blocking mode set, ready
    /// for registration with the worker's event loop.
    pub fn listen_handle(&self) -> io::Result<std::net::TcpListener> {
        let socket = Socket::from(self.fd.try_clone()?);
        socket.listen(LISTEN_BACKLOG)?;
        socket.set_nonblocking(true)?;
        Ok(socket.into())
    }
}
