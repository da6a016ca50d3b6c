//! The filter-chain seam.
//!
//! Traffic logic is out of scope for the supervisory core: a listener's
//! behavior is whatever its [`FilterChainFactory`] builds per accepted
//! connection. Factories are instantiated by name on each worker's own
//! thread, so implementations are free to hold loop-local state and the
//! futures they return never cross threads.
//!
//! Two trivial built-ins keep listeners exercisable end to end: `echo`
//! writes every byte back, `blackhole` discards until EOF.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::rc::Rc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// The future servicing one accepted connection, driven on the accepting
/// worker's loop until the connection ends.
pub type ConnectionFuture = Pin<Box<dyn Future<Output = io::Result<()>>>>;

/// Builds the processing chain for each accepted connection.
pub trait FilterChainFactory {
    fn name(&self) -> &str;
    fn create(&self, stream: TcpStream, peer: SocketAddr) -> ConnectionFuture;
}

/// Resolves a configured filter-chain name to a factory. Called on the
/// thread that will run the connections.
pub fn factory_for(name: &str) -> Option<Rc<dyn FilterChainFactory>> {
    match name {
        "echo" => Some(Rc::new(EchoFactory)),
        "blackhole" => Some(Rc::new(BlackholeFactory)),
        _ => None,
    }
}

/// Read buffer for the built-in chains. Small: these exist to prove the
/// plumbing, not to move bulk traffic.
const BUF_CAPACITY: usize = 4096;

/// Writes everything it reads straight back.
pub struct EchoFactory;

impl FilterChainFactory for EchoFactory {
    fn name(&self) -> &str {
        "echo"
    }

    fn create(&self, mut stream: TcpStream, _peer: SocketAddr) -> ConnectionFuture {
        Box::pin(async move {
            let mut buf = vec![0u8; BUF_CAPACITY];
            loop {
                let n = stream.read(&mut buf).await?;
                if n == 0 {
                    return Ok(());
                }
                stream.write_all(&buf[..n]).await?;
            }
        })
    }
}

/// Reads and discards until the peer closes.
pub struct BlackholeFactory;

impl FilterChainFactory for BlackholeFactory {
    fn name(&self) -> &str {
        "blackhole"
    }

    fn create(&self, mut stream: TcpStream, _peer: SocketAddr) -> ConnectionFuture {
        Box::pin(async move {
            let mut buf = vec![0u8; BUF_CAPACITY];
            loop {
                if stream.read(&mut buf).await? == 0 {
                    return Ok(());
                }
            }
        })
    }
}
