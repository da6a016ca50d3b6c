//! Error types for server start-up and listener creation.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Fatal initialization errors. Any of these exits the process with
/// status 1 after thread-local teardown.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to read configuration '{path}': {source}")]
    ConfigRead {
        path: PathBuf,
        source: io::Error,
    },

    #[error("failed to parse configuration '{path}': {source}")]
    ConfigParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The build was compiled without a parseable fingerprint. Refusing
    /// to run prevents deploying a binary nobody can identify.
    #[error("compiled build SHA '{0}' is invalid")]
    BadBuildSha(String),

    #[error("failed to bind listener on {address}: {source}")]
    Bind {
        address: SocketAddr,
        source: io::Error,
    },

    #[error("hot restart setup failed: {0}")]
    HotRestart(io::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A worker lost the race to listen on a port another process grabbed
/// between socket inheritance and `listen()`. Handled by an orderly
/// self-shutdown rather than a crash.
#[derive(Debug, Error)]
#[error("failed to create listener on {address}: {source}")]
pub struct CreateListenerError {
    pub address: SocketAddr,
    pub source: io::Error,
}
