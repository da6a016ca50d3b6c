//! gantry-server: the supervisory core of a multi-threaded L4/L7 proxy.
//!
//! Takes the process from a JSON configuration file to `concurrency`
//! worker threads accepting on a shared set of listen sockets, then
//! shepherds it through draining, hot restart, and exit. Protocol filters,
//! load balancing, and the like are hosted behind small seams
//! ([`filter::FilterChainFactory`], [`upstream::ClusterManager`]) — this
//! crate is the machinery around them, not the traffic logic.

pub mod access_log;
pub mod admin;
pub mod config;
pub mod error;
pub mod filter;
pub mod handler;
pub mod listener;
pub mod memory;
pub mod runtime;
pub mod server;
pub mod stats_sink;
pub mod thread_local;
pub mod upstream;
pub mod version;
pub mod worker;

pub use config::{Options, ServerConfig};
pub use error::{CreateListenerError, ServerError};
pub use server::ServerInstance;
