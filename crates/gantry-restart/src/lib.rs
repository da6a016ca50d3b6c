//! Hot-restart plumbing: the dialogue between a running server process and
//! the successor that replaces it during a live binary upgrade.
//!
//! The successor inherits the parent's listen sockets over a Unix-domain
//! datagram RPC (descriptors travel as `SCM_RIGHTS` ancillary data), asks
//! the parent to close its admin listener before opening its own, and —
//! once its workers accept traffic — tells the parent to drain and finally
//! to terminate. Wire format lives in [`message`], descriptor passing in
//! [`fdpass`], and the client/server object in [`restart`].

pub mod fdpass;
pub mod message;
pub mod restart;

pub use message::{CodecError, RestartMessage};
pub use restart::{HotRestart, ParentStats, RpcHandler, HOT_RESTART_VERSION};
