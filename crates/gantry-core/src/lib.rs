//! Core building blocks for the gantry server: the per-thread event loop
//! (dispatcher), the stats store, the initialization barrier, the drain
//! manager, and the watchdog / guard dog pair.
//!
//! Everything here is policy-free: the pieces know nothing about listeners,
//! configuration, or hot restart. `gantry-server` composes them.

pub mod dispatcher;
pub mod drain;
pub mod init;
pub mod stats;
pub mod time;
pub mod watchdog;

pub use dispatcher::{AbortOnDrop, Dispatcher, DispatcherHandle, TaskQueue};
pub use drain::DrainManager;
pub use init::{InitManager, InitState, InitTarget};
pub use stats::{Counter, Gauge, Scope, Sink, Store};
pub use watchdog::{GuardDog, GuardDogConfig, StallEvent, WatchDog};
