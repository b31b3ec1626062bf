//! kecho: a concurrent TCP echo daemon
//!
//! Every accepted connection is echoed byte-for-byte by a pool of worker
//! threads until the peer closes it or the daemon shuts down.
//!
//! Features:
//! - Fixed worker pool fed by an unbounded work queue
//! - Graceful shutdown that drains every in-flight connection
//! - Lock-free operation counters
//! - Configuration via CLI arguments or TOML file
//! - Load-generating benchmark client (`kecho-bench`)

pub mod bench;
pub mod config;
pub mod runtime;
pub mod server;
pub mod stats;

pub use config::Config;
pub use server::{bind_listener, Daemon};
pub use stats::{Counter, Stats, StatsSnapshot};
