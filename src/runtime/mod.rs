//! Connection-acceptance and work-dispatch engine.
//!
//! One accept loop feeds a fixed pool of blocking worker threads:
//! - `acceptor`: accept loop and `CancelHandle`
//! - `dispatch`: `Dispatcher` and `WorkerPool`
//! - `worker`: echo protocol for one `WorkItem`
//! - `shutdown`: stop flag, counter report and drain
//!
//! Shared pieces:
//! - `ServiceState`: stopping flag, registry, buffers, counters
//! - `WorkRegistry`: outstanding work items
//! - `BufferPool`: bounded per-connection buffers

mod acceptor;
mod buffer;
mod dispatch;
mod registry;
mod shutdown;
mod state;
mod worker;

pub use acceptor::{accept_loop, CancelHandle};
pub use buffer::{BufferPool, PooledBuffer};
pub use dispatch::{DispatchError, Dispatcher, WorkerPool};
pub use registry::{Entry, WorkRegistry};
pub use shutdown::{shutdown, ShutdownReport};
pub use state::{AllocPolicy, ServiceState};
pub use worker::WorkItem;
