//! Work dispatch: turns accepted connections into work items and runs them
//! on a fixed pool of worker threads.
//!
//! The queue in front of the pool is unbounded; the dispatcher never rejects
//! work because the workers are busy. It only fails when a work item cannot
//! be created (registry full, socket handle exhausted) or the pool is gone.

use crate::runtime::registry::Entry;
use crate::runtime::state::ServiceState;
use crate::runtime::worker::{self, WorkItem};
use crate::stats::Counter;
use crossbeam_channel::{Receiver, Sender};
use std::fmt;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Reasons a connection could not be dispatched.
#[derive(Debug)]
pub enum DispatchError {
    /// The registry is at capacity.
    RegistryFull,
    /// The socket handle kept by the registry could not be created.
    Clone(io::Error),
    /// The worker pool has shut down.
    PoolClosed,
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::RegistryFull => write!(f, "connection registry is full"),
            DispatchError::Clone(e) => write!(f, "failed to duplicate socket handle: {e}"),
            DispatchError::PoolClosed => write!(f, "worker pool is closed"),
        }
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DispatchError::Clone(e) => Some(e),
            _ => None,
        }
    }
}

/// Fixed-size pool of connection worker threads.
pub struct WorkerPool {
    sender: Option<Sender<WorkItem>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` worker threads sharing one unbounded queue.
    ///
    /// Failing to create a thread is fatal to the daemon and is returned.
    pub fn spawn(size: usize) -> io::Result<Self> {
        let size = size.max(1);
        let (sender, receiver) = crossbeam_channel::unbounded::<WorkItem>();
        let mut handles = Vec::with_capacity(size);

        for worker_id in 0..size {
            let receiver: Receiver<WorkItem> = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("worker-{worker_id}"))
                .spawn(move || {
                    for item in receiver.iter() {
                        worker::run(item);
                    }
                    debug!(worker = worker_id, "Worker stopped");
                })?;
            handles.push(handle);
        }

        info!(workers = size, "Worker pool started");

        Ok(Self {
            sender: Some(sender),
            handles,
        })
    }

    /// Number of worker threads.
    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Work items queued but not yet picked up by a worker.
    pub fn queued(&self) -> usize {
        self.sender.as_ref().map_or(0, Sender::len)
    }

    /// Build a dispatcher feeding this pool.
    pub fn dispatcher(&self, state: Arc<ServiceState>) -> Dispatcher {
        Dispatcher {
            state,
            sender: self.sender.clone(),
        }
    }

    /// Close the queue and wait for every worker to exit.
    ///
    /// Workers finish everything already queued first. Dispatchers created
    /// from this pool must be dropped before this returns.
    pub fn join(mut self) {
        self.sender.take();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("Worker thread panicked");
            }
        }
    }
}

/// Submits accepted connections to a [`WorkerPool`].
pub struct Dispatcher {
    state: Arc<ServiceState>,
    sender: Option<Sender<WorkItem>>,
}

impl Dispatcher {
    /// Register the connection and queue it for a worker.
    ///
    /// Returns the registry id of the new work item. On failure the
    /// connection is shut down and closed here, and the dispatch-error
    /// counter is incremented.
    pub fn submit(
        &self,
        stream: TcpStream,
        peer: Option<SocketAddr>,
    ) -> Result<usize, DispatchError> {
        let handle = match stream.try_clone() {
            Ok(handle) => handle,
            Err(e) => return Err(self.reject(stream, DispatchError::Clone(e))),
        };

        let id = match self.state.registry.insert(Entry::new(handle, peer)) {
            Some(id) => id,
            None => return Err(self.reject(stream, DispatchError::RegistryFull)),
        };

        let item = WorkItem::new(stream, peer, id, Arc::clone(&self.state));
        let Some(sender) = self.sender.as_ref() else {
            // Dropping the item removes its registry entry
            return Err(self.reject_item(item));
        };
        if let Err(unsent) = sender.send(item) {
            return Err(self.reject_item(unsent.into_inner()));
        }

        debug!(conn_id = id, peer = ?peer, "Dispatched connection");
        Ok(id)
    }

    fn reject(&self, stream: TcpStream, err: DispatchError) -> DispatchError {
        warn!(error = %err, "Rejecting connection");
        let _ = stream.shutdown(Shutdown::Both);
        self.state.stats.incr(Counter::DispatchErr);
        err
    }

    fn reject_item(&self, item: WorkItem) -> DispatchError {
        let err = DispatchError::PoolClosed;
        warn!(conn_id = item.id(), error = %err, "Rejecting connection");
        item.close();
        self.state.stats.incr(Counter::DispatchErr);
        err
    }
}
