//! Registry of outstanding work items.
//!
//! An item is present from the moment its connection is accepted until its
//! worker has released the transport and buffer. The drain relies on this:
//! once the registry is empty no connection worker is still running.

use slab::Slab;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::trace;

/// Registry side of a work item.
#[derive(Debug)]
pub struct Entry {
    /// Second handle to the item's socket, used to force it closed.
    handle: TcpStream,
    /// Remote address, if known.
    pub peer: Option<SocketAddr>,
}

impl Entry {
    pub fn new(handle: TcpStream, peer: Option<SocketAddr>) -> Self {
        Self { handle, peer }
    }

    /// Shut down both directions of the socket.
    ///
    /// A worker blocked in `read` on the same socket returns promptly.
    pub fn force_shutdown(&self) {
        if let Err(e) = self.handle.shutdown(Shutdown::Both) {
            trace!(peer = ?self.peer, error = %e, "Forced shutdown failed");
        }
    }
}

/// Mutex-guarded slab of outstanding work items.
///
/// Provides O(1) insert and remove; every mutation is serialized by one lock.
pub struct WorkRegistry {
    entries: Mutex<Slab<Entry>>,
    emptied: Condvar,
    max_items: usize,
}

impl WorkRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_items: usize) -> Self {
        Self {
            entries: Mutex::new(Slab::with_capacity(max_items.min(1024))),
            emptied: Condvar::new(),
            max_items,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slab<Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a new item into the registry.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn insert(&self, entry: Entry) -> Option<usize> {
        let mut entries = self.lock();
        if entries.len() >= self.max_items {
            return None;
        }
        Some(entries.insert(entry))
    }

    /// Remove an item, waking drain waiters when the registry empties.
    pub fn remove(&self, id: usize) -> Option<Entry> {
        let mut entries = self.lock();
        let entry = entries.try_remove(id);
        if entries.is_empty() {
            self.emptied.notify_all();
        }
        entry
    }

    /// Check if an item exists.
    pub fn contains(&self, id: usize) -> bool {
        self.lock().contains(id)
    }

    /// Number of outstanding items.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Maximum number of items allowed.
    pub fn capacity(&self) -> usize {
        self.max_items
    }

    /// Force every outstanding socket closed; returns how many were hit.
    pub fn shutdown_all(&self) -> usize {
        let entries = self.lock();
        for (_, entry) in entries.iter() {
            entry.force_shutdown();
        }
        entries.len()
    }

    /// Block until every item has been removed.
    pub fn wait_empty(&self) {
        let mut entries = self.lock();
        while !entries.is_empty() {
            entries = self
                .emptied
                .wait(entries)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until the registry is empty or `timeout` elapses.
    ///
    /// Returns the number of items still outstanding.
    pub fn wait_empty_timeout(&self, timeout: Duration) -> usize {
        let entries = self.lock();
        let (entries, _) = self
            .emptied
            .wait_timeout_while(entries, timeout, |e| !e.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        entries.len()
    }
}
