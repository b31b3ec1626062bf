//! Connection worker: runs the echo protocol for one accepted connection.

use crate::runtime::buffer::PooledBuffer;
use crate::runtime::state::ServiceState;
use crate::stats::Counter;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread;
use tracing::{debug, trace, warn};

/// One accepted connection awaiting or undergoing echo handling.
///
/// Field order matters: the socket is closed before the registry entry is
/// removed, so an item leaves the registry only after its transport is gone.
pub struct WorkItem {
    stream: TcpStream,
    peer: Option<SocketAddr>,
    membership: Membership,
}

/// Registry membership; removes the entry when dropped.
struct Membership {
    id: usize,
    state: Arc<ServiceState>,
}

impl Drop for Membership {
    fn drop(&mut self) {
        self.state.registry.remove(self.id);
    }
}

impl WorkItem {
    /// Wrap a connection already inserted into the registry under `id`.
    pub(crate) fn new(
        stream: TcpStream,
        peer: Option<SocketAddr>,
        id: usize,
        state: Arc<ServiceState>,
    ) -> Self {
        Self {
            stream,
            peer,
            membership: Membership { id, state },
        }
    }

    /// Registry key of this item.
    pub fn id(&self) -> usize {
        self.membership.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Close the connection without running it.
    pub(crate) fn close(self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Why an echo loop ended.
#[derive(Debug)]
enum Exit {
    /// Peer closed its side (or the socket was forced closed).
    PeerClosed,
    /// The stopping flag was observed.
    Stopping,
    Recv(io::Error),
    Send(io::Error),
    /// No buffer could be acquired.
    NoBuffer,
    /// The acquired buffer has no room to receive into.
    EmptyBuffer,
}

/// Execute a work item to completion.
///
/// Acquires a buffer, echoes until end-of-stream, an I/O error, or shutdown,
/// then shuts the socket down and releases the buffer and registry entry.
pub fn run(mut item: WorkItem) {
    let state = Arc::clone(&item.membership.state);
    let id = item.id();

    let mut buffer = acquire_buffer(&state);
    let exit = match buffer.as_mut() {
        Some(buf) => echo(&mut item.stream, buf, &state),
        None => Exit::NoBuffer,
    };

    match &exit {
        Exit::Recv(e) | Exit::Send(e) => {
            debug!(conn_id = id, peer = ?item.peer, error = %e, "Connection error")
        }
        Exit::NoBuffer => {
            warn!(conn_id = id, peer = ?item.peer, "Buffer pool exhausted, rejecting connection")
        }
        Exit::EmptyBuffer => {
            warn!(conn_id = id, peer = ?item.peer, "Zero-sized connection buffer, rejecting connection")
        }
        Exit::PeerClosed | Exit::Stopping => {
            trace!(conn_id = id, peer = ?item.peer, reason = ?exit, "Connection finished")
        }
    }

    if let Err(e) = item.stream.shutdown(Shutdown::Both) {
        trace!(conn_id = id, error = %e, "Shutdown on closed socket");
    }
    state.stats.incr(Counter::Shutdown);

    drop(buffer);
    drop(item);
}

/// Acquire a connection buffer, backing off while the pool is exhausted.
///
/// Gives up after the configured number of retries, or as soon as shutdown
/// has begun.
fn acquire_buffer(state: &ServiceState) -> Option<PooledBuffer> {
    let policy = state.alloc_policy;
    let mut failures = 0u32;

    loop {
        if let Some(buf) = state.buffers.try_acquire() {
            return Some(buf);
        }
        state.stats.incr(Counter::AllocErr);
        failures += 1;

        if failures > policy.retries || state.is_stopping() {
            return None;
        }
        thread::sleep(policy.backoff(failures));
    }
}

/// The echo loop proper.
///
/// The stopping flag is checked every cycle so long-lived connections end
/// promptly once shutdown begins.
fn echo(stream: &mut TcpStream, buf: &mut [u8], state: &ServiceState) -> Exit {
    if buf.is_empty() {
        return Exit::EmptyBuffer;
    }
    // One byte of the buffer is kept in reserve
    let limit = buf.len().saturating_sub(1).max(1);

    while !state.is_stopping() {
        let received = stream.read(&mut buf[..limit]);
        state.stats.incr(Counter::Recv);
        let n = match received {
            Ok(0) => return Exit::PeerClosed,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                state.stats.incr(Counter::RecvErr);
                return Exit::Recv(e);
            }
        };

        let sent = stream.write_all(&buf[..n]);
        state.stats.incr(Counter::Send);
        if let Err(e) = sent {
            state.stats.incr(Counter::SendErr);
            return Exit::Send(e);
        }

        buf[..n].fill(0);
    }

    Exit::Stopping
}
