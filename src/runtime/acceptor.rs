//! Accept loop and its cancellation handle.
//!
//! The loop blocks in `accept` on a listener bound by the caller. Every
//! accepted connection goes straight to the dispatcher; the loop itself never
//! reads or writes a connection.

use crate::runtime::dispatch::Dispatcher;
use crate::runtime::state::ServiceState;
use crate::stats::Counter;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, trace, warn};

const WAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// Requests the accept loop to stop.
///
/// Cloneable and usable from any thread, including a signal-handling one.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
    wake_addr: SocketAddr,
}

impl CancelHandle {
    /// Create a handle for a loop accepting on `local_addr`.
    pub fn new(local_addr: SocketAddr) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            wake_addr: wake_addr(local_addr),
        }
    }

    /// Ask the loop to stop and wake it from a blocked `accept`.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Cancellation requested");
        // The loop sees the flag as soon as this connection is accepted
        match TcpStream::connect_timeout(&self.wake_addr, WAKE_TIMEOUT) {
            Ok(stream) => drop(stream),
            Err(e) => warn!(
                addr = %self.wake_addr,
                error = %e,
                "Wake-up connect failed; accept loop stops on the next inbound connection"
            ),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Unspecified bind addresses are reached through loopback.
fn wake_addr(local_addr: SocketAddr) -> SocketAddr {
    match local_addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), local_addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), local_addr.port())
        }
        _ => local_addr,
    }
}

/// Run the accept loop until `cancel` fires.
///
/// Returns the number of connections handed to the dispatcher.
pub fn accept_loop(
    listener: &TcpListener,
    dispatcher: &Dispatcher,
    state: &ServiceState,
    cancel: &CancelHandle,
) -> usize {
    let mut accepted = 0usize;

    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                if cancel.is_cancelled() {
                    trace!(peer = %peer, "Closing connection accepted after cancellation");
                    let _ = stream.shutdown(Shutdown::Both);
                    break;
                }
                // Dispatch failures are counted and closed by the dispatcher
                if dispatcher.submit(stream, Some(peer)).is_ok() {
                    accepted += 1;
                }
            }
            Err(e) => {
                if cancel.is_cancelled() {
                    break;
                }
                state.stats.incr(Counter::AcceptErr);
                warn!(error = %e, "Failed to accept connection");
                if is_resource_exhaustion(&e) {
                    std::thread::sleep(Duration::from_millis(10));
                }
            }
        }
    }

    info!(accepted, "Accept loop stopped");
    accepted
}

/// Out of file descriptors; retrying immediately would spin.
fn is_resource_exhaustion(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::buffer::BufferPool;
    use crate::runtime::dispatch::WorkerPool;
    use crate::runtime::state::AllocPolicy;
    use std::io::{Read, Write};
    use std::thread;

    #[test]
    fn test_wake_addr() {
        let addr: SocketAddr = "0.0.0.0:4000".parse().unwrap();
        assert_eq!(wake_addr(addr), "127.0.0.1:4000".parse().unwrap());

        let addr: SocketAddr = "[::]:4000".parse().unwrap();
        assert_eq!(wake_addr(addr), "[::1]:4000".parse().unwrap());

        let addr: SocketAddr = "10.0.0.1:4000".parse().unwrap();
        assert_eq!(wake_addr(addr), addr);
    }

    #[test]
    fn test_cancel_stops_blocked_accept() {
        let state = ServiceState::new(8, BufferPool::new(8, 4096), AllocPolicy::default());
        let pool = WorkerPool::spawn(2).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancelHandle::new(addr);

        let acceptor = {
            let state = Arc::clone(&state);
            let dispatcher = pool.dispatcher(Arc::clone(&state));
            let cancel = cancel.clone();
            thread::spawn(move || accept_loop(&listener, &dispatcher, &state, &cancel))
        };

        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"abc").unwrap();
        let mut reply = [0u8; 3];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"abc");
        drop(client);

        cancel.cancel();
        assert!(cancel.is_cancelled());
        assert_eq!(acceptor.join().unwrap(), 1);

        state.registry.wait_empty();
        pool.join();
        assert_eq!(state.stats.get(Counter::AcceptErr), 0);
    }
}
