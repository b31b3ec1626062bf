//! Shutdown coordinator: stops workers and drains outstanding connections.

use crate::runtime::dispatch::WorkerPool;
use crate::runtime::state::ServiceState;
use crate::stats::StatsSnapshot;
use std::time::Duration;
use tracing::info;

const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Outcome of a completed drain.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownReport {
    /// Counters read right after the stopping flag was set.
    pub at_stop: StatsSnapshot,
    /// Connections still outstanding when the drain began.
    pub forced: usize,
    /// Counters after every worker has finished.
    pub drained: StatsSnapshot,
}

/// Stop the service and wait for every outstanding connection.
///
/// Must run after the accept loop has returned and every dispatcher feeding
/// `pool` has been dropped. On return the registry is empty and no worker
/// thread is alive.
pub fn shutdown(state: &ServiceState, pool: WorkerPool) -> ShutdownReport {
    info!("Daemon shutdown in progress");

    state.begin_stopping();

    let at_stop = state.stats.snapshot();
    at_stop.log("stopping");

    // Blocked reads return once their socket is shut down
    let forced = state.registry.shutdown_all();
    if forced > 0 {
        info!(connections = forced, queued = pool.queued(), "Draining connections");
    }
    loop {
        let remaining = state.registry.wait_empty_timeout(PROGRESS_INTERVAL);
        if remaining == 0 {
            break;
        }
        info!(remaining, "Waiting for connections to drain");
    }

    pool.join();

    let drained = state.stats.snapshot();
    drained.log("drained");
    info!(forced, "Daemon shutdown complete");

    ShutdownReport {
        at_stop,
        forced,
        drained,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::buffer::BufferPool;
    use crate::runtime::state::AllocPolicy;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::Arc;

    #[test]
    fn test_drain_forces_idle_connections() {
        let state = ServiceState::new(8, BufferPool::new(8, 4096), AllocPolicy::default());
        let pool = WorkerPool::spawn(4).unwrap();
        let dispatcher = pool.dispatcher(Arc::clone(&state));
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let mut clients = Vec::new();
        for _ in 0..3 {
            let mut client = TcpStream::connect(addr).unwrap();
            let (server, peer) = listener.accept().unwrap();
            dispatcher.submit(server, Some(peer)).unwrap();

            // Make sure a worker owns the connection before draining
            client.write_all(b"hi").unwrap();
            let mut reply = [0u8; 2];
            client.read_exact(&mut reply).unwrap();
            clients.push(client);
        }
        drop(dispatcher);

        let report = shutdown(&state, pool);

        assert_eq!(report.forced, 3);
        assert_eq!(report.at_stop.send, 3);
        assert_eq!(report.drained.shutdown, 3);
        assert!(state.registry.is_empty());
        assert!(state.is_stopping());

        for mut client in clients {
            let mut buf = [0u8; 1];
            assert_eq!(client.read(&mut buf).unwrap_or(0), 0);
        }
    }

    #[test]
    fn test_shutdown_with_nothing_outstanding() {
        let state = ServiceState::new(8, BufferPool::new(8, 4096), AllocPolicy::default());
        let pool = WorkerPool::spawn(1).unwrap();

        let report = shutdown(&state, pool);

        assert_eq!(report.forced, 0);
        assert_eq!(report.drained, StatsSnapshot::default());
    }
}
