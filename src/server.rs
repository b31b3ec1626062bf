//! Echo daemon: listener setup and the accept/drain lifecycle.
//!
//! The daemon takes a listener that is already bound and listening. It
//! accepts on the calling thread, echoes on a pool of worker threads, and
//! drains every outstanding connection before `run` returns.

use crate::config::Config;
use crate::runtime::{
    accept_loop, shutdown, CancelHandle, ServiceState, ShutdownReport, WorkerPool,
};
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use tracing::info;

/// Create a blocking listener bound to `addr`.
pub fn bind_listener(addr: &str, backlog: i32) -> io::Result<TcpListener> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

/// Daemon instance
pub struct Daemon {
    listener: TcpListener,
    state: Arc<ServiceState>,
    pool: WorkerPool,
    cancel: CancelHandle,
}

impl Daemon {
    /// Create a daemon on an already listening socket and start its workers.
    pub fn new(listener: TcpListener, config: &Config) -> io::Result<Self> {
        config
            .validate()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let local_addr = listener.local_addr()?;
        let state = ServiceState::from_config(config);
        let pool = WorkerPool::spawn(config.worker_count())?;

        info!(
            addr = %local_addr,
            workers = pool.size(),
            max_connections = state.registry.capacity(),
            buffer_size = state.buffers.buffer_size(),
            "Daemon ready"
        );

        Ok(Daemon {
            listener,
            state,
            pool,
            cancel: CancelHandle::new(local_addr),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle used to stop [`Daemon::run`] from another thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Shared state, for inspecting counters and the registry.
    pub fn state(&self) -> Arc<ServiceState> {
        Arc::clone(&self.state)
    }

    /// Accept until cancelled, then drain.
    ///
    /// Returns once every accepted connection has been closed and every
    /// worker thread has exited.
    pub fn run(self) -> ShutdownReport {
        let Daemon {
            listener,
            state,
            pool,
            cancel,
        } = self;

        let dispatcher = pool.dispatcher(Arc::clone(&state));
        accept_loop(&listener, &dispatcher, &state, &cancel);

        // No new connections from here on
        drop(dispatcher);
        drop(listener);

        shutdown(&state, pool)
    }
}
