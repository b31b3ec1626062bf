//! kecho: a concurrent TCP echo daemon
//!
//! Binds the configured address, echoes every connection on a worker pool
//! and drains all of them on Ctrl-C or SIGTERM.

use kecho::config::Config;
use kecho::runtime::CancelHandle;
use kecho::server::{bind_listener, Daemon};
use std::thread;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        backlog = config.backlog,
        workers = config.worker_count(),
        max_connections = config.max_connections,
        buffer_size = config.buffer_size,
        "Starting kecho daemon"
    );

    let listener = bind_listener(&config.listen, config.backlog)?;
    let daemon = Daemon::new(listener, &config)?;

    let cancel = daemon.cancel_handle();
    thread::Builder::new()
        .name("signal".to_string())
        .spawn(move || wait_for_signal(cancel))?;

    let report = daemon.run();
    info!(
        forced = report.forced,
        shutdown = report.drained.shutdown,
        "Exiting"
    );

    Ok(())
}

/// Block until Ctrl-C or SIGTERM, then cancel the accept loop.
fn wait_for_signal(cancel: CancelHandle) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to start signal handler");
            return;
        }
    };

    let signalled = runtime.block_on(async {
        let mut terminate =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM handler");
                    return false;
                }
            };

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!(error = %e, "Failed to listen for Ctrl-C");
                    return false;
                }
                info!("Received Ctrl-C");
            }
            _ = terminate.recv() => info!("Received SIGTERM"),
        }
        true
    });

    if signalled {
        cancel.cancel();
    }
}
