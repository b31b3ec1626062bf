//! Process-wide operation counters.
//!
//! Every counter is an independent atomic so the echo path never contends
//! on a lock. Increments are `Relaxed`; `snapshot` fences before reading.

use std::sync::atomic::{fence, AtomicU64, Ordering};
use tracing::info;

/// Counted events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    /// Receive calls on a connection.
    Recv,
    /// Send calls on a connection.
    Send,
    /// Connections shut down by their worker.
    Shutdown,
    /// Failed attempts to acquire a connection buffer.
    AllocErr,
    /// Receive calls that returned an error.
    RecvErr,
    /// Send calls that returned an error.
    SendErr,
    /// Failed accept attempts.
    AcceptErr,
    /// Connections that could not be turned into a work item.
    DispatchErr,
}

/// Instrumentation counters shared by every component.
#[derive(Debug, Default)]
pub struct Stats {
    recv: AtomicU64,
    send: AtomicU64,
    shutdown: AtomicU64,
    alloc_err: AtomicU64,
    recv_err: AtomicU64,
    send_err: AtomicU64,
    accept_err: AtomicU64,
    dispatch_err: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::Recv => &self.recv,
            Counter::Send => &self.send,
            Counter::Shutdown => &self.shutdown,
            Counter::AllocErr => &self.alloc_err,
            Counter::RecvErr => &self.recv_err,
            Counter::SendErr => &self.send_err,
            Counter::AcceptErr => &self.accept_err,
            Counter::DispatchErr => &self.dispatch_err,
        }
    }

    /// Record one occurrence of `counter`.
    #[inline]
    pub fn incr(&self, counter: Counter) {
        self.counter(counter).fetch_add(1, Ordering::Relaxed);
    }

    /// Current value of a single counter.
    pub fn get(&self, counter: Counter) -> u64 {
        self.counter(counter).load(Ordering::Relaxed)
    }

    /// Read all counters after a full fence.
    pub fn snapshot(&self) -> StatsSnapshot {
        fence(Ordering::SeqCst);
        StatsSnapshot {
            recv: self.recv.load(Ordering::Relaxed),
            send: self.send.load(Ordering::Relaxed),
            shutdown: self.shutdown.load(Ordering::Relaxed),
            alloc_err: self.alloc_err.load(Ordering::Relaxed),
            recv_err: self.recv_err.load(Ordering::Relaxed),
            send_err: self.send_err.load(Ordering::Relaxed),
            accept_err: self.accept_err.load(Ordering::Relaxed),
            dispatch_err: self.dispatch_err.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`Stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub recv: u64,
    pub send: u64,
    pub shutdown: u64,
    pub alloc_err: u64,
    pub recv_err: u64,
    pub send_err: u64,
    pub accept_err: u64,
    pub dispatch_err: u64,
}

impl StatsSnapshot {
    /// Sum of all error counters.
    pub fn errors(&self) -> u64 {
        self.alloc_err + self.recv_err + self.send_err + self.accept_err + self.dispatch_err
    }

    pub fn log(&self, stage: &str) {
        info!(
            stage,
            recv = self.recv,
            send = self.send,
            shutdown = self.shutdown,
            alloc_err = self.alloc_err,
            recv_err = self.recv_err,
            send_err = self.send_err,
            accept_err = self.accept_err,
            dispatch_err = self.dispatch_err,
            "Operation counters"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_counters_are_independent() {
        let stats = Stats::new();
        stats.incr(Counter::Recv);
        stats.incr(Counter::Recv);
        stats.incr(Counter::SendErr);

        let snap = stats.snapshot();
        assert_eq!(snap.recv, 2);
        assert_eq!(snap.send_err, 1);
        assert_eq!(snap.send, 0);
        assert_eq!(snap.errors(), 1);
        assert_eq!(stats.get(Counter::Recv), 2);
    }

    #[test]
    fn test_concurrent_increments() {
        let stats = Arc::new(Stats::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = Arc::clone(&stats);
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        stats.incr(Counter::Send);
                        stats.incr(Counter::Shutdown);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let snap = stats.snapshot();
        assert_eq!(snap.send, 80_000);
        assert_eq!(snap.shutdown, 80_000);
        assert_eq!(snap.recv, 0);
    }
}
