//! Process-wide service state shared by every component.

use crate::config::{Config, MAX_ALLOC_BACKOFF};
use crate::runtime::buffer::BufferPool;
use crate::runtime::registry::WorkRegistry;
use crate::stats::Stats;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How a worker retries when the buffer pool is exhausted.
#[derive(Debug, Clone, Copy)]
pub struct AllocPolicy {
    /// Failed attempts tolerated before the connection is rejected.
    pub retries: u32,
    /// Sleep after the first failure; doubled on each further failure.
    pub initial_backoff: Duration,
    /// Upper bound for a single sleep.
    pub max_backoff: Duration,
}

impl AllocPolicy {
    /// Backoff to apply after `attempt` failures (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for AllocPolicy {
    fn default() -> Self {
        Self {
            retries: 16,
            initial_backoff: Duration::from_millis(1),
            max_backoff: MAX_ALLOC_BACKOFF,
        }
    }
}

/// State shared between the accept loop, the workers and the coordinator.
pub struct ServiceState {
    stopping: AtomicBool,
    pub registry: WorkRegistry,
    pub buffers: Arc<BufferPool>,
    pub stats: Stats,
    pub alloc_policy: AllocPolicy,
}

impl ServiceState {
    pub fn new(max_items: usize, buffers: Arc<BufferPool>, alloc_policy: AllocPolicy) -> Arc<Self> {
        Arc::new(Self {
            stopping: AtomicBool::new(false),
            registry: WorkRegistry::new(max_items),
            buffers,
            stats: Stats::new(),
            alloc_policy,
        })
    }

    pub fn from_config(config: &Config) -> Arc<Self> {
        Self::new(
            config.max_connections,
            BufferPool::new(config.buffer_pool, config.buffer_size),
            AllocPolicy {
                retries: config.alloc_retries,
                initial_backoff: config.alloc_backoff,
                max_backoff: MAX_ALLOC_BACKOFF,
            },
        )
    }

    /// Whether shutdown has begun.
    #[inline]
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Flip the stopping flag. Only the shutdown coordinator calls this.
    pub(crate) fn begin_stopping(&self) {
        self.stopping.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = AllocPolicy {
            retries: 10,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(10));
        assert_eq!(policy.backoff(2), Duration::from_millis(20));
        assert_eq!(policy.backoff(3), Duration::from_millis(40));
        assert_eq!(policy.backoff(4), Duration::from_millis(50));
        assert_eq!(policy.backoff(64), Duration::from_millis(50));
    }

    #[test]
    fn test_stopping_flag() {
        let state = ServiceState::from_config(&Config::default());
        assert!(!state.is_stopping());
        state.begin_stopping();
        assert!(state.is_stopping());
        assert!(state.registry.is_empty());
    }
}
