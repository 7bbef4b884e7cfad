//! Loop configuration
//!
//! Compile-time defaults with runtime environment overrides, applied at
//! loop construction.
//!
//! # Environment variables (all optional)
//!
//! - `RVL_POLL_TIMEOUT_MS` - Max time one poll cycle blocks
//! - `RVL_EVENT_CAPACITY` - Initial kernel-event buffer size

use rivulet_core::env::env_get;

use crate::poller::PollerBackend;

/// Default poll timeout. Long enough to be cheap when idle, short enough
/// that housekeeping and liveness logging still happen without traffic.
pub const DEFAULT_POLL_TIMEOUT_MS: i32 = 10_000;

#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Max milliseconds one multiplexer wait may block.
    pub poll_timeout_ms: i32,
    /// Initial kernel-event buffer capacity (doubles under load).
    pub event_capacity: usize,
    /// Readiness backend. Chosen here, once, at construction.
    pub backend: PollerBackend,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl LoopConfig {
    /// Library defaults with environment overrides applied.
    pub fn from_env() -> Self {
        LoopConfig {
            poll_timeout_ms: env_get("RVL_POLL_TIMEOUT_MS", DEFAULT_POLL_TIMEOUT_MS),
            event_capacity: env_get(
                "RVL_EVENT_CAPACITY",
                crate::poller::epoll::DEFAULT_EVENT_CAPACITY,
            ),
            backend: PollerBackend::default(),
        }
    }

    pub fn poll_timeout_ms(mut self, ms: i32) -> Self {
        self.poll_timeout_ms = ms;
        self
    }

    pub fn event_capacity(mut self, cap: usize) -> Self {
        self.event_capacity = cap;
        self
    }

    pub fn backend(mut self, backend: PollerBackend) -> Self {
        self.backend = backend;
        self
    }
}
