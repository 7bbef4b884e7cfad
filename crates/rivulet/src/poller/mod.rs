//! Readiness multiplexer
//!
//! `Poller` is the abstract contract; `EpollPoller` is the one concrete
//! backend. Backend choice is an explicit configuration value decided at
//! loop construction, not an environment probe.

use rivulet_core::timestamp::Timestamp;
use std::rc::Rc;

use crate::channel::Channel;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub mod epoll;
        pub use epoll::EpollPoller;
    } else {
        compile_error!("rivulet requires an epoll-capable target");
    }
}

/// Registration state of a channel within its poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    /// Never registered with the OS readiness set.
    New,
    /// Live in the OS readiness set.
    Added,
    /// Was registered, then lost all interest; still in the registry map
    /// but deleted from the OS set.
    Detached,
}

pub trait Poller {
    /// Block until at least one registered descriptor is ready or the
    /// timeout elapses. Ready channels are pushed onto `active` with their
    /// readiness bitmask already stamped. Returns the wake time.
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Rc<Channel>>) -> Timestamp;

    /// Reconcile a channel's interest with the OS registration.
    fn update_channel(&mut self, channel: &Rc<Channel>);

    /// Drop a channel from the registry (and the OS set if still live).
    fn remove_channel(&mut self, channel: &Channel);

    fn has_channel(&self, channel: &Channel) -> bool;
}

/// Which multiplexer implementation a loop uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PollerBackend {
    #[default]
    Epoll,
}

impl PollerBackend {
    pub(crate) fn create(self, event_capacity: usize) -> Box<dyn Poller> {
        match self {
            PollerBackend::Epoll => Box::new(EpollPoller::with_capacity(event_capacity)),
        }
    }
}
