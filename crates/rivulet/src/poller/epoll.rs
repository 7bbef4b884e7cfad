//! epoll(7)-backed readiness multiplexer
//!
//! The registry maps fd -> channel; the kernel event carries only the fd
//! and readiness is stamped back onto the channel at wake. The registry is
//! always a superset of the descriptors the kernel can report ready.

use rivulet_core::error::NetError;
use rivulet_core::timestamp::Timestamp;
use rivulet_core::{rerror, rfatal, rtrace, rwarn};
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};

use crate::channel::Channel;
use crate::poller::{Poller, PollerState};

/// Default initial kernel-event buffer size; doubled whenever a poll cycle
/// fills it completely.
pub const DEFAULT_EVENT_CAPACITY: usize = 16;

pub struct EpollPoller {
    epfd: RawFd,
    events: Vec<libc::epoll_event>,
    channels: HashMap<RawFd, Weak<Channel>>,
}

impl EpollPoller {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(event_capacity: usize) -> Self {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            rfatal!("epoll_create1 failed: {}", NetError::last_os());
        }
        EpollPoller {
            epfd,
            events: vec![libc::epoll_event { events: 0, u64: 0 }; event_capacity.max(1)],
            channels: HashMap::new(),
        }
    }

    fn fill_active(&self, num_events: usize, active: &mut Vec<Rc<Channel>>) {
        for ev in &self.events[..num_events] {
            let fd = ev.u64 as RawFd;
            let revents = ev.events;
            match self.channels.get(&fd).and_then(Weak::upgrade) {
                Some(ch) => {
                    ch.set_revents(revents);
                    active.push(ch);
                }
                // A delete can race with a concurrently closed descriptor;
                // a stale wake for it is not an error.
                None => rtrace!("stale readiness for fd {} ignored", fd),
            }
        }
    }

    fn ctl(&self, op: libc::c_int, channel: &Channel) {
        let mut ev = libc::epoll_event {
            events: channel.interest(),
            u64: channel.fd() as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, channel.fd(), &mut ev) } < 0 {
            let err = NetError::last_os();
            if op == libc::EPOLL_CTL_DEL {
                rerror!("epoll_ctl del failed for fd {}: {}", channel.fd(), err);
            } else {
                // add/mod failure means the registry and the kernel have
                // diverged; there is no way to resynchronize in-process.
                rfatal!(
                    "epoll_ctl op {} failed for fd {}: {}",
                    op,
                    channel.fd(),
                    err
                );
            }
        }
    }
}

impl Poller for EpollPoller {
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Rc<Channel>>) -> Timestamp {
        rtrace!("polling {} registered fds", self.channels.len());

        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms,
            )
        };
        let saved_errno = unsafe { *libc::__errno_location() };
        let now = Timestamp::now();

        if n > 0 {
            rtrace!("{} events happened", n);
            self.fill_active(n as usize, active);
            if n as usize == self.events.len() {
                // Full buffer suggests more were ready than we could see.
                let doubled = self.events.len() * 2;
                rwarn!("poll event buffer full, doubling to {}", doubled);
                self.events
                    .resize(doubled, libc::epoll_event { events: 0, u64: 0 });
            }
        } else if n == 0 {
            rtrace!("nothing happened before timeout");
        } else if saved_errno == libc::EINTR {
            rtrace!("poll interrupted by signal");
        } else {
            rerror!("epoll_wait failed: {}", NetError::Os(saved_errno));
        }
        now
    }

    fn update_channel(&mut self, channel: &Rc<Channel>) {
        let state = channel.poller_state();
        rtrace!(
            "update channel fd {} interest {:#x} state {:?}",
            channel.fd(),
            channel.interest(),
            state
        );
        match state {
            PollerState::New | PollerState::Detached => {
                if state == PollerState::New {
                    self.channels.insert(channel.fd(), Rc::downgrade(channel));
                }
                channel.set_poller_state(PollerState::Added);
                self.ctl(libc::EPOLL_CTL_ADD, channel);
            }
            PollerState::Added => {
                if channel.is_none_interest() {
                    self.ctl(libc::EPOLL_CTL_DEL, channel);
                    channel.set_poller_state(PollerState::Detached);
                } else {
                    self.ctl(libc::EPOLL_CTL_MOD, channel);
                }
            }
        }
    }

    fn remove_channel(&mut self, channel: &Channel) {
        rtrace!("remove channel fd {}", channel.fd());
        self.channels.remove(&channel.fd());
        if channel.poller_state() == PollerState::Added {
            self.ctl(libc::EPOLL_CTL_DEL, channel);
        }
        channel.set_poller_state(PollerState::New);
    }

    fn has_channel(&self, channel: &Channel) -> bool {
        match self.channels.get(&channel.fd()) {
            Some(weak) => weak.as_ptr() == channel as *const Channel,
            None => false,
        }
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        unsafe { libc::close(self.epfd) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel_for(fd: RawFd) -> Rc<Channel> {
        Channel::new(Weak::new(), fd)
    }

    fn eventfd() -> RawFd {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        assert!(fd >= 0);
        fd
    }

    #[test]
    fn test_registration_state_cycle() {
        let mut p = EpollPoller::with_capacity(4);
        let fd = eventfd();
        let ch = channel_for(fd);

        assert_eq!(ch.poller_state(), PollerState::New);
        assert!(!p.has_channel(&ch));

        // First registration: add
        ch.force_interest_for_test((libc::EPOLLIN | libc::EPOLLPRI) as u32);
        p.update_channel(&ch);
        assert_eq!(ch.poller_state(), PollerState::Added);
        assert!(p.has_channel(&ch));

        // Empty interest: kernel delete, registry entry stays
        ch.force_interest_for_test(0);
        p.update_channel(&ch);
        assert_eq!(ch.poller_state(), PollerState::Detached);
        assert!(p.has_channel(&ch));

        // Re-enable: re-add
        ch.force_interest_for_test((libc::EPOLLIN | libc::EPOLLPRI) as u32);
        p.update_channel(&ch);
        assert_eq!(ch.poller_state(), PollerState::Added);

        p.remove_channel(&ch);
        assert_eq!(ch.poller_state(), PollerState::New);
        assert!(!p.has_channel(&ch));

        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_poll_reports_ready_channel() {
        let mut p = EpollPoller::with_capacity(4);
        let fd = eventfd();
        let ch = channel_for(fd);
        ch.force_interest_for_test((libc::EPOLLIN | libc::EPOLLPRI) as u32);
        p.update_channel(&ch);

        // Not ready yet
        let mut active = Vec::new();
        p.poll(0, &mut active);
        assert!(active.is_empty());

        // Make it readable
        let one: u64 = 1;
        let n = unsafe {
            libc::write(fd, &one as *const u64 as *const libc::c_void, 8)
        };
        assert_eq!(n, 8);

        let ts = p.poll(100, &mut active);
        assert!(ts.valid());
        assert_eq!(active.len(), 1);
        assert!(Rc::ptr_eq(&active[0], &ch));

        p.remove_channel(&ch);
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_poll_timeout_empty() {
        let mut p = EpollPoller::with_capacity(4);
        let mut active = Vec::new();
        let ts = p.poll(0, &mut active);
        assert!(ts.valid());
        assert!(active.is_empty());
    }
}
