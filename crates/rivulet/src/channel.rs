//! Channel — binds one descriptor to an interest set and callback set
//!
//! A channel never owns its fd; the owner (acceptor or connection) does.
//! It is registered with exactly one loop's poller for its lifetime and all
//! of its methods run on that loop's thread.
//!
//! ## Lifetime tie
//!
//! A channel may be tied to its owner through a liveness flag: the owner
//! holds a [`TieGuard`] and the channel a [`TieFlag`] over the same
//! `Cell<bool>`. Dropping the guard clears the flag, and `handle_event`
//! skips every callback once the flag reads false. This closes the window
//! where the active-channel list still holds the channel for the rest of a
//! dispatch cycle after an earlier callback released the owner. The tie
//! must be installed before the owner's first possible event.

use rivulet_core::timestamp::Timestamp;
use rivulet_core::{rerror, rtrace};
use std::cell::{Cell, RefCell};
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};

use crate::event_loop::EventLoop;
use crate::poller::PollerState;

const NONE_EVENT: u32 = 0;
const READ_EVENT: u32 = (libc::EPOLLIN | libc::EPOLLPRI) as u32;
const WRITE_EVENT: u32 = libc::EPOLLOUT as u32;

pub type ReadCallback = Box<dyn FnMut(Timestamp)>;
pub type EventCallback = Box<dyn FnMut()>;

/// Owner-held half of the lifetime tie; dropping it clears the flag.
pub struct TieGuard(Rc<Cell<bool>>);

impl TieGuard {
    pub fn new() -> (TieGuard, TieFlag) {
        let cell = Rc::new(Cell::new(true));
        (TieGuard(cell.clone()), TieFlag(cell))
    }
}

impl Drop for TieGuard {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// Channel-held half of the lifetime tie.
#[derive(Clone)]
pub struct TieFlag(Rc<Cell<bool>>);

impl TieFlag {
    #[inline]
    pub fn alive(&self) -> bool {
        self.0.get()
    }
}

pub struct Channel {
    fd: RawFd,
    owner_loop: Weak<EventLoop>,
    interest: Cell<u32>,
    revents: Cell<u32>,
    poller_state: Cell<PollerState>,
    tie: RefCell<Option<TieFlag>>,
    read_cb: RefCell<Option<ReadCallback>>,
    write_cb: RefCell<Option<EventCallback>>,
    close_cb: RefCell<Option<EventCallback>>,
    error_cb: RefCell<Option<EventCallback>>,
}

impl Channel {
    pub fn new(owner_loop: Weak<EventLoop>, fd: RawFd) -> Rc<Channel> {
        Rc::new(Channel {
            fd,
            owner_loop,
            interest: Cell::new(NONE_EVENT),
            revents: Cell::new(0),
            poller_state: Cell::new(PollerState::New),
            tie: RefCell::new(None),
            read_cb: RefCell::new(None),
            write_cb: RefCell::new(None),
            close_cb: RefCell::new(None),
            error_cb: RefCell::new(None),
        })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn interest(&self) -> u32 {
        self.interest.get()
    }

    #[inline]
    pub fn is_none_interest(&self) -> bool {
        self.interest.get() == NONE_EVENT
    }

    #[inline]
    pub fn is_reading(&self) -> bool {
        self.interest.get() & READ_EVENT != 0
    }

    #[inline]
    pub fn is_writing(&self) -> bool {
        self.interest.get() & WRITE_EVENT != 0
    }

    pub(crate) fn set_revents(&self, revents: u32) {
        self.revents.set(revents);
    }

    /// Set interest bits without a live loop; poller unit tests only.
    #[cfg(test)]
    pub(crate) fn force_interest_for_test(&self, bits: u32) {
        self.interest.set(bits);
    }

    pub(crate) fn poller_state(&self) -> PollerState {
        self.poller_state.get()
    }

    pub(crate) fn set_poller_state(&self, state: PollerState) {
        self.poller_state.set(state);
    }

    pub fn set_read_callback(&self, cb: ReadCallback) {
        *self.read_cb.borrow_mut() = Some(cb);
    }

    pub fn set_write_callback(&self, cb: EventCallback) {
        *self.write_cb.borrow_mut() = Some(cb);
    }

    pub fn set_close_callback(&self, cb: EventCallback) {
        *self.close_cb.borrow_mut() = Some(cb);
    }

    pub fn set_error_callback(&self, cb: EventCallback) {
        *self.error_cb.borrow_mut() = Some(cb);
    }

    /// Install the lifetime tie. Must happen before the owner's first
    /// possible event and never after.
    pub fn tie(&self, flag: TieFlag) {
        *self.tie.borrow_mut() = Some(flag);
    }

    pub fn enable_reading(self: &Rc<Self>) {
        self.interest.set(self.interest.get() | READ_EVENT);
        self.update();
    }

    pub fn disable_reading(self: &Rc<Self>) {
        self.interest.set(self.interest.get() & !READ_EVENT);
        self.update();
    }

    pub fn enable_writing(self: &Rc<Self>) {
        self.interest.set(self.interest.get() | WRITE_EVENT);
        self.update();
    }

    pub fn disable_writing(self: &Rc<Self>) {
        self.interest.set(self.interest.get() & !WRITE_EVENT);
        self.update();
    }

    pub fn disable_all(self: &Rc<Self>) {
        self.interest.set(NONE_EVENT);
        self.update();
    }

    /// Reconcile current interest with the owning loop's poller.
    fn update(self: &Rc<Self>) {
        match self.owner_loop.upgrade() {
            Some(lp) => lp.update_channel(self),
            None => rerror!("channel fd {} updated after its loop was destroyed", self.fd),
        }
    }

    /// Unregister from the owning loop's poller. Required before the
    /// channel is destroyed.
    pub fn remove(self: &Rc<Self>) {
        match self.owner_loop.upgrade() {
            Some(lp) => lp.remove_channel(self),
            None => rtrace!("channel fd {} removed after its loop was destroyed", self.fd),
        }
    }

    /// Dispatch the last-observed readiness to the installed callbacks.
    ///
    /// Order matters: hang-up with no readable data goes to close before
    /// anything else so a half-closed peer is never read; errors surface
    /// before data handling.
    pub fn handle_event(self: &Rc<Self>, receive_time: Timestamp) {
        let tied = self.tie.borrow().clone();
        if let Some(flag) = tied {
            if !flag.alive() {
                rtrace!("channel fd {} owner gone, dropping event", self.fd);
                return;
            }
        }
        self.handle_event_with_guard(receive_time);
    }

    fn handle_event_with_guard(self: &Rc<Self>, receive_time: Timestamp) {
        let revents = self.revents.get();
        rtrace!("channel fd {} revents {:#x}", self.fd, revents);

        if revents & libc::EPOLLHUP as u32 != 0 && revents & libc::EPOLLIN as u32 == 0 {
            invoke_event(&self.close_cb);
            return;
        }
        if revents & libc::EPOLLERR as u32 != 0 {
            invoke_event(&self.error_cb);
        }
        if revents & (READ_EVENT | libc::EPOLLRDHUP as u32) != 0 {
            invoke_read(&self.read_cb, receive_time);
        }
        if revents & libc::EPOLLOUT as u32 != 0 {
            invoke_event(&self.write_cb);
        }
    }
}

// Callbacks are taken out of their slot for the duration of the call so a
// handler may freely mutate the channel (or replace the handler) without
// hitting a RefCell re-borrow. The old handler is only put back if the slot
// was not refilled in the meantime.
fn invoke_event(slot: &RefCell<Option<EventCallback>>) {
    let taken = slot.borrow_mut().take();
    if let Some(mut cb) = taken {
        cb();
        let mut s = slot.borrow_mut();
        if s.is_none() {
            *s = Some(cb);
        }
    }
}

fn invoke_read(slot: &RefCell<Option<ReadCallback>>, ts: Timestamp) {
    let taken = slot.borrow_mut().take();
    if let Some(mut cb) = taken {
        cb(ts);
        let mut s = slot.borrow_mut();
        if s.is_none() {
            *s = Some(cb);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A detached channel (dead loop weak) is enough to exercise dispatch.
    fn detached_channel() -> Rc<Channel> {
        Channel::new(Weak::new(), -1)
    }

    #[test]
    fn test_interest_bits() {
        let ch = detached_channel();
        assert!(ch.is_none_interest());
        ch.interest.set(READ_EVENT);
        assert!(ch.is_reading());
        assert!(!ch.is_writing());
        ch.interest.set(READ_EVENT | WRITE_EVENT);
        assert!(ch.is_writing());
    }

    #[test]
    fn test_hangup_without_data_skips_read() {
        let ch = detached_channel();
        let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

        let o = order.clone();
        ch.set_read_callback(Box::new(move |_| o.borrow_mut().push("read")));
        let o = order.clone();
        ch.set_close_callback(Box::new(move || o.borrow_mut().push("close")));

        ch.set_revents(libc::EPOLLHUP as u32);
        ch.handle_event(Timestamp::now());
        assert_eq!(*order.borrow(), vec!["close"]);
    }

    #[test]
    fn test_hangup_with_data_reads_first() {
        let ch = detached_channel();
        let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

        let o = order.clone();
        ch.set_read_callback(Box::new(move |_| o.borrow_mut().push("read")));
        let o = order.clone();
        ch.set_close_callback(Box::new(move || o.borrow_mut().push("close")));

        ch.set_revents((libc::EPOLLHUP | libc::EPOLLIN) as u32);
        ch.handle_event(Timestamp::now());
        // Readable data must be drained; close is driven by read() == 0
        assert_eq!(*order.borrow(), vec!["read"]);
    }

    #[test]
    fn test_error_before_read() {
        let ch = detached_channel();
        let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

        let o = order.clone();
        ch.set_error_callback(Box::new(move || o.borrow_mut().push("error")));
        let o = order.clone();
        ch.set_read_callback(Box::new(move |_| o.borrow_mut().push("read")));

        ch.set_revents((libc::EPOLLERR | libc::EPOLLIN) as u32);
        ch.handle_event(Timestamp::now());
        assert_eq!(*order.borrow(), vec!["error", "read"]);
    }

    #[test]
    fn test_dead_tie_suppresses_all_callbacks() {
        let ch = detached_channel();
        let fired = Rc::new(Cell::new(false));
        let f = fired.clone();
        ch.set_read_callback(Box::new(move |_| f.set(true)));

        let (guard, flag) = TieGuard::new();
        ch.tie(flag);
        ch.set_revents(libc::EPOLLIN as u32);

        ch.handle_event(Timestamp::now());
        assert!(fired.get());

        fired.set(false);
        drop(guard);
        ch.handle_event(Timestamp::now());
        assert!(!fired.get());
    }

    #[test]
    fn test_reentrant_callback_mutation() {
        let ch = detached_channel();
        let inner = ch.clone();
        // A handler that mutates the channel's own interest bits must not
        // deadlock or panic on re-borrow.
        ch.set_read_callback(Box::new(move |_| {
            inner.interest.set(WRITE_EVENT);
        }));
        ch.set_revents(libc::EPOLLIN as u32);
        ch.handle_event(Timestamp::now());
        assert!(ch.is_writing());
        // Handler was put back and can fire again
        ch.handle_event(Timestamp::now());
    }
}
