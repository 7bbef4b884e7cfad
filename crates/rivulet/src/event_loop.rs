//! EventLoop — the poll/dispatch/pending-task cycle
//!
//! One loop per thread: a loop is created on the thread that will run it,
//! registers itself in a thread-local on construction, and only that thread
//! may drive it. The cross-thread half is [`LoopHandle`]: a mutex-guarded
//! task queue plus an eventfd the other threads write to interrupt a
//! blocking poll. Everything else about the loop is single-threaded by
//! construction.

use rivulet_core::current_thread;
use rivulet_core::error::NetError;
use rivulet_core::timestamp::Timestamp;
use rivulet_core::{rdebug, rerror, rfatal, rinfo};
use std::cell::{Cell, RefCell};
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::channel::Channel;
use crate::config::LoopConfig;
use crate::poller::Poller;

/// A deferred unit of work bound for a specific loop's thread.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    // One-loop-per-thread registry. Set on loop construction, cleared on
    // destruction; a second construction on the same thread is fatal.
    static CURRENT_LOOP: RefCell<Weak<EventLoop>> = const { RefCell::new(Weak::new()) };
}

fn create_eventfd() -> RawFd {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        rfatal!("eventfd failed: {}", NetError::last_os());
    }
    fd
}

/// The `Send + Sync` half of a loop, shared across threads.
///
/// Owns the wakeup eventfd and the pending-task queue. Dropping the last
/// handle closes the eventfd; handles held by remote threads keep it valid
/// for late wakeups after the loop itself has stopped.
pub struct LoopHandle {
    wakeup_fd: RawFd,
    owner_tid: libc::pid_t,
    quit: AtomicBool,
    /// True while the owner is draining the task queue; a task queued
    /// during the drain must trigger a wakeup or it would sit unseen
    /// through the next full poll timeout.
    draining: AtomicBool,
    tasks: Mutex<Vec<Task>>,
}

impl LoopHandle {
    fn new(wakeup_fd: RawFd, owner_tid: libc::pid_t) -> Self {
        LoopHandle {
            wakeup_fd,
            owner_tid,
            quit: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    #[inline]
    pub fn is_in_loop_thread(&self) -> bool {
        current_thread::tid() == self.owner_tid
    }

    /// Run `task` on the owning thread: immediately when already there,
    /// queued and signalled otherwise.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Queue `task` for the next drain, waking the loop when the caller is
    /// foreign or the owner is mid-drain.
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        {
            let mut tasks = self.tasks.lock().unwrap();
            tasks.push(Box::new(task));
        }
        if !self.is_in_loop_thread() || self.draining.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    /// Request loop exit. Takes effect at the top of the next cycle; a
    /// foreign caller interrupts any in-flight poll wait.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    #[inline]
    pub fn quit_requested(&self) -> bool {
        self.quit.load(Ordering::Acquire)
    }

    /// Interrupt a blocking poll. The 8-byte value is immaterial; only the
    /// readability edge matters.
    pub fn wakeup(&self) {
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.wakeup_fd,
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n < 0 {
            let err = NetError::last_os();
            // EAGAIN means the counter is saturated: a wakeup is already
            // pending, which is all we wanted.
            if err.raw_os() != Some(libc::EAGAIN) {
                rerror!("wakeup write failed: {}", err);
            }
        } else if n != 8 {
            rerror!("wakeup wrote {} bytes instead of 8", n);
        }
    }

    fn drain_wakeup(&self) {
        let mut one: u64 = 0;
        let n = unsafe {
            libc::read(
                self.wakeup_fd,
                &mut one as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n != 8 {
            rerror!("wakeup read returned {} bytes instead of 8", n);
        }
    }

    /// Swap the queue empty under the lock and run the tasks outside it,
    /// so a task enqueueing further tasks lands in the next drain instead
    /// of deadlocking or extending this one unboundedly.
    fn run_pending(&self) {
        self.draining.store(true, Ordering::Release);
        let tasks = {
            let mut pending = self.tasks.lock().unwrap();
            std::mem::take(&mut *pending)
        };
        for task in tasks {
            task();
        }
        self.draining.store(false, Ordering::Release);
    }
}

impl Drop for LoopHandle {
    fn drop(&mut self) {
        unsafe { libc::close(self.wakeup_fd) };
    }
}

pub struct EventLoop {
    handle: Arc<LoopHandle>,
    poller: RefCell<Box<dyn Poller>>,
    poll_timeout_ms: i32,
    /// Channels reported ready by the last poll; rebuilt every cycle.
    active: RefCell<Vec<Rc<Channel>>>,
    looping: Cell<bool>,
    poll_return_time: Cell<Timestamp>,
    wakeup_channel: RefCell<Option<Rc<Channel>>>,
}

impl EventLoop {
    /// Create a loop on the calling thread with default configuration.
    pub fn new() -> Rc<EventLoop> {
        Self::with_config(LoopConfig::default())
    }

    pub fn with_config(config: LoopConfig) -> Rc<EventLoop> {
        let tid = current_thread::tid();
        let already = CURRENT_LOOP.with(|c| c.borrow().upgrade().is_some());
        if already {
            rfatal!("another EventLoop already exists in thread {}", tid);
        }

        let wakeup_fd = create_eventfd();
        let handle = Arc::new(LoopHandle::new(wakeup_fd, tid));

        let lp = Rc::new(EventLoop {
            handle: handle.clone(),
            poller: RefCell::new(config.backend.create(config.event_capacity)),
            poll_timeout_ms: config.poll_timeout_ms,
            active: RefCell::new(Vec::new()),
            looping: Cell::new(false),
            poll_return_time: Cell::new(Timestamp::invalid()),
            wakeup_channel: RefCell::new(None),
        });

        // The wakeup eventfd is just another channel on this loop.
        let ch = Channel::new(Rc::downgrade(&lp), wakeup_fd);
        let h = handle;
        ch.set_read_callback(Box::new(move |_| h.drain_wakeup()));
        ch.enable_reading();
        *lp.wakeup_channel.borrow_mut() = Some(ch);

        CURRENT_LOOP.with(|c| *c.borrow_mut() = Rc::downgrade(&lp));
        rdebug!("EventLoop created in thread {}", tid);
        lp
    }

    /// The loop registered on the calling thread, if any.
    pub fn current() -> Option<Rc<EventLoop>> {
        CURRENT_LOOP.with(|c| c.borrow().upgrade())
    }

    /// The shareable cross-thread half of this loop.
    pub fn handle(&self) -> Arc<LoopHandle> {
        self.handle.clone()
    }

    #[inline]
    pub fn is_in_loop_thread(&self) -> bool {
        self.handle.is_in_loop_thread()
    }

    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            rfatal!(
                "EventLoop owned by thread {} driven from thread {}",
                self.handle.owner_tid,
                current_thread::tid()
            );
        }
    }

    /// Wall-clock instant the last poll woke up.
    pub fn poll_return_time(&self) -> Timestamp {
        self.poll_return_time.get()
    }

    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.handle.run_in_loop(task);
    }

    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.handle.queue_in_loop(task);
    }

    pub fn quit(&self) {
        self.handle.quit();
    }

    /// Drive the loop until `quit()`. Only the owning thread may call this,
    /// and only once at a time.
    pub fn run(&self) {
        self.assert_in_loop_thread();
        if self.looping.get() {
            rfatal!("EventLoop::run called re-entrantly");
        }
        self.looping.set(true);
        self.handle.quit.store(false, Ordering::Release);
        rinfo!("EventLoop start looping in thread {}", self.handle.owner_tid);

        while !self.handle.quit_requested() {
            // Reuse the active list's allocation cycle over cycle.
            let mut active = std::mem::take(&mut *self.active.borrow_mut());
            active.clear();

            let ts = self
                .poller
                .borrow_mut()
                .poll(self.poll_timeout_ms, &mut active);
            self.poll_return_time.set(ts);

            for channel in &active {
                channel.handle_event(ts);
            }
            *self.active.borrow_mut() = active;

            self.handle.run_pending();
        }

        rinfo!("EventLoop stop looping in thread {}", self.handle.owner_tid);
        self.looping.set(false);
    }

    pub(crate) fn update_channel(&self, channel: &Rc<Channel>) {
        self.assert_in_loop_thread();
        self.poller.borrow_mut().update_channel(channel);
    }

    pub(crate) fn remove_channel(&self, channel: &Rc<Channel>) {
        self.assert_in_loop_thread();
        self.poller.borrow_mut().remove_channel(channel);
    }

    pub fn has_channel(&self, channel: &Rc<Channel>) -> bool {
        self.assert_in_loop_thread();
        self.poller.borrow().has_channel(channel)
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        if let Some(ch) = self.wakeup_channel.borrow_mut().take() {
            // The loop is going away; unregister directly rather than via
            // the (now unupgradeable) weak back-reference.
            self.poller.borrow_mut().remove_channel(&ch);
        }
        CURRENT_LOOP.with(|c| *c.borrow_mut() = Weak::new());
        rdebug!("EventLoop destroyed in thread {}", self.handle.owner_tid);
    }
}
