//! EventLoopThreadPool — connection distribution across sub-loops
//!
//! Owns N loop threads plus the creator's base loop. `next_loop()` hands
//! out sub-loops round-robin; with zero sub-loops everything runs on the
//! base loop. Configure the size before `start()`.

use rivulet_core::rinfo;
use std::cell::{Cell, RefCell};
use std::sync::Arc;

use crate::callbacks::ThreadInitCallback;
use crate::event_loop::{EventLoop, LoopHandle};
use crate::loop_thread::EventLoopThread;

pub struct EventLoopThreadPool {
    base: Arc<LoopHandle>,
    name: String,
    started: Cell<bool>,
    num_threads: Cell<usize>,
    next: Cell<usize>,
    threads: RefCell<Vec<EventLoopThread>>,
    loops: RefCell<Vec<Arc<LoopHandle>>>,
}

impl EventLoopThreadPool {
    pub fn new(base: Arc<LoopHandle>, name: impl Into<String>) -> Self {
        EventLoopThreadPool {
            base,
            name: name.into(),
            started: Cell::new(false),
            num_threads: Cell::new(0),
            next: Cell::new(0),
            threads: RefCell::new(Vec::new()),
            loops: RefCell::new(Vec::new()),
        }
    }

    /// Number of sub-loops; must be set before `start()`.
    pub fn set_thread_num(&self, n: usize) {
        assert!(!self.started.get(), "pool already started");
        self.num_threads.set(n);
    }

    /// Launch every sub-loop thread and collect its handle. With zero
    /// sub-loops the init callback runs on the base loop instead.
    pub fn start(&self, init_cb: Option<ThreadInitCallback>) {
        assert!(!self.started.get(), "pool started twice");
        self.started.set(true);

        let n = self.num_threads.get();
        rinfo!("thread pool '{}' starting {} sub-loops", self.name, n);
        for i in 0..n {
            let mut t = EventLoopThread::new(format!("{}{}", self.name, i), init_cb.clone());
            self.loops.borrow_mut().push(t.start_loop());
            self.threads.borrow_mut().push(t);
        }
        if n == 0 {
            if let (Some(cb), Some(lp)) = (init_cb, EventLoop::current()) {
                cb(&lp);
            }
        }
    }

    pub fn started(&self) -> bool {
        self.started.get()
    }

    /// Round-robin pick; the base loop when no sub-loops exist.
    pub fn next_loop(&self) -> Arc<LoopHandle> {
        let loops = self.loops.borrow();
        if loops.is_empty() {
            return self.base.clone();
        }
        let i = self.next.get();
        self.next.set((i + 1) % loops.len());
        loops[i].clone()
    }

    pub fn all_loops(&self) -> Vec<Arc<LoopHandle>> {
        let loops = self.loops.borrow();
        if loops.is_empty() {
            vec![self.base.clone()]
        } else {
            loops.clone()
        }
    }
}
