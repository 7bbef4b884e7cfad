//! EventLoopThread — an OS thread hosting exactly one loop
//!
//! The loop is constructed inside the new thread (one loop per thread is
//! enforced by the loop's own thread-local registry); its shareable handle
//! is published back to the creator through a mutex/condvar pair.

use rivulet_core::rerror;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crate::callbacks::ThreadInitCallback;
use crate::config::LoopConfig;
use crate::event_loop::{EventLoop, LoopHandle};

pub struct EventLoopThread {
    name: String,
    config: LoopConfig,
    init_cb: Option<ThreadInitCallback>,
    thread: Option<thread::JoinHandle<()>>,
    handle: Option<Arc<LoopHandle>>,
}

impl EventLoopThread {
    pub fn new(name: impl Into<String>, init_cb: Option<ThreadInitCallback>) -> Self {
        Self::with_config(name, init_cb, LoopConfig::default())
    }

    pub fn with_config(
        name: impl Into<String>,
        init_cb: Option<ThreadInitCallback>,
        config: LoopConfig,
    ) -> Self {
        EventLoopThread {
            name: name.into(),
            config,
            init_cb,
            thread: None,
            handle: None,
        }
    }

    /// Spawn the thread and block until its loop has been constructed and
    /// published. Returns the loop's cross-thread handle.
    pub fn start_loop(&mut self) -> Arc<LoopHandle> {
        assert!(self.thread.is_none(), "loop thread started twice");

        let published: Arc<(Mutex<Option<Arc<LoopHandle>>>, Condvar)> =
            Arc::new((Mutex::new(None), Condvar::new()));
        let publisher = published.clone();
        let init_cb = self.init_cb.clone();
        let config = self.config.clone();

        let thread = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let lp = EventLoop::with_config(config);
                if let Some(cb) = init_cb {
                    cb(&lp);
                }
                {
                    let (slot, cond) = &*publisher;
                    *slot.lock().unwrap() = Some(lp.handle());
                    cond.notify_one();
                }
                lp.run();
                // Loop (and its thread-local registration) drop here.
            })
            .expect("failed to spawn event loop thread");
        self.thread = Some(thread);

        let (slot, cond) = &*published;
        let mut guard = slot.lock().unwrap();
        while guard.is_none() {
            guard = cond.wait(guard).unwrap();
        }
        let handle = guard.take().unwrap();
        self.handle = Some(handle.clone());
        handle
    }

    pub fn handle(&self) -> Option<Arc<LoopHandle>> {
        self.handle.clone()
    }
}

impl Drop for EventLoopThread {
    // No loop outlives its owning thread: request quit, then join.
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.quit();
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                rerror!("event loop thread '{}' panicked", self.name);
            }
        }
    }
}
