//! Cached kernel thread id
//!
//! Loop-affinity checks (`is_in_loop_thread`) run on every `run_in_loop`
//! call; `gettid(2)` is cached in a thread-local so the common case is a
//! single TLS load.

use std::cell::Cell;

thread_local! {
    static CACHED_TID: Cell<libc::pid_t> = const { Cell::new(0) };
}

/// Kernel tid of the calling thread.
#[inline]
pub fn tid() -> libc::pid_t {
    CACHED_TID.with(|c| {
        let mut t = c.get();
        if t == 0 {
            t = unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t };
            c.set(t);
        }
        t
    })
}
