//! Non-blocking TCP networking on a one-loop-per-thread reactor
//!
//! Each [`EventLoop`] owns one thread and one readiness multiplexer; every
//! file descriptor belongs to exactly one loop and all of its callbacks run
//! on that loop's thread. Cross-thread work enters through a loop's
//! [`LoopHandle`] task queue, which wakes the loop via an eventfd.
//!
//! A [`TcpServer`] accepts on its base loop and spreads connections
//! round-robin over an [`EventLoopThreadPool`]. Per-connection I/O flows
//! through [`TcpConnection`] and its input/output [`Buffer`]s; user code
//! reacts through the callback types in [`callbacks`].
//!
//! ```no_run
//! use rivulet::{Buffer, EventLoop, InetAddress, TcpConnectionRef, TcpServer};
//! use std::sync::Arc;
//!
//! let lp = EventLoop::new();
//! let server = TcpServer::new(&lp, &InetAddress::any(7000), "echo", false);
//! server.set_message_callback(Arc::new(|conn: &TcpConnectionRef, buf: &mut Buffer, _when| {
//!     let data = buf.retrieve_as_bytes(buf.readable());
//!     conn.send(&data);
//! }));
//! server.start();
//! lp.run();
//! ```

pub mod acceptor;
pub mod buffer;
pub mod callbacks;
pub mod channel;
pub mod config;
pub mod connection;
pub mod event_loop;
pub mod inet_address;
pub mod loop_pool;
pub mod loop_thread;
pub mod poller;
pub mod server;
pub mod socket;

pub use buffer::Buffer;
pub use callbacks::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnectionRef,
    ThreadInitCallback, WriteCompleteCallback,
};
pub use config::LoopConfig;
pub use connection::{ConnState, TcpConnection};
pub use event_loop::{EventLoop, LoopHandle};
pub use inet_address::InetAddress;
pub use loop_pool::EventLoopThreadPool;
pub use loop_thread::EventLoopThread;
pub use server::TcpServer;
pub use socket::Socket;
