//! User-installable callback types
//!
//! Callbacks cross threads at connection handoff, so they are `Arc`-shared
//! and `Send + Sync`; they always *run* on the thread of the loop that owns
//! the connection.

use rivulet_core::timestamp::Timestamp;
use std::sync::Arc;

use crate::buffer::Buffer;
use crate::connection::TcpConnection;
use crate::event_loop::EventLoop;

/// Shared handle to a connection.
pub type TcpConnectionRef = Arc<TcpConnection>;

/// Connection established or torn down; distinguish via `connected()`.
pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionRef) + Send + Sync>;

/// Bytes arrived. The callback consumes (or deliberately retains) data in
/// the input buffer; the core does no framing.
pub type MessageCallback = Arc<dyn Fn(&TcpConnectionRef, &mut Buffer, Timestamp) + Send + Sync>;

/// Output buffer fully drained.
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionRef) + Send + Sync>;

/// Pending output crossed the high-water mark while ascending; the second
/// argument is the queued size at the crossing.
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionRef, usize) + Send + Sync>;

/// Internal: connection asks its server to forget it.
pub type CloseCallback = Arc<dyn Fn(&TcpConnectionRef) + Send + Sync>;

/// Runs once inside each freshly started loop thread, before the loop runs.
pub type ThreadInitCallback = Arc<dyn Fn(&EventLoop) + Send + Sync>;
