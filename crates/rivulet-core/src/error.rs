//! Error types for the rivulet reactor

use core::fmt;

/// Result type for reactor operations
pub type NetResult<T> = Result<T, NetError>;

/// Errors that can occur in reactor operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetError {
    /// Raw OS error (errno)
    Os(i32),

    /// Address string could not be parsed
    BadAddress(String),

    /// Connection is not in a state that allows the operation
    Disconnected,
}

impl NetError {
    /// Capture the current errno as an `Os` error.
    ///
    /// Must be called immediately after the failing syscall, before any
    /// other libc call can clobber errno.
    #[inline]
    pub fn last_os() -> Self {
        NetError::Os(unsafe { *libc::__errno_location() })
    }

    /// The raw errno, if this is an OS error.
    #[inline]
    pub fn raw_os(&self) -> Option<i32> {
        match self {
            NetError::Os(code) => Some(*code),
            _ => None,
        }
    }
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetError::Os(code) => {
                write!(f, "os error {} ({})", code, errno_name(*code))
            }
            NetError::BadAddress(s) => write!(f, "bad address: {}", s),
            NetError::Disconnected => write!(f, "connection is disconnected"),
        }
    }
}

impl std::error::Error for NetError {}

impl From<std::io::Error> for NetError {
    fn from(e: std::io::Error) -> Self {
        NetError::Os(e.raw_os_error().unwrap_or(libc::EIO))
    }
}

/// Symbolic name for the errno values the reactor actually classifies.
fn errno_name(code: i32) -> &'static str {
    match code {
        libc::EAGAIN => "EAGAIN",
        libc::EINTR => "EINTR",
        libc::EPIPE => "EPIPE",
        libc::ECONNRESET => "ECONNRESET",
        libc::EMFILE => "EMFILE",
        libc::ENFILE => "ENFILE",
        libc::EBADF => "EBADF",
        libc::EINVAL => "EINVAL",
        libc::EADDRINUSE => "EADDRINUSE",
        libc::ENOENT => "ENOENT",
        _ => "?",
    }
}
