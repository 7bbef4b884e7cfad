//! Scoped ownership of a socket descriptor
//!
//! A `Socket` owns its fd: it closes on drop and can only be moved, never
//! copied, so a descriptor has exactly one owner at any time. Accepted
//! connections travel through the acceptor callback as `Socket` values for
//! the same reason.

use rivulet_core::error::{NetError, NetResult};
use rivulet_core::rerror;
use std::os::unix::io::RawFd;

use crate::inet_address::InetAddress;

const LISTEN_BACKLOG: libc::c_int = 4096;

pub struct Socket {
    fd: RawFd,
}

impl Socket {
    /// Fresh non-blocking, close-on-exec IPv4 stream socket.
    pub fn new_nonblocking() -> NetResult<Socket> {
        let fd = unsafe {
            libc::socket(
                libc::AF_INET,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if fd < 0 {
            return Err(NetError::last_os());
        }
        Ok(Socket { fd })
    }

    /// Take ownership of an existing descriptor.
    pub fn from_raw(fd: RawFd) -> Socket {
        Socket { fd }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn bind(&self, addr: &InetAddress) -> NetResult<()> {
        let ret = unsafe {
            libc::bind(
                self.fd,
                addr.raw() as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(NetError::last_os());
        }
        Ok(())
    }

    pub fn listen(&self) -> NetResult<()> {
        let ret = unsafe { libc::listen(self.fd, LISTEN_BACKLOG) };
        if ret != 0 {
            return Err(NetError::last_os());
        }
        Ok(())
    }

    /// Accept one pending connection; the new descriptor is already
    /// non-blocking and close-on-exec.
    pub fn accept(&self) -> NetResult<(Socket, InetAddress)> {
        let mut peer: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let connfd = unsafe {
            libc::accept4(
                self.fd,
                &mut peer as *mut libc::sockaddr_in as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if connfd < 0 {
            return Err(NetError::last_os());
        }
        Ok((Socket::from_raw(connfd), InetAddress::from_raw(peer)))
    }

    /// Close the write half; the read half stays open so in-flight data
    /// from the peer can still be drained.
    pub fn shutdown_write(&self) {
        if unsafe { libc::shutdown(self.fd, libc::SHUT_WR) } < 0 {
            rerror!("shutdown_write failed on fd {}: {}", self.fd, NetError::last_os());
        }
    }

    pub fn set_reuse_addr(&self, on: bool) {
        self.set_int_opt(libc::SOL_SOCKET, libc::SO_REUSEADDR, on);
    }

    pub fn set_reuse_port(&self, on: bool) {
        self.set_int_opt(libc::SOL_SOCKET, libc::SO_REUSEPORT, on);
    }

    pub fn set_keep_alive(&self, on: bool) {
        self.set_int_opt(libc::SOL_SOCKET, libc::SO_KEEPALIVE, on);
    }

    pub fn set_tcp_no_delay(&self, on: bool) {
        self.set_int_opt(libc::IPPROTO_TCP, libc::TCP_NODELAY, on);
    }

    fn set_int_opt(&self, level: libc::c_int, opt: libc::c_int, on: bool) {
        let val: libc::c_int = if on { 1 } else { 0 };
        let ret = unsafe {
            libc::setsockopt(
                self.fd,
                level,
                opt,
                &val as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            rerror!(
                "setsockopt({}, {}) failed on fd {}: {}",
                level,
                opt,
                self.fd,
                NetError::last_os()
            );
        }
    }

    pub fn local_addr(&self) -> NetResult<InetAddress> {
        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockname(
                self.fd,
                &mut addr as *mut libc::sockaddr_in as *mut libc::sockaddr,
                &mut len,
            )
        };
        if ret != 0 {
            return Err(NetError::last_os());
        }
        Ok(InetAddress::from_raw(addr))
    }

    pub fn peer_addr(&self) -> NetResult<InetAddress> {
        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let ret = unsafe {
            libc::getpeername(
                self.fd,
                &mut addr as *mut libc::sockaddr_in as *mut libc::sockaddr,
                &mut len,
            )
        };
        if ret != 0 {
            return Err(NetError::last_os());
        }
        Ok(InetAddress::from_raw(addr))
    }

    /// Pending socket error (`SO_ERROR`), clearing it in the kernel.
    pub fn so_error(&self) -> i32 {
        let mut optval: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut optval as *mut libc::c_int as *mut libc::c_void,
                &mut len,
            )
        };
        if ret < 0 {
            unsafe { *libc::__errno_location() }
        } else {
            optval
        }
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
            self.fd = -1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_listen_and_local_addr() {
        let s = Socket::new_nonblocking().unwrap();
        s.set_reuse_addr(true);
        s.bind(&InetAddress::loopback(0)).unwrap();
        s.listen().unwrap();
        let local = s.local_addr().unwrap();
        assert_eq!(local.ip().to_string(), "127.0.0.1");
        assert_ne!(local.port(), 0);
    }

    #[test]
    fn test_accept_would_block() {
        let s = Socket::new_nonblocking().unwrap();
        s.bind(&InetAddress::loopback(0)).unwrap();
        s.listen().unwrap();
        match s.accept() {
            Err(e) => assert_eq!(e.raw_os(), Some(libc::EAGAIN)),
            Ok(_) => panic!("accept on an idle listener should not succeed"),
        }
    }

    #[test]
    fn test_drop_closes_fd() {
        let raw;
        {
            let s = Socket::new_nonblocking().unwrap();
            raw = s.fd();
        }
        // fd is gone: fcntl should fail with EBADF
        let ret = unsafe { libc::fcntl(raw, libc::F_GETFD) };
        assert_eq!(ret, -1);
    }

    #[test]
    fn test_so_error_clean_socket() {
        let s = Socket::new_nonblocking().unwrap();
        assert_eq!(s.so_error(), 0);
    }
}
