//! Acceptor — turns listen-socket readiness into accepted connections
//!
//! Lives on the creating (base) loop. Failure to produce a bound listening
//! socket is fatal; accept failures are logged and the loop continues,
//! with descriptor exhaustion called out distinctly as a capacity signal.

use rivulet_core::error::NetError;
use rivulet_core::{rerror, rfatal, rtrace};
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::inet_address::InetAddress;
use crate::socket::Socket;

/// Hands off an accepted socket (already non-blocking/cloexec) and the
/// peer's address.
pub type NewConnectionCallback = Box<dyn FnMut(Socket, InetAddress)>;

pub struct Acceptor {
    socket: Socket,
    channel: Rc<Channel>,
    listening: Cell<bool>,
    new_connection_cb: RefCell<Option<NewConnectionCallback>>,
}

impl Acceptor {
    pub fn new(lp: &Rc<EventLoop>, listen_addr: &InetAddress, reuse_port: bool) -> Rc<Acceptor> {
        let socket = match Socket::new_nonblocking() {
            Ok(s) => s,
            Err(e) => rfatal!("listen socket create failed: {}", e),
        };
        socket.set_reuse_addr(true);
        socket.set_reuse_port(reuse_port);
        if let Err(e) = socket.bind(listen_addr) {
            rfatal!("bind {} failed: {}", listen_addr, e);
        }

        let channel = Channel::new(Rc::downgrade(lp), socket.fd());
        let acceptor = Rc::new(Acceptor {
            socket,
            channel,
            listening: Cell::new(false),
            new_connection_cb: RefCell::new(None),
        });

        let weak: Weak<Acceptor> = Rc::downgrade(&acceptor);
        acceptor.channel.set_read_callback(Box::new(move |_| {
            if let Some(a) = weak.upgrade() {
                a.handle_read();
            }
        }));
        acceptor
    }

    pub fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.new_connection_cb.borrow_mut() = Some(cb);
    }

    pub fn listening(&self) -> bool {
        self.listening.get()
    }

    /// The actually bound address (resolves a port-0 bind).
    pub fn local_addr(&self) -> InetAddress {
        self.socket
            .local_addr()
            .unwrap_or_else(|_| InetAddress::any(0))
    }

    /// Start listening and enable read interest. Runs on the owning loop.
    pub fn listen(&self) {
        self.listening.set(true);
        if let Err(e) = self.socket.listen() {
            rfatal!("listen failed: {}", e);
        }
        self.channel.enable_reading();
    }

    fn handle_read(&self) {
        match self.socket.accept() {
            Ok((sock, peer)) => {
                rtrace!("accepted fd {} from {}", sock.fd(), peer);
                let mut cb = self.new_connection_cb.borrow_mut();
                match cb.as_mut() {
                    Some(cb) => cb(sock, peer),
                    // No handler configured: drop (close) immediately so an
                    // unconsumed connection cannot pin a descriptor.
                    None => drop(sock),
                }
            }
            Err(e) => {
                rerror!("accept failed: {}", e);
                if e.raw_os() == Some(libc::EMFILE) {
                    rerror!("accept hit the open-descriptor limit");
                }
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.channel.disable_all();
        self.channel.remove();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoopConfig;

    #[test]
    fn test_unhandled_connection_is_closed() {
        let lp = EventLoop::with_config(LoopConfig::from_env().poll_timeout_ms(20));
        let acceptor = Acceptor::new(&lp, &InetAddress::loopback(0), false);
        // No new-connection callback installed on purpose
        acceptor.listen();
        let addr = acceptor.local_addr();

        let client = std::net::TcpStream::connect(("127.0.0.1", addr.port())).unwrap();

        // One short cycle accepts and closes the connection
        let h = lp.handle();
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(200));
            h.quit();
        });
        lp.run();

        client
            .set_read_timeout(Some(std::time::Duration::from_secs(2)))
            .unwrap();
        use std::io::Read;
        let mut buf = [0u8; 1];
        // Peer closed without sending anything
        assert_eq!((&client).read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_accept_delivers_socket_and_peer() {
        let lp = EventLoop::with_config(LoopConfig::from_env().poll_timeout_ms(20));
        let acceptor = Acceptor::new(&lp, &InetAddress::loopback(0), false);

        let seen: Rc<RefCell<Vec<InetAddress>>> = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        acceptor.set_new_connection_callback(Box::new(move |sock, peer| {
            assert!(sock.fd() >= 0);
            s.borrow_mut().push(peer);
        }));
        acceptor.listen();
        let addr = acceptor.local_addr();

        let _client = std::net::TcpStream::connect(("127.0.0.1", addr.port())).unwrap();

        let h = lp.handle();
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(200));
            h.quit();
        });
        lp.run();

        let seen = seen.borrow();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].ip().to_string(), "127.0.0.1");
    }
}
