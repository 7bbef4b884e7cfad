//! TcpServer — accepting front end plus the connection registry
//!
//! The server lives on its base loop: the acceptor runs there, the registry
//! is only touched there, and worker loops from the pool each own the
//! connections handed to them. A connection's close request travels from
//! its owning loop back to the base loop for deregistration, then the final
//! teardown is queued back onto the owning loop.

use rivulet_core::{rerror, rinfo, rtrace};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::acceptor::Acceptor;
use crate::callbacks::{
    ConnectionCallback, MessageCallback, TcpConnectionRef, ThreadInitCallback,
    WriteCompleteCallback,
};
use crate::connection::TcpConnection;
use crate::event_loop::{EventLoop, LoopHandle};
use crate::inet_address::InetAddress;
use crate::loop_pool::EventLoopThreadPool;
use crate::socket::Socket;

pub struct TcpServer {
    base_handle: Arc<LoopHandle>,
    acceptor: Rc<Acceptor>,
    pool: EventLoopThreadPool,
    name: String,
    ip_port: String,
    started: AtomicBool,
    next_conn_id: AtomicU64,
    /// Live connections by name. Base-loop thread only.
    connections: RefCell<HashMap<String, TcpConnectionRef>>,
    connection_cb: RefCell<Option<ConnectionCallback>>,
    message_cb: RefCell<Option<MessageCallback>>,
    write_complete_cb: RefCell<Option<WriteCompleteCallback>>,
    thread_init_cb: RefCell<Option<ThreadInitCallback>>,
}

// Safety: the registry, the acceptor, the pool and the callback slots are
// only touched from the base loop's thread; configuration setters run on
// the constructing (base) thread before start. The Arc handle may still be
// cloned across threads so close notifications can marshal back in through
// the base loop's task queue.
unsafe impl Send for TcpServer {}
unsafe impl Sync for TcpServer {}

impl TcpServer {
    /// Create a server bound (not yet listening) on `listen_addr`. Must run
    /// on the thread of `base`.
    pub fn new(
        base: &Rc<EventLoop>,
        listen_addr: &InetAddress,
        name: impl Into<String>,
        reuse_port: bool,
    ) -> Arc<TcpServer> {
        let name = name.into();
        let acceptor = Acceptor::new(base, listen_addr, reuse_port);
        let ip_port = acceptor.local_addr().ip_port();
        let server = Arc::new(TcpServer {
            base_handle: base.handle(),
            acceptor,
            pool: EventLoopThreadPool::new(base.handle(), name.clone()),
            name,
            ip_port,
            started: AtomicBool::new(false),
            next_conn_id: AtomicU64::new(1),
            connections: RefCell::new(HashMap::new()),
            connection_cb: RefCell::new(None),
            message_cb: RefCell::new(None),
            write_complete_cb: RefCell::new(None),
            thread_init_cb: RefCell::new(None),
        });

        let weak = Arc::downgrade(&server);
        server
            .acceptor
            .set_new_connection_callback(Box::new(move |sock, peer| {
                if let Some(s) = weak.upgrade() {
                    s.new_connection(sock, peer);
                }
            }));
        server
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The actually bound listen address (resolves a port-0 bind).
    pub fn listen_addr(&self) -> InetAddress {
        self.acceptor.local_addr()
    }

    /// Number of worker loops; 0 keeps all connections on the base loop.
    /// Must be called before `start`.
    pub fn set_thread_num(&self, n: usize) {
        assert!(!self.started.load(Ordering::Acquire));
        self.pool.set_thread_num(n);
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.connection_cb.borrow_mut() = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.message_cb.borrow_mut() = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.write_complete_cb.borrow_mut() = Some(cb);
    }

    pub fn set_thread_init_callback(&self, cb: ThreadInitCallback) {
        *self.thread_init_cb.borrow_mut() = Some(cb);
    }

    /// Spin up the worker pool and begin listening. Safe to call more than
    /// once; only the first call acts.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        rinfo!("TcpServer [{}] starting on {}", self.name, self.ip_port);
        self.pool.start(self.thread_init_cb.borrow().clone());
        let server = self.clone();
        self.base_handle.run_in_loop(move || {
            server.acceptor.listen();
        });
    }

    /// Base-loop thread: register, wire and hand off an accepted socket.
    fn new_connection(self: &Arc<Self>, sock: Socket, peer_addr: InetAddress) {
        let id = self.next_conn_id.fetch_add(1, Ordering::AcqRel);
        let conn_name = format!("{}-{}#{}", self.name, self.ip_port, id);
        rinfo!(
            "TcpServer [{}] new connection [{}] from {}",
            self.name,
            conn_name,
            peer_addr
        );
        let local_addr = sock.local_addr().unwrap_or_else(|e| {
            rerror!("[{}] getsockname failed: {}", conn_name, e);
            InetAddress::any(0)
        });

        let handle = self.pool.next_loop();
        let conn = TcpConnection::new(handle.clone(), conn_name.clone(), sock, local_addr, peer_addr);
        self.connections.borrow_mut().insert(conn_name, conn.clone());

        if let Some(cb) = self.connection_cb.borrow().clone() {
            conn.set_connection_callback(cb);
        }
        if let Some(cb) = self.message_cb.borrow().clone() {
            conn.set_message_callback(cb);
        }
        if let Some(cb) = self.write_complete_cb.borrow().clone() {
            conn.set_write_complete_callback(cb);
        }
        let weak = Arc::downgrade(self);
        conn.set_close_callback(Arc::new(move |c| {
            if let Some(s) = weak.upgrade() {
                s.remove_connection(c);
            }
        }));

        let c = conn.clone();
        handle.run_in_loop(move || c.establish());
    }

    /// Called from a connection's owning loop; hops to the base loop.
    fn remove_connection(self: &Arc<Self>, conn: &TcpConnectionRef) {
        let server = self.clone();
        let conn = conn.clone();
        self.base_handle
            .run_in_loop(move || server.remove_connection_in_loop(&conn));
    }

    fn remove_connection_in_loop(&self, conn: &TcpConnectionRef) {
        rinfo!(
            "TcpServer [{}] removing connection [{}]",
            self.name,
            conn.name()
        );
        if self.connections.borrow_mut().remove(conn.name()).is_none() {
            rerror!(
                "TcpServer [{}] connection [{}] was not registered",
                self.name,
                conn.name()
            );
        }
        // Teardown always goes through the owning loop's queue so it never
        // runs inside the channel dispatch that triggered the close.
        let handle = conn.loop_handle().clone();
        let conn = conn.clone();
        handle.queue_in_loop(move || conn.destroy());
    }

    #[cfg(test)]
    fn connection_count(&self) -> usize {
        self.connections.borrow().len()
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        rtrace!("TcpServer::drop [{}]", self.name);
        for (_, conn) in self.connections.borrow_mut().drain() {
            let handle = conn.loop_handle().clone();
            handle.queue_in_loop(move || conn.destroy());
        }
        // Pool drop quits and joins the worker threads after the queued
        // teardowns have run.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoopConfig;
    use rivulet_core::timestamp::Timestamp;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn run_for(lp: &Rc<EventLoop>, ms: u64) {
        let h = lp.handle();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(ms));
            h.quit();
        });
        lp.run();
        t.join().unwrap();
    }

    #[test]
    fn test_echo_lifecycle() {
        let lp = EventLoop::with_config(LoopConfig::from_env().poll_timeout_ms(20));
        let server = TcpServer::new(&lp, &InetAddress::loopback(0), "echo", false);
        server.set_thread_num(1);

        let connects = Arc::new(AtomicUsize::new(0));
        let disconnects = Arc::new(AtomicUsize::new(0));
        let (co, di) = (connects.clone(), disconnects.clone());
        server.set_connection_callback(Arc::new(move |c: &TcpConnectionRef| {
            if c.connected() {
                co.fetch_add(1, Ordering::SeqCst);
            } else {
                di.fetch_add(1, Ordering::SeqCst);
            }
        }));
        server.set_message_callback(Arc::new(
            |c: &TcpConnectionRef, buf: &mut crate::buffer::Buffer, _: Timestamp| {
                let data = buf.retrieve_as_bytes(buf.readable());
                c.send(&data);
            },
        ));
        server.start();
        server.start(); // second start is a no-op
        let addr = server.listen_addr();

        let client = std::thread::spawn(move || {
            let mut stream = TcpStream::connect(("127.0.0.1", addr.port())).unwrap();
            stream.write_all(b"0123456789").unwrap();
            let mut echo = [0u8; 10];
            stream.read_exact(&mut echo).unwrap();
            assert_eq!(&echo, b"0123456789");
            // Half-close our write side; the server sees EOF and closes,
            // which we observe as EOF on the remaining read half.
            stream.shutdown(std::net::Shutdown::Write).unwrap();
            let mut rest = [0u8; 1];
            assert_eq!(stream.read(&mut rest).unwrap(), 0);
        });

        run_for(&lp, 400);
        client.join().unwrap();

        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn test_concurrent_clients_across_workers() {
        let lp = EventLoop::with_config(LoopConfig::from_env().poll_timeout_ms(20));
        let server = TcpServer::new(&lp, &InetAddress::loopback(0), "echo-multi", false);
        server.set_thread_num(2);

        let disconnects = Arc::new(AtomicUsize::new(0));
        let di = disconnects.clone();
        server.set_connection_callback(Arc::new(move |c: &TcpConnectionRef| {
            if !c.connected() {
                di.fetch_add(1, Ordering::SeqCst);
            }
        }));
        server.set_message_callback(Arc::new(
            |c: &TcpConnectionRef, buf: &mut crate::buffer::Buffer, _: Timestamp| {
                let data = buf.retrieve_as_bytes(buf.readable());
                c.send(&data);
            },
        ));
        server.start();
        let port = server.listen_addr().port();

        let mut clients = Vec::new();
        for i in 0..4u8 {
            clients.push(std::thread::spawn(move || {
                let payload = vec![b'a' + i; 64];
                let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
                stream.write_all(&payload).unwrap();
                let mut echo = vec![0u8; 64];
                stream.read_exact(&mut echo).unwrap();
                assert_eq!(echo, payload);
            }));
        }

        run_for(&lp, 500);
        for c in clients {
            c.join().unwrap();
        }
        assert_eq!(disconnects.load(Ordering::SeqCst), 4);
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn test_thread_init_callback_runs_per_worker() {
        let lp = EventLoop::with_config(LoopConfig::from_env().poll_timeout_ms(20));
        let server = TcpServer::new(&lp, &InetAddress::loopback(0), "init", false);
        server.set_thread_num(3);
        let inits = Arc::new(AtomicUsize::new(0));
        let n = inits.clone();
        server.set_thread_init_callback(Arc::new(move |_| {
            n.fetch_add(1, Ordering::SeqCst);
        }));
        server.start();
        run_for(&lp, 50);
        assert_eq!(inits.load(Ordering::SeqCst), 3);
    }
}
