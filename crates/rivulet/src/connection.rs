//! TcpConnection — the send/receive/shutdown state machine
//!
//! A connection is created on the accepting (base) thread, then handed to
//! its owning loop and activated there. After that handoff every mutation
//! happens on the owning loop's thread; foreign callers (send, shutdown)
//! are marshalled in through the loop handle.
//!
//! Backpressure strategy: attempt one direct write, buffer the remainder,
//! rely on the next writable notification. Short results are never retried
//! inline.

use rivulet_core::error::NetError;
use rivulet_core::timestamp::Timestamp;
use rivulet_core::{rdebug, rerror, rinfo, rtrace};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::buffer::Buffer;
use crate::callbacks::{
    CloseCallback, ConnectionCallback, HighWaterMarkCallback, MessageCallback,
    TcpConnectionRef, WriteCompleteCallback,
};
use crate::channel::{Channel, TieGuard};
use crate::event_loop::{EventLoop, LoopHandle};
use crate::inet_address::InetAddress;
use crate::socket::Socket;

/// Default pending-output threshold for the high-water-mark callback.
pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl ConnState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnState::Connecting,
            1 => ConnState::Connected,
            2 => ConnState::Disconnecting,
            _ => ConnState::Disconnected,
        }
    }
}

pub struct TcpConnection {
    handle: Arc<LoopHandle>,
    name: String,
    state: AtomicU8,
    socket: Socket,
    /// Created on the owning loop at establish, None before that.
    channel: RefCell<Option<Rc<Channel>>>,
    /// Owner half of the channel's liveness tie.
    tie: RefCell<Option<TieGuard>>,
    local_addr: InetAddress,
    peer_addr: InetAddress,
    input: RefCell<Buffer>,
    output: RefCell<Buffer>,
    high_water_mark: AtomicUsize,
    /// Write errnos treated as peer faults (drop pending data, close).
    fault_errnos: RefCell<Vec<i32>>,
    connection_cb: RefCell<Option<ConnectionCallback>>,
    message_cb: RefCell<Option<MessageCallback>>,
    write_complete_cb: RefCell<Option<WriteCompleteCallback>>,
    high_water_mark_cb: RefCell<Option<HighWaterMarkCallback>>,
    close_cb: RefCell<Option<CloseCallback>>,
}

// Safety: after construction the connection is handed to exactly one loop
// and every non-atomic field (buffers, channel, tie, callback slots) is
// only touched by that loop's thread. Callback slots are filled by the
// server on the creating thread strictly before the activation task is
// queued, which forms a happens-before edge via the task-queue mutex.
// State and high-water mark are atomics so foreign threads may read them.
unsafe impl Send for TcpConnection {}
unsafe impl Sync for TcpConnection {}

impl TcpConnection {
    pub fn new(
        handle: Arc<LoopHandle>,
        name: String,
        socket: Socket,
        local_addr: InetAddress,
        peer_addr: InetAddress,
    ) -> TcpConnectionRef {
        socket.set_keep_alive(true);
        rdebug!("TcpConnection::new [{}] fd {}", name, socket.fd());
        Arc::new(TcpConnection {
            handle,
            name,
            state: AtomicU8::new(ConnState::Connecting as u8),
            socket,
            channel: RefCell::new(None),
            tie: RefCell::new(None),
            local_addr,
            peer_addr,
            input: RefCell::new(Buffer::new()),
            output: RefCell::new(Buffer::new()),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            fault_errnos: RefCell::new(vec![libc::EPIPE, libc::ECONNRESET]),
            connection_cb: RefCell::new(None),
            message_cb: RefCell::new(None),
            write_complete_cb: RefCell::new(None),
            high_water_mark_cb: RefCell::new(None),
            close_cb: RefCell::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> InetAddress {
        self.local_addr
    }

    pub fn peer_addr(&self) -> InetAddress {
        self.peer_addr
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, s: ConnState) {
        self.state.store(s as u8, Ordering::Release);
    }

    pub fn connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    /// The loop this connection is bound to.
    pub fn loop_handle(&self) -> &Arc<LoopHandle> {
        &self.handle
    }

    pub fn set_tcp_no_delay(&self, on: bool) {
        self.socket.set_tcp_no_delay(on);
    }

    pub fn set_high_water_mark(&self, bytes: usize) {
        self.high_water_mark.store(bytes, Ordering::Release);
    }

    /// Override which write errnos count as peer faults. Set before
    /// activation; defaults to `EPIPE` and `ECONNRESET`.
    pub fn set_fault_errnos(&self, errnos: Vec<i32>) {
        *self.fault_errnos.borrow_mut() = errnos;
    }

    // Callback installers; the server fills these before activation.
    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.connection_cb.borrow_mut() = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.message_cb.borrow_mut() = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.write_complete_cb.borrow_mut() = Some(cb);
    }

    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback) {
        *self.high_water_mark_cb.borrow_mut() = Some(cb);
    }

    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        *self.close_cb.borrow_mut() = Some(cb);
    }

    fn channel(&self) -> Option<Rc<Channel>> {
        self.channel.borrow().clone()
    }

    /// Send bytes, marshalling to the owning thread when called from
    /// elsewhere. Silently ignored unless currently Connected.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if self.state() != ConnState::Connected {
            return;
        }
        if self.handle.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let owned = data.to_vec();
            let conn = self.clone();
            self.handle.queue_in_loop(move || conn.send_in_loop(&owned));
        }
    }

    /// One direct write attempt, remainder buffered under write interest.
    fn send_in_loop(self: &Arc<Self>, data: &[u8]) {
        if self.state() == ConnState::Disconnected {
            rerror!("[{}] {}, give up writing", self.name, NetError::Disconnected);
            return;
        }
        let channel = match self.channel() {
            Some(ch) => ch,
            None => {
                rerror!("[{}] send before connection was established", self.name);
                return;
            }
        };

        let mut nwrote = 0usize;
        let mut remaining = data.len();
        let mut fault = false;

        // Direct write is only correct while nothing is queued ahead of us.
        if !channel.is_writing() && self.output.borrow().readable() == 0 {
            let n = unsafe {
                libc::write(
                    self.socket.fd(),
                    data.as_ptr() as *const libc::c_void,
                    data.len(),
                )
            };
            if n >= 0 {
                nwrote = n as usize;
                remaining = data.len() - nwrote;
                if remaining == 0 {
                    self.queue_write_complete();
                }
            } else {
                let err = NetError::last_os();
                if err.raw_os() != Some(libc::EAGAIN) {
                    rerror!("[{}] write failed: {}", self.name, err);
                    if let Some(no) = err.raw_os() {
                        fault = self.fault_errnos.borrow().contains(&no);
                    }
                }
            }
        }

        if fault {
            // Peer-initiated fault: drop the unsent data and drive the
            // connection through its normal close sequence.
            let conn = self.clone();
            self.handle.queue_in_loop(move || conn.handle_close());
            return;
        }

        if remaining > 0 {
            let old_len = self.output.borrow().readable();
            let mark = self.high_water_mark.load(Ordering::Acquire);
            if old_len + remaining >= mark && old_len < mark {
                // Fires once per ascent: while the queue stays above the
                // mark, old_len >= mark suppresses re-firing.
                let cb = self.high_water_mark_cb.borrow().clone();
                if let Some(cb) = cb {
                    let conn = self.clone();
                    let queued = old_len + remaining;
                    self.handle.queue_in_loop(move || cb(&conn, queued));
                }
            }
            self.output.borrow_mut().append(&data[nwrote..]);
            if !channel.is_writing() {
                channel.enable_writing();
            }
        }
    }

    /// Half-close the write side once all queued output has drained.
    pub fn shutdown(self: &Arc<Self>) {
        if self.state() == ConnState::Connected {
            self.set_state(ConnState::Disconnecting);
            let conn = self.clone();
            self.handle.run_in_loop(move || conn.shutdown_in_loop());
        }
    }

    fn shutdown_in_loop(&self) {
        if let Some(ch) = self.channel() {
            // Write interest still on means queued output remains; the
            // write-complete path performs the deferred shutdown.
            if !ch.is_writing() {
                self.socket.shutdown_write();
            }
        }
    }

    /// Activate on the owning loop: tie the channel, enable read interest,
    /// announce the connection. Must run on the owning loop's thread.
    pub fn establish(self: &Arc<Self>) {
        let lp = match EventLoop::current() {
            Some(lp) if Arc::ptr_eq(&lp.handle(), &self.handle) => lp,
            _ => {
                rerror!("[{}] establish outside the owning loop", self.name);
                return;
            }
        };

        let channel = Channel::new(Rc::downgrade(&lp), self.socket.fd());
        let weak = Arc::downgrade(self);
        channel.set_read_callback(Box::new({
            let weak = weak.clone();
            move |ts| {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_read(ts);
                }
            }
        }));
        channel.set_write_callback(Box::new({
            let weak = weak.clone();
            move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_write();
                }
            }
        }));
        channel.set_close_callback(Box::new({
            let weak = weak.clone();
            move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_close();
                }
            }
        }));
        channel.set_error_callback(Box::new(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_error();
            }
        }));

        // Tie before the first possible event so a released connection can
        // never have callbacks invoked on it.
        let (guard, flag) = TieGuard::new();
        channel.tie(flag);
        *self.tie.borrow_mut() = Some(guard);
        *self.channel.borrow_mut() = Some(channel.clone());

        self.set_state(ConnState::Connected);
        channel.enable_reading();

        let cb = self.connection_cb.borrow().clone();
        if let Some(cb) = cb {
            cb(self);
        }
    }

    /// Final teardown on the owning loop: runs the connection callback if
    /// the close sequence has not already, then unregisters the channel.
    pub fn destroy(self: &Arc<Self>) {
        if self.state() == ConnState::Connected {
            self.set_state(ConnState::Disconnected);
            if let Some(ch) = self.channel() {
                ch.disable_all();
            }
            let cb = self.connection_cb.borrow().clone();
            if let Some(cb) = cb {
                cb(self);
            }
        }
        if let Some(ch) = self.channel.borrow_mut().take() {
            ch.remove();
        }
        self.tie.borrow_mut().take();
        rdebug!("TcpConnection::destroy [{}]", self.name);
    }

    fn handle_read(self: &Arc<Self>, receive_time: Timestamp) {
        let result = self.input.borrow_mut().read_fd(self.socket.fd());
        match result {
            Ok(0) => self.handle_close(),
            Ok(n) => {
                rtrace!("[{}] read {} bytes", self.name, n);
                let cb = self.message_cb.borrow().clone();
                if let Some(cb) = cb {
                    let mut input = self.input.borrow_mut();
                    cb(self, &mut input, receive_time);
                }
            }
            Err(e) => match e.raw_os() {
                // Spurious wakeup; nothing to do.
                Some(libc::EAGAIN) | Some(libc::EINTR) => {}
                _ => {
                    rerror!("[{}] read failed: {}", self.name, e);
                    self.handle_error();
                }
            },
        }
    }

    fn handle_write(self: &Arc<Self>) {
        let channel = match self.channel() {
            Some(ch) => ch,
            None => return,
        };
        if !channel.is_writing() {
            rtrace!("[{}] fd {} is down, no more writing", self.name, self.socket.fd());
            return;
        }

        let result = self.output.borrow_mut().write_fd(self.socket.fd());
        match result {
            Ok(n) => {
                let drained = {
                    let mut output = self.output.borrow_mut();
                    output.retrieve(n);
                    output.readable() == 0
                };
                if drained {
                    channel.disable_writing();
                    self.queue_write_complete();
                    if self.state() == ConnState::Disconnecting {
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(e) => match e.raw_os() {
                Some(libc::EAGAIN) | Some(libc::EINTR) => {}
                _ => rerror!("[{}] flush failed: {}", self.name, e),
            },
        }
    }

    fn queue_write_complete(self: &Arc<Self>) {
        let cb = self.write_complete_cb.borrow().clone();
        if let Some(cb) = cb {
            let conn = self.clone();
            self.handle.queue_in_loop(move || cb(&conn));
        }
    }

    /// The single exit path: runs the connection and close callbacks
    /// exactly once, whatever triggered it (peer close, hang-up, fault,
    /// explicit teardown).
    fn handle_close(self: &Arc<Self>) {
        if self.state() == ConnState::Disconnected {
            return;
        }
        rinfo!(
            "TcpConnection::close [{}] fd {} state {:?}",
            self.name,
            self.socket.fd(),
            self.state()
        );
        self.set_state(ConnState::Disconnected);
        if let Some(ch) = self.channel() {
            ch.disable_all();
        }

        let conn_cb = self.connection_cb.borrow().clone();
        if let Some(cb) = conn_cb {
            cb(self);
        }
        let close_cb = self.close_cb.borrow().clone();
        if let Some(cb) = close_cb {
            cb(self);
        }
    }

    fn handle_error(&self) {
        let err = self.socket.so_error();
        rerror!("[{}] SO_ERROR {}", self.name, NetError::Os(err));
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        rdebug!(
            "TcpConnection::drop [{}] state {:?}",
            self.name,
            ConnState::from_u8(self.state.load(Ordering::Acquire))
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoopConfig;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::IntoRawFd;
    use std::time::Duration;

    /// Accepted server-side fd (made non-blocking) plus the client stream.
    fn tcp_pair() -> (Socket, InetAddress, InetAddress, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        let sock = Socket::from_raw(server.into_raw_fd());
        let local = sock.local_addr().unwrap();
        let peer = sock.peer_addr().unwrap();
        (sock, local, peer, client)
    }

    fn run_for(lp: &Rc<EventLoop>, ms: u64) {
        let h = lp.handle();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(ms));
            h.quit();
        });
        lp.run();
        t.join().unwrap();
    }

    fn new_test_conn(
        lp: &Rc<EventLoop>,
        sock: Socket,
        local: InetAddress,
        peer: InetAddress,
    ) -> TcpConnectionRef {
        TcpConnection::new(lp.handle(), "test-conn".to_string(), sock, local, peer)
    }

    #[test]
    fn test_direct_send_and_write_complete() {
        let lp = EventLoop::with_config(LoopConfig::from_env().poll_timeout_ms(20));
        let (sock, local, peer, mut client) = tcp_pair();
        let conn = new_test_conn(&lp, sock, local, peer);

        let completions = Arc::new(AtomicUsize::new(0));
        let c = completions.clone();
        conn.set_write_complete_callback(Arc::new(move |_: &TcpConnectionRef| {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        conn.establish();
        assert!(conn.connected());
        conn.send(b"ping");

        run_for(&lp, 150);

        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(completions.load(Ordering::SeqCst), 1);

        conn.destroy();
    }

    #[test]
    fn test_peer_close_runs_close_sequence_once() {
        let lp = EventLoop::with_config(LoopConfig::from_env().poll_timeout_ms(20));
        let (sock, local, peer, client) = tcp_pair();
        let conn = new_test_conn(&lp, sock, local, peer);

        let disconnects = Arc::new(AtomicUsize::new(0));
        let d = disconnects.clone();
        conn.set_connection_callback(Arc::new(move |c: &TcpConnectionRef| {
            if !c.connected() {
                d.fetch_add(1, Ordering::SeqCst);
            }
        }));
        let closes = Arc::new(AtomicUsize::new(0));
        let cl = closes.clone();
        conn.set_close_callback(Arc::new(move |_: &TcpConnectionRef| {
            cl.fetch_add(1, Ordering::SeqCst);
        }));

        conn.establish();
        drop(client); // peer closes; read() == 0 drives the close sequence

        run_for(&lp, 150);

        assert_eq!(conn.state(), ConnState::Disconnected);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        conn.destroy();
    }

    #[test]
    fn test_high_water_mark_fires_once_per_ascent() {
        let lp = EventLoop::with_config(LoopConfig::from_env().poll_timeout_ms(20));
        let (sock, local, peer, client) = tcp_pair();

        // Shrink the send buffer so direct writes go short and output
        // actually queues.
        let small: libc::c_int = 4096;
        unsafe {
            libc::setsockopt(
                sock.fd(),
                libc::SOL_SOCKET,
                libc::SO_SNDBUF,
                &small as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }

        let conn = new_test_conn(&lp, sock, local, peer);
        conn.set_high_water_mark(10_000);
        let crossings = Arc::new(AtomicUsize::new(0));
        let cr = crossings.clone();
        conn.set_high_water_mark_callback(Arc::new(move |_: &TcpConnectionRef, queued: usize| {
            assert!(queued >= 10_000);
            cr.fetch_add(1, Ordering::SeqCst);
        }));

        conn.establish();
        let chunk = vec![b'w'; 200_000];
        conn.send(&chunk); // queues far beyond the mark: one crossing
        conn.send(&chunk); // still above: must not re-fire

        // Peer does not read, so the queue stays above the mark throughout.
        run_for(&lp, 150);
        assert_eq!(crossings.load(Ordering::SeqCst), 1);

        drop(client);
        conn.destroy();
    }

    #[test]
    fn test_shutdown_defers_until_output_drained() {
        let lp = EventLoop::with_config(LoopConfig::from_env().poll_timeout_ms(20));
        let (sock, local, peer, mut client) = tcp_pair();

        let small: libc::c_int = 4096;
        unsafe {
            libc::setsockopt(
                sock.fd(),
                libc::SOL_SOCKET,
                libc::SO_SNDBUF,
                &small as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }

        let conn = new_test_conn(&lp, sock, local, peer);
        conn.establish();

        let payload = vec![b's'; 300_000];
        conn.send(&payload);
        conn.shutdown(); // output still queued: half-close must wait
        assert_eq!(conn.state(), ConnState::Disconnecting);

        // Reader thread drains everything, then must see EOF — proving the
        // write half closed only after the full payload went out.
        let reader = std::thread::spawn(move || {
            let mut total = 0usize;
            let mut buf = [0u8; 16384];
            loop {
                match client.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => total += n,
                    Err(e) => panic!("client read failed: {}", e),
                }
            }
            total
        });

        run_for(&lp, 500);
        assert_eq!(reader.join().unwrap(), 300_000);

        conn.destroy();
    }

    #[test]
    fn test_shutdown_immediate_when_output_empty() {
        let lp = EventLoop::with_config(LoopConfig::from_env().poll_timeout_ms(20));
        let (sock, local, peer, mut client) = tcp_pair();
        let conn = new_test_conn(&lp, sock, local, peer);
        conn.establish();

        conn.shutdown(); // nothing queued: write half closes right away
        assert_eq!(conn.state(), ConnState::Disconnecting);

        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).unwrap(), 0);

        run_for(&lp, 50);
        conn.destroy();
    }

    #[test]
    fn test_send_on_disconnected_is_ignored() {
        let lp = EventLoop::with_config(LoopConfig::from_env().poll_timeout_ms(20));
        let (sock, local, peer, _client) = tcp_pair();
        let conn = new_test_conn(&lp, sock, local, peer);
        // Never established: state is Connecting, send must be a no-op
        conn.send(b"dropped");
        assert_eq!(conn.state(), ConnState::Connecting);
        conn.destroy();
    }
}
