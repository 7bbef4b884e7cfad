//! Echo server demo
//!
//! One base loop accepts, a small worker pool carries the connections, and
//! every received byte goes straight back out.
//!
//! Run: ./target/release/rivulet-echo [port] [threads]
//!   port     listen port (default 7000)
//!   threads  worker loops, 0 keeps everything on the base loop (default 4)
//!
//! Env: RVL_LOG_LEVEL=trace|debug|info|warn|error

use rivulet::{EventLoop, InetAddress, TcpConnectionRef, TcpServer};
use rivulet_core::{rfatal, rinfo};
use std::sync::Arc;

fn main() {
    rivulet_core::logging::init();

    let mut args = std::env::args().skip(1);
    let port: u16 = args
        .next()
        .map(|a| a.parse().unwrap_or(7000))
        .unwrap_or(7000);
    let threads: usize = args.next().map(|a| a.parse().unwrap_or(4)).unwrap_or(4);

    let lp = EventLoop::new();
    let addr = match InetAddress::new("0.0.0.0", port) {
        Ok(a) => a,
        Err(e) => rfatal!("bad listen address: {}", e),
    };
    let server = TcpServer::new(&lp, &addr, "echo", true);
    server.set_thread_num(threads);

    server.set_connection_callback(Arc::new(|conn: &TcpConnectionRef| {
        if conn.connected() {
            conn.set_tcp_no_delay(true);
            rinfo!("up   [{}] {}", conn.name(), conn.peer_addr());
        } else {
            rinfo!("down [{}]", conn.name());
        }
    }));
    server.set_message_callback(Arc::new(|conn: &TcpConnectionRef, buf: &mut rivulet::Buffer, _when| {
        let data = buf.retrieve_as_bytes(buf.readable());
        conn.send(&data);
    }));

    server.start();
    rinfo!(
        "echo listening on {} with {} worker thread(s)",
        server.listen_addr(),
        threads
    );
    lp.run();
}
