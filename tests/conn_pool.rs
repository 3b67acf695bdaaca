//! End-to-end tests over real loopback sockets: one event loop thread, a
//! listening pool and client pools, with hook invocations reported back to
//! the test thread over channels.

use std::net::SocketAddr;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use millstream::net::{
    ConnError, ConnFactory, ConnHandler, ConnPool, ConnRef, ConnState, PoolConfig,
};
use millstream::EventLoop;

const TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
enum Happening {
    Setup,
    Read(Vec<u8>),
    Teardown,
}

/// Reports every hook invocation to the test thread, optionally echoing
/// received bytes back.
struct Recorder {
    tx: Mutex<Sender<Happening>>,
    echo: bool,
}

impl Recorder {
    fn report(&self, happening: Happening) {
        let _ = self.tx.lock().unwrap().send(happening);
    }
}

impl ConnHandler for Recorder {
    fn on_setup(&self, _conn: &ConnRef) -> millstream::net::errors::Result<()> {
        self.report(Happening::Setup);
        Ok(())
    }

    fn on_read(&self, conn: &ConnRef) {
        let data = {
            let mut ring = conn.recv_buffer();
            let n = ring.size();
            ring.pop(n)
        };
        if self.echo {
            let _ = conn.write(data.clone());
        }
        self.report(Happening::Read(data));
    }

    fn on_teardown(&self, _conn: &ConnRef) {
        self.report(Happening::Teardown);
    }
}

struct RecorderFactory {
    tx: Mutex<Sender<Happening>>,
    echo: bool,
}

impl RecorderFactory {
    fn new(echo: bool) -> (Self, Receiver<Happening>) {
        let (tx, rx) = channel();
        (
            Self {
                tx: Mutex::new(tx),
                echo,
            },
            rx,
        )
    }
}

impl ConnFactory for RecorderFactory {
    fn create_conn(&self) -> Arc<dyn ConnHandler> {
        Arc::new(Recorder {
            tx: Mutex::new(self.tx.lock().unwrap().clone()),
            echo: self.echo,
        })
    }
}

fn start_loop() -> (Arc<EventLoop>, thread::JoinHandle<millstream::error::Result<()>>) {
    let ev = Arc::new(EventLoop::new(256, 20).expect("event loop"));
    let runner = ev.clone();
    let join = thread::spawn(move || runner.run());
    (ev, join)
}

fn stop_loop(ev: Arc<EventLoop>, join: thread::JoinHandle<millstream::error::Result<()>>) {
    ev.stop();
    join.join().expect("loop thread panicked").expect("loop error");
}

fn expect_setup(rx: &Receiver<Happening>) {
    match rx.recv_timeout(TIMEOUT).expect("waiting for setup") {
        Happening::Setup => {}
        other => panic!("expected setup, got {other:?}"),
    }
}

/// Collects `Read` happenings until `total` bytes have arrived.
fn expect_read_total(rx: &Receiver<Happening>, total: usize) -> Vec<u8> {
    let mut bytes = Vec::new();
    while bytes.len() < total {
        match rx.recv_timeout(TIMEOUT).expect("waiting for read") {
            Happening::Read(data) => bytes.extend_from_slice(&data),
            other => panic!("expected read, got {other:?}"),
        }
    }
    bytes
}

/// Waits for a teardown, skipping reads that may still be in flight.
fn expect_teardown(rx: &Receiver<Happening>) {
    loop {
        match rx.recv_timeout(TIMEOUT).expect("waiting for teardown") {
            Happening::Teardown => return,
            Happening::Read(_) => {}
            Happening::Setup => panic!("unexpected setup while waiting for teardown"),
        }
    }
}

/// An address that nothing listens on (bind, observe, drop).
fn dead_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("local addr")
}

#[test]
fn end_to_end_write_read_close() {
    let (ev, join) = start_loop();

    let (server_factory, server_rx) = RecorderFactory::new(false);
    let server = ConnPool::new(ev.clone(), PoolConfig::default(), server_factory);
    let addr = server.listen("127.0.0.1:0".parse().unwrap()).unwrap();

    let (client_factory, client_rx) = RecorderFactory::new(false);
    let client = ConnPool::new(ev.clone(), PoolConfig::default(), client_factory);
    let conn = client.create_conn(addr);

    expect_setup(&client_rx);
    expect_setup(&server_rx);
    assert_eq!(conn.state(), ConnState::Established);
    assert_eq!(client.conn_count(), 1);
    assert_eq!(server.conn_count(), 1);

    conn.write(vec![1, 2, 3, 4, 5]).unwrap();
    assert_eq!(expect_read_total(&server_rx, 5), vec![1, 2, 3, 4, 5]);

    conn.terminate();
    assert_eq!(conn.state(), ConnState::Closed);
    expect_teardown(&client_rx);
    // the server observes the peer close and tears down its side
    expect_teardown(&server_rx);
    assert_eq!(client.conn_count(), 0);

    drop(client);
    drop(server);
    stop_loop(ev, join);
}

#[test]
fn echo_round_trip() {
    let (ev, join) = start_loop();

    let (server_factory, server_rx) = RecorderFactory::new(true);
    let server = ConnPool::new(ev.clone(), PoolConfig::default(), server_factory);
    let addr = server.listen("127.0.0.1:0".parse().unwrap()).unwrap();

    let (client_factory, client_rx) = RecorderFactory::new(false);
    let client = ConnPool::new(ev.clone(), PoolConfig::default(), client_factory);
    let conn = client.create_conn(addr);

    expect_setup(&client_rx);
    expect_setup(&server_rx);
    conn.write(b"ping".to_vec()).unwrap();
    expect_read_total(&server_rx, 4);
    assert_eq!(expect_read_total(&client_rx, 4), b"ping".to_vec());

    drop(client);
    drop(server);
    stop_loop(ev, join);
}

#[test]
fn terminate_is_idempotent_and_write_after_close_fails() {
    let (ev, join) = start_loop();

    let (server_factory, _server_rx) = RecorderFactory::new(false);
    let server = ConnPool::new(ev.clone(), PoolConfig::default(), server_factory);
    let addr = server.listen("127.0.0.1:0".parse().unwrap()).unwrap();

    let (client_factory, client_rx) = RecorderFactory::new(false);
    let client = ConnPool::new(ev.clone(), PoolConfig::default(), client_factory);
    let conn = client.create_conn(addr);
    expect_setup(&client_rx);

    conn.terminate();
    conn.terminate();

    expect_teardown(&client_rx);
    // no second teardown arrives
    assert!(client_rx.recv_timeout(Duration::from_millis(300)).is_err());

    // writing to a closed connection is a caller error, not a transport one
    match conn.write(vec![1]) {
        Err(ConnError::Closed) => {}
        other => panic!("expected ConnError::Closed, got {other:?}"),
    }

    drop(client);
    drop(server);
    stop_loop(ev, join);
}

#[test]
fn writes_before_establishment_are_queued_and_flushed_in_order() {
    let (ev, join) = start_loop();

    let (server_factory, server_rx) = RecorderFactory::new(false);
    let server = ConnPool::new(ev.clone(), PoolConfig::default(), server_factory);
    let addr = server.listen("127.0.0.1:0".parse().unwrap()).unwrap();

    let (client_factory, client_rx) = RecorderFactory::new(false);
    let client = ConnPool::new(ev.clone(), PoolConfig::default(), client_factory);
    let conn = client.create_conn(addr);

    // queue immediately; the connect is still in flight
    conn.write(vec![10, 20]).unwrap();
    conn.write(vec![30]).unwrap();

    expect_setup(&client_rx);
    expect_setup(&server_rx);
    assert_eq!(expect_read_total(&server_rx, 3), vec![10, 20, 30]);

    drop(client);
    drop(server);
    stop_loop(ev, join);
}

#[test]
fn unreachable_peer_retries_then_reports_failure_via_teardown() {
    let (ev, join) = start_loop();

    let config = PoolConfig::builder()
        .try_conn_delay(Duration::from_millis(50))
        .max_conn_retries(Some(2))
        .build();
    let (client_factory, client_rx) = RecorderFactory::new(false);
    let client = ConnPool::new(ev.clone(), config, client_factory);
    let conn = client.create_conn(dead_addr());

    // failure surfaces through teardown only; setup never runs
    match client_rx.recv_timeout(TIMEOUT).expect("waiting for teardown") {
        Happening::Teardown => {}
        other => panic!("expected teardown, got {other:?}"),
    }
    assert_eq!(conn.state(), ConnState::Closed);
    assert_eq!(client.conn_count(), 0);

    drop(client);
    stop_loop(ev, join);
}

#[test]
fn dropping_the_pool_force_closes_connections() {
    let (ev, join) = start_loop();

    let (server_factory, server_rx) = RecorderFactory::new(false);
    let server = ConnPool::new(ev.clone(), PoolConfig::default(), server_factory);
    let addr = server.listen("127.0.0.1:0".parse().unwrap()).unwrap();

    let (client_factory, client_rx) = RecorderFactory::new(false);
    let client = ConnPool::new(ev.clone(), PoolConfig::default(), client_factory);
    let _conn = client.create_conn(addr);

    expect_setup(&client_rx);
    expect_setup(&server_rx);

    drop(server);
    expect_teardown(&server_rx);
    // the client side observes the close as a zero-length read
    expect_teardown(&client_rx);

    drop(client);
    stop_loop(ev, join);
}

#[test]
fn write_succeeds_while_recv_buffer_guard_is_held() {
    let (ev, join) = start_loop();

    let (server_factory, _server_rx) = RecorderFactory::new(true);
    let server = ConnPool::new(ev.clone(), PoolConfig::default(), server_factory);
    let addr = server.listen("127.0.0.1:0".parse().unwrap()).unwrap();

    let (client_factory, client_rx) = RecorderFactory::new(false);
    let client = ConnPool::new(ev.clone(), PoolConfig::default(), client_factory);
    let conn = client.create_conn(addr);
    expect_setup(&client_rx);

    // hold the receive-ring guard across a loop-thread read: the echo of
    // "seed" arrives while we sleep, so the loop thread is mid-read when the
    // second write takes the connection's state lock
    {
        let guard = conn.recv_buffer();
        conn.write(b"seed".to_vec()).unwrap();
        thread::sleep(Duration::from_millis(300));
        conn.write(vec![42]).unwrap();
        drop(guard);
    }
    assert_eq!(expect_read_total(&client_rx, 5), vec![b's', b'e', b'e', b'd', 42]);

    drop(client);
    drop(server);
    stop_loop(ev, join);
}

#[test]
fn listen_again_replaces_the_previous_listener() {
    let (ev, join) = start_loop();

    let (server_factory, server_rx) = RecorderFactory::new(false);
    let server = ConnPool::new(ev.clone(), PoolConfig::default(), server_factory);
    let first = server.listen("127.0.0.1:0".parse().unwrap()).unwrap();
    let second = server.listen("127.0.0.1:0".parse().unwrap()).unwrap();
    assert_ne!(first, second);

    // the new address accepts
    let (client_factory, client_rx) = RecorderFactory::new(false);
    let client = ConnPool::new(ev.clone(), PoolConfig::default(), client_factory);
    let conn = client.create_conn(second);
    expect_setup(&client_rx);
    expect_setup(&server_rx);
    conn.terminate();
    expect_teardown(&client_rx);

    // the replaced listener was closed, not leaked: the old address now
    // refuses connections
    let config = PoolConfig::builder()
        .try_conn_delay(Duration::from_millis(50))
        .max_conn_retries(Some(1))
        .build();
    let (old_factory, old_rx) = RecorderFactory::new(false);
    let old_client = ConnPool::new(ev.clone(), config, old_factory);
    let _old = old_client.create_conn(first);
    match old_rx.recv_timeout(TIMEOUT).expect("waiting for teardown") {
        Happening::Teardown => {}
        other => panic!("expected teardown, got {other:?}"),
    }

    drop(old_client);
    drop(client);
    drop(server);
    stop_loop(ev, join);
}

#[test]
fn move_send_buffer_migrates_queued_bytes() {
    let (ev, join) = start_loop();

    let (server_factory, server_rx) = RecorderFactory::new(false);
    let server = ConnPool::new(ev.clone(), PoolConfig::default(), server_factory);
    let addr = server.listen("127.0.0.1:0".parse().unwrap()).unwrap();

    // stalled: connects to a dead address with a long retry delay, so its
    // queued output never leaves on its own
    let stalled_config = PoolConfig::builder()
        .try_conn_delay(Duration::from_secs(30))
        .max_conn_retries(None)
        .build();
    let (stalled_factory, _stalled_rx) = RecorderFactory::new(false);
    let stalled_pool = ConnPool::new(ev.clone(), stalled_config, stalled_factory);
    let stalled = stalled_pool.create_conn(dead_addr());
    stalled.write(vec![7, 8, 9]).unwrap();

    let (client_factory, client_rx) = RecorderFactory::new(false);
    let client = ConnPool::new(ev.clone(), PoolConfig::default(), client_factory);
    let conn = client.create_conn(addr);
    expect_setup(&client_rx);
    expect_setup(&server_rx);

    conn.move_send_buffer(&stalled);
    assert_eq!(expect_read_total(&server_rx, 3), vec![7, 8, 9]);
    // the source ring was consumed, not copied
    assert_eq!(stalled.send_buffer_size(), 0);
    stalled.terminate();

    drop(client);
    drop(stalled_pool);
    drop(server);
    stop_loop(ev, join);
}
