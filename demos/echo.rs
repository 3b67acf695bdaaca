//! Echo demo: a server pool and a client pool sharing one event loop.
//!
//! Run with `cargo run --example echo`.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use millstream::net::{ConnFactory, ConnHandler, ConnPool, ConnRef, PoolConfig};
use millstream::EventLoop;
use tracing::info;

struct EchoServer;

impl ConnHandler for EchoServer {
    fn on_read(&self, conn: &ConnRef) {
        let data = {
            let mut ring = conn.recv_buffer();
            let n = ring.size();
            ring.pop(n)
        };
        info!(conn = %conn, "echoing {} bytes", data.len());
        let _ = conn.write(data);
    }
}

struct EchoClient;

impl ConnHandler for EchoClient {
    fn on_setup(&self, conn: &ConnRef) -> millstream::net::errors::Result<()> {
        conn.write(b"hello, millstream".to_vec())?;
        Ok(())
    }

    fn on_read(&self, conn: &ConnRef) {
        let data = {
            let mut ring = conn.recv_buffer();
            let n = ring.size();
            ring.pop(n)
        };
        info!("server replied: {}", String::from_utf8_lossy(&data));
        conn.terminate();
    }
}

struct ServerFactory;
impl ConnFactory for ServerFactory {
    fn create_conn(&self) -> Arc<dyn ConnHandler> {
        Arc::new(EchoServer)
    }
}

struct ClientFactory;
impl ConnFactory for ClientFactory {
    fn create_conn(&self) -> Arc<dyn ConnHandler> {
        Arc::new(EchoClient)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let ev = Arc::new(EventLoop::default());
    let server = ConnPool::new(ev.clone(), PoolConfig::default(), ServerFactory);
    let addr = server.listen("127.0.0.1:0".parse()?)?;

    let client = ConnPool::new(ev.clone(), PoolConfig::default(), ClientFactory);
    client.create_conn(addr);

    let loop_ev = ev.clone();
    let join = thread::spawn(move || loop_ev.run());

    thread::sleep(Duration::from_secs(1));
    ev.stop();
    join.join().expect("event loop thread panicked")?;
    Ok(())
}
