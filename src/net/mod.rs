//! Connection management over the event loop.
//!
//! This layer owns the lifecycle of bidirectional byte-stream connections —
//! both outbound ([`ConnPool::create_conn`]) and inbound
//! ([`ConnPool::listen`]) — multiplexed over a single
//! [`EventLoop`](crate::EventLoop), and the
//! byte buffering between the socket layer and whatever protocol the
//! application builds on top. It is transport plumbing only: payloads are
//! opaque, and there is no framing, retry policy beyond connection
//! (re)establishment, or encryption here.
//!
//! ```text
//!  ConnPool ──listen──▶ accept ──▶ Conn (PASSIVE, handshake timer)
//!     │                                │
//!     └──create_conn──▶ Conn (ACTIVE, non-blocking connect + retry)
//!                                      │
//!                        send ByteRing ◀── write() / move_send_buffer()
//!                        recv ByteRing ──▶ on_read()
//! ```
//!
//! The application plugs in through [`ConnFactory`] and the three
//! [`ConnHandler`] hooks; the pool and connections never depend on message
//! content.
//!
//! # Example
//!
//! ```rust,no_run
//! use millstream::net::{ConnFactory, ConnHandler, ConnPool, ConnRef, PoolConfig};
//! use millstream::EventLoop;
//! use std::sync::Arc;
//!
//! struct Echo;
//!
//! impl ConnHandler for Echo {
//!     fn on_read(&self, conn: &ConnRef) {
//!         let data = {
//!             let mut ring = conn.recv_buffer();
//!             let n = ring.size();
//!             ring.pop(n)
//!         };
//!         let _ = conn.write(data);
//!     }
//! }
//!
//! struct EchoFactory;
//!
//! impl ConnFactory for EchoFactory {
//!     fn create_conn(&self) -> Arc<dyn ConnHandler> {
//!         Arc::new(Echo)
//!     }
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let ev = Arc::new(EventLoop::default());
//! let pool = ConnPool::new(ev.clone(), PoolConfig::default(), EchoFactory);
//! pool.listen("127.0.0.1:7000".parse()?)?;
//! ev.run()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod conn;
pub mod errors;
pub mod pool;
pub mod ring;
pub mod traits;

pub use config::{PoolConfig, PoolConfigBuilder};
pub use conn::{Conn, ConnMode, ConnRef, ConnState};
pub use errors::ConnError;
pub use pool::ConnPool;
pub use ring::ByteRing;
pub use traits::{ConnFactory, ConnHandler};
