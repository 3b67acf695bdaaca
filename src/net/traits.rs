use crate::net::conn::ConnRef;
use crate::net::errors::Result;
use std::sync::Arc;

/// Protocol-specific behavior attached to one connection.
///
/// The transport core never inspects payload bytes; everything it does not
/// define happens through these three hooks, each invoked on the event-loop
/// thread:
///
/// - `on_setup` runs once when the connection becomes established (after a
///   successful connect for active connections, after the accept handshake
///   for passive ones). Returning an error rejects the connection and closes
///   it.
/// - `on_read` runs after new bytes land in the receive ring; it is the only
///   place received data surfaces. Consume via
///   [`Conn::recv_buffer`](crate::net::Conn::recv_buffer).
/// - `on_teardown` runs exactly once when the connection is permanently
///   closed, whether by the application, the peer, or an error. It is the
///   sole failure-notification point.
///
/// A hook may close its own connection (`conn.terminate()`); the core
/// tolerates this reentrancy.
pub trait ConnHandler: Send + Sync {
    fn on_setup(&self, conn: &ConnRef) -> Result<()> {
        let _ = conn;
        Ok(())
    }

    fn on_read(&self, conn: &ConnRef);

    fn on_teardown(&self, conn: &ConnRef) {
        let _ = conn;
    }
}

/// Factory supplied by the embedding application; the pool calls it once per
/// connection (inbound or outbound) to obtain that connection's handler.
pub trait ConnFactory: Send + Sync + 'static {
    fn create_conn(&self) -> Arc<dyn ConnHandler>;
}

impl<F> ConnFactory for F
where
    F: Fn() -> Arc<dyn ConnHandler> + Send + Sync + 'static,
{
    fn create_conn(&self) -> Arc<dyn ConnHandler> {
        self()
    }
}
