use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Connection-layer error taxonomy.
///
/// Transport failures (`Io`, `ConnectFailed`, `HandshakeTimeout`) are handled
/// inside the connection layer: the connection closes itself and the
/// application is notified exactly once through its teardown hook. They are
/// never propagated across the event-loop boundary, since a callback failing
/// out of the loop would corrupt scheduling for every other connection.
///
/// `Closed` is different in kind: it reports a caller bug (operating on an
/// already-closed connection), not a network condition.
#[derive(Debug, Error)]
pub enum ConnError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The operation was attempted on a connection that is already closed.
    #[error("connection is closed")]
    Closed,

    /// An outbound connect gave up after exhausting its retry budget.
    #[error("connect to {addr} failed after {attempts} attempts")]
    ConnectFailed { addr: SocketAddr, attempts: u32 },

    /// A passive connection did not complete its handshake in time.
    #[error("handshake timed out")]
    HandshakeTimeout,
}

impl From<crate::error::Error> for ConnError {
    fn from(err: crate::error::Error) -> Self {
        match err {
            crate::error::Error::Io(e) => ConnError::Io(e),
            other => ConnError::Io(io::Error::other(other.to_string())),
        }
    }
}

pub type Result<T> = std::result::Result<T, ConnError>;
