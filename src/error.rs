use mio::Token;
use std::io;
use thiserror::Error;

/// Errors surfaced by the event loop itself (registration and polling).
///
/// Connection-level failures never appear here; they are handled inside the
/// connection layer and reported through the teardown hook (see
/// [`crate::net::errors::ConnError`]).
#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// A source was registered under a token that is already in use.
    #[error("token {0:?} is already registered")]
    TokenInUse(Token),

    /// A reregister/deregister referenced a token with no registry entry.
    #[error("token {0:?} is not registered")]
    UnknownToken(Token),
}

pub type Result<T> = std::result::Result<T, Error>;
