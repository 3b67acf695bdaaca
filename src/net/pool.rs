//! The owning registry of connections: listens, accepts, originates.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

use mio::event::Event;
use mio::net::TcpListener;
use mio::{Interest, Token};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};

use crate::handler::EventHandler;
use crate::net::config::PoolConfig;
use crate::net::conn::{Conn, ConnRef};
use crate::net::errors::Result;
use crate::net::traits::ConnFactory;
use crate::EventLoop;

/// A registry of live connections bound to one event loop.
///
/// The pool accepts inbound connections on a listening socket
/// ([`listen`](Self::listen)), originates outbound ones
/// ([`create_conn`](Self::create_conn)), and owns the token-keyed table of
/// every connection either produced. Protocol behavior comes from the
/// application through the [`ConnFactory`] given at construction; the pool
/// itself never looks at payload bytes.
///
/// Dropping the pool force-closes every registered connection (each receives
/// its teardown) before the listening socket is released, so no event
/// registration outlives the pool.
pub struct ConnPool {
    shared: Arc<PoolShared>,
}

pub(crate) struct PoolShared {
    pub(crate) ev: Arc<EventLoop>,
    pub(crate) config: PoolConfig,
    factory: Box<dyn ConnFactory>,
    conns: Mutex<HashMap<Token, ConnRef>>,
    listener: Mutex<Option<(Token, TcpListener)>>,
}

impl ConnPool {
    pub fn new<F: ConnFactory>(ev: Arc<EventLoop>, config: PoolConfig, factory: F) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                ev,
                config,
                factory: Box::new(factory),
                conns: Mutex::new(HashMap::new()),
                listener: Mutex::new(None),
            }),
        }
    }

    /// Binds and listens on `addr` with the configured backlog and starts
    /// accepting. Returns the bound address (useful with port 0).
    ///
    /// Calling `listen` again replaces the previous listener: the old socket
    /// is deregistered and closed before the new one takes over.
    pub fn listen(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(self.shared.config.backlog)?;
        socket.set_nonblocking(true)?;
        let mut listener = TcpListener::from_std(socket.into());
        let local = listener.local_addr()?;

        let token = self.shared.ev.next_token();
        self.shared.ev.register(
            &mut listener,
            token,
            Interest::READABLE,
            ListenEventHandler {
                pool: Arc::downgrade(&self.shared),
            },
        )?;
        let mut slot = self.shared.listener.lock().unwrap();
        if let Some((old_token, mut old_listener)) = slot.take() {
            let _ = self.shared.ev.deregister(&mut old_listener, old_token);
        }
        *slot = Some((token, listener));
        drop(slot);
        info!(addr = %local, "listening");
        Ok(local)
    }

    /// Originates an active connection to `addr`. The returned handle is live
    /// immediately: writes queue and flush once the connection establishes.
    /// Connect failures are retried with jitter per the pool configuration
    /// and ultimately surface through the connection's teardown hook.
    pub fn create_conn(&self, addr: SocketAddr) -> ConnRef {
        let handler = self.shared.factory.create_conn();
        let token = self.shared.ev.next_token();
        let conn = Conn::new_active(token, addr, handler, &self.shared);
        self.shared.conns.lock().unwrap().insert(token, conn.clone());
        info!(conn = %conn, "connecting");
        conn.try_conn();
        conn
    }

    /// Looks up a live connection by token.
    pub fn conn(&self, token: Token) -> Option<ConnRef> {
        self.shared.conns.lock().unwrap().get(&token).cloned()
    }

    pub fn conn_count(&self) -> usize {
        self.shared.conns.lock().unwrap().len()
    }
}

impl Drop for ConnPool {
    fn drop(&mut self) {
        // close connections first so their registrations are gone before the
        // listening socket is released
        let conns: Vec<ConnRef> = self.shared.conns.lock().unwrap().values().cloned().collect();
        for conn in conns {
            conn.terminate();
        }
        if let Some((token, mut listener)) = self.shared.listener.lock().unwrap().take() {
            let _ = self.shared.ev.deregister(&mut listener, token);
        }
    }
}

impl PoolShared {
    pub(crate) fn remove_conn(&self, token: Token) {
        self.conns.lock().unwrap().remove(&token);
    }

    /// Drains the accept queue; under a connection-arrival burst several
    /// sockets can be pending behind one readability event.
    fn accept_clients(self: &Arc<Self>) {
        loop {
            let accepted = {
                let guard = self.listener.lock().unwrap();
                let Some((_, listener)) = guard.as_ref() else {
                    return;
                };
                listener.accept()
            };
            match accepted {
                Ok((stream, peer_addr)) => {
                    if self.config.nodelay {
                        let _ = stream.set_nodelay(true);
                    }
                    let handler = self.factory.create_conn();
                    let token = self.ev.next_token();
                    let conn = Conn::new_passive(token, peer_addr, handler, self, stream);
                    self.conns.lock().unwrap().insert(token, conn.clone());
                    debug!(conn = %conn, "accepted connection");
                    if let Err(e) = conn.start_handshake() {
                        warn!(conn = %conn, error = %e, "failed to register accepted connection");
                        conn.terminate();
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "accept error");
                    break;
                }
            }
        }
    }
}

struct ListenEventHandler {
    pool: Weak<PoolShared>,
}

impl EventHandler for ListenEventHandler {
    fn handle_event(&self, event: &Event) {
        if !event.is_readable() {
            return;
        }
        let Some(shared) = self.pool.upgrade() else {
            return;
        };
        shared.accept_clients();
    }
}
