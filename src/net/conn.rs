//! The per-connection state machine.
//!
//! A [`Conn`] wraps one non-blocking TCP socket together with its send and
//! receive [`ByteRing`]s and drives it through a small state machine:
//!
//! ```text
//! ACTIVE:   Connecting ──connect ok──▶ Established ──▶ Closed
//!                │  ▲
//!                └──┴── jittered retry timer
//!
//! PASSIVE:  Handshaking ──probe ok──▶ Established ──▶ Closed
//!                │
//!                └── conn_server_timeout ──▶ Closed
//! ```
//!
//! Connections are shared as [`ConnRef`] (`Arc<Conn>`). While any event or
//! timer registration is pending, the connection additionally holds a strong
//! handle on itself (`self_ref`), so it cannot be freed while a callback
//! could still fire on it; `close` releases that handle after deregistering
//! everything.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use mio::event::Event;
use mio::net::TcpStream;
use mio::{Interest, Token};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::handler::EventHandler;
use crate::net::errors::ConnError;
use crate::net::pool::PoolShared;
use crate::net::ring::ByteRing;
use crate::net::traits::ConnHandler;
use crate::timer::TimerId;

/// Shared handle to a connection.
pub type ConnRef = Arc<Conn>;

/// How the connection came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnMode {
    /// Established by this side via `create_conn`.
    Active,
    /// Accepted from the listening socket.
    Passive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Active only: a non-blocking connect is in flight (or between retries).
    Connecting,
    /// Passive only: accepted, waiting for the handshake probe.
    Handshaking,
    /// Bidirectional I/O active.
    Established,
    /// Terminal: socket released, no further events, teardown delivered.
    Closed,
}

struct ConnInner {
    stream: Option<TcpStream>,
    state: ConnState,
    send_buf: ByteRing,
    seg_buff_size: usize,
    /// True when the last drain emptied the send ring without blocking: the
    /// next `write` may hit the socket immediately instead of waiting for a
    /// writability event.
    ready_send: bool,
    timer: Option<TimerId>,
    retries_left: Option<u32>,
    attempts: u32,
}

/// One bidirectional byte-stream connection owned by a
/// [`ConnPool`](crate::net::ConnPool).
pub struct Conn {
    token: Token,
    mode: ConnMode,
    addr: SocketAddr,
    handler: Arc<dyn ConnHandler>,
    pool: Weak<PoolShared>,
    inner: Mutex<ConnInner>,
    recv_buf: Mutex<ByteRing>,
    self_ref: Mutex<Option<ConnRef>>,
}

enum DrainOutcome {
    /// Nothing to do (not established, or nothing was drained).
    Idle,
    /// Send ring emptied; ready to send immediately next time.
    Done,
    /// Kernel buffer full; writability event armed.
    Blocked,
    Fatal(io::Error),
}

impl Conn {
    fn new(
        token: Token,
        mode: ConnMode,
        addr: SocketAddr,
        handler: Arc<dyn ConnHandler>,
        pool: &Arc<PoolShared>,
        stream: Option<TcpStream>,
        state: ConnState,
    ) -> ConnRef {
        let conn = Arc::new(Conn {
            token,
            mode,
            addr,
            handler,
            pool: Arc::downgrade(pool),
            inner: Mutex::new(ConnInner {
                stream,
                state,
                send_buf: ByteRing::new(),
                seg_buff_size: pool.config.seg_buff_size,
                ready_send: false,
                timer: None,
                retries_left: pool.config.max_conn_retries,
                attempts: 0,
            }),
            recv_buf: Mutex::new(ByteRing::new()),
            self_ref: Mutex::new(None),
        });
        *conn.self_ref.lock().unwrap() = Some(conn.clone());
        conn
    }

    pub(crate) fn new_active(
        token: Token,
        addr: SocketAddr,
        handler: Arc<dyn ConnHandler>,
        pool: &Arc<PoolShared>,
    ) -> ConnRef {
        Self::new(
            token,
            ConnMode::Active,
            addr,
            handler,
            pool,
            None,
            ConnState::Connecting,
        )
    }

    pub(crate) fn new_passive(
        token: Token,
        addr: SocketAddr,
        handler: Arc<dyn ConnHandler>,
        pool: &Arc<PoolShared>,
        stream: TcpStream,
    ) -> ConnRef {
        Self::new(
            token,
            ConnMode::Passive,
            addr,
            handler,
            pool,
            Some(stream),
            ConnState::Handshaking,
        )
    }

    // ---- accessors -------------------------------------------------------

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn mode(&self) -> ConnMode {
        self.mode
    }

    /// Connect target for active connections, peer address for passive ones.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> ConnState {
        self.inner.lock().unwrap().state
    }

    /// The receive ring. `on_read` consumes newly arrived bytes from here.
    pub fn recv_buffer(&self) -> MutexGuard<'_, ByteRing> {
        self.recv_buf.lock().unwrap()
    }

    /// Overrides the pool-wide read chunk size for this connection.
    pub fn set_seg_buff_size(&self, size: usize) {
        self.inner.lock().unwrap().seg_buff_size = size;
    }

    /// Bytes queued for sending but not yet accepted by the kernel.
    pub fn send_buffer_size(&self) -> usize {
        self.inner.lock().unwrap().send_buf.size()
    }

    /// A strong handle to this connection, as long as it is not closed.
    pub fn self_ref(&self) -> Option<ConnRef> {
        self.self_ref.lock().unwrap().clone()
    }

    // ---- application-facing operations -----------------------------------

    /// Queues `data` for sending. If the connection is established and ready,
    /// the socket is written synchronously in the same turn, so an idle
    /// connection does not wait one loop iteration for a writability event.
    ///
    /// Before establishment, data queues without loss and is flushed in order
    /// once the connection comes up. Writing to a closed connection is a
    /// caller error and reports [`ConnError::Closed`].
    pub fn write(&self, data: Vec<u8>) -> Result<(), ConnError> {
        let outcome = {
            let mut guard = self.inner.lock().unwrap();
            if guard.state == ConnState::Closed {
                return Err(ConnError::Closed);
            }
            guard.send_buf.push(data);
            if guard.state == ConnState::Established && guard.ready_send {
                self.drain_locked(&mut guard)
            } else {
                DrainOutcome::Idle
            }
        };
        self.finish_drain(outcome);
        Ok(())
    }

    /// Replaces this connection's send ring with `other`'s queued-but-unsent
    /// bytes, leaving `other`'s ring empty. Used for connection hand-off so
    /// pending output is not lost when migrating to a new connection.
    ///
    /// Must not race with `other`'s own write path; the single-threaded event
    /// loop provides that guarantee.
    pub fn move_send_buffer(&self, other: &ConnRef) {
        if std::ptr::eq(self as *const Conn, Arc::as_ptr(other)) {
            return;
        }
        let moved = other.inner.lock().unwrap().send_buf.take();
        let outcome = {
            let mut guard = self.inner.lock().unwrap();
            if guard.state == ConnState::Closed {
                return;
            }
            guard.send_buf = moved;
            if guard.state == ConnState::Established && guard.ready_send {
                self.drain_locked(&mut guard)
            } else {
                DrainOutcome::Idle
            }
        };
        self.finish_drain(outcome);
    }

    /// Closes the connection: cancels its timer, deregisters its socket,
    /// closes the descriptor, removes it from the pool, and delivers
    /// `on_teardown`. Idempotent; teardown is invoked exactly once.
    pub fn terminate(&self) {
        self.close();
    }

    // ---- state machine ---------------------------------------------------

    /// Starts (or retries) the non-blocking connect for an active connection.
    pub(crate) fn try_conn(&self) {
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        let Some(this) = self.self_ref() else {
            return;
        };
        let register_failed = {
            let mut guard = self.inner.lock().unwrap();
            if guard.state == ConnState::Closed {
                return;
            }
            guard.timer = None;
            guard.attempts += 1;
            match TcpStream::connect(self.addr) {
                Ok(mut stream) => {
                    if pool.config.nodelay {
                        let _ = stream.set_nodelay(true);
                    }
                    match pool.ev.register(
                        &mut stream,
                        self.token,
                        Interest::WRITABLE,
                        ConnEventHandler { conn: this },
                    ) {
                        Ok(()) => {
                            guard.stream = Some(stream);
                            false
                        }
                        Err(e) => {
                            warn!(conn = %self, error = %e, "failed to register connect socket");
                            true
                        }
                    }
                }
                Err(e) => {
                    debug!(conn = %self, error = %e, "connect attempt failed");
                    true
                }
            }
        };
        if register_failed {
            self.retry_or_fail();
        }
    }

    /// Registers an accepted socket and arms the handshake window. The first
    /// readiness event runs the handshake probe; the timer firing first
    /// force-closes the connection, bounding resource exposure to slow or
    /// malicious peers.
    pub(crate) fn start_handshake(&self) -> crate::error::Result<()> {
        let Some(pool) = self.pool.upgrade() else {
            return Ok(());
        };
        let Some(this) = self.self_ref() else {
            return Ok(());
        };
        let mut guard = self.inner.lock().unwrap();
        if guard.state != ConnState::Handshaking {
            return Ok(());
        }
        let Some(stream) = guard.stream.as_mut() else {
            return Ok(());
        };
        pool.ev.register(
            stream,
            self.token,
            Interest::READABLE | Interest::WRITABLE,
            ConnEventHandler { conn: this.clone() },
        )?;
        let id = pool
            .ev
            .schedule(pool.config.conn_server_timeout, move || {
                this.handshake_timed_out()
            });
        guard.timer = Some(id);
        Ok(())
    }

    /// Writability fired while connecting: decide success, still-pending, or
    /// failure from the socket error state.
    fn connect_ready(&self) {
        enum Next {
            Pending,
            Connected,
            Failed(io::Error),
        }
        let next = {
            let mut guard = self.inner.lock().unwrap();
            if guard.state != ConnState::Connecting {
                return;
            }
            let Some(stream) = guard.stream.as_mut() else {
                return;
            };
            match stream.take_error() {
                Ok(Some(e)) | Err(e) => Next::Failed(e),
                Ok(None) => match stream.peer_addr() {
                    Ok(_) => Next::Connected,
                    Err(e)
                        if e.kind() == io::ErrorKind::NotConnected
                            || e.kind() == io::ErrorKind::WouldBlock =>
                    {
                        Next::Pending
                    }
                    Err(e) => Next::Failed(e),
                },
            }
        };
        match next {
            Next::Pending => {}
            Next::Connected => self.establish(),
            Next::Failed(e) => {
                debug!(conn = %self, error = %e, "connect failed");
                self.retry_or_fail();
            }
        }
    }

    /// Tears down the failed connect socket, then either schedules a jittered
    /// retry or gives up and closes.
    fn retry_or_fail(&self) {
        let stream = {
            let mut guard = self.inner.lock().unwrap();
            if guard.state != ConnState::Connecting {
                return;
            }
            guard.stream.take()
        };
        let pool = self.pool.upgrade();
        if let (Some(mut stream), Some(pool)) = (stream, pool.as_ref()) {
            let _ = pool.ev.deregister(&mut stream, self.token);
        }
        let Some(pool) = pool else {
            self.close();
            return;
        };
        let give_up = {
            let mut guard = self.inner.lock().unwrap();
            if guard.state != ConnState::Connecting {
                return;
            }
            match guard.retries_left.as_mut() {
                Some(0) => true,
                Some(n) => {
                    *n -= 1;
                    false
                }
                None => false,
            }
        };
        if give_up {
            let attempts = self.inner.lock().unwrap().attempts;
            warn!(
                conn = %self,
                error = %ConnError::ConnectFailed { addr: self.addr, attempts },
                "giving up on connect"
            );
            self.close();
            return;
        }
        let Some(this) = self.self_ref() else {
            return;
        };
        let delay = gen_conn_timeout(pool.config.try_conn_delay);
        debug!(conn = %self, ?delay, "scheduling connect retry");
        let id = pool.ev.schedule(delay, move || this.try_conn());
        self.inner.lock().unwrap().timer = Some(id);
    }

    /// Readiness fired on a freshly accepted connection: probe socket health,
    /// then complete the handshake.
    fn handshake_ready(&self) {
        let healthy = {
            let mut guard = self.inner.lock().unwrap();
            if guard.state != ConnState::Handshaking {
                return;
            }
            let Some(stream) = guard.stream.as_mut() else {
                return;
            };
            matches!(stream.take_error(), Ok(None))
        };
        if healthy {
            self.establish();
        } else {
            debug!(conn = %self, "accepted socket failed handshake probe");
            self.close();
        }
    }

    /// The handshake window elapsed without the connection establishing.
    pub(crate) fn handshake_timed_out(&self) {
        let expired = {
            let mut guard = self.inner.lock().unwrap();
            guard.timer = None;
            guard.state == ConnState::Handshaking
        };
        if expired {
            warn!(conn = %self, error = %ConnError::HandshakeTimeout, "closing");
            self.close();
        }
    }

    /// Enters ESTABLISHED: cancels any pending timer, switches interest to
    /// read-only (writes go through `ready_send`), runs `on_setup`, and
    /// flushes anything queued before establishment.
    fn establish(&self) {
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        let rearm_failed = {
            let mut guard = self.inner.lock().unwrap();
            if matches!(guard.state, ConnState::Established | ConnState::Closed) {
                return;
            }
            if let Some(id) = guard.timer.take() {
                pool.ev.cancel_timer(id);
            }
            let inner = &mut *guard;
            let Some(stream) = inner.stream.as_mut() else {
                return;
            };
            match pool.ev.reregister(stream, self.token, Interest::READABLE) {
                Ok(()) => {
                    inner.state = ConnState::Established;
                    inner.ready_send = true;
                    false
                }
                Err(e) => {
                    warn!(conn = %self, error = %e, "failed to arm read interest");
                    true
                }
            }
        };
        if rearm_failed {
            self.close();
            return;
        }
        info!(conn = %self, "connection established");
        let Some(this) = self.self_ref() else {
            return;
        };
        if let Err(e) = self.handler.on_setup(&this) {
            debug!(conn = %self, error = %e, "connection rejected in on_setup");
            self.close();
            return;
        }
        // flush writes queued while the connection was coming up
        self.send_data();
    }

    /// Readability fired: drain the socket in `seg_buff_size` chunks into the
    /// receive ring (edge-triggered readiness requires reading until
    /// `WouldBlock`), then surface the bytes through one `on_read`.
    fn recv_data(&self) {
        let mut chunks: Vec<Vec<u8>> = Vec::new();
        let mut peer_closed = false;
        let mut fatal: Option<io::Error> = None;
        {
            let mut guard = self.inner.lock().unwrap();
            let inner = &mut *guard;
            if inner.state != ConnState::Established {
                return;
            }
            let seg = inner.seg_buff_size;
            let Some(stream) = inner.stream.as_mut() else {
                return;
            };
            loop {
                let mut chunk = vec![0u8; seg];
                match stream.read(&mut chunk) {
                    Ok(0) => {
                        peer_closed = true;
                        break;
                    }
                    Ok(n) => {
                        chunk.truncate(n);
                        chunks.push(chunk);
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        fatal = Some(e);
                        break;
                    }
                }
            }
        }
        // the receive ring is locked only after `inner` is released: an
        // embedder may hold the ring guard from `recv_buffer` while calling
        // methods that take `inner`
        if !chunks.is_empty() {
            {
                let mut ring = self.recv_buf.lock().unwrap();
                for chunk in chunks {
                    ring.push(chunk);
                }
            }
            if let Some(this) = self.self_ref() {
                self.handler.on_read(&this);
            }
        }
        if peer_closed {
            debug!(conn = %self, "peer closed connection");
            self.close();
        } else if let Some(e) = fatal {
            warn!(conn = %self, error = %e, "read error, closing");
            self.close();
        }
    }

    /// Writability fired (or an immediate send was requested): drain the send
    /// ring into the socket.
    fn send_data(&self) {
        let outcome = {
            let mut guard = self.inner.lock().unwrap();
            if guard.state != ConnState::Established {
                return;
            }
            self.drain_locked(&mut guard)
        };
        self.finish_drain(outcome);
    }

    /// Writes as much of the send ring as the kernel accepts. On full drain,
    /// drops write interest and marks the connection ready to send; on a
    /// partial write or `WouldBlock`, arms write interest and clears the
    /// ready flag.
    fn drain_locked(&self, guard: &mut MutexGuard<'_, ConnInner>) -> DrainOutcome {
        let inner = &mut **guard;
        let Some(stream) = inner.stream.as_mut() else {
            return DrainOutcome::Idle;
        };
        loop {
            let Some(chunk) = inner.send_buf.front() else {
                if !inner.ready_send {
                    inner.ready_send = true;
                    if let Some(pool) = self.pool.upgrade() {
                        let _ = pool.ev.reregister(stream, self.token, Interest::READABLE);
                    }
                }
                return DrainOutcome::Done;
            };
            match stream.write(chunk) {
                Ok(0) => {
                    // kernel took nothing; same treatment as WouldBlock
                    inner.ready_send = false;
                    if let Some(pool) = self.pool.upgrade() {
                        let _ = pool.ev.reregister(
                            stream,
                            self.token,
                            Interest::READABLE | Interest::WRITABLE,
                        );
                    }
                    return DrainOutcome::Blocked;
                }
                Ok(n) => inner.send_buf.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    inner.ready_send = false;
                    if let Some(pool) = self.pool.upgrade() {
                        let _ = pool.ev.reregister(
                            stream,
                            self.token,
                            Interest::READABLE | Interest::WRITABLE,
                        );
                    }
                    return DrainOutcome::Blocked;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return DrainOutcome::Fatal(e),
            }
        }
    }

    fn finish_drain(&self, outcome: DrainOutcome) {
        if let DrainOutcome::Fatal(e) = outcome {
            warn!(conn = %self, error = %e, "write error, closing");
            self.close();
        }
    }

    /// Deregisters everything, closes the socket, removes the pool entry,
    /// delivers `on_teardown` exactly once, and releases the self-reference.
    /// Safe to call from within any of this connection's own callbacks.
    fn close(&self) {
        let (stream, timer) = {
            let mut guard = self.inner.lock().unwrap();
            if guard.state == ConnState::Closed {
                return;
            }
            guard.state = ConnState::Closed;
            guard.ready_send = false;
            (guard.stream.take(), guard.timer.take())
        };
        // keep a strong handle through the teardown call; events can no
        // longer fire once the registration below is gone
        let this = self.self_ref.lock().unwrap().take();
        if let Some(pool) = self.pool.upgrade() {
            if let Some(id) = timer {
                pool.ev.cancel_timer(id);
            }
            if let Some(mut stream) = stream {
                let _ = pool.ev.deregister(&mut stream, self.token);
            }
            pool.remove_conn(self.token);
        }
        info!(conn = %self, "connection closed");
        if let Some(this) = this {
            self.handler.on_teardown(&this);
        }
    }
}

impl fmt::Display for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self.mode {
            ConnMode::Active => "active",
            ConnMode::Passive => "passive",
        };
        write!(f, "<{} {} #{}>", mode, self.addr, self.token.0)
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        debug!(conn = %self, "destroyed connection");
    }
}

/// Routes readiness events for one connection's socket into the state
/// machine. The `ConnRef` held here (via the handler registry) is part of
/// what keeps the connection alive while events are pending.
pub(crate) struct ConnEventHandler {
    pub(crate) conn: ConnRef,
}

impl EventHandler for ConnEventHandler {
    fn handle_event(&self, event: &Event) {
        match self.conn.state() {
            ConnState::Connecting => self.conn.connect_ready(),
            ConnState::Handshaking => self.conn.handshake_ready(),
            _ => {}
        }
        // an establishing event may carry read/write readiness with it;
        // edge-triggered polling will not deliver those edges again
        if self.conn.state() == ConnState::Established {
            if event.is_readable() || event.is_read_closed() {
                self.conn.recv_data();
            }
            if event.is_writable() {
                self.conn.send_data();
            }
        }
    }
}

/// Uniformly jittered delay in `(0, base]`; keeps many peers that lost the
/// same endpoint from retrying in lockstep.
fn gen_conn_timeout(base: Duration) -> Duration {
    base.mul_f64(rand::thread_rng().gen_range(f64::EPSILON..=1.0))
}
