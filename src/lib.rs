//! # millstream
//!
//! A reactor-based connection-management library built on [`mio`]: a
//! single-threaded event loop plus a non-blocking TCP connection pool with
//! per-connection state machines and chunked byte buffering, without relying
//! on heavyweight async runtimes.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   User Application                      │
//! │   ConnFactory / ConnHandler (on_setup, on_read, ...)    │
//! └───────────────┬─────────────────────────────────────────┘
//!                 │ hooks
//! ┌───────────────▼─────────────────────────────────────────┐
//! │   ConnPool ── Conn (state machine, send/recv ByteRing)  │
//! └───────────────┬─────────────────────────────────────────┘
//!                 │ readiness events, timers
//! ┌───────────────▼─────────────────────────────────────────┐
//! │   EventLoop ── Reactor ── PollHandle ── TimerQueue      │
//! └───────────────┬─────────────────────────────────────────┘
//!                 │ epoll / kqueue
//! ```
//!
//! All readiness callbacks and timer expiries are dispatched serially by one
//! loop thread; there are no worker threads and no blocking system calls on
//! the loop. See [`net`] for the connection layer.
//!
//! - [`EventLoop`]: registering I/O sources and timers, running the loop
//! - [`EventHandler`]: trait for raw readiness callbacks
//! - [`net::ConnPool`] / [`net::Conn`]: connection lifecycle management
//! - [`net::ByteRing`]: chunked, cursor-tracked byte queue

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use mio::{Interest, Token};

pub mod error;
pub mod handler;
pub mod net;
pub mod poll;
pub mod reactor;
pub mod timer;

pub use handler::EventHandler;
pub use mio::event::Event;
pub use timer::TimerId;

use crate::error::Result;
use crate::reactor::{DEFAULT_EVENTS_CAPACITY, DEFAULT_POLL_TIMEOUT_MS};

pub mod prelude {
    pub use crate::handler::EventHandler;
    pub use crate::net::{ByteRing, Conn, ConnFactory, ConnHandler, ConnPool, ConnRef, PoolConfig};
    pub use crate::reactor::{self, Reactor};
    pub use crate::EventLoop;
}

/// The main event loop: registers I/O sources and timers, and dispatches
/// their callbacks serially on the thread that calls [`run`](Self::run).
///
/// Connection pools ([`net::ConnPool`]) are bound to an `EventLoop` at
/// construction and drive all their socket and timer activity through it.
pub struct EventLoop {
    reactor: reactor::Reactor,
    next_token: AtomicUsize,
}

impl Default for EventLoop {
    /// Creates an `EventLoop` with default capacity (1024 events per poll,
    /// 100ms poll timeout).
    ///
    /// # Panics
    ///
    /// Panics if the OS selector cannot be initialized.
    fn default() -> Self {
        Self::new(DEFAULT_EVENTS_CAPACITY, DEFAULT_POLL_TIMEOUT_MS)
            .expect("failed to initialize event loop with default settings")
    }
}

impl EventLoop {
    pub fn new(events_capacity: usize, poll_timeout_ms: u64) -> Result<Self> {
        let reactor = reactor::Reactor::new(events_capacity, poll_timeout_ms)?;
        Ok(Self {
            reactor,
            // Token(0) is reserved for the internal waker.
            next_token: AtomicUsize::new(1),
        })
    }

    /// Allocates a token unique within this event loop.
    pub fn next_token(&self) -> Token {
        Token(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    /// Registers an I/O source; `handler` is invoked on the loop thread
    /// whenever the source becomes ready for one of `interests`.
    pub fn register<H, S>(
        &self,
        source: &mut S,
        token: Token,
        interests: Interest,
        handler: H,
    ) -> Result<()>
    where
        H: EventHandler + 'static,
        S: mio::event::Source + ?Sized,
    {
        self.reactor
            .poll_handle
            .register(source, token, interests, handler)
    }

    /// Changes the interest set of a registered source, keeping its handler.
    pub fn reregister<S>(&self, source: &mut S, token: Token, interests: Interest) -> Result<()>
    where
        S: mio::event::Source + ?Sized,
    {
        self.reactor.poll_handle.reregister(source, token, interests)
    }

    /// Removes a source; no further events will be delivered for it. The
    /// removal is synchronous, so once this returns the handler can be freed.
    pub fn deregister<S>(&self, source: &mut S, token: Token) -> Result<()>
    where
        S: mio::event::Source + ?Sized,
    {
        self.reactor.poll_handle.deregister(source, token)
    }

    /// Schedules a one-shot callback `delay` from now on the loop thread.
    /// Wakes the poller so a nearer deadline takes effect immediately.
    pub fn schedule<F>(&self, delay: Duration, callback: F) -> TimerId
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.reactor.timers.schedule(delay, callback);
        let _ = self.reactor.poll_handle.wake();
        id
    }

    /// Cancels a pending timer. Returns false if it already fired.
    pub fn cancel_timer(&self, id: TimerId) -> bool {
        self.reactor.timers.cancel(id)
    }

    /// Runs the event loop on the current thread, blocking until
    /// [`stop`](Self::stop) is called or a fatal poll error occurs.
    pub fn run(&self) -> Result<()> {
        self.reactor.run()
    }

    /// Signals the loop to stop after the current iteration. Thread-safe and
    /// non-blocking.
    pub fn stop(&self) {
        self.reactor.get_shutdown_handle().shutdown();
        let _ = self.reactor.poll_handle.wake();
    }
}
