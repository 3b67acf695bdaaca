use std::{
    sync::atomic::{AtomicBool, Ordering},
    sync::Arc,
    time::{Duration, Instant},
};

use mio::Events;
use tracing::trace;

use crate::error::Result;
use crate::poll::{PollHandle, WAKER_TOKEN};
use crate::timer::TimerQueue;

pub const DEFAULT_EVENTS_CAPACITY: usize = 1024;
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 100;

/// Core event loop: polls for readiness, dispatches handlers, fires timers.
///
/// Dispatch is strictly serial on the thread that calls [`Reactor::run`]:
/// each handler and each timer callback runs to completion before the next is
/// invoked. Callback ordering for a single source therefore matches readiness
/// order, and a callback that closes a connection can rely on no further
/// callback firing against it once its registration is gone.
pub struct Reactor {
    pub(crate) poll_handle: PollHandle,
    pub(crate) timers: Arc<TimerQueue>,
    events_capacity: usize,
    poll_timeout: Duration,
    running: Arc<AtomicBool>,
}

impl Reactor {
    pub fn new(events_capacity: usize, poll_timeout_ms: u64) -> Result<Self> {
        Ok(Self {
            poll_handle: PollHandle::new()?,
            timers: Arc::new(TimerQueue::new()),
            events_capacity,
            poll_timeout: Duration::from_millis(poll_timeout_ms),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn run(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        let mut events = Events::with_capacity(self.events_capacity);

        while self.running.load(Ordering::SeqCst) {
            let timeout = self.next_timeout();
            match self.poll_handle.poll(&mut events, Some(timeout)) {
                Ok(()) => {}
                Err(crate::error::Error::Io(ref e))
                    if e.kind() == std::io::ErrorKind::Interrupted =>
                {
                    continue;
                }
                Err(e) => return Err(e),
            }

            for event in events.iter() {
                let token = event.token();
                if token == WAKER_TOKEN {
                    continue;
                }
                // Clone the handler out so the callback can touch the
                // registry (e.g. deregister itself).
                let Some((handler, interest)) = self.poll_handle.lookup(token) else {
                    trace!(?token, "event for token with no handler, dropped");
                    continue;
                };
                let wanted = (interest.is_readable() && event.is_readable())
                    || (interest.is_writable() && event.is_writable())
                    || event.is_error()
                    || event.is_read_closed()
                    || event.is_write_closed();
                if wanted {
                    handler.handle_event(event);
                }
            }

            self.timers.fire_expired(Instant::now());
        }
        Ok(())
    }

    /// Bounds the poll timeout by the nearest timer deadline so an expiry is
    /// never delayed by a quiet socket set.
    fn next_timeout(&self) -> Duration {
        match self.timers.next_deadline() {
            Some(deadline) => deadline
                .saturating_duration_since(Instant::now())
                .min(self.poll_timeout),
            None => self.poll_timeout,
        }
    }

    pub fn get_shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            running: self.running.clone(),
        }
    }
}

/// Cloneable handle that stops the reactor from any thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    running: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
