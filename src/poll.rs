use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use mio::{Events, Interest, Poll, Registry, Token, Waker};

use crate::error::{Error, Result};
use crate::handler::{EventHandler, HandlerEntry};

/// Token reserved for the internal waker; never handed out to sources.
pub(crate) const WAKER_TOKEN: Token = Token(0);

/// Wrapper around `mio::Poll` pairing the OS selector with the token->handler
/// registry.
///
/// The `Registry` clone lets sources be (de)registered from any thread while
/// the poller itself is only locked by the reactor during `poll`.
pub struct PollHandle {
    poller: Mutex<Poll>,
    registry: Registry,
    handlers: Mutex<HashMap<Token, HandlerEntry>>,
    waker: Arc<Waker>,
}

impl PollHandle {
    pub fn new() -> Result<Self> {
        let poller = Poll::new()?;
        let waker = Waker::new(poller.registry(), WAKER_TOKEN)?;
        let registry = poller.registry().try_clone()?;
        Ok(PollHandle {
            poller: Mutex::new(poller),
            registry,
            handlers: Mutex::new(HashMap::new()),
            waker: Arc::new(waker),
        })
    }

    pub fn register<H, S>(
        &self,
        src: &mut S,
        token: Token,
        interest: Interest,
        handler: H,
    ) -> Result<()>
    where
        H: EventHandler + 'static,
        S: mio::event::Source + ?Sized,
    {
        let mut handlers = self.handlers.lock().unwrap();
        if handlers.contains_key(&token) {
            return Err(Error::TokenInUse(token));
        }
        src.register(&self.registry, token, interest)?;
        handlers.insert(token, HandlerEntry::new(handler, interest));
        Ok(())
    }

    /// Updates the interest set of an already-registered source, keeping its
    /// handler. Connections use this to arm and disarm write readiness.
    pub fn reregister<S>(&self, src: &mut S, token: Token, interest: Interest) -> Result<()>
    where
        S: mio::event::Source + ?Sized,
    {
        let mut handlers = self.handlers.lock().unwrap();
        let entry = handlers
            .get_mut(&token)
            .ok_or(Error::UnknownToken(token))?;
        src.reregister(&self.registry, token, interest)?;
        entry.interest = interest;
        Ok(())
    }

    pub fn deregister<S>(&self, src: &mut S, token: Token) -> Result<()>
    where
        S: mio::event::Source + ?Sized,
    {
        let entry = self.handlers.lock().unwrap().remove(&token);
        src.deregister(&self.registry)?;
        if entry.is_none() {
            return Err(Error::UnknownToken(token));
        }
        Ok(())
    }

    /// Clones the handler registered for `token`, if any, so the caller can
    /// invoke it without holding the registry lock.
    pub(crate) fn lookup(&self, token: Token) -> Option<(Arc<dyn EventHandler>, Interest)> {
        let handlers = self.handlers.lock().unwrap();
        handlers
            .get(&token)
            .map(|entry| (entry.handler.clone(), entry.interest))
    }

    pub fn poll(&self, events: &mut Events, timeout: Option<Duration>) -> Result<()> {
        let mut poller = self.poller.lock().unwrap();
        poller.poll(events, timeout)?;
        Ok(())
    }

    pub fn wake(&self) -> Result<()> {
        self.waker.wake()?;
        Ok(())
    }
}
