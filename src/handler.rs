use mio::event::Event;
use mio::Interest;
use std::sync::Arc;

/// Callback invoked by the reactor when a registered source becomes ready.
///
/// Handlers run serially on the event-loop thread; no two handlers execute
/// concurrently and each call runs to completion before the next event is
/// dispatched. A handler is therefore free to deregister its own source (or
/// any other) from within `handle_event`.
pub trait EventHandler: Send + Sync {
    fn handle_event(&self, event: &Event);
}

/// Registry entry for one registered source.
///
/// The handler is held behind an `Arc` so dispatch can clone it out of the
/// registry lock before invoking it; the callback may mutate the registry.
pub(crate) struct HandlerEntry {
    pub(crate) handler: Arc<dyn EventHandler>,
    pub(crate) interest: Interest,
}

impl HandlerEntry {
    pub(crate) fn new<H>(handler: H, interest: Interest) -> Self
    where
        H: EventHandler + 'static,
    {
        HandlerEntry {
            handler: Arc::new(handler),
            interest,
        }
    }
}
