use crate::ConvoyResult;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// A handler registered for a named event.
///
/// Returning an error marks the emission as failed; the message bus uses this
/// to detect delivery failures.
pub type EventHandler<E> = Arc<dyn Fn(&E) -> ConvoyResult<()> + Send + Sync>;

/// Synchronous named-event fan-out.
///
/// Handlers for the same event fire in registration order. There is no
/// ordering guarantee across different event names.
pub struct EventEmitter<E> {
    handlers: RwLock<HashMap<String, Vec<EventHandler<E>>>>,
}

impl<E> EventEmitter<E> {
    /// An emitter with no handlers.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register `handler` for `event`.
    pub fn on<F>(&self, event: impl Into<String>, handler: F)
    where
        F: Fn(&E) -> ConvoyResult<()> + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .entry(event.into())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Invoke every handler registered for `event` with `payload`.
    ///
    /// Stops at the first handler that fails and returns its error. Returns the
    /// number of handlers invoked otherwise. The handler list is snapshotted
    /// before dispatch, so handlers may register further handlers or emit.
    pub fn emit(&self, event: &str, payload: &E) -> ConvoyResult<usize> {
        let handlers: Vec<EventHandler<E>> = match self.handlers.read().get(event) {
            Some(list) => list.clone(),
            None => return Ok(0),
        };
        for handler in &handlers {
            handler(payload)?;
        }
        Ok(handlers.len())
    }

    /// Like [`emit`](Self::emit) but logs handler errors instead of returning them.
    pub fn emit_quiet(&self, event: &str, payload: &E) {
        if let Err(e) = self.emit(event, payload) {
            tracing::warn!(event = %event, error = %e, "Event handler failed");
        }
    }

    /// Number of handlers registered for `event`.
    pub fn listener_count(&self, event: &str) -> usize {
        self.handlers.read().get(event).map_or(0, Vec::len)
    }
}

impl<E> Default for EventEmitter<E> {
    fn default() -> Self {
        Self::new()
    }
}
