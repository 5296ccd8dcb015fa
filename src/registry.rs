//! Inbound-request fan-out.
//!
//! Server-pushed requests arrive on the authenticated channel as soon as it
//! opens, usually before the application has finished wiring itself up. The
//! registry buffers them until the first handler registers, then replays the
//! backlog in arrival order and delivers live from then on.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::Result;
use crate::resource::IncomingRequest;

/// Consumer of server-pushed requests.
pub trait RequestHandler: Send + Sync {
    /// Handle one pushed request. An error here is logged and does not stop
    /// delivery to other handlers.
    fn handle_request(&self, request: IncomingRequest) -> Result<()>;
}

/// Token returned by [`RequestHandlerRegistry::register`]; passing it back to
/// [`unregister`](RequestHandlerRegistry::unregister) removes that handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(u64);

#[derive(Default)]
struct Inner {
    handlers: Vec<(u64, Arc<dyn RequestHandler>)>,
    buffer: VecDeque<IncomingRequest>,
    next_id: u64,
}

/// Registry of inbound-request handlers, shared between the manager and the
/// dispatch closures installed on connection resources.
#[derive(Clone, Default)]
pub struct RequestHandlerRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl RequestHandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler. If it is the first one, the buffered backlog is
    /// delivered to it immediately, oldest first.
    pub fn register(&self, handler: Arc<dyn RequestHandler>) -> HandlerId {
        let (id, backlog) = {
            let mut inner = self.lock();
            let id = inner.next_id;
            inner.next_id += 1;

            let backlog = if inner.handlers.is_empty() {
                std::mem::take(&mut inner.buffer)
            } else {
                VecDeque::new()
            };
            inner.handlers.push((id, Arc::clone(&handler)));
            (id, backlog)
        };

        // Replay outside the lock; a handler may re-enter the registry.
        for request in backlog {
            deliver(&handler, request);
        }

        HandlerId(id)
    }

    /// Remove a previously registered handler. Unknown ids are ignored.
    pub fn unregister(&self, id: HandlerId) {
        self.lock().handlers.retain(|(held, _)| *held != id.0);
    }

    /// Deliver a pushed request to every registered handler, or buffer it if
    /// none have registered yet.
    pub fn dispatch(&self, request: IncomingRequest) {
        let handlers: Vec<Arc<dyn RequestHandler>> = {
            let mut inner = self.lock();
            if inner.handlers.is_empty() {
                inner.buffer.push_back(request);
                return;
            }
            inner
                .handlers
                .iter()
                .map(|(_, handler)| Arc::clone(handler))
                .collect()
        };

        for handler in &handlers {
            deliver(handler, request.clone());
        }
    }

    /// Number of requests waiting for a first handler.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.lock().buffer.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl std::fmt::Debug for RequestHandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("RequestHandlerRegistry")
            .field("handlers", &inner.handlers.len())
            .field("buffered", &inner.buffer.len())
            .finish()
    }
}

fn deliver(handler: &Arc<dyn RequestHandler>, request: IncomingRequest) {
    let id = request.id;
    if let Err(error) = handler.handle_request(request) {
        tracing::warn!(id, %error, "inbound request handler failed");
    }
}
