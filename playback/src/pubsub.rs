//! Fan-out of engine events to dynamically-registered subscribers.
//!
//! Subscriber lists are append-only for the process lifetime; there is no
//! unsubscription. Every publish hands each subscriber its own copy of the
//! event on a fresh task, so a slow or panicking handler cannot stall the
//! engine or its peers.

use parking_lot::RwLock;
use std::sync::Arc;

type Handler<T> = Arc<dyn Fn(T) + Send + Sync>;

pub struct Publisher<T> {
    subscribers: RwLock<Vec<Handler<T>>>,
}

impl<T> Default for Publisher<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Publisher<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Register a handler. Handlers stay registered until shutdown.
    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        self.subscribers.write().push(Arc::new(handler));
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl<T> Publisher<T>
where
    T: Clone + Send + 'static,
{
    /// Deliver `event` to every subscriber, one task each.
    ///
    /// Requires a running tokio runtime on the calling thread.
    pub fn publish(&self, event: T) {
        let subscribers = self.subscribers.read().clone();
        for subscriber in subscribers {
            let event = event.clone();
            tokio::spawn(async move {
                subscriber(event);
            });
        }
    }
}
