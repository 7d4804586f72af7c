//! Typed event publication with a dedicated delivery thread.
//!
//! Events are queued onto a channel and handed to subscribers from a
//! forwarder thread, so publishers never run handlers while holding
//! session locks. A handler may unsubscribe or call back into the
//! session (including `disconnect`) without deadlocking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

/// Handle returned by [`EventBus::subscribe`]; pass it back to
/// [`EventBus::unsubscribe`] to cancel delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionToken(u64);

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct BusShared<T> {
    handlers: Mutex<Vec<(u64, Handler<T>)>>,
    next_id: AtomicU64,
}

/// A clonable publisher for one event type.
pub struct EventBus<T: Send + 'static> {
    shared: Arc<BusShared<T>>,
    tx: mpsc::Sender<T>,
}

impl<T: Send + 'static> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        EventBus {
            shared: self.shared.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<T: Send + 'static> EventBus<T> {
    /// Create a bus and start its delivery thread. The thread exits
    /// when the last publisher clone is dropped.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel::<T>();
        let shared = Arc::new(BusShared {
            handlers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        });

        let delivery = shared.clone();
        thread::spawn(move || {
            while let Ok(event) = rx.recv() {
                // Snapshot outside the handler calls, so a handler can
                // subscribe or unsubscribe without deadlocking.
                let snapshot: Vec<Handler<T>> = match delivery.handlers.lock() {
                    Ok(handlers) => handlers.iter().map(|(_, h)| h.clone()).collect(),
                    Err(_) => break,
                };
                for handler in snapshot {
                    handler(&event);
                }
            }
        });

        EventBus { shared, tx }
    }

    /// Register a handler; it runs on the delivery thread for every
    /// subsequent event.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionToken
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut handlers) = self.shared.handlers.lock() {
            handlers.push((id, Arc::new(handler)));
        }
        SubscriptionToken(id)
    }

    /// Remove a previously registered handler. Unknown tokens are
    /// ignored.
    pub fn unsubscribe(&self, token: SubscriptionToken) {
        if let Ok(mut handlers) = self.shared.handlers.lock() {
            handlers.retain(|(id, _)| *id != token.0);
        }
    }

    /// Queue an event for delivery. Never blocks on handlers.
    pub fn publish(&self, event: T) {
        let _ = self.tx.send(event);
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.shared.handlers.lock().map(|h| h.len()).unwrap_or(0)
    }
}

impl<T: Send + 'static> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}
