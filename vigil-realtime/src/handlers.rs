//! Domain collaborators and event listeners.
//!
//! Handlers are the external projections (caches, notification centers) the
//! pipeline routes each delivery to by channel. Listeners are the plain
//! `on_event` callbacks.

use crate::types::{Channel, Delivery};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::debug;

/// An external domain projection fed by the pipeline.
pub trait DomainHandler: Send + Sync {
    /// Applies one delivered event. Must be idempotent: followers can see the
    /// same event through more than one path.
    fn apply(&self, delivery: &Delivery);

    /// Drops whatever is cached for `subject_id`. Called when gap-resync fails
    /// and local state can no longer be trusted.
    fn invalidate(&self, _subject_id: &str) {}
}

/// Channel to handler routing table.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    by_channel: HashMap<Channel, Vec<Arc<dyn DomainHandler>>>,
    catch_all: Vec<Arc<dyn DomainHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, channel: Channel, handler: Arc<dyn DomainHandler>) -> &mut Self {
        self.by_channel.entry(channel).or_default().push(handler);
        self
    }

    /// Registers a handler that sees every channel.
    pub fn register_all(&mut self, handler: Arc<dyn DomainHandler>) -> &mut Self {
        self.catch_all.push(handler);
        self
    }

    /// Hands `delivery` to every handler for its channel plus the catch-alls.
    /// Returns how many handlers ran.
    pub fn route(&self, delivery: &Delivery) -> usize {
        let mut count = 0;
        if let Some(handlers) = self.by_channel.get(&delivery.channel) {
            for handler in handlers {
                handler.apply(delivery);
                count += 1;
            }
        }
        for handler in &self.catch_all {
            handler.apply(delivery);
            count += 1;
        }
        if count == 0 {
            debug!("handlers: no handler for channel {}", delivery.channel);
        }
        count
    }

    /// Asks every distinct handler to invalidate `subject_id`.
    pub fn invalidate(&self, subject_id: &str) {
        let mut seen: Vec<*const ()> = Vec::new();
        let all = self
            .by_channel
            .values()
            .flatten()
            .chain(self.catch_all.iter());
        for handler in all {
            let ptr = Arc::as_ptr(handler) as *const ();
            if seen.contains(&ptr) {
                continue;
            }
            seen.push(ptr);
            handler.invalidate(subject_id);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.catch_all.is_empty() && self.by_channel.values().all(Vec::is_empty)
    }
}

/// Callback registered through `on_event`.
pub type EventListener = Arc<dyn Fn(&Delivery) + Send + Sync>;

#[derive(Default)]
struct ListenerSet {
    next_id: u64,
    listeners: Vec<(u64, EventListener)>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registered `on_event` listeners. Cheap to clone.
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    inner: Arc<Mutex<ListenerSet>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: EventListener) -> Unsubscribe {
        let mut set = lock(&self.inner);
        set.next_id += 1;
        let id = set.next_id;
        set.listeners.push((id, listener));
        Unsubscribe {
            registry: Arc::downgrade(&self.inner),
            id,
            released: false,
        }
    }

    /// Calls every listener with `delivery`; returns how many were called.
    pub fn notify(&self, delivery: &Delivery) -> usize {
        // Snapshot so listeners can (un)subscribe from inside the callback.
        let listeners: Vec<EventListener> = lock(&self.inner)
            .listeners
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in &listeners {
            listener(delivery);
        }
        listeners.len()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Guard returned by `on_event`. Dropping it removes the listener.
#[must_use = "dropping an Unsubscribe guard removes the listener immediately"]
pub struct Unsubscribe {
    registry: Weak<Mutex<ListenerSet>>,
    id: u64,
    released: bool,
}

impl Unsubscribe {
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).listeners.retain(|(id, _)| *id != self.id);
        }
    }
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        self.release();
    }
}
