//! Interrupt notification source.
//!
//! Stands in for the display controller's ISR dispatch: listeners register
//! under a listening id (one per interrupt bit, e.g. a vsync or frame-done
//! line) and are invoked whenever that id fires. Dispatch is serialized, so
//! a callback never runs concurrently with itself.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, trace};

/// One delivered interrupt.
#[derive(Debug, Clone, Copy)]
pub struct IsrNotification {
    /// Id the interrupt fired under.
    pub listening_id: u32,
    /// When the interrupt was observed.
    pub timestamp: Instant,
}

type IsrCallback = Arc<dyn Fn(&IsrNotification) + Send + Sync>;

struct Entry {
    token: u64,
    listening_id: u32,
    callback: IsrCallback,
}

struct Registry {
    next_token: u64,
    entries: Vec<Entry>,
}

struct IsrShared {
    name: String,
    registry: Mutex<Registry>,
    /// Held for the whole of a dispatch.
    dispatch: Mutex<()>,
}

/// Dispatcher fanning interrupts out to registered callbacks.
#[derive(Clone)]
pub struct IsrSource {
    shared: Arc<IsrShared>,
}

impl IsrSource {
    pub fn new(name: &str) -> Self {
        Self {
            shared: Arc::new(IsrShared {
                name: name.to_string(),
                registry: Mutex::new(Registry {
                    next_token: 1,
                    entries: Vec::new(),
                }),
                dispatch: Mutex::new(()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Register `callback` for `listening_id`.
    ///
    /// The callback stays registered until the returned guard is dropped.
    pub fn register<F>(&self, listening_id: u32, callback: F) -> IsrRegistration
    where
        F: Fn(&IsrNotification) + Send + Sync + 'static,
    {
        let mut registry = self.shared.registry.lock();
        let token = registry.next_token;
        registry.next_token += 1;
        registry.entries.push(Entry {
            token,
            listening_id,
            callback: Arc::new(callback),
        });

        debug!(isr = %self.shared.name, listening_id, token, "ISR listener registered");

        IsrRegistration {
            source: Arc::downgrade(&self.shared),
            token,
            listening_id,
        }
    }

    /// Fire `listening_id` now. Returns how many callbacks ran.
    pub fn notify(&self, listening_id: u32) -> usize {
        self.notify_at(listening_id, Instant::now())
    }

    /// Fire `listening_id` with an explicit timestamp.
    pub fn notify_at(&self, listening_id: u32, timestamp: Instant) -> usize {
        let _dispatch = self.shared.dispatch.lock();

        // Callbacks run without the registry lock so they may register or
        // unregister other listeners.
        let callbacks: Vec<IsrCallback> = self
            .shared
            .registry
            .lock()
            .entries
            .iter()
            .filter(|e| e.listening_id == listening_id)
            .map(|e| Arc::clone(&e.callback))
            .collect();

        let notification = IsrNotification {
            listening_id,
            timestamp,
        };
        for callback in &callbacks {
            callback(&notification);
        }

        trace!(isr = %self.shared.name, listening_id, count = callbacks.len(), "ISR dispatched");
        callbacks.len()
    }

    /// Number of callbacks registered for `listening_id`.
    pub fn listener_count(&self, listening_id: u32) -> usize {
        self.shared
            .registry
            .lock()
            .entries
            .iter()
            .filter(|e| e.listening_id == listening_id)
            .count()
    }
}

/// Keeps a callback registered; unregisters on drop.
pub struct IsrRegistration {
    source: Weak<IsrShared>,
    token: u64,
    listening_id: u32,
}

impl IsrRegistration {
    pub fn listening_id(&self) -> u32 {
        self.listening_id
    }
}

impl Drop for IsrRegistration {
    fn drop(&mut self) {
        if let Some(shared) = self.source.upgrade() {
            shared
                .registry
                .lock()
                .entries
                .retain(|e| e.token != self.token);
            debug!(isr = %shared.name, listening_id = self.listening_id, "ISR listener unregistered");
        }
    }
}
