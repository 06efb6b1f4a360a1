//! Per-instance callback registries for channel lifecycle events.
//!
//! Each controller owns its own registries (connected, disconnected, data,
//! percentage) so multiple controllers in one process never leak subscribers
//! into each other. Registries are append-only: every registered callback is
//! invoked for every corresponding event, there is no unregistration and no
//! once-semantics.

use std::sync::{Arc, Mutex, PoisonError};

/// Callback stored in a registry.
pub type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// An append-only list of subscriber callbacks for one event kind.
///
/// Emission snapshots the list before invoking anything, so a callback may
/// register further callbacks without deadlocking; additions made during an
/// emission are first invoked on the next event.
pub struct CallbackRegistry<T> {
    callbacks: Mutex<Vec<Callback<T>>>,
}

impl<T> std::fmt::Debug for CallbackRegistry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("len", &self.len())
            .finish()
    }
}

impl<T> Default for CallbackRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CallbackRegistry<T> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Append a callback. Callbacks are never removed.
    pub fn add<F>(&self, callback: F)
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(callback));
    }

    /// Invoke every registered callback with `value`, in registration order.
    pub fn emit(&self, value: &T) {
        let snapshot: Vec<Callback<T>> = self
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for callback in snapshot {
            callback(value);
        }
    }

    /// Number of registered callbacks.
    pub fn len(&self) -> usize {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
