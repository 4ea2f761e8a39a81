//! Callbacks for daemon-initiated pushes.
//!
//! A push carries no id; it names a `remote_method` that the client asked
//! the daemon to use via `register_remote_method`. The reader thread looks
//! the name up here and invokes the callback with the push's `params`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;

/// Callback invoked with a push's `params`.
///
/// Runs on the reader thread. While it runs no other response or push on
/// the primary connection is delivered, so keep it short or hand the work
/// off (e.g. send it down a channel).
pub type RemoteMethodCallback = Arc<dyn Fn(Value) + Send + Sync>;

/// Thread-safe map from remote-method name to callback.
#[derive(Default)]
pub struct RemoteMethods {
    callbacks: Mutex<HashMap<String, RemoteMethodCallback>>,
}

impl std::fmt::Debug for RemoteMethods {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.lock().keys().cloned().collect();
        f.debug_struct("RemoteMethods").field("names", &names).finish()
    }
}

impl RemoteMethods {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, RemoteMethodCallback>> {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind `name` to `callback`, replacing any previous binding.
    ///
    /// Returns `true` if a previous callback was replaced.
    pub fn register(&self, name: impl Into<String>, callback: RemoteMethodCallback) -> bool {
        self.lock().insert(name.into(), callback).is_some()
    }

    /// Remove the binding for `name`.
    pub fn unregister(&self, name: &str) -> bool {
        self.lock().remove(name).is_some()
    }

    /// Invoke the callback bound to `name`.
    ///
    /// The lock is released before the callback runs, so callbacks may
    /// register or unregister methods themselves. Returns `false` if `name`
    /// is not bound.
    pub fn dispatch(&self, name: &str, params: Value) -> bool {
        let Some(callback) = self.lock().get(name).map(Arc::clone) else {
            return false;
        };
        callback(params);
        true
    }

    /// Returns `true` if `name` is bound.
    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    /// Drop every binding.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of bound names.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if nothing is bound.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
