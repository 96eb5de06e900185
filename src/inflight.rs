//! Request-coalescing inflight table
//!
//! Maps keys to pending load futures so concurrent misses for the same key
//! share a single loader invocation. The shared future is broadcast-once:
//! every waiter clones the same outcome.
//!
//! Entries are removable from outside the completion path (by delete,
//! reset, or a connection loss) without disturbing waiters: removal only
//! prevents the loaded value from being cached, the waiters still receive
//! their result. `remove_if_same` compares future identity so a finished
//! load never evicts a newer load that reused its key.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, Shared};

/// Error type shared by every waiter of a failed load
pub(crate) type LoadError = Arc<dyn std::error::Error + Send + Sync>;

/// A pending load, cloneable by every concurrent caller
pub(crate) type LoadFuture<T> = Shared<BoxFuture<'static, Result<Option<T>, LoadError>>>;

pub(crate) struct InflightTable<T> {
    entries: Mutex<HashMap<String, LoadFuture<T>>>,
}

impl<T> InflightTable<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Join the pending load for `key`, or install a new one
    ///
    /// Returns the future to await and whether this caller is the leader
    /// (the one that installed it). `create` runs only for the leader.
    pub fn get_or_insert_with<F>(&self, key: &str, create: F) -> (LoadFuture<T>, bool)
    where
        F: FnOnce() -> LoadFuture<T>,
    {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(existing) => (existing.clone(), false),
            None => {
                let future = create();
                entries.insert(key.to_string(), future.clone());
                (future, true)
            }
        }
    }

    pub fn remove(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    /// Remove the entry for `key` only if it is still `future`'s episode
    ///
    /// Returns whether the entry was present and removed. A `false` means
    /// the load was invalidated mid-flight (or superseded by a newer load)
    /// and its value must not be cached.
    pub fn remove_if_same(&self, key: &str, future: &LoadFuture<T>) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(current) if current.ptr_eq(future) => {
                entries.remove(key);
                true
            }
            _ => false,
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}
