//! Book-keeping for the clients an adapter has opened.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::OnceCell;

use crate::error::TenantResult;

/// Tracks shared per-target clients and independently created clients.
///
/// Shared clients are opened at most once per key: concurrent
/// [`get_or_open`](ClientRegistry::get_or_open) calls for one key wait on the
/// same open. A failed open leaves the key empty so the next call retries.
pub struct ClientRegistry<C> {
    shared: Mutex<HashMap<String, Arc<OnceCell<C>>>>,
    owned: Mutex<HashMap<u64, C>>,
    next_id: AtomicU64,
}

impl<C> Default for ClientRegistry<C> {
    fn default() -> Self {
        Self {
            shared: Mutex::new(HashMap::new()),
            owned: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<C: Clone + Send + Sync> ClientRegistry<C> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the shared client for `key`, opening it with `open` if needed.
    pub async fn get_or_open<F, Fut>(&self, key: &str, open: F) -> TenantResult<C>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = TenantResult<C>>,
    {
        let cell = {
            let mut shared = self.shared.lock();
            Arc::clone(shared.entry(key.to_string()).or_default())
        };
        cell.get_or_try_init(open).await.cloned()
    }

    /// Allocate an id for an independently created client.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Remember an independently created client until it is closed.
    pub fn track(&self, id: u64, client: C) {
        self.owned.lock().insert(id, client);
    }

    /// Forget a closed client. Returns whether it was tracked.
    pub fn untrack(&self, id: u64) -> bool {
        self.owned.lock().remove(&id).is_some()
    }

    /// Take every open client out of the registry for closing.
    pub fn drain(&self) -> Vec<C> {
        let shared = std::mem::take(&mut *self.shared.lock());
        let owned = std::mem::take(&mut *self.owned.lock());

        shared
            .into_values()
            .filter_map(|cell| cell.get().cloned())
            .chain(owned.into_values())
            .collect()
    }

    /// Number of open shared and owned clients.
    pub fn len(&self) -> usize {
        let shared = self
            .shared
            .lock()
            .values()
            .filter(|cell| cell.initialized())
            .count();
        shared + self.owned.lock().len()
    }

    /// Check if nothing is open.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
