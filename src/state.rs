//! Observable query and mutation state.
//!
//! The [`StateNotifier`] holds the authoritative, externally-readable state of
//! every in-flight or completed query and mutation, and broadcasts updates to
//! subscribers. Writes happen under the lock; listeners are invoked after it
//! is released with a cloned snapshot, so no observer sees a partially
//! updated state.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use tokio::time::Instant;
use tracing::debug;

use crate::error::FetchError;
use crate::key::{CanonicalKey, QueryKey};
use crate::lock::{rw_read, rw_write};
use crate::store::{CacheEntry, CachedValue};

const SOURCE: &str = "state";

/// Externally observable state of one logical query.
///
/// `is_loading` is true only while no data (cached or fresh) is available
/// yet; `is_fetching` is true whenever a network operation is outstanding,
/// including background revalidation while stale data is shown.
#[derive(Clone, Default)]
pub struct QueryState {
    data: Option<CachedValue>,
    pub is_loading: bool,
    pub is_fetching: bool,
    pub error: Option<FetchError>,
    pub updated_at: Option<Instant>,
    pub is_stale: bool,
}

impl QueryState {
    /// The cached data, downcast to the caller's type.
    pub fn data<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.data
            .as_ref()
            .and_then(|data| data.clone().downcast::<T>().ok())
    }

    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    /// A fetch is outstanding; previous data (if any) stays visible.
    pub(crate) fn fetching(previous: Option<&CacheEntry>) -> Self {
        match previous {
            Some(entry) => Self {
                data: Some(entry.data.clone()),
                is_loading: false,
                is_fetching: true,
                error: None,
                updated_at: Some(entry.stored_at),
                is_stale: true,
            },
            None => Self {
                data: None,
                is_loading: true,
                is_fetching: true,
                error: None,
                updated_at: None,
                is_stale: false,
            },
        }
    }

    /// A fetch (or manual write) settled successfully.
    pub(crate) fn settled(data: CachedValue, stored_at: Instant) -> Self {
        Self {
            data: Some(data),
            is_loading: false,
            is_fetching: false,
            error: None,
            updated_at: Some(stored_at),
            is_stale: false,
        }
    }

    /// Retries were exhausted; the last known cached data is retained.
    pub(crate) fn failed(previous: Option<&CacheEntry>, error: FetchError) -> Self {
        Self {
            data: previous.map(|entry| entry.data.clone()),
            is_loading: false,
            is_fetching: false,
            error: Some(error),
            updated_at: previous.map(|entry| entry.stored_at),
            is_stale: previous.is_some(),
        }
    }
}

impl fmt::Debug for QueryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryState")
            .field("has_data", &self.data.is_some())
            .field("is_loading", &self.is_loading)
            .field("is_fetching", &self.is_fetching)
            .field("error", &self.error)
            .field("is_stale", &self.is_stale)
            .finish()
    }
}

/// Externally observable state of one named mutation. Last write wins per
/// name.
#[derive(Debug, Clone, Default)]
pub struct MutationState {
    pub is_loading: bool,
    pub error: Option<FetchError>,
}

type QueryListener = Arc<dyn Fn(&QueryState) + Send + Sync>;
type ListenerTable = RwLock<HashMap<CanonicalKey, Vec<(u64, QueryListener)>>>;

/// Holds query/mutation state and fans updates out to subscribers.
pub struct StateNotifier {
    queries: RwLock<HashMap<CanonicalKey, QueryState>>,
    mutations: RwLock<HashMap<String, MutationState>>,
    listeners: Arc<ListenerTable>,
    listener_seq: AtomicU64,
}

impl StateNotifier {
    pub fn new() -> Self {
        Self {
            queries: RwLock::new(HashMap::new()),
            mutations: RwLock::new(HashMap::new()),
            listeners: Arc::new(RwLock::new(HashMap::new())),
            listener_seq: AtomicU64::new(0),
        }
    }

    /// The current state for a key, or the default idle state if the key has
    /// never been queried.
    pub fn query_state(&self, key: impl Into<QueryKey>) -> QueryState {
        let canonical = key.into().canonical();
        rw_read(&self.queries, SOURCE, "query_state")
            .get(&canonical)
            .cloned()
            .unwrap_or_default()
    }

    pub fn mutation_state(&self, name: &str) -> MutationState {
        rw_read(&self.mutations, SOURCE, "mutation_state")
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// Subscribe to every state publication for a key.
    ///
    /// The returned [`Subscription`] detaches on [`Subscription::unsubscribe`]
    /// or drop.
    pub fn subscribe(
        &self,
        key: impl Into<QueryKey>,
        listener: impl Fn(&QueryState) + Send + Sync + 'static,
    ) -> Subscription {
        let canonical = key.into().canonical();
        let id = self.listener_seq.fetch_add(1, Ordering::SeqCst);
        rw_write(&self.listeners, SOURCE, "subscribe")
            .entry(canonical.clone())
            .or_default()
            .push((id, Arc::new(listener)));

        debug!(cache_key = %canonical, listener_id = id, "Listener subscribed");

        Subscription {
            listeners: Arc::downgrade(&self.listeners),
            key: canonical,
            id,
        }
    }

    /// Replace the state for a key and notify its listeners.
    pub(crate) fn publish_query(&self, key: &CanonicalKey, state: QueryState) {
        rw_write(&self.queries, SOURCE, "publish_query").insert(key.clone(), state.clone());
        self.notify(key, &state);
    }

    /// Mutate the state for a key in place and notify its listeners.
    pub(crate) fn update_query(&self, key: &CanonicalKey, update: impl FnOnce(&mut QueryState)) {
        let state = {
            let mut queries = rw_write(&self.queries, SOURCE, "update_query");
            let state = queries.entry(key.clone()).or_default();
            update(state);
            state.clone()
        };
        self.notify(key, &state);
    }

    /// Flag previously published data as stale, retaining it. A no-op for
    /// keys that were never queried.
    pub(crate) fn mark_stale(&self, key: &CanonicalKey) {
        let updated = {
            let mut queries = rw_write(&self.queries, SOURCE, "mark_stale");
            queries.get_mut(key).map(|state| {
                state.is_stale = true;
                state.clone()
            })
        };
        if let Some(state) = updated {
            self.notify(key, &state);
        }
    }

    pub(crate) fn publish_mutation(&self, name: &str, state: MutationState) {
        rw_write(&self.mutations, SOURCE, "publish_mutation").insert(name.to_string(), state);
    }

    /// Drop all query and mutation state. Listeners stay subscribed.
    pub(crate) fn clear(&self) {
        rw_write(&self.queries, SOURCE, "clear.queries").clear();
        rw_write(&self.mutations, SOURCE, "clear.mutations").clear();
    }

    fn notify(&self, key: &CanonicalKey, state: &QueryState) {
        let listeners: Vec<QueryListener> = rw_read(&self.listeners, SOURCE, "notify")
            .get(key)
            .map(|entries| entries.iter().map(|(_, listener)| listener.clone()).collect())
            .unwrap_or_default();
        for listener in listeners {
            listener(state);
        }
    }
}

impl Default for StateNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle for an active state subscription. Detaches on drop.
pub struct Subscription {
    listeners: Weak<ListenerTable>,
    key: CanonicalKey,
    id: u64,
}

impl Subscription {
    /// Detach the listener explicitly.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(table) = self.listeners.upgrade() else {
            return;
        };
        let mut listeners = rw_write(&table, SOURCE, "unsubscribe");
        if let Some(entries) = listeners.get_mut(&self.key) {
            entries.retain(|(listener_id, _)| *listener_id != self.id);
            if entries.is_empty() {
                listeners.remove(&self.key);
            }
        }
        debug!(cache_key = %self.key, listener_id = self.id, "Listener detached");
    }
}
