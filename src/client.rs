//! Coordinator facade.
//!
//! [`SyncClient`] is the explicitly constructed entry point every data-bearing
//! page talks to. It owns the cache store, the state notifier, and the
//! executors; multiple isolated instances can coexist (useful for testing and
//! multi-tenant hosting) — there is no hidden module-level singleton.

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{FetchError, QueryError};
use crate::key::QueryKey;
use crate::mutation::MutationExecutor;
use crate::options::{ClientConfig, MutationOptions, QueryOptions};
use crate::query::QueryExecutor;
use crate::state::{MutationState, QueryState, StateNotifier, Subscription};
use crate::store::{CacheStore, CachedValue};

/// A self-contained cache/query/mutation coordinator instance.
pub struct SyncClient {
    store: Arc<CacheStore>,
    notifier: Arc<StateNotifier>,
    queries: QueryExecutor,
    mutations: MutationExecutor,
    config: ClientConfig,
}

impl SyncClient {
    pub fn new(config: ClientConfig) -> Self {
        let store = Arc::new(CacheStore::new());
        let notifier = Arc::new(StateNotifier::new());
        Self {
            queries: QueryExecutor::new(store.clone(), notifier.clone()),
            mutations: MutationExecutor::new(store.clone(), notifier.clone()),
            store,
            notifier,
            config,
        }
    }

    /// Execute a read query. See [`QueryExecutor::execute`].
    pub async fn query<T, F, Fut, E>(
        &self,
        key: impl Into<QueryKey>,
        fetcher: F,
        options: QueryOptions,
    ) -> Result<Option<Arc<T>>, QueryError>
    where
        T: Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<FetchError> + Send + 'static,
    {
        self.queries.execute(key, fetcher, options).await
    }

    /// Execute a write mutation. See [`MutationExecutor::execute`].
    pub async fn mutate<R, M, Fut, E>(
        &self,
        name: &str,
        mutator: M,
        options: MutationOptions<R>,
    ) -> Result<R, FetchError>
    where
        R: Send,
        M: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<R, E>> + Send,
        E: Into<FetchError>,
    {
        self.mutations.execute(name, mutator, options).await
    }

    /// Run a query solely to warm the cache. Failures are logged, not raised.
    pub async fn prefetch<T, F, Fut, E>(
        &self,
        key: impl Into<QueryKey>,
        fetcher: F,
        options: QueryOptions,
    ) where
        T: Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<FetchError> + Send + 'static,
    {
        if let Err(error) = self.queries.execute::<T, _, _, _>(key, fetcher, options).await {
            warn!(error = %error, "Prefetch failed");
        }
    }

    /// The current state for a key, or the default idle state.
    pub fn query_state(&self, key: impl Into<QueryKey>) -> QueryState {
        self.notifier.query_state(key)
    }

    pub fn mutation_state(&self, name: &str) -> MutationState {
        self.notifier.mutation_state(name)
    }

    /// Subscribe to every state publication for a key.
    pub fn subscribe(
        &self,
        key: impl Into<QueryKey>,
        listener: impl Fn(&QueryState) + Send + Sync + 'static,
    ) -> Subscription {
        self.notifier.subscribe(key, listener)
    }

    /// Drop the cached entries for `keys` and flag their published state as
    /// stale, so the next query for each is treated as a miss.
    pub fn invalidate_queries(&self, keys: &[QueryKey]) {
        let canonicals: Vec<_> = keys.iter().map(QueryKey::canonical).collect();
        self.store.invalidate(&canonicals);
        for key in &canonicals {
            self.notifier.mark_stale(key);
        }
        info!(invalidated = canonicals.len(), "Queries invalidated");
    }

    pub fn invalidate_query(&self, key: impl Into<QueryKey>) {
        let key = key.into();
        self.invalidate_queries(std::slice::from_ref(&key));
    }

    /// Write a value for a key directly, bypassing the fetch cycle. Used to
    /// keep the cache warm with data already in hand after a write.
    pub fn set_query_data<T: Send + Sync + 'static>(&self, key: impl Into<QueryKey>, value: T) {
        let canonical = key.into().canonical();
        let data: CachedValue = Arc::new(value);
        let stored_at = self.store.put(canonical.clone(), data.clone());
        self.notifier
            .publish_query(&canonical, QueryState::settled(data, stored_at));
        debug!(cache_key = %canonical, "Query data set manually");
    }

    /// Patch the cached value for a key synchronously, for local optimistic
    /// edits that don't go through a full query cycle. The updater receives
    /// the current value, if one is cached with the requested type.
    pub fn update_query_data<T, F>(&self, key: impl Into<QueryKey>, updater: F)
    where
        T: Send + Sync + 'static,
        F: FnOnce(Option<&T>) -> T,
    {
        let canonical = key.into().canonical();
        let current = self
            .store
            .get(&canonical)
            .and_then(|entry| entry.data.downcast::<T>().ok());
        let next = updater(current.as_deref());

        let data: CachedValue = Arc::new(next);
        let stored_at = self.store.put(canonical.clone(), data.clone());
        self.notifier
            .publish_query(&canonical, QueryState::settled(data, stored_at));
        debug!(cache_key = %canonical, "Query data patched manually");
    }

    /// Drop every cached entry and all published state.
    pub fn clear_cache(&self) {
        self.store.clear();
        self.notifier.clear();
        info!("Cache cleared");
    }

    /// Get the underlying cache store.
    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// Get the underlying state notifier.
    pub fn notifier(&self) -> &Arc<StateNotifier> {
        &self.notifier
    }

    /// Get the underlying config.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Query options seeded from this client's configured defaults.
    pub fn query_defaults(&self) -> QueryOptions {
        self.config.query_defaults()
    }

    /// Mutation options seeded from this client's configured defaults.
    pub fn mutation_defaults<R>(&self) -> MutationOptions<R> {
        self.config.mutation_defaults()
    }
}

impl Default for SyncClient {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;

    fn users() -> Vec<String> {
        vec!["a".to_string(), "b".to_string()]
    }

    #[tokio::test]
    async fn isolated_clients_do_not_share_a_cache() {
        let first = SyncClient::default();
        let second = SyncClient::default();

        first.set_query_data("users", users());

        assert!(first.query_state("users").has_data());
        assert!(!second.query_state("users").has_data());
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_query_forces_the_next_execute_to_miss() {
        let client = SyncClient::default();
        let calls = Arc::new(AtomicU32::new(0));
        let fetcher = {
            let calls = calls.clone();
            move || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, FetchError>(users())
                }
            }
        };
        let options = QueryOptions::new().with_cache_time(Duration::from_secs(600));

        client
            .query::<Vec<String>, _, _, _>("users", fetcher.clone(), options.clone())
            .await
            .expect("first fetch");
        client
            .query::<Vec<String>, _, _, _>("users", fetcher.clone(), options.clone())
            .await
            .expect("cached read");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        client.invalidate_query("users");
        assert!(client.query_state("users").is_stale);

        client
            .query::<Vec<String>, _, _, _>("users", fetcher, options)
            .await
            .expect("refetch");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn set_query_data_publishes_state() {
        let client = SyncClient::default();
        let observed = Arc::new(Mutex::new(0usize));

        let observed_by_listener = observed.clone();
        let _subscription = client.subscribe("users", move |state: &QueryState| {
            if state.has_data() {
                *observed_by_listener.lock().expect("observed lock") += 1;
            }
        });

        client.set_query_data("users", users());

        assert_eq!(*observed.lock().expect("observed lock"), 1);
        assert_eq!(
            client.query_state("users").data::<Vec<String>>().as_deref(),
            Some(&users())
        );
    }

    #[tokio::test]
    async fn update_query_data_patches_in_place() {
        let client = SyncClient::default();
        client.set_query_data("users", users());

        client.update_query_data("users", |current: Option<&Vec<String>>| {
            let mut next = current.cloned().unwrap_or_default();
            next.push("c".to_string());
            next
        });

        assert_eq!(
            client.query_state("users").data::<Vec<String>>().as_deref(),
            Some(&vec!["a".to_string(), "b".to_string(), "c".to_string()])
        );
    }

    #[tokio::test]
    async fn update_query_data_starts_from_none_on_a_cold_key() {
        let client = SyncClient::default();

        client.update_query_data("counter", |current: Option<&u32>| {
            current.copied().unwrap_or(0) + 1
        });

        assert_eq!(client.query_state("counter").data::<u32>().as_deref(), Some(&1));
    }

    #[tokio::test]
    async fn clear_cache_drops_entries_and_state() {
        let client = SyncClient::default();
        client.set_query_data("users", users());
        client.set_query_data("posts", vec![1u32]);

        client.clear_cache();

        assert!(client.cache().is_empty());
        assert!(!client.query_state("users").has_data());
    }

    #[tokio::test(start_paused = true)]
    async fn prefetch_warms_the_cache_and_swallows_failures() {
        let client = SyncClient::default();
        let calls = Arc::new(AtomicU32::new(0));
        let fetcher = {
            let calls = calls.clone();
            move || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, FetchError>(users())
                }
            }
        };
        let options = QueryOptions::new().with_cache_time(Duration::from_secs(600));

        client
            .prefetch::<Vec<String>, _, _, _>("users", fetcher.clone(), options.clone())
            .await;
        client
            .query::<Vec<String>, _, _, _>("users", fetcher, options.clone())
            .await
            .expect("warmed read");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // A failing prefetch does not raise.
        client
            .prefetch::<Vec<String>, _, _, _>(
                "broken",
                || async { Err::<Vec<String>, _>(FetchError::network("reset")) },
                options.with_retry(0),
            )
            .await;
    }

    #[tokio::test]
    async fn client_defaults_follow_the_config() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"cache_time_ms": 1000, "retry": 0}"#).expect("config");
        let client = SyncClient::new(config);

        let options = client.query_defaults();
        assert_eq!(options.cache_time, Duration::from_secs(1));
        assert_eq!(options.retry, 0);
        assert_eq!(client.config().mutation_retry, 1);
    }
}
