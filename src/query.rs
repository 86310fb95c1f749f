//! Query execution.
//!
//! The executor consults the cache first, and on a miss or an expired entry
//! runs the injected fetcher with bounded retries, writing the result back
//! through the store and the notifier. Concurrent callers of the same key
//! share a single in-flight fetch instead of racing the network, and a
//! caller's cancellation token stops retries and suppresses the cache write.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use metrics::{counter, histogram};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{FetchError, QueryError};
use crate::key::{CanonicalKey, QueryKey};
use crate::lock::rw_write;
use crate::options::QueryOptions;
use crate::retry::{AttemptError, RetryPolicy, run_attempts};
use crate::state::{QueryState, StateNotifier};
use crate::store::{CacheStore, CachedValue};

const SOURCE: &str = "query";

const METRIC_CACHE_HITS: &str = "sincro_query_cache_hits_total";
const METRIC_CACHE_MISSES: &str = "sincro_query_cache_misses_total";
const METRIC_FETCH_ERRORS: &str = "sincro_query_fetch_errors_total";
const METRIC_FETCH_MS: &str = "sincro_query_fetch_ms";

type FetchResult = Result<CachedValue, QueryError>;
type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;

/// Registry of outstanding fetches, keyed by canonical key.
///
/// A second caller for a key with a fetch outstanding awaits the same future
/// rather than starting a new one. This also closes the concurrent
/// last-write-wins gap: there is never more than one writer per key.
pub(crate) struct InflightRegistry {
    fetches: RwLock<HashMap<CanonicalKey, SharedFetch>>,
}

impl InflightRegistry {
    fn new() -> Self {
        Self {
            fetches: RwLock::new(HashMap::new()),
        }
    }

    fn remove(&self, key: &CanonicalKey) {
        rw_write(&self.fetches, SOURCE, "inflight_remove").remove(key);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        crate::lock::rw_read(&self.fetches, SOURCE, "inflight_len").len()
    }
}

/// Cache-first executor for read queries.
#[derive(Clone)]
pub struct QueryExecutor {
    store: Arc<CacheStore>,
    notifier: Arc<StateNotifier>,
    inflight: Arc<InflightRegistry>,
}

impl QueryExecutor {
    pub fn new(store: Arc<CacheStore>, notifier: Arc<StateNotifier>) -> Self {
        Self {
            store,
            notifier,
            inflight: Arc::new(InflightRegistry::new()),
        }
    }

    /// Execute a query.
    ///
    /// Returns `Ok(None)` iff the query is disabled, `Ok(Some(data))` on a
    /// cache hit or successful fetch, and an error once retries are exhausted
    /// or the caller's cancellation token fires.
    pub async fn execute<T, F, Fut, E>(
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
        if !options.enabled {
            debug!(result = "disabled", "Query short-circuited");
            return Ok(None);
        }

        let canonical = key.into().canonical();

        if let Some(entry) = self.store.get(&canonical) {
            if self.store.is_valid(&entry, options.cache_time) {
                match entry.data.clone().downcast::<T>() {
                    Ok(data) => {
                        counter!(METRIC_CACHE_HITS).increment(1);
                        let revalidate = options
                            .stale_time
                            .is_some_and(|stale_time| entry.stored_at.elapsed() >= stale_time);
                        if revalidate {
                            debug!(
                                cache_key = %canonical,
                                result = "stale_hit",
                                "Serving cached data while revalidating"
                            );
                            let shared = self.join_or_spawn(canonical, fetcher, &options);
                            tokio::spawn(async move {
                                let _ = shared.await;
                            });
                        } else {
                            debug!(cache_key = %canonical, result = "hit", "Query served from cache");
                            self.notifier.publish_query(
                                &canonical,
                                QueryState::settled(entry.data.clone(), entry.stored_at),
                            );
                        }
                        return Ok(Some(data));
                    }
                    Err(_) => {
                        warn!(
                            cache_key = %canonical,
                            "Cached value has a different type; treating as a miss"
                        );
                    }
                }
            }
        }

        counter!(METRIC_CACHE_MISSES).increment(1);
        let shared = self.join_or_spawn(canonical.clone(), fetcher, &options);
        match shared.await {
            Ok(value) => match value.downcast::<T>() {
                Ok(data) => Ok(Some(data)),
                Err(_) => {
                    warn!(
                        cache_key = %canonical,
                        "Fetched value has a different type than this caller requested"
                    );
                    Err(QueryError::Fetch(FetchError::request(
                        "cached value type does not match the requested type",
                    )))
                }
            },
            Err(error) => Err(error),
        }
    }

    /// Join the in-flight fetch for `canonical`, or install a new one.
    fn join_or_spawn<T, F, Fut, E>(
        &self,
        canonical: CanonicalKey,
        fetcher: F,
        options: &QueryOptions,
    ) -> SharedFetch
    where
        T: Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<FetchError> + Send + 'static,
    {
        let mut fetches = rw_write(&self.inflight.fetches, SOURCE, "join_or_spawn");
        if let Some(existing) = fetches.get(&canonical) {
            debug!(cache_key = %canonical, result = "joined", "Query joined an in-flight fetch");
            return existing.clone();
        }

        let driver = drive_fetch(self.clone(), canonical.clone(), fetcher, options.clone())
            .boxed()
            .shared();
        fetches.insert(canonical, driver.clone());
        driver
    }
}

/// The single writer for one key: publishes the fetching state, runs the
/// attempt loop, and settles cache and state. Exactly one driver exists per
/// key at a time; joiners await its shared future.
async fn drive_fetch<T, F, Fut, E>(
    executor: QueryExecutor,
    canonical: CanonicalKey,
    fetcher: F,
    options: QueryOptions,
) -> FetchResult
where
    T: Send + Sync + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    E: Into<FetchError> + Send + 'static,
{
    let previous = executor.store.get(&canonical);
    executor
        .notifier
        .publish_query(&canonical, QueryState::fetching(previous.as_ref()));

    let cancel = options.cancel.clone().unwrap_or_default();
    let policy = RetryPolicy::new(options.retry, options.retry_delay);
    let fetch_started = Instant::now();

    let outcome = run_attempts(&policy, &cancel, canonical.as_str(), fetcher).await;
    executor.inflight.remove(&canonical);

    match outcome {
        Ok(value) => {
            let data: CachedValue = Arc::new(value);
            let stored_at = executor.store.put(canonical.clone(), data.clone());
            executor
                .notifier
                .publish_query(&canonical, QueryState::settled(data.clone(), stored_at));
            histogram!(METRIC_FETCH_MS).record(fetch_started.elapsed().as_secs_f64() * 1000.0);
            info!(cache_key = %canonical, result = "stored", "Query fetch complete");
            Ok(data)
        }
        Err(AttemptError::Cancelled) => {
            debug!(cache_key = %canonical, result = "cancelled", "Query fetch cancelled");
            executor.notifier.update_query(&canonical, |state| {
                state.is_loading = false;
                state.is_fetching = false;
            });
            Err(QueryError::Cancelled)
        }
        Err(AttemptError::Exhausted(error)) => {
            counter!(METRIC_FETCH_ERRORS).increment(1);
            warn!(
                cache_key = %canonical,
                error_kind = error.kind(),
                error = %error,
                "Query fetch failed after all attempts"
            );
            executor.notifier.publish_query(
                &canonical,
                QueryState::failed(previous.as_ref(), error.clone()),
            );
            Err(QueryError::Fetch(error))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use tokio::time::sleep;
    use tokio_util::sync::CancellationToken;

    use super::*;

    fn executor() -> QueryExecutor {
        QueryExecutor::new(Arc::new(CacheStore::new()), Arc::new(StateNotifier::new()))
    }

    fn counting_fetcher(
        calls: Arc<AtomicU32>,
        value: Vec<String>,
    ) -> impl Fn() -> BoxFuture<'static, Result<Vec<String>, FetchError>> + Clone {
        move || {
            let calls = calls.clone();
            let value = value.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(value)
            }
            .boxed()
        }
    }

    fn users() -> Vec<String> {
        vec!["a".to_string(), "b".to_string()]
    }

    #[tokio::test]
    async fn disabled_query_is_a_no_op() {
        let executor = executor();
        let calls = Arc::new(AtomicU32::new(0));

        let result = executor
            .execute::<Vec<String>, _, _, _>(
                "users",
                counting_fetcher(calls.clone(), users()),
                QueryOptions::new().with_enabled(false),
            )
            .await
            .expect("disabled query");

        assert!(result.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(executor.store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_hit_skips_the_fetcher() {
        let executor = executor();
        let calls = Arc::new(AtomicU32::new(0));
        let fetcher = counting_fetcher(calls.clone(), users());
        let options = QueryOptions::new().with_cache_time(Duration::from_secs(1));

        let first = executor
            .execute::<Vec<String>, _, _, _>("users", fetcher.clone(), options.clone())
            .await
            .expect("first fetch")
            .expect("enabled");

        tokio::time::advance(Duration::from_millis(500)).await;
        let second = executor
            .execute::<Vec<String>, _, _, _>("users", fetcher, options)
            .await
            .expect("second fetch")
            .expect("enabled");

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_refetches() {
        let executor = executor();
        let calls = Arc::new(AtomicU32::new(0));
        let fetcher = counting_fetcher(calls.clone(), users());
        let options = QueryOptions::new().with_cache_time(Duration::from_secs(1));

        executor
            .execute::<Vec<String>, _, _, _>("users", fetcher.clone(), options.clone())
            .await
            .expect("first fetch");

        tokio::time::advance(Duration::from_secs(2)).await;
        executor
            .execute::<Vec<String>, _, _, _>("users", fetcher, options)
            .await
            .expect("second fetch");

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_failure_retains_cached_data() {
        let executor = executor();
        let calls = Arc::new(AtomicU32::new(0));
        let options = QueryOptions::new()
            .with_cache_time(Duration::from_secs(1))
            .with_retry(1)
            .with_retry_delay(Duration::from_millis(10));

        executor
            .execute::<Vec<String>, _, _, _>("users", counting_fetcher(calls.clone(), users()), options.clone())
            .await
            .expect("seed fetch");

        tokio::time::advance(Duration::from_secs(2)).await;

        let failing_calls = Arc::new(AtomicU32::new(0));
        let failing = {
            let calls = failing_calls.clone();
            move || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<Vec<String>, _>(FetchError::response(503, "unavailable", None))
                }
            }
        };
        let result = executor
            .execute::<Vec<String>, _, _, _>("users", failing, options)
            .await;

        assert!(matches!(result, Err(QueryError::Fetch(_))));
        assert_eq!(failing_calls.load(Ordering::SeqCst), 2);

        let state = executor.notifier.query_state("users");
        assert_eq!(state.data::<Vec<String>>().as_deref(), Some(&users()));
        assert_eq!(state.error, Some(FetchError::response(503, "unavailable", None)));
        assert!(!state.is_loading);
        assert!(!state.is_fetching);
        assert!(state.is_stale);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_fetch() {
        let executor = executor();
        let calls = Arc::new(AtomicU32::new(0));
        let slow_fetcher = {
            let calls = calls.clone();
            move || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    sleep(Duration::from_millis(100)).await;
                    Ok::<_, FetchError>(users())
                }
            }
        };

        let (first, second) = tokio::join!(
            executor.execute::<Vec<String>, _, _, _>(
                "users",
                slow_fetcher.clone(),
                QueryOptions::new()
            ),
            executor.execute::<Vec<String>, _, _, _>("users", slow_fetcher, QueryOptions::new()),
        );

        let first = first.expect("first").expect("enabled");
        let second = second.expect("second").expect("enabled");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(executor.inflight.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_suppresses_the_cache_write() {
        let executor = executor();
        let cancel = CancellationToken::new();
        let fetcher = || async {
            sleep(Duration::from_secs(3600)).await;
            Ok::<_, FetchError>(users())
        };

        let cancel_trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(1)).await;
            cancel_trigger.cancel();
        });

        let result = executor
            .execute::<Vec<String>, _, _, _>(
                "users",
                fetcher,
                QueryOptions::new().with_cancel(cancel),
            )
            .await;

        assert!(matches!(result, Err(QueryError::Cancelled)));
        assert!(executor.store.is_empty());

        let state = executor.notifier.query_state("users");
        assert!(!state.is_fetching);
        assert!(!state.is_loading);
        assert!(state.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_hit_serves_cached_data_and_revalidates() {
        let executor = executor();
        let calls = Arc::new(AtomicU32::new(0));
        let fetcher = counting_fetcher(calls.clone(), users());
        let options = QueryOptions::new()
            .with_cache_time(Duration::from_secs(600))
            .with_stale_time(Duration::from_secs(1));

        executor
            .execute::<Vec<String>, _, _, _>("users", fetcher.clone(), options.clone())
            .await
            .expect("seed fetch");

        tokio::time::advance(Duration::from_secs(2)).await;
        let served = executor
            .execute::<Vec<String>, _, _, _>("users", fetcher, options)
            .await
            .expect("stale hit")
            .expect("enabled");

        // Served immediately from cache, revalidated in the background.
        assert_eq!(*served, users());
        sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!executor.notifier.query_state("users").is_stale);
    }

    #[tokio::test]
    async fn loading_states_progress_in_order() {
        let store = Arc::new(CacheStore::new());
        let notifier = Arc::new(StateNotifier::new());
        let executor = QueryExecutor::new(store, notifier.clone());

        let observed: Arc<Mutex<Vec<(bool, bool)>>> = Arc::new(Mutex::new(Vec::new()));
        let observed_by_listener = observed.clone();
        let _subscription = notifier.subscribe("users", move |state: &QueryState| {
            observed_by_listener
                .lock()
                .expect("observed lock")
                .push((state.is_loading, state.is_fetching));
        });

        executor
            .execute::<Vec<String>, _, _, _>(
                "users",
                || async { Ok::<_, FetchError>(users()) },
                QueryOptions::new(),
            )
            .await
            .expect("fetch");

        // loading -> settled
        assert_eq!(
            *observed.lock().expect("observed lock"),
            vec![(true, true), (false, false)]
        );
    }
}
