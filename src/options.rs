//! Execution options and client-level defaults.
//!
//! Per-call knobs for queries and mutations, plus a deserializable
//! [`ClientConfig`] so hosts can set coordinator-wide defaults from their
//! configuration file.

use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::error::FetchError;
use crate::key::QueryKey;

// Default values for coordinator configuration
const DEFAULT_CACHE_TIME_MS: u64 = 300_000;
const DEFAULT_RETRY: u32 = 3;
const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;
const DEFAULT_MUTATION_RETRY: u32 = 1;

/// Per-call options for a query execution.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// How long a successful result is considered fresh.
    pub cache_time: Duration,
    /// Age past which a fresh-enough hit is served immediately while a
    /// background revalidation runs. `None` disables revalidation: a hit
    /// within `cache_time` performs no network activity at all.
    pub stale_time: Option<Duration>,
    /// When false, the query short-circuits to a no-op. Used to gate
    /// dependent queries.
    pub enabled: bool,
    /// Maximum retry attempts after the initial one.
    pub retry: u32,
    /// Base delay before retrying; grows linearly with the attempt index.
    pub retry_delay: Duration,
    /// Cooperative cancellation for consumer disposal or key change. A
    /// cancelled fetch stops retrying and never writes the cache.
    pub cancel: Option<CancellationToken>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            cache_time: Duration::from_millis(DEFAULT_CACHE_TIME_MS),
            stale_time: None,
            enabled: true,
            retry: DEFAULT_RETRY,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            cancel: None,
        }
    }
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set how long a successful result stays fresh.
    pub fn with_cache_time(mut self, cache_time: Duration) -> Self {
        self.cache_time = cache_time;
        self
    }

    /// Enable stale-while-revalidate past the given age.
    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    /// Gate the query on a caller-side condition.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the maximum retry attempts.
    pub fn with_retry(mut self, retry: u32) -> Self {
        self.retry = retry;
        self
    }

    /// Set the base retry delay.
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Attach a cancellation token.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Per-call options for a mutation execution.
///
/// `R` is the mutator's result type, so the success callback is typed.
pub struct MutationOptions<R> {
    /// Maximum retry attempts after the initial one.
    pub retry: u32,
    /// Base delay before retrying; grows linearly with the attempt index.
    pub retry_delay: Duration,
    /// Query keys whose cached reads this write makes stale. Invalidated on
    /// success, forcing the next query for them to miss.
    pub invalidate_queries: Vec<QueryKey>,
    /// Invoked with the result after a successful mutation.
    pub on_success: Option<Box<dyn FnOnce(&R) + Send>>,
    /// Invoked with the classified error once retries are exhausted.
    pub on_error: Option<Box<dyn FnOnce(&FetchError) + Send>>,
    /// Applied synchronously before any network activity, so the UI reflects
    /// the intended end state speculatively.
    pub optimistic_update: Option<Box<dyn FnOnce() + Send>>,
    /// Undoes the optimistic update. Invoked automatically on exhausted
    /// failure, only if the optimistic update ran, before `on_error`.
    pub rollback: Option<Box<dyn FnOnce() + Send>>,
}

impl<R> Default for MutationOptions<R> {
    fn default() -> Self {
        Self {
            retry: DEFAULT_MUTATION_RETRY,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            invalidate_queries: Vec::new(),
            on_success: None,
            on_error: None,
            optimistic_update: None,
            rollback: None,
        }
    }
}

impl<R> MutationOptions<R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry(mut self, retry: u32) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Declare the queries this mutation invalidates on success.
    pub fn with_invalidate_queries(mut self, keys: impl IntoIterator<Item = QueryKey>) -> Self {
        self.invalidate_queries = keys.into_iter().collect();
        self
    }

    pub fn with_on_success(mut self, callback: impl FnOnce(&R) + Send + 'static) -> Self {
        self.on_success = Some(Box::new(callback));
        self
    }

    pub fn with_on_error(mut self, callback: impl FnOnce(&FetchError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(callback));
        self
    }

    /// Pair an optimistic update with its rollback.
    pub fn with_optimistic_update(
        mut self,
        update: impl FnOnce() + Send + 'static,
        rollback: impl FnOnce() + Send + 'static,
    ) -> Self {
        self.optimistic_update = Some(Box::new(update));
        self.rollback = Some(Box::new(rollback));
        self
    }
}

/// Coordinator-wide defaults, loadable from host configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Default freshness window for queries (ms).
    pub cache_time_ms: u64,
    /// Default stale-while-revalidate age (ms); absent means disabled.
    pub stale_time_ms: Option<u64>,
    /// Default maximum query retries.
    pub retry: u32,
    /// Default base retry delay (ms).
    pub retry_delay_ms: u64,
    /// Default maximum mutation retries.
    pub mutation_retry: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            cache_time_ms: DEFAULT_CACHE_TIME_MS,
            stale_time_ms: None,
            retry: DEFAULT_RETRY,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            mutation_retry: DEFAULT_MUTATION_RETRY,
        }
    }
}

impl ClientConfig {
    /// Query options seeded from these defaults.
    pub fn query_defaults(&self) -> QueryOptions {
        QueryOptions {
            cache_time: Duration::from_millis(self.cache_time_ms),
            stale_time: self.stale_time_ms.map(Duration::from_millis),
            enabled: true,
            retry: self.retry,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            cancel: None,
        }
    }

    /// Mutation options seeded from these defaults.
    pub fn mutation_defaults<R>(&self) -> MutationOptions<R> {
        MutationOptions {
            retry: self.mutation_retry,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            ..MutationOptions::default()
        }
    }
}
