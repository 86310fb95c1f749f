//! Mutation execution.
//!
//! Writes run with the same bounded linear-backoff loop as queries. A
//! successful mutation invalidates its declared query keys, so the next read
//! of those keys is a cache miss; an exhausted failure rolls back the
//! optimistic update (when one was applied) before surfacing the error.

use std::future::Future;
use std::sync::Arc;

use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::FetchError;
use crate::options::MutationOptions;
use crate::retry::{AttemptError, RetryPolicy, run_attempts};
use crate::state::{MutationState, StateNotifier};
use crate::store::CacheStore;

const METRIC_MUTATION_ERRORS: &str = "sincro_mutation_errors_total";

/// Executor for write operations.
pub struct MutationExecutor {
    store: Arc<CacheStore>,
    notifier: Arc<StateNotifier>,
}

impl MutationExecutor {
    pub fn new(store: Arc<CacheStore>, notifier: Arc<StateNotifier>) -> Self {
        Self { store, notifier }
    }

    /// Execute a mutation under `name`.
    ///
    /// Resolves with the mutator's result, or rejects with the classified
    /// error once retries are exhausted.
    pub async fn execute<R, M, Fut, E>(
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
        let MutationOptions {
            retry,
            retry_delay,
            invalidate_queries,
            on_success,
            on_error,
            optimistic_update,
            rollback,
        } = options;

        self.notifier.publish_mutation(
            name,
            MutationState {
                is_loading: true,
                error: None,
            },
        );

        let optimistic_applied = match optimistic_update {
            Some(update) => {
                update();
                true
            }
            None => false,
        };

        let policy = RetryPolicy::new(retry, retry_delay);
        let outcome = run_attempts(&policy, &CancellationToken::new(), name, mutator).await;

        match outcome {
            Ok(result) => {
                if !invalidate_queries.is_empty() {
                    let canonicals: Vec<_> = invalidate_queries
                        .iter()
                        .map(|key| key.canonical())
                        .collect();
                    self.store.invalidate(&canonicals);
                    for key in &canonicals {
                        self.notifier.mark_stale(key);
                    }
                    info!(
                        mutation = name,
                        invalidated = canonicals.len(),
                        "Mutation invalidated dependent queries"
                    );
                }

                self.notifier.publish_mutation(
                    name,
                    MutationState {
                        is_loading: false,
                        error: None,
                    },
                );
                info!(mutation = name, result = "ok", "Mutation complete");

                if let Some(callback) = on_success {
                    callback(&result);
                }
                Ok(result)
            }
            Err(failure) => {
                let error = match failure {
                    AttemptError::Exhausted(error) => error,
                    AttemptError::Cancelled => FetchError::request("mutation cancelled"),
                };

                if optimistic_applied
                    && let Some(undo) = rollback
                {
                    undo();
                    info!(mutation = name, "Optimistic update rolled back");
                }

                counter!(METRIC_MUTATION_ERRORS).increment(1);
                warn!(
                    mutation = name,
                    error_kind = error.kind(),
                    error = %error,
                    "Mutation failed after all attempts"
                );
                self.notifier.publish_mutation(
                    name,
                    MutationState {
                        is_loading: false,
                        error: Some(error.clone()),
                    },
                );

                if let Some(callback) = on_error {
                    callback(&error);
                }
                Err(error)
            }
        }
    }
}
