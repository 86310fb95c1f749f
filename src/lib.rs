//! Sincro Data Synchronization Layer
//!
//! A pure, transport-agnostic cache/query/mutation coordinator for admin
//! portals: it decides when to reuse previously fetched data, when to
//! refetch, how to retry transient failures, how concurrent consumers of the
//! same logical query share state, and how writes invalidate previously
//! cached reads.
//!
//! - **Queries** consult the cache first; on a miss or an expired entry the
//!   injected fetcher runs with bounded linear-backoff retries, and
//!   concurrent callers of the same key share a single in-flight fetch.
//! - **Mutations** optionally apply an optimistic update (with automatic
//!   rollback on failure) and invalidate their declared query keys on
//!   success.
//! - **State** for every query and mutation is observable through
//!   [`SyncClient::query_state`] and [`SyncClient::subscribe`].
//!
//! The actual network transport is an injected asynchronous closure; hosts
//! classify their transport's errors into [`FetchError`] once, at that
//! boundary.
//!
//! ## Usage
//!
//! ```ignore
//! use sincro::{ClientConfig, QueryKey, QueryOptions, SyncClient};
//!
//! let client = SyncClient::new(ClientConfig::default());
//!
//! // Cached read: the fetcher only runs on a miss or after expiry.
//! let notices = client
//!     .query::<Vec<Notice>, _, _, _>("notices", || api.list_notices(), QueryOptions::new())
//!     .await?;
//!
//! // Write, then force dependent reads to refetch.
//! client
//!     .mutate(
//!         "create-notice",
//!         || api.create_notice(&draft),
//!         client
//!             .mutation_defaults()
//!             .with_invalidate_queries([QueryKey::from("notices")]),
//!     )
//!     .await?;
//! ```

mod client;
mod error;
mod key;
mod lock;
mod mutation;
mod options;
mod query;
mod retry;
mod state;
mod store;

pub use client::SyncClient;
pub use error::{FetchError, QueryError};
pub use key::{CanonicalKey, QueryKey};
pub use mutation::MutationExecutor;
pub use options::{ClientConfig, MutationOptions, QueryOptions};
pub use query::QueryExecutor;
pub use retry::RetryPolicy;
pub use state::{MutationState, QueryState, StateNotifier, Subscription};
pub use store::{CacheEntry, CacheStore, CachedValue};
