//! Error taxonomy for the coordinator.
//!
//! Transport failures are classified exactly once, at the fetcher/mutator
//! boundary, into the three-kind [`FetchError`] form. The classified form is
//! what gets cached and surfaced; the transport-specific error object is not
//! retained.

use serde::Serialize;
use thiserror::Error;

/// A classified transport failure.
///
/// Hosts implement `Into<FetchError>` (or `From<TheirError> for FetchError`)
/// for their transport's error type, so classification happens in one place
/// and the coordinator stays transport-agnostic.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FetchError {
    /// The remote side answered with an error status.
    #[error("server responded with status {status}: {message}")]
    Response {
        status: u16,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    /// No answer reached the caller (connection failure, timeout).
    #[error("network failure: {message}")]
    Network { message: String },
    /// The call could not be constructed or dispatched.
    #[error("request could not be dispatched: {message}")]
    Request { message: String },
}

impl FetchError {
    pub fn response(status: u16, message: impl Into<String>, data: Option<serde_json::Value>) -> Self {
        Self::Response {
            status,
            message: message.into(),
            data,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn request(message: impl Into<String>) -> Self {
        Self::Request {
            message: message.into(),
        }
    }

    /// The kind tag of this failure (`response`, `network`, or `request`).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Response { .. } => "response",
            Self::Network { .. } => "network",
            Self::Request { .. } => "request",
        }
    }

    /// The status code, for `response` failures.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Response { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Failure of a query execution.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueryError {
    /// The caller's cancellation token fired before the fetch settled.
    ///
    /// A cancelled fetch never writes the cache and its retries stop.
    #[error("query cancelled")]
    Cancelled,
    /// All fetch attempts were exhausted.
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

impl QueryError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
