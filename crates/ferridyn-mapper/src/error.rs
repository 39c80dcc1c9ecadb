//! Error types for all mapper operations.

use std::time::Duration;

use thiserror::Error;

use crate::types::Item;

/// Top-level error type returned by every public operation.
#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("scan forbidden: {0}")]
    ScanForbidden(String),

    #[error("conditional write failed: {0}")]
    ConditionalWriteFailed(String),

    #[error("batch write left {} items unprocessed after {attempts} attempts", unprocessed.len())]
    PartialBatchFailure { unprocessed: Vec<Item>, attempts: u32 },

    #[error("timed out after {attempts} attempts ({elapsed:?})")]
    TimedOut { attempts: u32, elapsed: Duration },

    #[error(transparent)]
    Upstream(#[from] StoreError),
}

/// Errors reported by the storage adapter and object store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("conditional check failed")]
    ConditionalCheckFailed,

    #[error("table not ready: {0}")]
    TableNotReady(String),

    #[error("throttled: {0}")]
    Throttled(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Other(String),
}

impl StoreError {
    /// Transient failures the backoff coordinator may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::TableNotReady(_) | StoreError::Throttled(_) | StoreError::Unavailable(_)
        )
    }
}

/// Errors raised while evaluating a store-side condition expression.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    #[error("invalid expression: {0}")]
    InvalidExpression(String),
}

impl From<FilterError> for Error {
    fn from(e: FilterError) -> Self {
        Error::InvalidInput(e.to_string())
    }
}

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
