//! Destination store + HTTP fetch utilities for ratesync.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use ratesync_core::{EntityRecord, RawEvent};
use thiserror::Error;

mod http;
mod pg;

pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError,
    HttpClientConfig, HttpFetcher, RetryDisposition,
};
pub use pg::{PgEntityStore, ENTITY_TABLE, STAGING_TABLE};

pub const CRATE_NAME: &str = "ratesync-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection-level failure; the current pass cannot continue.
    #[error("store connection lost: {0}")]
    Fatal(#[source] sqlx::Error),
    #[error("batch of {rows} rows was not committed: {source}")]
    BatchCommit {
        rows: usize,
        #[source]
        source: sqlx::Error,
    },
    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),
    #[error("reading event file {}: {source}", .path.display())]
    EventFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    /// Sort a read-side sqlx error into `Fatal` or `Query`.
    pub fn from_query(err: sqlx::Error) -> Self {
        if is_connection_error(&err) {
            Self::Fatal(err)
        } else {
            Self::Query(err)
        }
    }

    /// Sort a write-side sqlx error into `Fatal` or `BatchCommit`.
    pub fn from_batch(err: sqlx::Error, rows: usize) -> Self {
        if is_connection_error(&err) {
            Self::Fatal(err)
        } else {
            Self::BatchCommit { rows, source: err }
        }
    }
}

/// Errors that mean the connection itself is gone, as opposed to one
/// statement being rejected.
pub fn is_connection_error(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
    )
}

/// Bulk events read back from the staging relation, in input order.
#[derive(Debug, Clone, Default)]
pub struct StagedEvents {
    pub events: Vec<RawEvent>,
    pub source_sha256: String,
    pub source_bytes: usize,
}

/// Destination table for merged entity records.
///
/// Implementations own their connection handling; callers only see records.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Every stored record, taken once at the start of a pass.
    async fn snapshot_records(&self) -> Result<Vec<EntityRecord>, StoreError>;

    /// Records for the given identifiers; unknown identifiers are simply absent.
    async fn load_records(&self, identifiers: &[String]) -> Result<Vec<EntityRecord>, StoreError>;

    /// Upsert one batch atomically. Identifiers within a batch must be unique.
    async fn upsert_batch(&self, rows: &[EntityRecord]) -> Result<u64, StoreError>;

    /// Load a CSV event log into the staging relation and read it back.
    async fn stage_event_file(&self, path: &Path) -> Result<StagedEvents, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_errors_are_fatal() {
        let err = StoreError::from_batch(sqlx::Error::PoolClosed, 10);
        assert!(err.is_fatal());

        let err = StoreError::from_batch(sqlx::Error::Protocol("unexpected message".into()), 10);
        assert!(err.is_fatal());

        let err = StoreError::from_query(sqlx::Error::PoolTimedOut);
        assert!(err.is_fatal());
    }

    #[test]
    fn statement_errors_stay_within_the_batch() {
        let err = StoreError::from_batch(sqlx::Error::RowNotFound, 42);
        assert!(!err.is_fatal());
        match err {
            StoreError::BatchCommit { rows, .. } => assert_eq!(rows, 42),
            other => panic!("unexpected {other:?}"),
        }

        let err = StoreError::from_query(sqlx::Error::ColumnNotFound("fast_rating".into()));
        assert!(matches!(err, StoreError::Query(_)));
    }
}
