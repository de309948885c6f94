//! Persistence and HTTP plumbing for the outlet crawler.
//!
//! Postings and search watermarks live behind [`PostingStore`]; `PgStore` is the
//! production backend and `MemoryStore` backs tests and mocked runs.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fundgrube_core::{DeactivationScope, Page, Posting, PostingFilter, QueryError, SearchOperation};
use thiserror::Error;

mod http;
mod memory;
mod postgres;

pub use http::{
    is_transient_status, BackoffPolicy, FetchError, FetchedResponse, HttpClientConfig,
    HttpFetcher, DEFAULT_USER_AGENT,
};
pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "fundgrube-storage";

/// `DATABASE_URL` value selecting the in-process store.
pub const MEMORY_DATABASE_URL: &str = "memory";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error")]
    Database(#[from] sqlx::Error),
    #[error("schema migration failed")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error("posting {id} has no creation/modification timestamps")]
    MissingTimestamps { id: String },
    #[error("stored document for {id} is malformed")]
    MalformedDocument {
        id: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Outcome of schema/data maintenance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub schema_version: Option<i64>,
    pub documents_repaired: u64,
}

#[async_trait]
pub trait PostingStore: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn find_posting(&self, id: &str) -> Result<Option<Posting>, StoreError>;

    /// Filtered read sorted by price ascending (ties by id).
    async fn find_postings(
        &self,
        filter: &PostingFilter,
        page: Page,
    ) -> Result<Vec<Posting>, StoreError>;

    /// Insert-or-replace by id as a single write; every posting must carry timestamps.
    async fn upsert_postings(&self, postings: &[Posting]) -> Result<(), StoreError>;

    /// Mark active postings inside `scope` whose id is not in `seen_ids` as inactive.
    async fn deactivate_missing(
        &self,
        scope: &DeactivationScope,
        seen_ids: &HashSet<String>,
    ) -> Result<u64, StoreError>;

    async fn delete_all_postings(&self) -> Result<u64, StoreError>;

    /// Hard-delete inactive postings last modified before `before`.
    async fn purge_inactive(&self, before: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn find_search_operation(&self, hash: &str)
        -> Result<Option<SearchOperation>, StoreError>;

    async fn save_search_operation(&self, op: &SearchOperation) -> Result<(), StoreError>;

    async fn migrate(&self) -> Result<MigrationReport, StoreError>;
}

/// Open the store named by `database_url`; Postgres stores are migrated on connect.
pub async fn connect_store(database_url: &str) -> Result<Arc<dyn PostingStore>, StoreError> {
    if database_url.trim() == MEMORY_DATABASE_URL {
        tracing::warn!("using in-memory store; nothing survives this process");
        return Ok(Arc::new(MemoryStore::new()));
    }
    let store = PgStore::connect(database_url).await?;
    Ok(Arc::new(store))
}

pub(crate) fn require_timestamps(
    posting: &Posting,
) -> Result<(DateTime<Utc>, DateTime<Utc>), StoreError> {
    match (posting.created_at, posting.modified_at) {
        (Some(created), Some(modified)) => Ok((created, modified)),
        _ => Err(StoreError::MissingTimestamps {
            id: posting.id.clone(),
        }),
    }
}
