//! Request store abstraction.
//!
//! This module defines the `RequestStore` trait, the single shared mutable resource of the
//! engine. Rows are only ever changed through [`RequestStore::compare_and_update`], which
//! succeeds only if the row still has the status the caller observed, and which validates
//! the change with [`RowUpdate::apply`](crate::domain::request::RowUpdate::apply).

use async_trait::async_trait;

use crate::domain::batch::{BatchJobId, BatchJobOutcome, BatchJobRecord};
use crate::domain::request::{
    ContentHash, NewRow, RequestRow, RequestStatus, RowId, RowUpdate, Tags,
};
use crate::error::{BarrageError, Result};

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::InMemoryRequestStore;

/// How many times [`RequestStore::transition`] re-reads a row after a conflict.
pub const MAX_CONFLICT_RETRIES: usize = 8;

/// What a store can do beyond plain row storage.
///
/// A store without `dedup` never resolves a submission to an existing row; a store without
/// `batching` cannot hold rows for the clearing loop, so batch submissions degrade to the
/// fast path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub dedup: bool,
    pub batching: bool,
}

impl Capabilities {
    pub fn full() -> Self {
        Self {
            dedup: true,
            batching: true,
        }
    }

    pub fn ephemeral() -> Self {
        Self {
            dedup: false,
            batching: false,
        }
    }
}

/// Filter for [`RequestStore::scan`]. Scans only return lineage heads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    /// Empty matches every status
    pub statuses: Vec<RequestStatus>,
    pub tag: Option<String>,
    pub batch: Option<BatchJobId>,
    pub limit: Option<usize>,
}

impl ScanFilter {
    pub fn statuses(statuses: impl IntoIterator<Item = RequestStatus>) -> Self {
        Self {
            statuses: statuses.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn batch(batch: BatchJobId) -> Self {
        Self {
            batch: Some(batch),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: RequestStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `row` passes the status, tag, and batch conditions.
    pub fn matches(&self, row: &RequestRow) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&row.status))
            && self.tag.as_deref().is_none_or(|tag| row.tags.contains(tag))
            && self.batch.is_none_or(|batch| row.current_batch == Some(batch))
    }
}

/// Storage trait for persisting and querying request rows and batch jobs.
#[async_trait]
pub trait RequestStore: Send + Sync {
    fn capabilities(&self) -> Capabilities {
        Capabilities::full()
    }

    /// Insert a new row. The store assigns the id and a strictly increasing insertion
    /// timestamp.
    async fn insert(&self, row: NewRow) -> Result<RequestRow>;

    /// Insert the next version of the lineage headed by `previous`.
    ///
    /// Returns `None` without inserting if `previous` is no longer the lineage head, which
    /// means another worker already requeued it.
    async fn insert_version(&self, previous: RowId, row: NewRow) -> Result<Option<RequestRow>>;

    /// Insert `row` as the first version of its lineage.
    ///
    /// Returns `None` without inserting if the lineage `(content_hash, tags)` already has a
    /// row. The check and the insert are atomic, so concurrent first submissions of the same
    /// content produce exactly one row.
    async fn insert_first_version(&self, row: NewRow) -> Result<Option<RequestRow>>;

    async fn get(&self, id: RowId) -> Result<RequestRow>;

    /// Newest row with `hash`, within the lineage for `tags` if given, across all tag sets
    /// otherwise.
    async fn find_latest_by_hash(
        &self,
        hash: &ContentHash,
        tags: Option<&Tags>,
    ) -> Result<Option<RequestRow>>;

    /// Lineage heads matching `filter`, oldest insertion first.
    async fn scan(&self, filter: &ScanFilter) -> Result<Vec<RequestRow>>;

    /// Apply `update` if the row's status is still `expected`.
    ///
    /// # Errors
    /// - [`BarrageError::StoreConflict`] if the status changed
    /// - [`BarrageError::InvalidTransition`] / [`BarrageError::ValidationError`] if the
    ///   update breaks a row invariant
    async fn compare_and_update(
        &self,
        id: RowId,
        expected: RequestStatus,
        update: RowUpdate,
    ) -> Result<RequestRow>;

    /// Append an access timestamp without changing anything else.
    async fn touch(&self, id: RowId) -> Result<()>;

    /// Atomically move up to `limit` WAITING heads carrying `tag` to RUNNING under `batch`.
    ///
    /// Concurrent claims never return the same row.
    async fn claim_waiting(
        &self,
        tag: &str,
        limit: usize,
        batch: BatchJobId,
    ) -> Result<Vec<RequestRow>>;

    async fn record_batch_job(&self, job: &BatchJobRecord) -> Result<()>;

    async fn get_batch_job(&self, batch: BatchJobId) -> Result<Option<BatchJobRecord>>;

    /// Jobs for `tag` that have not been closed, oldest first.
    async fn open_batch_jobs(&self, tag: &str) -> Result<Vec<BatchJobRecord>>;

    /// Mark a job closed. Closing an already closed job is a no-op that returns `false`.
    async fn close_batch_job(&self, batch: BatchJobId, outcome: BatchJobOutcome) -> Result<bool>;

    /// Read-decide-write with transparent retry on conflict.
    ///
    /// `decide` sees the current row and returns the update to apply, or `None` to leave the
    /// row alone (in which case `Ok(None)` is returned). On a conflict the row is re-read and
    /// `decide` is asked again.
    async fn transition<F>(&self, id: RowId, decide: F) -> Result<Option<RequestRow>>
    where
        F: Fn(&RequestRow) -> Option<RowUpdate> + Send + Sync,
    {
        let mut last_conflict = None;
        for attempt in 0..MAX_CONFLICT_RETRIES {
            let current = self.get(id).await?;
            let Some(update) = decide(&current) else {
                return Ok(None);
            };

            match self.compare_and_update(id, current.status, update).await {
                Ok(updated) => return Ok(Some(updated)),
                Err(e @ BarrageError::StoreConflict { .. }) => {
                    tracing::debug!(
                        row_id = %id,
                        attempt,
                        error = %e,
                        "Conflicting update, re-reading row"
                    );
                    last_conflict = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_conflict.unwrap_or_else(|| {
            BarrageError::Other(anyhow::anyhow!("transition of request {} made no attempt", id))
        }))
    }
}
