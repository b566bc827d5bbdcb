//! In-process request store.
//!
//! Everything lives behind one `parking_lot` mutex, which makes every operation atomic. No
//! lock is ever held across an await point.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::domain::batch::{BatchJobId, BatchJobOutcome, BatchJobRecord};
use crate::domain::request::{
    ContentHash, NewRow, RequestRow, RequestStatus, RowId, RowUpdate, Tags,
};
use crate::error::{BarrageError, Result};

use super::{Capabilities, RequestStore, ScanFilter};

type LineageKey = (ContentHash, Tags);

#[derive(Default)]
struct Inner {
    rows: HashMap<RowId, RequestRow>,
    /// Insertion order
    order: Vec<RowId>,
    heads: HashMap<LineageKey, RowId>,
    jobs: HashMap<BatchJobId, BatchJobRecord>,
    last_insertion: Option<DateTime<Utc>>,
}

impl Inner {
    fn is_head(&self, row: &RequestRow) -> bool {
        self.heads
            .get(&(row.content_hash.clone(), row.tags.clone()))
            .is_some_and(|head| *head == row.id)
    }

    fn next_insertion_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let ts = match self.last_insertion {
            Some(last) if now <= last => last + chrono::Duration::microseconds(1),
            _ => now,
        };
        self.last_insertion = Some(ts);
        ts
    }

    fn insert(&mut self, row: NewRow) -> RequestRow {
        let id = RowId::new();
        let inserted_at = self.next_insertion_timestamp();
        let row = row.into_row(id, inserted_at);

        self.heads
            .insert((row.content_hash.clone(), row.tags.clone()), id);
        self.order.push(id);
        self.rows.insert(id, row.clone());
        row
    }

    fn row_mut(&mut self, id: RowId) -> Result<&mut RequestRow> {
        self.rows.get_mut(&id).ok_or(BarrageError::RequestNotFound(id))
    }
}

/// Request store kept in process memory.
pub struct InMemoryRequestStore {
    inner: Mutex<Inner>,
    capabilities: Capabilities,
}

impl InMemoryRequestStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capabilities: Capabilities::full(),
        }
    }

    /// A store that neither deduplicates nor holds rows for batching.
    pub fn ephemeral() -> Self {
        Self {
            capabilities: Capabilities::ephemeral(),
            ..Self::new()
        }
    }

    /// Every stored version, oldest first. Includes superseded versions.
    pub fn all_rows(&self) -> Vec<RequestRow> {
        let inner = self.inner.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.rows.get(id).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryRequestStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RequestStore for InMemoryRequestStore {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn insert(&self, row: NewRow) -> Result<RequestRow> {
        row.validate()?;
        Ok(self.inner.lock().insert(row))
    }

    async fn insert_version(&self, previous: RowId, row: NewRow) -> Result<Option<RequestRow>> {
        row.validate()?;
        let mut inner = self.inner.lock();
        let head = inner
            .rows
            .get(&previous)
            .ok_or(BarrageError::RequestNotFound(previous))?;
        if !inner.is_head(head) {
            return Ok(None);
        }
        Ok(Some(inner.insert(row)))
    }

    async fn insert_first_version(&self, row: NewRow) -> Result<Option<RequestRow>> {
        row.validate()?;
        let mut inner = self.inner.lock();
        if inner.heads.contains_key(&(row.content_hash.clone(), row.tags.clone())) {
            return Ok(None);
        }
        Ok(Some(inner.insert(row)))
    }

    async fn get(&self, id: RowId) -> Result<RequestRow> {
        self.inner
            .lock()
            .rows
            .get(&id)
            .cloned()
            .ok_or(BarrageError::RequestNotFound(id))
    }

    async fn find_latest_by_hash(
        &self,
        hash: &ContentHash,
        tags: Option<&Tags>,
    ) -> Result<Option<RequestRow>> {
        let inner = self.inner.lock();
        let latest = inner
            .heads
            .iter()
            .filter(|((head_hash, head_tags), _)| {
                head_hash == hash && tags.is_none_or(|tags| tags == head_tags)
            })
            .filter_map(|(_, id)| inner.rows.get(id))
            .max_by_key(|row| row.insertion_timestamp)
            .cloned();
        Ok(latest)
    }

    async fn scan(&self, filter: &ScanFilter) -> Result<Vec<RequestRow>> {
        let inner = self.inner.lock();
        let rows = inner
            .order
            .iter()
            .filter_map(|id| inner.rows.get(id))
            .filter(|row| filter.matches(row) && inner.is_head(row))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(rows)
    }

    async fn compare_and_update(
        &self,
        id: RowId,
        expected: RequestStatus,
        update: RowUpdate,
    ) -> Result<RequestRow> {
        let mut inner = self.inner.lock();
        let row = inner.row_mut(id)?;
        if row.status != expected {
            return Err(BarrageError::StoreConflict {
                id,
                expected,
                actual: row.status,
            });
        }
        let next = update.apply(row, Utc::now())?;
        *row = next.clone();
        Ok(next)
    }

    async fn touch(&self, id: RowId) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.row_mut(id)?.access_timestamps.push(Utc::now());
        Ok(())
    }

    async fn claim_waiting(
        &self,
        tag: &str,
        limit: usize,
        batch: BatchJobId,
    ) -> Result<Vec<RequestRow>> {
        let mut inner = self.inner.lock();
        let candidates: Vec<RowId> = inner
            .order
            .iter()
            .filter_map(|id| inner.rows.get(id))
            .filter(|row| {
                row.status == RequestStatus::Waiting
                    && row.current_batch.is_none()
                    && row.tags.contains(tag)
                    && inner.is_head(row)
            })
            .take(limit)
            .map(|row| row.id)
            .collect();

        let now = Utc::now();
        let mut claimed = Vec::with_capacity(candidates.len());
        for id in candidates {
            let row = inner.row_mut(id)?;
            let next = RowUpdate::to(RequestStatus::Running)
                .with_batch(Some(batch))
                .apply(row, now)?;
            *row = next.clone();
            claimed.push(next);
        }
        Ok(claimed)
    }

    async fn record_batch_job(&self, job: &BatchJobRecord) -> Result<()> {
        self.inner.lock().jobs.insert(job.batch_id, job.clone());
        Ok(())
    }

    async fn get_batch_job(&self, batch: BatchJobId) -> Result<Option<BatchJobRecord>> {
        Ok(self.inner.lock().jobs.get(&batch).cloned())
    }

    async fn open_batch_jobs(&self, tag: &str) -> Result<Vec<BatchJobRecord>> {
        let inner = self.inner.lock();
        let mut jobs: Vec<_> = inner
            .jobs
            .values()
            .filter(|job| job.is_open() && job.tag == tag)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.submitted_at);
        Ok(jobs)
    }

    async fn close_batch_job(&self, batch: BatchJobId, outcome: BatchJobOutcome) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.jobs.get_mut(&batch) {
            Some(job) if job.is_open() => {
                job.closed_at = Some(Utc::now());
                job.outcome = Some(outcome);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
