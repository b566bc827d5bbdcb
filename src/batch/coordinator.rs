//! Batch coordinator.
//!
//! Launching a batch claims WAITING rows into a fresh batch id (flipping them to RUNNING),
//! submits one external job and persists its record. Monitoring polls the job until it
//! finishes or its persisted deadline passes, then reconciles every row still RUNNING under
//! the batch. Reconciliation writes are conditioned on the row still being RUNNING under
//! this batch, so two monitors of the same job never count an outcome twice.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use tokio_util::sync::CancellationToken;

use super::{BatchClient, BatchItem, BatchJobStatus};
use crate::config::instant_after;
use crate::domain::batch::{BatchJobId, BatchJobOutcome, BatchJobRecord};
use crate::domain::request::{AttemptRecord, RequestRow, RequestStatus, RowId, RowUpdate};
use crate::error::{BarrageError, Result};
use crate::executor::AttemptOutcome;
use crate::retry::annotate_terminal_failure;
use crate::scheduling::{PollSchedule, RegionSelector};
use crate::storage::{RequestStore, ScanFilter};

/// Deadline `timeout` after `submitted_at`, saturating at the latest representable time.
fn deadline_after(submitted_at: DateTime<Utc>, timeout: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(timeout)
        .ok()
        .and_then(|timeout| submitted_at.checked_add_signed(timeout))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// How a monitored job ended, before its rows are reconciled.
#[derive(Debug, Clone, PartialEq)]
enum JobEnd {
    Completed(HashMap<RowId, AttemptOutcome>),
    Failed(String),
    TimedOut,
}

/// Per-row tally of one reconciled batch job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReconciliation {
    pub batch_id: BatchJobId,
    pub outcome: BatchJobOutcome,
    pub succeeded: usize,
    /// Rows that ended FAILED
    pub failed: usize,
    /// Rows returned to WAITING
    pub requeued: usize,
    /// Rows another worker had already reconciled
    pub skipped: usize,
    /// This reconciliation closed the job record; false if another worker got there first
    pub closed: bool,
}

/// Launches, monitors and reconciles batch jobs.
pub struct BatchCoordinator<S, B> {
    store: Arc<S>,
    client: Arc<B>,
    regions: Arc<dyn RegionSelector>,
    poll_schedule: Arc<dyn PollSchedule>,
}

impl<S, B> BatchCoordinator<S, B>
where
    S: RequestStore,
    B: BatchClient,
{
    pub fn new(
        store: Arc<S>,
        client: Arc<B>,
        regions: Arc<dyn RegionSelector>,
        poll_schedule: Arc<dyn PollSchedule>,
    ) -> Self {
        Self {
            store,
            client,
            regions,
            poll_schedule,
        }
    }

    /// Claim up to `batch_size` WAITING rows for `tag` and submit them as one job that must
    /// finish within `timeout`.
    ///
    /// Returns `Ok(None)` when there was nothing to claim.
    ///
    /// # Errors
    /// [`BarrageError::BatchSubmission`] if the service refused the job. The claimed rows
    /// are back in WAITING by then, with no failure counted.
    #[tracing::instrument(skip(self, tag), fields(tag = %tag))]
    pub async fn launch(
        &self,
        tag: &str,
        batch_size: usize,
        timeout: Duration,
    ) -> Result<Option<BatchJobRecord>> {
        let batch = BatchJobId::new();
        let rows = self.store.claim_waiting(tag, batch_size, batch).await?;
        if rows.is_empty() {
            return Ok(None);
        }

        let items: Vec<BatchItem> = rows.iter().map(BatchItem::from).collect();
        let region = self.regions.next_region();

        let job_id = match self.client.submit(batch, &items, region.as_deref()).await {
            Ok(job_id) => job_id,
            Err(e) => {
                tracing::warn!(
                    batch_id = %batch,
                    rows = rows.len(),
                    error = %e,
                    "Batch submission failed, returning rows to waiting"
                );
                counter!("barrage_batch_submissions_total", "outcome" => "rejected").increment(1);
                self.rollback(batch, &rows).await?;
                return Err(BarrageError::BatchSubmission {
                    batch,
                    reason: e.to_string(),
                });
            }
        };

        let submitted_at = Utc::now();
        let record = BatchJobRecord {
            batch_id: batch,
            job_id,
            tag: tag.to_string(),
            row_count: rows.len(),
            region,
            submitted_at,
            deadline: deadline_after(submitted_at, timeout),
            closed_at: None,
            outcome: None,
        };
        self.store.record_batch_job(&record).await?;

        counter!("barrage_batch_submissions_total", "outcome" => "submitted").increment(1);
        tracing::info!(
            batch_id = %batch,
            job_id = %record.job_id,
            rows = record.row_count,
            region = ?record.region,
            "Batch job submitted"
        );

        Ok(Some(record))
    }

    /// Return claimed rows to WAITING without counting a failure.
    async fn rollback(&self, batch: BatchJobId, rows: &[RequestRow]) -> Result<usize> {
        let mut restored = 0;
        for row in rows {
            let updated = self
                .store
                .transition(row.id, |current| {
                    held_by(current, batch)
                        .then(|| RowUpdate::to(RequestStatus::Waiting).with_batch(None))
                })
                .await?;
            if updated.is_some() {
                restored += 1;
            }
        }
        Ok(restored)
    }

    /// Poll `job` until it finishes or its deadline passes, then reconcile its rows.
    ///
    /// # Errors
    /// [`BarrageError::Shutdown`] if `shutdown` fires first; the job stays open and its rows
    /// stay RUNNING so a later monitor can resume.
    #[tracing::instrument(
        skip(self, job, shutdown),
        fields(batch_id = %job.batch_id, job_id = %job.job_id)
    )]
    pub async fn monitor(
        &self,
        job: BatchJobRecord,
        shutdown: CancellationToken,
    ) -> Result<BatchReconciliation> {
        let deadline = instant_after(job.remaining(Utc::now()));
        let mut poll: u32 = 0;

        let end = loop {
            if tokio::time::Instant::now() >= deadline {
                break JobEnd::TimedOut;
            }

            match self.client.poll(&job.job_id, job.region.as_deref()).await {
                Ok(BatchJobStatus::Running) => {
                    tracing::trace!(poll, "Batch job still running");
                }
                Ok(BatchJobStatus::Succeeded(outcomes)) => break JobEnd::Completed(outcomes),
                Ok(BatchJobStatus::Failed(reason)) => break JobEnd::Failed(reason),
                Err(e) => {
                    tracing::warn!(poll, error = %e, "Polling batch job failed, will poll again");
                }
            }

            let wake = instant_after(self.poll_schedule.delay(poll)).min(deadline);
            poll = poll.saturating_add(1);

            tokio::select! {
                _ = tokio::time::sleep_until(wake) => {}
                _ = shutdown.cancelled() => {
                    tracing::info!("Shutdown requested, leaving batch job open");
                    return Err(BarrageError::Shutdown);
                }
            }
        };

        self.reconcile(&job, end).await
    }

    async fn reconcile(&self, job: &BatchJobRecord, end: JobEnd) -> Result<BatchReconciliation> {
        let batch = job.batch_id;
        let outcome = match &end {
            JobEnd::Completed(_) => BatchJobOutcome::Completed,
            JobEnd::Failed(_) => BatchJobOutcome::Failed,
            JobEnd::TimedOut => BatchJobOutcome::TimedOut,
        };

        let mut tally = BatchReconciliation {
            batch_id: batch,
            outcome,
            succeeded: 0,
            failed: 0,
            requeued: 0,
            skipped: 0,
            closed: false,
        };

        let rows = self
            .store
            .scan(&ScanFilter::batch(batch).with_status(RequestStatus::Running))
            .await?;

        for row in &rows {
            let updated = self
                .store
                .transition(row.id, |current| {
                    held_by(current, batch).then(|| reconcile_update(current, job, &end))
                })
                .await?;

            match updated.map(|row| row.status) {
                Some(RequestStatus::Succeeded) => tally.succeeded += 1,
                Some(RequestStatus::Failed) => tally.failed += 1,
                Some(_) => tally.requeued += 1,
                None => tally.skipped += 1,
            }
        }

        tally.closed = self.store.close_batch_job(batch, outcome).await?;
        if tally.closed {
            counter!("barrage_batch_outcomes_total", "outcome" => outcome.as_str()).increment(1);
        }

        match &end {
            JobEnd::Completed(_) => tracing::info!(
                succeeded = tally.succeeded,
                failed = tally.failed,
                skipped = tally.skipped,
                "Batch job completed"
            ),
            JobEnd::Failed(reason) => tracing::warn!(
                reason = %reason,
                requeued = tally.requeued,
                failed = tally.failed,
                "Batch job failed"
            ),
            JobEnd::TimedOut => tracing::warn!(
                requeued = tally.requeued,
                failed = tally.failed,
                "Batch job timed out"
            ),
        }

        Ok(tally)
    }
}

/// The row is still in flight under `batch`.
fn held_by(row: &RequestRow, batch: BatchJobId) -> bool {
    row.status == RequestStatus::Running && row.current_batch == Some(batch)
}

fn reconcile_update(row: &RequestRow, job: &BatchJobRecord, end: &JobEnd) -> RowUpdate {
    let batch = Some(job.batch_id);
    let region = job.region.clone();

    let update = match end {
        JobEnd::Completed(outcomes) => match outcomes.get(&row.id) {
            Some(AttemptOutcome::Success(text)) => {
                return RowUpdate::succeeded(text.clone(), AttemptRecord::succeeded(batch, region));
            }
            Some(AttemptOutcome::RetryableFailure(reason)) => RowUpdate::failure(
                row,
                AttemptRecord::failed(batch, region, reason.clone(), true),
                RequestStatus::Failed,
            ),
            Some(AttemptOutcome::FatalFailure(reason)) => RowUpdate::failure(
                row,
                AttemptRecord::failed(batch, region, reason.clone(), false),
                RequestStatus::Failed,
            ),
            None => RowUpdate::failure(
                row,
                AttemptRecord::failed(batch, region, "missing from batch output", true),
                RequestStatus::Failed,
            ),
        },
        JobEnd::Failed(reason) => RowUpdate::failure(
            row,
            AttemptRecord::failed(batch, region, format!("batch job failed: {}", reason), true),
            RequestStatus::Waiting,
        ),
        JobEnd::TimedOut => RowUpdate::failure(
            row,
            AttemptRecord::failed(
                batch,
                region,
                format!("batch job {} timed out", job.job_id),
                true,
            ),
            RequestStatus::Waiting,
        ),
    };
    annotate_terminal_failure(row, update)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::MockBatchClient;
    use crate::domain::request::{NewRow, RequestContent, Tags};
    use crate::generation::GenerationError;
    use crate::scheduling::{FixedInterval, RoundRobinRegions};
    use crate::storage::InMemoryRequestStore;

    const HOUR: Duration = Duration::from_secs(3600);

    fn coordinator(
        store: &Arc<InMemoryRequestStore>,
        mock: &MockBatchClient,
    ) -> BatchCoordinator<InMemoryRequestStore, MockBatchClient> {
        BatchCoordinator::new(
            store.clone(),
            Arc::new(mock.clone()),
            Arc::new(RoundRobinRegions::new(vec!["us".to_string()])),
            Arc::new(FixedInterval(Duration::from_secs(60))),
        )
    }

    async fn waiting_rows(store: &InMemoryRequestStore, count: usize) -> Vec<RequestRow> {
        let mut rows = Vec::new();
        for i in 0..count {
            let row = store
                .insert(
                    NewRow::new(RequestContent::new("m", format!("q{i}")), Tags::new(["eval"]), 3)
                        .with_status(RequestStatus::Waiting),
                )
                .await
                .unwrap();
            rows.push(row);
        }
        rows
    }

    #[tokio::test]
    async fn test_launch_claims_and_records_job() {
        let store = Arc::new(InMemoryRequestStore::new());
        let mock = MockBatchClient::new();
        waiting_rows(&store, 3).await;

        let job = coordinator(&store, &mock)
            .launch("eval", 2, HOUR)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(job.row_count, 2);
        assert_eq!(job.region.as_deref(), Some("us"));
        assert_eq!(store.open_batch_jobs("eval").await.unwrap(), vec![job.clone()]);

        let in_batch = store.scan(&ScanFilter::batch(job.batch_id)).await.unwrap();
        assert_eq!(in_batch.len(), 2);
        assert!(in_batch.iter().all(|row| row.status == RequestStatus::Running));
        assert_eq!(
            mock.submissions()[0].row_ids,
            in_batch.iter().map(|r| r.id).collect::<Vec<_>>()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_timeout_saturates_deadline() {
        let store = Arc::new(InMemoryRequestStore::new());
        let mock = MockBatchClient::new();
        mock.complete_after(1, |_| AttemptOutcome::Success("done".to_string()));
        waiting_rows(&store, 2).await;

        let coordinator = coordinator(&store, &mock);
        let job = coordinator
            .launch("eval", 10, Duration::from_secs(u64::MAX / 4))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.deadline, DateTime::<Utc>::MAX_UTC);
        assert_eq!(store.get_batch_job(job.batch_id).await.unwrap(), Some(job.clone()));

        let tally = coordinator.monitor(job, CancellationToken::new()).await.unwrap();
        assert_eq!(tally.outcome, BatchJobOutcome::Completed);
        assert_eq!(tally.succeeded, 2);
    }

    #[test]
    fn test_deadline_after_adds_timeout() {
        let submitted_at = Utc::now();
        assert_eq!(
            deadline_after(submitted_at, HOUR),
            submitted_at + chrono::Duration::hours(1)
        );
        assert_eq!(deadline_after(submitted_at, Duration::MAX), DateTime::<Utc>::MAX_UTC);
    }

    #[tokio::test]
    async fn test_submission_failure_rolls_back() {
        let store = Arc::new(InMemoryRequestStore::new());
        let mock = MockBatchClient::new();
        mock.fail_next_submit(GenerationError::ServiceUnavailable {
            status: 503,
            body: "down".to_string(),
        });
        let rows = waiting_rows(&store, 2).await;

        let result = coordinator(&store, &mock)
            .launch("eval", 10, HOUR)
            .await;

        assert!(matches!(result, Err(BarrageError::BatchSubmission { .. })));
        for row in rows {
            let stored = store.get(row.id).await.unwrap();
            assert_eq!(stored.status, RequestStatus::Waiting);
            assert_eq!(stored.current_batch, None);
            assert_eq!(stored.failure_count, 0);
            assert!(stored.attempts_metadata.is_empty());
        }
        assert!(store.open_batch_jobs("eval").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_batch_reconciles_each_row() {
        let store = Arc::new(InMemoryRequestStore::new());
        let mock = MockBatchClient::new();
        let rows = waiting_rows(&store, 3).await;
        let (ok, bad, missing) = (rows[0].id, rows[1].id, rows[2].id);
        mock.complete_after(2, move |item| {
            if item.row_id == ok {
                AttemptOutcome::Success("done".to_string())
            } else {
                AttemptOutcome::FatalFailure("invalid request".to_string())
            }
        });

        let coordinator = coordinator(&store, &mock);
        let job = coordinator.launch("eval", 2, HOUR).await.unwrap().unwrap();
        let tally = coordinator.monitor(job.clone(), CancellationToken::new()).await.unwrap();

        assert_eq!(tally.outcome, BatchJobOutcome::Completed);
        assert_eq!(tally.succeeded, 1);
        assert_eq!(tally.failed, 1);
        assert_eq!(mock.poll_count(), 3);

        let ok_row = store.get(ok).await.unwrap();
        assert_eq!(ok_row.status, RequestStatus::Succeeded);
        assert_eq!(ok_row.response.as_deref(), Some("done"));
        assert_eq!(ok_row.current_batch, None);

        let bad_row = store.get(bad).await.unwrap();
        assert_eq!(bad_row.status, RequestStatus::Failed);
        assert_eq!(bad_row.failure_count, 1);
        assert_eq!(bad_row.current_batch, None);

        // Third row was never claimed
        assert_eq!(store.get(missing).await.unwrap().status, RequestStatus::Waiting);
        assert_eq!(
            store.get_batch_job(job.batch_id).await.unwrap().unwrap().outcome,
            Some(BatchJobOutcome::Completed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rows_missing_from_output_fail_retryably() {
        let store = Arc::new(InMemoryRequestStore::new());
        let mock = MockBatchClient::new();
        let rows = waiting_rows(&store, 2).await;
        let answered = rows[0].id;
        mock.complete_after(0, move |item| {
            if item.row_id == answered {
                AttemptOutcome::Success("yes".to_string())
            } else {
                AttemptOutcome::RetryableFailure("unused".to_string())
            }
        });

        let coordinator = coordinator(&store, &mock);
        let job = coordinator.launch("eval", 10, HOUR).await.unwrap().unwrap();
        // Drop the second row's result on the floor
        let end = JobEnd::Completed(HashMap::from([(
            answered,
            AttemptOutcome::Success("yes".to_string()),
        )]));
        let tally = coordinator.reconcile(&job, end).await.unwrap();

        assert_eq!(tally.succeeded, 1);
        assert_eq!(tally.failed, 1);
        let missing = store.get(rows[1].id).await.unwrap();
        assert_eq!(missing.status, RequestStatus::Failed);
        assert!(missing.is_requeueable());
        assert_eq!(missing.last_error(), Some("missing from batch output"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_failure_requeues_with_count() {
        let store = Arc::new(InMemoryRequestStore::new());
        let mock = MockBatchClient::new();
        mock.fail_after(0, "quota exceeded");
        let rows = waiting_rows(&store, 2).await;

        let coordinator = coordinator(&store, &mock);
        let job = coordinator.launch("eval", 10, HOUR).await.unwrap().unwrap();
        let tally = coordinator.monitor(job, CancellationToken::new()).await.unwrap();

        assert_eq!(tally.outcome, BatchJobOutcome::Failed);
        assert_eq!(tally.requeued, 2);
        for row in rows {
            let stored = store.get(row.id).await.unwrap();
            assert_eq!(stored.status, RequestStatus::Waiting);
            assert_eq!(stored.failure_count, 1);
            assert_eq!(stored.current_batch, None);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_leaves_job_open() {
        let store = Arc::new(InMemoryRequestStore::new());
        let mock = MockBatchClient::new();
        waiting_rows(&store, 1).await;

        let coordinator = coordinator(&store, &mock);
        let job = coordinator.launch("eval", 10, HOUR).await.unwrap().unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let result = coordinator.monitor(job.clone(), token).await;

        assert!(matches!(result, Err(BarrageError::Shutdown)));
        assert_eq!(store.open_batch_jobs("eval").await.unwrap(), vec![job.clone()]);
        let rows = store.scan(&ScanFilter::batch(job.batch_id)).await.unwrap();
        assert_eq!(rows[0].status, RequestStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_reconciliation_skips_rows() {
        let store = Arc::new(InMemoryRequestStore::new());
        let mock = MockBatchClient::new();
        waiting_rows(&store, 2).await;

        let coordinator = coordinator(&store, &mock);
        let job = coordinator.launch("eval", 10, HOUR).await.unwrap().unwrap();

        let first = coordinator.reconcile(&job, JobEnd::TimedOut).await.unwrap();
        let second = coordinator.reconcile(&job, JobEnd::TimedOut).await.unwrap();

        assert_eq!(first.requeued, 2);
        assert!(first.closed);
        assert_eq!(second.requeued + second.failed + second.succeeded, 0);
        assert_eq!(second.skipped, 0);
        assert!(!second.closed);
        for row in store.all_rows() {
            assert_eq!(row.failure_count, 1);
        }
    }
}
