//! Clearing loop.
//!
//! One clearing run drives every row carrying a tag toward a terminal status. Each round it
//! recovers stuck RUNNING rows, requeues retryable FAILED heads as new versions, routes
//! WAITING rows to the fast path or into new batch jobs, and makes sure every open batch job
//! for the tag has a monitor. It stops once nothing is left in flight or waiting, when its
//! wall-clock budget runs out, or on shutdown.
//!
//! Runs are re-entrant: several loops on the same tag share the store's atomic claim and the
//! coordinator's conditioned reconciliation, so no row is submitted twice and no batch outcome
//! is counted twice.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::batch::{BatchClient, BatchCoordinator, BatchReconciliation};
use crate::config::{EngineConfig, ExecutionMode, hours, instant_after};
use crate::domain::batch::{BatchJobId, BatchJobOutcome};
use crate::domain::request::{Cause, NewRow, RequestRow, RequestStatus, RowId, RowUpdate};
use crate::error::{BarrageError, Result};
use crate::generation::GenerationClient;
use crate::retry::RetryController;
use crate::storage::{RequestStore, ScanFilter};

/// Per-run clearing parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClearingOptions {
    /// Rows per batch job, and fast-path concurrency
    pub batch_size: usize,

    /// When false the run only monitors jobs that are already open
    pub launch_new_batches: bool,

    /// Deadline for each launched job; the run's budget is this times the budget factor
    pub timeout_hours: f64,

    /// `Fast` routes every WAITING row to the fast path
    pub mode: ExecutionMode,
}

impl ClearingOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            launch_new_batches: true,
            timeout_hours: config.batch_timeout_hours,
            mode: ExecutionMode::Batch,
        }
    }

    pub fn monitor_only(mut self) -> Self {
        self.launch_new_batches = false;
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_timeout_hours(mut self, timeout_hours: f64) -> Self {
        self.timeout_hours = timeout_hours;
        self
    }
}

/// Why a clearing run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Nothing left to dispatch or wait for.
    Drained,
    BudgetExhausted,
    Shutdown,
}

/// Summary of one clearing run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClearingReport {
    pub tag: String,
    pub rounds: u64,

    /// Rows this run saw finish SUCCEEDED, on either path
    pub succeeded: usize,

    /// Rows this run saw finish FAILED, on either path
    pub failed: usize,

    /// FAILED heads requeued as a new WAITING version
    pub requeued: usize,

    /// Batch rows returned to WAITING after a job timed out or failed
    pub returned_to_waiting: usize,

    /// Stuck RUNNING rows returned to WAITING
    pub recovered: usize,

    pub batches_launched: usize,
    pub batch_submission_failures: usize,

    /// Job outcomes this run recorded; a job closed by another run is not counted here
    pub batches_completed: usize,
    pub batches_failed: usize,
    pub batches_timed_out: usize,

    /// FAILED heads left for the tag that cannot be retried
    pub exhausted: Vec<RowId>,

    pub stop_reason: StopReason,
}

impl ClearingReport {
    fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            rounds: 0,
            succeeded: 0,
            failed: 0,
            requeued: 0,
            returned_to_waiting: 0,
            recovered: 0,
            batches_launched: 0,
            batch_submission_failures: 0,
            batches_completed: 0,
            batches_failed: 0,
            batches_timed_out: 0,
            exhausted: Vec::new(),
            stop_reason: StopReason::Drained,
        }
    }

    fn record_fast(&mut self, joined: std::result::Result<Result<RequestRow>, JoinError>) {
        match joined {
            Ok(Ok(row)) => match row.status {
                RequestStatus::Succeeded => self.succeeded += 1,
                RequestStatus::Failed => self.failed += 1,
                _ => {}
            },
            Ok(Err(BarrageError::Shutdown)) => {
                tracing::debug!("Fast-path task stopped by shutdown");
            }
            Ok(Err(e)) => tracing::error!(error = %e, "Fast-path task failed"),
            Err(join_error) => tracing::error!(error = %join_error, "Fast-path task panicked"),
        }
    }

    fn record_batch(
        &mut self,
        joined: std::result::Result<Result<BatchReconciliation>, JoinError>,
    ) {
        match joined {
            Ok(Ok(tally)) => {
                self.succeeded += tally.succeeded;
                self.failed += tally.failed;
                self.returned_to_waiting += tally.requeued;
                if tally.closed {
                    match tally.outcome {
                        BatchJobOutcome::Completed => self.batches_completed += 1,
                        BatchJobOutcome::Failed => self.batches_failed += 1,
                        BatchJobOutcome::TimedOut => self.batches_timed_out += 1,
                    }
                }
            }
            Ok(Err(BarrageError::Shutdown)) => {
                tracing::debug!("Batch monitor stopped by shutdown");
            }
            Ok(Err(e)) => tracing::error!(error = %e, "Batch monitor failed"),
            Err(join_error) => tracing::error!(error = %join_error, "Batch monitor panicked"),
        }
    }
}

/// Live work shared by every clearing run of one engine.
///
/// A batch id in `batches` has a running monitor; a row id in `rows` is being driven by a
/// fast-path task. Neither is ever treated as stuck.
#[derive(Clone, Default)]
pub(crate) struct ActiveWork {
    pub batches: Arc<DashMap<BatchJobId, CancellationToken>>,
    pub rows: Arc<DashSet<RowId>>,
}

/// Per-tag driver for WAITING, stuck RUNNING and retryable FAILED rows.
pub struct ClearingLoop<S, G, B> {
    store: Arc<S>,
    retry: Arc<RetryController<S, G>>,
    coordinator: Arc<BatchCoordinator<S, B>>,
    config: EngineConfig,
    active: ActiveWork,
    shutdown: CancellationToken,
}

impl<S, G, B> ClearingLoop<S, G, B>
where
    S: RequestStore + 'static,
    G: GenerationClient + 'static,
    B: BatchClient + 'static,
{
    pub(crate) fn new(
        store: Arc<S>,
        retry: Arc<RetryController<S, G>>,
        coordinator: Arc<BatchCoordinator<S, B>>,
        config: EngineConfig,
        active: ActiveWork,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            retry,
            coordinator,
            config,
            active,
            shutdown,
        }
    }

    /// Clear `tag` until drained, out of budget, or shut down.
    #[tracing::instrument(skip(self, tag, options), fields(tag = %tag, mode = ?options.mode))]
    pub async fn run(&self, tag: &str, options: ClearingOptions) -> Result<ClearingReport> {
        let budget = hours(options.timeout_hours * self.config.clearing_budget_factor);
        let batch_timeout = hours(options.timeout_hours);
        let deadline = instant_after(budget);
        let idle = Duration::from_millis(self.config.clearing_idle_interval_ms);
        let batching = self.store.capabilities().batching;

        let children = self.shutdown.child_token();
        let fast_slots = Arc::new(Semaphore::new(options.batch_size.max(1)));
        let mut fast_tasks: JoinSet<Result<RequestRow>> = JoinSet::new();
        let mut monitors: JoinSet<Result<BatchReconciliation>> = JoinSet::new();
        let mut report = ClearingReport::new(tag);

        tracing::info!(
            budget_secs = budget.as_secs(),
            batch_size = options.batch_size,
            launch_new_batches = options.launch_new_batches,
            "Clearing started"
        );

        let result = loop {
            report.rounds += 1;

            while let Some(joined) = fast_tasks.try_join_next() {
                report.record_fast(joined);
            }
            while let Some(joined) = monitors.try_join_next() {
                report.record_batch(joined);
            }

            if self.shutdown.is_cancelled() {
                break Ok(StopReason::Shutdown);
            }
            if tokio::time::Instant::now() >= deadline {
                break Ok(StopReason::BudgetExhausted);
            }

            let round = async {
                report.recovered += self.recover_stuck(tag).await?;

                if options.launch_new_batches {
                    report.requeued += self.requeue_failed(tag).await?;

                    let held_back = self
                        .route_fast(
                            tag,
                            &options,
                            batching,
                            &fast_slots,
                            &mut fast_tasks,
                            &children,
                        )
                        .await?;

                    if batching && options.mode == ExecutionMode::Batch && !held_back {
                        self.launch_batches(tag, &options, batch_timeout, &mut report).await?;
                    }
                }

                self.spawn_monitors(tag, &mut monitors, &children).await?;

                self.is_drained(tag, &options, &fast_tasks, &monitors).await
            };

            match round.await {
                Ok(true) => break Ok(StopReason::Drained),
                Ok(false) => {}
                Err(e) => break Err(e),
            }

            let wake = instant_after(idle).min(deadline);
            tokio::select! {
                Some(joined) = fast_tasks.join_next(), if !fast_tasks.is_empty() => {
                    report.record_fast(joined)
                }
                Some(joined) = monitors.join_next(), if !monitors.is_empty() => {
                    report.record_batch(joined)
                }
                _ = tokio::time::sleep_until(wake) => {}
                _ = self.shutdown.cancelled() => {}
            }
        };

        children.cancel();
        fast_tasks.shutdown().await;
        monitors.shutdown().await;

        let stop_reason = result?;
        report.stop_reason = stop_reason;
        report.exhausted = self
            .store
            .scan(&ScanFilter::statuses([RequestStatus::Failed]).with_tag(tag))
            .await?
            .into_iter()
            .filter(|row| !row.is_requeueable())
            .map(|row| row.id)
            .collect();

        tracing::info!(
            rounds = report.rounds,
            succeeded = report.succeeded,
            failed = report.failed,
            requeued = report.requeued,
            recovered = report.recovered,
            batches_launched = report.batches_launched,
            exhausted = report.exhausted.len(),
            stop_reason = ?report.stop_reason,
            "Clearing finished"
        );

        Ok(report)
    }

    /// Return stuck RUNNING rows to WAITING without counting a failure.
    ///
    /// A batch row is stuck when its job is closed, or when its job was never recorded and
    /// the row has been idle past `stale_running_after`. A fast-path row is stuck when no
    /// task of this engine is driving it and it has been idle past `stale_running_after`.
    /// Rows under an open job without a monitor are left for [`Self::spawn_monitors`].
    async fn recover_stuck(&self, tag: &str) -> Result<usize> {
        let running = self
            .store
            .scan(&ScanFilter::statuses([RequestStatus::Running]).with_tag(tag))
            .await?;
        let stale_after = self.config.stale_running_after();
        let now = Utc::now();

        let mut recovered = 0;
        for row in running {
            let idle = now - row.last_accessed() >= stale_after;
            let stuck = match row.current_batch {
                Some(batch) if self.active.batches.contains_key(&batch) => false,
                Some(batch) => match self.store.get_batch_job(batch).await? {
                    Some(job) => !job.is_open(),
                    None => idle,
                },
                None => idle && !self.active.rows.contains(&row.id),
            };
            if !stuck {
                continue;
            }

            let observed_batch = row.current_batch;
            let observed_access = row.last_accessed();
            let updated = self
                .store
                .transition(row.id, |current| {
                    (current.status == RequestStatus::Running
                        && current.current_batch == observed_batch
                        && current.last_accessed() == observed_access)
                        .then(|| RowUpdate::to(RequestStatus::Waiting).with_batch(None))
                })
                .await?;

            if updated.is_some() {
                tracing::warn!(
                    row_id = %row.id,
                    batch_id = ?observed_batch,
                    last_accessed = %observed_access,
                    "Recovered stuck running request"
                );
                counter!("barrage_stale_recoveries_total").increment(1);
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    /// Requeue every retryable FAILED head for `tag` as a new WAITING version.
    async fn requeue_failed(&self, tag: &str) -> Result<usize> {
        let failed = self
            .store
            .scan(&ScanFilter::statuses([RequestStatus::Failed]).with_tag(tag))
            .await?;

        let mut requeued = 0;
        for row in failed.iter().filter(|row| row.is_requeueable()) {
            let next = NewRow::next_version(row, RequestStatus::Waiting, Cause::Backup);
            match self.store.insert_version(row.id, next).await? {
                Some(version) => {
                    tracing::debug!(
                        previous = %row.id,
                        row_id = %version.id,
                        failure_count = version.failure_count,
                        "Requeued failed request"
                    );
                    requeued += 1;
                }
                None => {
                    tracing::debug!(
                        previous = %row.id,
                        "Failed request already requeued elsewhere"
                    );
                }
            }
        }
        Ok(requeued)
    }

    /// Move WAITING rows that belong on the fast path to RUNNING and spawn their retry loops.
    ///
    /// Returns whether a fast-path row had to stay WAITING for lack of a free slot, in which
    /// case no batch should be launched this round.
    async fn route_fast(
        &self,
        tag: &str,
        options: &ClearingOptions,
        batching: bool,
        fast_slots: &Arc<Semaphore>,
        fast_tasks: &mut JoinSet<Result<RequestRow>>,
        shutdown: &CancellationToken,
    ) -> Result<bool> {
        let waiting = self
            .store
            .scan(&ScanFilter::statuses([RequestStatus::Waiting]).with_tag(tag))
            .await?;

        for row in waiting {
            let fast = options.mode == ExecutionMode::Fast || !batching || row.is_near_cap();
            if !fast {
                continue;
            }

            let Ok(permit) = fast_slots.clone().try_acquire_owned() else {
                tracing::debug!(row_id = %row.id, "No fast-path slot free, holding row back");
                return Ok(true);
            };

            let claimed = self
                .store
                .transition(row.id, |current| {
                    (current.status == RequestStatus::Waiting && current.current_batch.is_none())
                        .then(|| RowUpdate::to(RequestStatus::Running))
                })
                .await?;

            if let Some(claimed) = claimed {
                tracing::debug!(
                    row_id = %claimed.id,
                    failure_count = claimed.failure_count,
                    attempts_cap = claimed.attempts_cap,
                    "Routing waiting request to fast path"
                );
                self.spawn_fast(claimed, permit, fast_tasks, shutdown);
            }
        }
        Ok(false)
    }

    fn spawn_fast(
        &self,
        row: RequestRow,
        permit: OwnedSemaphorePermit,
        fast_tasks: &mut JoinSet<Result<RequestRow>>,
        shutdown: &CancellationToken,
    ) {
        let retry = self.retry.clone();
        let rows = self.active.rows.clone();
        let shutdown = shutdown.clone();

        rows.insert(row.id);
        fast_tasks.spawn(async move {
            let id = row.id;
            let _permit = permit;
            let _guard = scopeguard::guard(rows, move |rows| {
                rows.remove(&id);
            });
            retry.drive(row, &shutdown).await
        });
    }

    async fn launch_batches(
        &self,
        tag: &str,
        options: &ClearingOptions,
        timeout: Duration,
        report: &mut ClearingReport,
    ) -> Result<()> {
        loop {
            match self.coordinator.launch(tag, options.batch_size, timeout).await {
                Ok(Some(_)) => report.batches_launched += 1,
                Ok(None) => return Ok(()),
                Err(e @ BarrageError::BatchSubmission { .. }) => {
                    tracing::warn!(error = %e, "Batch launch failed, will retry next round");
                    report.batch_submission_failures += 1;
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Start a monitor for every open job of `tag` that nobody in this engine is watching.
    async fn spawn_monitors(
        &self,
        tag: &str,
        monitors: &mut JoinSet<Result<BatchReconciliation>>,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        for job in self.store.open_batch_jobs(tag).await? {
            let batch = job.batch_id;
            let token = shutdown.child_token();
            match self.active.batches.entry(batch) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(slot) => {
                    slot.insert(token.clone());
                }
            }

            tracing::debug!(batch_id = %batch, job_id = %job.job_id, "Monitoring batch job");
            let coordinator = self.coordinator.clone();
            let batches = self.active.batches.clone();
            monitors.spawn(async move {
                let _guard = scopeguard::guard(batches, move |batches| {
                    batches.remove(&batch);
                });
                coordinator.monitor(job, token).await
            });
        }
        Ok(())
    }

    async fn is_drained(
        &self,
        tag: &str,
        options: &ClearingOptions,
        fast_tasks: &JoinSet<Result<RequestRow>>,
        monitors: &JoinSet<Result<BatchReconciliation>>,
    ) -> Result<bool> {
        if !fast_tasks.is_empty() || !monitors.is_empty() {
            return Ok(false);
        }
        if !self.store.open_batch_jobs(tag).await?.is_empty() {
            return Ok(false);
        }

        let mut outstanding = ScanFilter::statuses([RequestStatus::Running]).with_tag(tag);
        if options.launch_new_batches {
            outstanding = outstanding.with_status(RequestStatus::Waiting);
            let requeueable = self
                .store
                .scan(&ScanFilter::statuses([RequestStatus::Failed]).with_tag(tag))
                .await?
                .iter()
                .any(RequestRow::is_requeueable);
            if requeueable {
                return Ok(false);
            }
        }
        Ok(self.store.scan(&outstanding.with_limit(1)).await?.is_empty())
    }
}
