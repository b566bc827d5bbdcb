//! Fast-path retry controller.
//!
//! Drives one RUNNING row (with no batch) to a terminal status: call, record the attempt,
//! back off, call again, until the call succeeds, fails fatally, or the row's failure count
//! reaches its cap. Each attempt is written back with a compare-and-update conditioned on
//! the row still being RUNNING without a batch, so a row taken over by someone else (stale
//! recovery, say) is left alone.

use std::sync::Arc;

use metrics::counter;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::domain::request::{AttemptRecord, RequestRow, RequestStatus, RetryConfig, RowUpdate};
use crate::error::{BarrageError, Result};
use crate::executor::{AttemptExecutor, AttemptOutcome};
use crate::generation::GenerationClient;
use crate::scheduling::RegionSelector;
use crate::storage::RequestStore;

/// Runs the bounded retry loop for fast-path rows.
pub struct RetryController<S, G> {
    store: Arc<S>,
    executor: AttemptExecutor<G>,
    regions: Arc<dyn RegionSelector>,
    config: RetryConfig,
}

impl<S, G> RetryController<S, G>
where
    S: RequestStore,
    G: GenerationClient,
{
    pub fn new(
        store: Arc<S>,
        client: Arc<G>,
        regions: Arc<dyn RegionSelector>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            executor: AttemptExecutor::new(client, config.run_fast_timeout()),
            regions,
            config: RetryConfig::from(config),
        }
    }

    /// Retry until `row` is terminal and return the final row.
    ///
    /// `row` must already be RUNNING with no batch. If another worker changes the row
    /// between attempts, the loop stops and returns the row as it now stands.
    ///
    /// # Errors
    /// [`BarrageError::Shutdown`] if `shutdown` fires during a backoff; the row is left
    /// RUNNING for stale recovery.
    #[tracing::instrument(
        skip(self, row, shutdown),
        fields(row_id = %row.id, model = %row.content.model)
    )]
    pub async fn drive(&self, row: RequestRow, shutdown: &CancellationToken) -> Result<RequestRow> {
        let mut row = row;
        loop {
            let region = self.regions.next_region();
            let outcome = self.executor.attempt(&row.content, region.as_deref()).await;

            let updated = self
                .store
                .transition(row.id, |current| {
                    owns_fast_row(current).then(|| fast_update(current, &outcome, region.clone()))
                })
                .await?;

            let Some(updated) = updated else {
                tracing::warn!(
                    outcome = outcome.label(),
                    "Row changed hands during attempt, discarding result"
                );
                return self.store.get(row.id).await;
            };
            row = updated;

            match row.status {
                RequestStatus::Succeeded => {
                    tracing::info!(attempts = row.attempts_metadata.len(), "Request succeeded");
                    return Ok(row);
                }
                RequestStatus::Failed => {
                    if row.failure_count >= row.attempts_cap {
                        counter!(
                            "barrage_retry_denied_total",
                            "model" => row.content.model.clone(),
                            "reason" => "attempts_cap"
                        )
                        .increment(1);
                    }
                    tracing::warn!(
                        failure_count = row.failure_count,
                        attempts_cap = row.attempts_cap,
                        error = row.last_error().unwrap_or_default(),
                        "Request failed"
                    );
                    return Ok(row);
                }
                _ => {}
            }

            let delay = self.config.backoff(row.failure_count);
            tracing::warn!(
                failure_count = row.failure_count,
                attempts_cap = row.attempts_cap,
                backoff_ms = delay.as_millis() as u64,
                error = row.last_error().unwrap_or_default(),
                "Attempt failed, retrying after backoff"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => return Err(BarrageError::Shutdown),
            }
        }
    }
}

/// A fast-path attempt may only be written to a row that is still RUNNING outside a batch.
fn owns_fast_row(row: &RequestRow) -> bool {
    row.status == RequestStatus::Running && row.current_batch.is_none()
}

fn fast_update(row: &RequestRow, outcome: &AttemptOutcome, region: Option<String>) -> RowUpdate {
    let update = match outcome {
        AttemptOutcome::Success(text) => {
            return RowUpdate::succeeded(text.clone(), AttemptRecord::succeeded(None, region));
        }
        AttemptOutcome::RetryableFailure(reason) => RowUpdate::failure(
            row,
            AttemptRecord::failed(None, region, reason.clone(), true),
            RequestStatus::Running,
        ),
        AttemptOutcome::FatalFailure(reason) => RowUpdate::failure(
            row,
            AttemptRecord::failed(None, region, reason.clone(), false),
            RequestStatus::Running,
        ),
    };
    annotate_terminal_failure(row, update)
}

/// Note on a row that ends FAILED while its caller asked for a synthetic response.
pub(crate) fn annotate_terminal_failure(row: &RequestRow, update: RowUpdate) -> RowUpdate {
    if row.allow_failure && update.status == Some(RequestStatus::Failed) {
        update.with_notes("failed; synthetic failure response returned to caller (allow_failure)")
    } else {
        update
    }
}
