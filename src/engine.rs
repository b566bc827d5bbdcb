//! Public entry points: submit, await, clear.
//!
//! The engine wires the store, the generation and batch clients, and the scheduling
//! strategies together. It owns no row state of its own; everything it knows about a request
//! is read back from the store.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::batch::{BatchClient, BatchCoordinator};
use crate::clearing::{ActiveWork, ClearingLoop, ClearingOptions, ClearingReport};
use crate::config::{EngineConfig, ExecutionMode};
use crate::domain::request::{
    Cause, NewRow, RequestContent, RequestRow, RequestStatus, RowId, RowUpdate, Tags,
};
use crate::error::{BarrageError, Result};
use crate::generation::GenerationClient;
use crate::retry::RetryController;
use crate::scheduling::{FixedInterval, PollSchedule, RegionSelector, RoundRobinRegions};
use crate::storage::{MAX_CONFLICT_RETRIES, RequestStore};

/// Per-submission parameters. Unset fields fall back to the engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubmitOptions {
    pub mode: ExecutionMode,
    pub cause: Cause,
    pub attempts_cap: Option<u32>,
    pub allow_failure: Option<bool>,
    pub notes: Option<String>,
}

impl SubmitOptions {
    pub fn fast() -> Self {
        Self::default()
    }

    pub fn batch() -> Self {
        Self {
            mode: ExecutionMode::Batch,
            ..Default::default()
        }
    }

    pub fn with_cause(mut self, cause: Cause) -> Self {
        self.cause = cause;
        self
    }

    pub fn with_attempts_cap(mut self, attempts_cap: u32) -> Self {
        self.attempts_cap = Some(attempts_cap);
        self
    }

    pub fn with_allow_failure(mut self, allow_failure: bool) -> Self {
        self.allow_failure = Some(allow_failure);
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

/// The outcome handed back to a caller awaiting a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    /// The row version that produced this result
    pub row_id: RowId,
    pub text: String,
    /// The request failed and `text` describes the failure instead of generated output
    pub synthetic: bool,
}

/// Request lifecycle engine.
pub struct Engine<S, G, B> {
    store: Arc<S>,
    generation: Arc<G>,
    batch_client: Arc<B>,
    config: EngineConfig,
    regions: Arc<dyn RegionSelector>,
    poll_schedule: Arc<dyn PollSchedule>,
    active: ActiveWork,
    shutdown: CancellationToken,
}

impl<S, G, B> Engine<S, G, B>
where
    S: RequestStore + 'static,
    G: GenerationClient + 'static,
    B: BatchClient + 'static,
{
    pub fn new(
        store: Arc<S>,
        generation: Arc<G>,
        batch_client: Arc<B>,
        config: EngineConfig,
    ) -> Self {
        let regions = Arc::new(RoundRobinRegions::new(config.regions.clone()));
        let poll_schedule =
            Arc::new(FixedInterval(Duration::from_millis(config.batch_poll_interval_ms)));
        Self {
            store,
            generation,
            batch_client,
            config,
            regions,
            poll_schedule,
            active: ActiveWork::default(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_region_selector(mut self, regions: Arc<dyn RegionSelector>) -> Self {
        self.regions = regions;
        self
    }

    pub fn with_poll_schedule(mut self, poll_schedule: Arc<dyn PollSchedule>) -> Self {
        self.poll_schedule = poll_schedule;
        self
    }

    /// Use an externally owned token; cancelling it stops retry loops, monitors and clearing.
    pub fn with_shutdown_token(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn retry_controller(&self) -> RetryController<S, G> {
        RetryController::new(
            self.store.clone(),
            self.generation.clone(),
            self.regions.clone(),
            &self.config,
        )
    }

    /// Resolve `content` to a stored row and start it on its execution path.
    ///
    /// An existing SUCCEEDED, WAITING or RUNNING row for the same content and tags is
    /// returned as-is. A retryable FAILED row is continued as a new version. In fast mode the
    /// call returns once the row is terminal; in batch mode it returns the WAITING row.
    ///
    /// # Errors
    /// - [`BarrageError::ValidationError`] for an unusable submission
    /// - [`BarrageError::Shutdown`] if shutdown interrupts the fast path
    #[tracing::instrument(
        skip(self, content, tags, options),
        fields(model = %content.model, tags = %tags, mode = ?options.mode)
    )]
    pub async fn submit_request(
        &self,
        content: RequestContent,
        tags: Tags,
        options: SubmitOptions,
    ) -> Result<RequestRow> {
        let capabilities = self.store.capabilities();
        let mode = if options.mode == ExecutionMode::Batch && !capabilities.batching {
            tracing::warn!("Store cannot hold rows for batching, using the fast path");
            ExecutionMode::Fast
        } else {
            options.mode
        };
        let allow_failure = options.allow_failure.unwrap_or(self.config.allow_failure);

        let new_row = NewRow::new(
            content,
            tags,
            options.attempts_cap.unwrap_or(self.config.attempts_cap),
        )
        .with_cause(options.cause)
        .with_allow_failure(allow_failure)
        .with_notes(options.notes.clone());
        new_row.validate()?;

        if !capabilities.dedup {
            let row = self.store.insert(new_row).await?;
            return self.dispatch(row, mode).await;
        }

        for _ in 0..MAX_CONFLICT_RETRIES {
            let existing = self
                .store
                .find_latest_by_hash(&new_row.content_hash, Some(&new_row.tags))
                .await?;

            let Some(existing) = existing else {
                match self.store.insert_first_version(new_row.clone()).await? {
                    Some(row) => {
                        tracing::debug!(
                            row_id = %row.id,
                            hash = %row.content_hash,
                            "Stored new request"
                        );
                        return self.dispatch(row, mode).await;
                    }
                    None => {
                        tracing::debug!(
                            hash = %new_row.content_hash,
                            "Lineage started concurrently, looking up again"
                        );
                        continue;
                    }
                }
            };

            match existing.status {
                RequestStatus::Succeeded | RequestStatus::Waiting | RequestStatus::Running => {
                    counter!("barrage_dedup_hits_total", "status" => existing.status.as_str())
                        .increment(1);
                    tracing::debug!(
                        row_id = %existing.id,
                        status = %existing.status,
                        "Resolved to existing request"
                    );
                    self.store.touch(existing.id).await?;
                    return self.store.get(existing.id).await;
                }
                RequestStatus::Pending => {
                    counter!("barrage_dedup_hits_total", "status" => existing.status.as_str())
                        .increment(1);
                    return self.dispatch(existing, mode).await;
                }
                RequestStatus::Failed if existing.is_requeueable() => {
                    let next =
                        NewRow::next_version(&existing, RequestStatus::Pending, options.cause)
                            .with_allow_failure(allow_failure);
                    match self.store.insert_version(existing.id, next).await? {
                        Some(row) => {
                            tracing::info!(
                                previous = %existing.id,
                                row_id = %row.id,
                                failure_count = row.failure_count,
                                "Continuing failed request as a new version"
                            );
                            return self.dispatch(row, mode).await;
                        }
                        None => {
                            tracing::debug!(
                                previous = %existing.id,
                                "Lineage moved on, looking up again"
                            );
                        }
                    }
                }
                RequestStatus::Failed => {
                    tracing::debug!(
                        row_id = %existing.id,
                        failure_count = existing.failure_count,
                        "Resolved to exhausted request"
                    );
                    self.store.touch(existing.id).await?;
                    return self.store.get(existing.id).await;
                }
            }
        }

        Err(BarrageError::Other(anyhow::anyhow!(
            "lineage of {} kept changing during submission",
            new_row.content_hash
        )))
    }

    /// Submit many requests sharing `tags`, at most `batch_size` at a time. Results are in
    /// input order.
    pub async fn submit_requests(
        &self,
        requests: Vec<RequestContent>,
        tags: Tags,
        options: SubmitOptions,
    ) -> Vec<Result<RequestRow>> {
        futures::stream::iter(requests)
            .map(|content| self.submit_request(content, tags.clone(), options.clone()))
            .buffered(self.config.batch_size.max(1))
            .collect()
            .await
    }

    async fn dispatch(&self, row: RequestRow, mode: ExecutionMode) -> Result<RequestRow> {
        match mode {
            ExecutionMode::Fast => {
                let claimed = self
                    .store
                    .transition(row.id, |current| {
                        (matches!(current.status, RequestStatus::Pending | RequestStatus::Waiting)
                            && current.current_batch.is_none())
                        .then(|| RowUpdate::to(RequestStatus::Running))
                    })
                    .await?;
                let Some(claimed) = claimed else {
                    // Someone else got there first
                    return self.store.get(row.id).await;
                };

                let id = claimed.id;
                self.active.rows.insert(id);
                let _guard = scopeguard::guard(self.active.rows.clone(), move |rows| {
                    rows.remove(&id);
                });
                self.retry_controller().drive(claimed, &self.shutdown).await
            }
            ExecutionMode::Batch => {
                let parked = self
                    .store
                    .transition(row.id, |current| {
                        (current.status == RequestStatus::Pending)
                            .then(|| RowUpdate::to(RequestStatus::Waiting))
                    })
                    .await?;
                match parked {
                    Some(parked) => Ok(parked),
                    None => self.store.get(row.id).await,
                }
            }
        }
    }

    /// Wait until the lineage of `row` reaches a result.
    ///
    /// A retryable FAILED version is followed to its successor; until one exists the wait
    /// continues, since a clearing run will requeue it.
    ///
    /// # Errors
    /// - [`BarrageError::ServiceRejection`] if the request failed fatally
    /// - [`BarrageError::CapacityExceeded`] if it failed at its attempts cap
    /// - [`BarrageError::AwaitTimeout`] past `await_timeout_ms`
    /// - [`BarrageError::Shutdown`] on shutdown
    ///
    /// Neither failure is raised for a row submitted with `allow_failure`; a synthetic
    /// [`Completion`] is returned instead.
    #[tracing::instrument(skip(self, row), fields(row_id = %row.id))]
    pub async fn await_result(&self, row: &RequestRow) -> Result<Completion> {
        let started = tokio::time::Instant::now();
        let limit = self.config.await_timeout_ms.map(Duration::from_millis);
        let interval = Duration::from_millis(self.config.await_poll_interval_ms);

        let mut current = self.store.get(row.id).await?;
        loop {
            match current.status {
                RequestStatus::Succeeded => {
                    self.store.touch(current.id).await?;
                    return Ok(Completion {
                        row_id: current.id,
                        text: current.response.unwrap_or_default(),
                        synthetic: false,
                    });
                }
                RequestStatus::Failed if current.is_requeueable() => {
                    if let Some(head) = self
                        .store
                        .find_latest_by_hash(&current.content_hash, Some(&current.tags))
                        .await?
                        && head.id != current.id
                    {
                        tracing::debug!(
                            previous = %current.id,
                            row_id = %head.id,
                            "Following requeued version"
                        );
                        current = head;
                        continue;
                    }
                }
                RequestStatus::Failed => return self.failure_result(current).await,
                _ => {}
            }

            if let Some(limit) = limit
                && started.elapsed() >= limit
            {
                return Err(BarrageError::AwaitTimeout(row.id));
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.shutdown.cancelled() => return Err(BarrageError::Shutdown),
            }
            current = self.store.get(current.id).await?;
        }
    }

    async fn failure_result(&self, row: RequestRow) -> Result<Completion> {
        let last_error = row.last_error().unwrap_or("unknown error").to_string();

        if row.allow_failure {
            self.store.touch(row.id).await?;
            return Ok(Completion {
                row_id: row.id,
                text: format!(
                    "request failed after {} attempt(s): {}",
                    row.failure_count, last_error
                ),
                synthetic: true,
            });
        }

        if row.last_attempt().is_some_and(|attempt| !attempt.retryable) {
            Err(BarrageError::ServiceRejection {
                id: row.id,
                reason: last_error,
            })
        } else {
            Err(BarrageError::CapacityExceeded {
                id: row.id,
                failures: row.failure_count,
                cap: row.attempts_cap,
                last_error,
            })
        }
    }

    /// Run one clearing loop for `tag`.
    pub async fn run_clearing(
        &self,
        tag: &str,
        options: ClearingOptions,
    ) -> Result<ClearingReport> {
        let coordinator = BatchCoordinator::new(
            self.store.clone(),
            self.batch_client.clone(),
            self.regions.clone(),
            self.poll_schedule.clone(),
        );
        ClearingLoop::new(
            self.store.clone(),
            Arc::new(self.retry_controller()),
            Arc::new(coordinator),
            self.config.clone(),
            self.active.clone(),
            self.shutdown.clone(),
        )
        .run(tag, options)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::MockBatchClient;
    use crate::domain::request::AttemptRecord;
    use crate::generation::{GenerationError, MockGenerationClient};
    use crate::storage::InMemoryRequestStore;

    type TestEngine = Engine<InMemoryRequestStore, MockGenerationClient, MockBatchClient>;

    fn engine_with(
        store: InMemoryRequestStore,
        config: EngineConfig,
    ) -> (TestEngine, MockGenerationClient) {
        let generation = MockGenerationClient::new();
        let engine = Engine::new(
            Arc::new(store),
            Arc::new(generation.clone()),
            Arc::new(MockBatchClient::new()),
            config,
        );
        (engine, generation)
    }

    fn tags() -> Tags {
        Tags::new(["eval"])
    }

    #[tokio::test]
    async fn test_fast_submission_is_deduplicated() {
        let (engine, generation) =
            engine_with(InMemoryRequestStore::new(), EngineConfig::default());
        generation.add_response("q", Ok("answer".to_string()));

        let first = engine
            .submit_request(RequestContent::new("m", "q"), tags(), SubmitOptions::fast())
            .await
            .unwrap();
        let second = engine
            .submit_request(RequestContent::new("m", "q"), tags(), SubmitOptions::fast())
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.status, RequestStatus::Succeeded);
        assert!(second.access_timestamps.len() > first.access_timestamps.len());
        assert_eq!(generation.call_count(), 1);
    }

    #[tokio::test]
    async fn test_different_tags_are_separate_lineages() {
        let (engine, generation) =
            engine_with(InMemoryRequestStore::new(), EngineConfig::default());
        generation.add_response(crate::generation::ANY_QUERY, Ok("x".to_string()));
        generation.add_response(crate::generation::ANY_QUERY, Ok("x".to_string()));

        let a = engine
            .submit_request(RequestContent::new("m", "q"), Tags::new(["a"]), SubmitOptions::fast())
            .await
            .unwrap();
        let b = engine
            .submit_request(RequestContent::new("m", "q"), Tags::new(["b"]), SubmitOptions::fast())
            .await
            .unwrap();

        assert_ne!(a.id, b.id);
        assert_eq!(a.content_hash, b.content_hash);
        assert_eq!(generation.call_count(), 2);
    }

    #[tokio::test]
    async fn test_batch_submission_parks_row() {
        let (engine, generation) =
            engine_with(InMemoryRequestStore::new(), EngineConfig::default());

        let row = engine
            .submit_request(RequestContent::new("m", "q"), tags(), SubmitOptions::batch())
            .await
            .unwrap();

        assert_eq!(row.status, RequestStatus::Waiting);
        assert_eq!(row.current_batch, None);
        assert_eq!(generation.call_count(), 0);

        // Resubmitting resolves to the parked row
        let again = engine
            .submit_request(RequestContent::new("m", "q"), tags(), SubmitOptions::batch())
            .await
            .unwrap();
        assert_eq!(again.id, row.id);
    }

    #[tokio::test]
    async fn test_ephemeral_store_degrades_to_fast_path() {
        let (engine, generation) =
            engine_with(InMemoryRequestStore::ephemeral(), EngineConfig::default());
        generation.add_response("q", Ok("one".to_string()));
        generation.add_response("q", Ok("two".to_string()));

        let first = engine
            .submit_request(RequestContent::new("m", "q"), tags(), SubmitOptions::batch())
            .await
            .unwrap();
        let second = engine
            .submit_request(RequestContent::new("m", "q"), tags(), SubmitOptions::batch())
            .await
            .unwrap();

        assert_eq!(first.status, RequestStatus::Succeeded);
        assert_ne!(first.id, second.id);
        assert_eq!(generation.call_count(), 2);
    }

    #[tokio::test]
    async fn test_invalid_submission_is_rejected() {
        let (engine, _) = engine_with(InMemoryRequestStore::new(), EngineConfig::default());

        let result = engine
            .submit_request(
                RequestContent::new("m", "q"),
                tags(),
                SubmitOptions::fast().with_attempts_cap(0),
            )
            .await;

        assert!(matches!(result, Err(BarrageError::ValidationError(_))));
        assert!(engine.store().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_failure_raises_service_rejection() {
        let (engine, generation) =
            engine_with(InMemoryRequestStore::new(), EngineConfig::default());
        generation.add_response(
            "q",
            Err(GenerationError::PolicyRejection("content policy".to_string())),
        );

        let row = engine
            .submit_request(RequestContent::new("m", "q"), tags(), SubmitOptions::fast())
            .await
            .unwrap();
        let result = engine.await_result(&row).await;

        assert!(matches!(result, Err(BarrageError::ServiceRejection { id, .. }) if id == row.id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_allow_failure_returns_synthetic_completion() {
        let (engine, generation) =
            engine_with(InMemoryRequestStore::new(), EngineConfig::default());
        generation.add_response(
            "q",
            Err(GenerationError::InvalidRequest { status: 400, body: "bad".to_string() }),
        );

        let row = engine
            .submit_request(
                RequestContent::new("m", "q"),
                tags(),
                SubmitOptions::fast().with_allow_failure(true),
            )
            .await
            .unwrap();
        let completion = engine.await_result(&row).await.unwrap();

        assert!(completion.synthetic);
        assert!(completion.text.contains("request failed after 1 attempt(s)"));
        assert_eq!(row.status, RequestStatus::Failed);
        assert!(row.notes.unwrap().contains("allow_failure"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_times_out_on_parked_row() {
        let (engine, _) = engine_with(
            InMemoryRequestStore::new(),
            EngineConfig {
                await_timeout_ms: Some(5000),
                ..Default::default()
            },
        );

        let row = engine
            .submit_request(RequestContent::new("m", "q"), tags(), SubmitOptions::batch())
            .await
            .unwrap();
        let result = engine.await_result(&row).await;

        assert!(matches!(result, Err(BarrageError::AwaitTimeout(id)) if id == row.id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_follows_requeued_version() {
        let (engine, generation) =
            engine_with(InMemoryRequestStore::new(), EngineConfig::default());
        generation.add_response("q", Ok("eventually".to_string()));
        let store = engine.store().clone();

        // A batch row that failed retryably
        let row = store
            .insert(
                NewRow::new(RequestContent::new("m", "q"), tags(), 3)
                    .with_status(RequestStatus::Waiting),
            )
            .await
            .unwrap();
        let running = store
            .compare_and_update(
                row.id,
                RequestStatus::Waiting,
                RowUpdate::to(RequestStatus::Running),
            )
            .await
            .unwrap();
        let failed = store
            .compare_and_update(
                row.id,
                RequestStatus::Running,
                RowUpdate::failure(
                    &running,
                    AttemptRecord::failed(None, None, "missing from batch output", true),
                    RequestStatus::Failed,
                ),
            )
            .await
            .unwrap();

        // Resubmitting continues the lineage on the fast path
        let continued = engine
            .submit_request(RequestContent::new("m", "q"), tags(), SubmitOptions::fast())
            .await
            .unwrap();
        assert_ne!(continued.id, failed.id);
        assert_eq!(continued.status, RequestStatus::Succeeded);
        assert_eq!(continued.failure_count, 1);

        let completion = engine.await_result(&failed).await.unwrap();
        assert_eq!(completion.row_id, continued.id);
        assert_eq!(completion.text, "eventually");
        assert!(!completion.synthetic);
    }

    #[tokio::test]
    async fn test_submit_many_preserves_order() {
        let (engine, generation) =
            engine_with(InMemoryRequestStore::new(), EngineConfig::default());
        for query in ["a", "b", "c"] {
            generation.add_response(query, Ok(query.to_uppercase()));
        }

        let rows = engine
            .submit_requests(
                vec![
                    RequestContent::new("m", "a"),
                    RequestContent::new("m", "b"),
                    RequestContent::new("m", "c"),
                ],
                tags(),
                SubmitOptions::fast(),
            )
            .await;

        let responses: Vec<_> = rows
            .into_iter()
            .map(|row| row.unwrap().response.unwrap())
            .collect();
        assert_eq!(responses, vec!["A", "B", "C"]);
    }
}
