//! External batch service abstraction.
//!
//! A batch job carries many rows at once. It is submitted once, then polled until the
//! service reports results or failure. The [`BatchCoordinator`] owns the row bookkeeping
//! around those calls.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::domain::batch::BatchJobId;
use crate::domain::request::{RequestContent, RequestRow, RowId};
use crate::executor::AttemptOutcome;
use crate::generation::{
    GenerationError, chat_completion_body, classify_send_error, completion_text,
};

pub mod coordinator;

pub use coordinator::{BatchCoordinator, BatchReconciliation};

/// One row's slot in a batch job.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchItem {
    pub row_id: RowId,
    pub content: RequestContent,
}

impl From<&RequestRow> for BatchItem {
    fn from(row: &RequestRow) -> Self {
        Self {
            row_id: row.id,
            content: row.content.clone(),
        }
    }
}

/// What a poll of a batch job reported.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchJobStatus {
    /// Not finished yet.
    Running,
    /// Finished; per-row outcomes. Rows absent from the map produced no output.
    Succeeded(HashMap<RowId, AttemptOutcome>),
    /// The whole job failed.
    Failed(String),
}

/// Trait for submitting and polling batch jobs.
#[async_trait]
pub trait BatchClient: Send + Sync {
    /// Submit one job containing every item. Returns the service's job id.
    async fn submit(
        &self,
        batch: BatchJobId,
        items: &[BatchItem],
        region: Option<&str>,
    ) -> std::result::Result<String, GenerationError>;

    /// Report the current status of a submitted job.
    ///
    /// `region` is the one the job was submitted to; job ids are only meaningful there.
    async fn poll(
        &self,
        job_id: &str,
        region: Option<&str>,
    ) -> std::result::Result<BatchJobStatus, GenerationError>;
}

// ============================================================================
// Production Implementation using reqwest
// ============================================================================

/// Batch client for a JSON batch API.
///
/// Jobs are created with `POST {base}/v1/batches` carrying one chat-completions body per row
/// (keyed by `custom_id` = row id) and polled with `GET {base}/v1/batches/{id}`, where `base`
/// is the URL of the region the job went to.
#[derive(Clone)]
pub struct ReqwestBatchClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    region_urls: HashMap<String, String>,
    request_timeout: Duration,
}

impl ReqwestBatchClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: None,
            region_urls: HashMap::new(),
            request_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>, base_url: impl Into<String>) -> Self {
        self.region_urls.insert(region.into(), base_url.into());
        self
    }

    /// Timeout for each submit or poll HTTP call.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn url(&self, region: Option<&str>, path: &str) -> String {
        let base = region
            .and_then(|region| self.region_urls.get(region))
            .unwrap_or(&self.base_url);
        format!("{}{}", base.trim_end_matches('/'), path)
    }

    async fn send_json(
        &self,
        req: reqwest::RequestBuilder,
    ) -> std::result::Result<Value, GenerationError> {
        let mut req = req.timeout(self.request_timeout);
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key);
        }

        let response = req
            .send()
            .await
            .map_err(|e| classify_send_error(&e, self.request_timeout))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| classify_send_error(&e, self.request_timeout))?;

        if !(200..300).contains(&status) {
            return Err(GenerationError::from_status(status, body));
        }
        serde_json::from_str(&body).map_err(|e| GenerationError::MalformedResponse(e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct BatchCreated {
    id: String,
}

#[derive(Debug, Deserialize)]
struct BatchState {
    status: String,
    #[serde(default)]
    results: Vec<BatchResult>,
    #[serde(default)]
    errors: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct BatchResult {
    custom_id: String,
    #[serde(default)]
    response: Option<BatchResultResponse>,
    #[serde(default)]
    error: Option<BatchResultError>,
}

#[derive(Debug, Deserialize)]
struct BatchResultResponse {
    status_code: u16,
    body: Value,
}

#[derive(Debug, Deserialize)]
struct BatchResultError {
    #[serde(default)]
    code: Option<String>,
    message: String,
}

impl BatchResult {
    fn outcome(self) -> AttemptOutcome {
        match (self.response, self.error) {
            (Some(response), _) if (200..300).contains(&response.status_code) => {
                completion_text(response.body).into()
            }
            (Some(response), _) => {
                let err: std::result::Result<String, GenerationError> = Err(
                    GenerationError::from_status(response.status_code, response.body.to_string()),
                );
                err.into()
            }
            (None, Some(error)) => AttemptOutcome::RetryableFailure(match error.code {
                Some(code) => format!("{}: {}", code, error.message),
                None => error.message,
            }),
            (None, None) => AttemptOutcome::RetryableFailure("empty batch result".to_string()),
        }
    }
}

fn parse_batch_state(state: BatchState) -> BatchJobStatus {
    match state.status.as_str() {
        "completed" => {
            let mut outcomes = HashMap::with_capacity(state.results.len());
            for result in state.results {
                match result.custom_id.parse::<uuid::Uuid>() {
                    Ok(id) => {
                        outcomes.insert(RowId(id), result.outcome());
                    }
                    Err(_) => {
                        tracing::warn!(
                            custom_id = %result.custom_id,
                            "Ignoring batch result with unknown custom_id"
                        );
                    }
                }
            }
            BatchJobStatus::Succeeded(outcomes)
        }
        "failed" | "expired" | "cancelled" => BatchJobStatus::Failed(match state.errors {
            Some(errors) => format!("batch {}: {}", state.status, errors),
            None => format!("batch {}", state.status),
        }),
        _ => BatchJobStatus::Running,
    }
}

#[async_trait]
impl BatchClient for ReqwestBatchClient {
    #[tracing::instrument(skip(self, items), fields(batch_id = %batch, rows = items.len()))]
    async fn submit(
        &self,
        batch: BatchJobId,
        items: &[BatchItem],
        region: Option<&str>,
    ) -> std::result::Result<String, GenerationError> {
        let requests: Vec<Value> = items
            .iter()
            .map(|item| {
                json!({
                    "custom_id": item.row_id.0.to_string(),
                    "method": "POST",
                    "url": "/v1/chat/completions",
                    "body": chat_completion_body(&item.content),
                })
            })
            .collect();
        let body = json!({
            "requests": requests,
            "metadata": { "barrage_batch_id": batch.0.to_string() },
        });

        let created = self
            .send_json(self.client.post(self.url(region, "/v1/batches")).json(&body))
            .await?;
        let created: BatchCreated = serde_json::from_value(created)
            .map_err(|e| GenerationError::MalformedResponse(e.to_string()))?;

        tracing::debug!(job_id = %created.id, "Batch job created");
        Ok(created.id)
    }

    async fn poll(
        &self,
        job_id: &str,
        region: Option<&str>,
    ) -> std::result::Result<BatchJobStatus, GenerationError> {
        let url = self.url(region, &format!("/v1/batches/{}", job_id));
        let state = self.send_json(self.client.get(url)).await?;
        let state: BatchState = serde_json::from_value(state)
            .map_err(|e| GenerationError::MalformedResponse(e.to_string()))?;

        tracing::trace!(job_id, status = %state.status, "Polled batch job");
        Ok(parse_batch_state(state))
    }
}

// ============================================================================
// Test/Mock Implementation
// ============================================================================

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

type Responder = Arc<dyn Fn(&BatchItem) -> AttemptOutcome + Send + Sync>;

/// How submitted mock jobs behave when polled.
#[derive(Clone, Default)]
enum MockBehaviour {
    /// Every poll reports Running.
    #[default]
    NeverFinishes,
    /// Running for `polls` polls, then Succeeded with `responder` applied to every item.
    CompleteAfter { polls: usize, responder: Responder },
    /// Running for `polls` polls, then Failed.
    FailAfter { polls: usize, reason: String },
}

struct MockJob {
    items: Vec<BatchItem>,
    region: Option<String>,
    behaviour: MockBehaviour,
    polls: usize,
}

/// Record of a job submitted to the mock.
#[derive(Debug, Clone, PartialEq)]
pub struct MockSubmission {
    pub batch: BatchJobId,
    pub job_id: String,
    pub row_ids: Vec<RowId>,
    pub region: Option<String>,
}

/// Record of one poll made against the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockPoll {
    pub job_id: String,
    pub region: Option<String>,
}

/// Mock batch client for testing.
///
/// Jobs never finish unless told otherwise. The behaviour in force at submission time sticks
/// to the job. Like a regional service, a job is only found when polled in the region it was
/// submitted to.
///
/// # Example
/// ```ignore
/// let mock = MockBatchClient::new();
/// mock.complete_after(1, |item| AttemptOutcome::Success(format!("echo {}", item.content.query)));
/// ```
#[derive(Clone, Default)]
pub struct MockBatchClient {
    behaviour: Arc<Mutex<MockBehaviour>>,
    submit_errors: Arc<Mutex<VecDeque<GenerationError>>>,
    jobs: Arc<Mutex<HashMap<String, MockJob>>>,
    submissions: Arc<Mutex<Vec<MockSubmission>>>,
    polls: Arc<Mutex<Vec<MockPoll>>>,
}

impl MockBatchClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs submitted from now on complete after `polls` Running polls.
    pub fn complete_after<F>(&self, polls: usize, responder: F)
    where
        F: Fn(&BatchItem) -> AttemptOutcome + Send + Sync + 'static,
    {
        *self.behaviour.lock() = MockBehaviour::CompleteAfter {
            polls,
            responder: Arc::new(responder),
        };
    }

    /// Jobs submitted from now on fail after `polls` Running polls.
    pub fn fail_after(&self, polls: usize, reason: impl Into<String>) {
        *self.behaviour.lock() = MockBehaviour::FailAfter {
            polls,
            reason: reason.into(),
        };
    }

    /// Jobs submitted from now on never finish.
    pub fn never_finish(&self) {
        *self.behaviour.lock() = MockBehaviour::NeverFinishes;
    }

    /// The next submission fails with `error`.
    pub fn fail_next_submit(&self, error: GenerationError) {
        self.submit_errors.lock().push_back(error);
    }

    pub fn submissions(&self) -> Vec<MockSubmission> {
        self.submissions.lock().clone()
    }

    pub fn submit_count(&self) -> usize {
        self.submissions.lock().len()
    }

    pub fn polls(&self) -> Vec<MockPoll> {
        self.polls.lock().clone()
    }

    pub fn poll_count(&self) -> usize {
        self.polls.lock().len()
    }
}

#[async_trait]
impl BatchClient for MockBatchClient {
    async fn submit(
        &self,
        batch: BatchJobId,
        items: &[BatchItem],
        region: Option<&str>,
    ) -> std::result::Result<String, GenerationError> {
        if let Some(error) = self.submit_errors.lock().pop_front() {
            return Err(error);
        }

        let job_id = format!("mock-job-{}", batch.0);
        self.jobs.lock().insert(
            job_id.clone(),
            MockJob {
                items: items.to_vec(),
                region: region.map(str::to_string),
                behaviour: self.behaviour.lock().clone(),
                polls: 0,
            },
        );
        self.submissions.lock().push(MockSubmission {
            batch,
            job_id: job_id.clone(),
            row_ids: items.iter().map(|item| item.row_id).collect(),
            region: region.map(str::to_string),
        });
        Ok(job_id)
    }

    async fn poll(
        &self,
        job_id: &str,
        region: Option<&str>,
    ) -> std::result::Result<BatchJobStatus, GenerationError> {
        self.polls.lock().push(MockPoll {
            job_id: job_id.to_string(),
            region: region.map(str::to_string),
        });

        let mut jobs = self.jobs.lock();
        let Some(job) = jobs
            .get_mut(job_id)
            .filter(|job| job.region.as_deref() == region)
        else {
            return Err(GenerationError::InvalidRequest {
                status: 404,
                body: format!("unknown batch job '{}'", job_id),
            });
        };
        job.polls += 1;

        let status = match &job.behaviour {
            MockBehaviour::NeverFinishes => BatchJobStatus::Running,
            MockBehaviour::CompleteAfter { polls, .. } | MockBehaviour::FailAfter { polls, .. }
                if job.polls <= *polls =>
            {
                BatchJobStatus::Running
            }
            MockBehaviour::CompleteAfter { responder, .. } => BatchJobStatus::Succeeded(
                job.items
                    .iter()
                    .map(|item| (item.row_id, responder(item)))
                    .collect(),
            ),
            MockBehaviour::FailAfter { reason, .. } => BatchJobStatus::Failed(reason.clone()),
        };
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_completed_batch() {
        let ok_id = uuid::Uuid::new_v4();
        let throttled_id = uuid::Uuid::new_v4();
        let rejected_id = uuid::Uuid::new_v4();
        let errored_id = uuid::Uuid::new_v4();

        let state: BatchState = serde_json::from_value(json!({
            "status": "completed",
            "results": [
                {"custom_id": ok_id.to_string(), "response": {"status_code": 200, "body": {"choices": [{"message": {"content": "hi"}}]}}},
                {"custom_id": throttled_id.to_string(), "response": {"status_code": 429, "body": {"error": "slow down"}}},
                {"custom_id": rejected_id.to_string(), "response": {"status_code": 400, "body": {"error": "bad"}}},
                {"custom_id": errored_id.to_string(), "error": {"code": "server_error", "message": "oops"}},
                {"custom_id": "not-a-uuid", "error": {"message": "ignored"}}
            ]
        }))
        .unwrap();

        let BatchJobStatus::Succeeded(outcomes) = parse_batch_state(state) else {
            panic!("expected completed batch");
        };
        assert_eq!(outcomes.len(), 4);
        assert_eq!(outcomes[&RowId(ok_id)], AttemptOutcome::Success("hi".to_string()));
        assert!(matches!(outcomes[&RowId(throttled_id)], AttemptOutcome::RetryableFailure(_)));
        assert!(matches!(outcomes[&RowId(rejected_id)], AttemptOutcome::FatalFailure(_)));
        assert_eq!(
            outcomes[&RowId(errored_id)],
            AttemptOutcome::RetryableFailure("server_error: oops".to_string())
        );
    }

    #[test]
    fn test_parse_running_and_failed_batch() {
        let running: BatchState = serde_json::from_value(json!({"status": "in_progress"})).unwrap();
        assert_eq!(parse_batch_state(running), BatchJobStatus::Running);

        let expired: BatchState = serde_json::from_value(json!({"status": "expired"})).unwrap();
        assert_eq!(parse_batch_state(expired), BatchJobStatus::Failed("batch expired".to_string()));
    }

    #[test]
    fn test_regional_urls() {
        let client = ReqwestBatchClient::new("https://api.example.com/")
            .with_region("eu-west", "https://eu.example.com");

        assert_eq!(
            client.url(Some("eu-west"), "/v1/batches/job-1"),
            "https://eu.example.com/v1/batches/job-1"
        );
        assert_eq!(
            client.url(Some("ap-south"), "/v1/batches/job-1"),
            "https://api.example.com/v1/batches/job-1"
        );
        assert_eq!(client.url(None, "/v1/batches"), "https://api.example.com/v1/batches");
    }

    #[tokio::test]
    async fn test_mock_completes_after_polls() {
        let mock = MockBatchClient::new();
        mock.complete_after(1, |item| AttemptOutcome::Success(item.content.query.to_uppercase()));

        let item = BatchItem {
            row_id: RowId::new(),
            content: RequestContent::new("m", "abc"),
        };
        let job_id = mock
            .submit(BatchJobId::new(), std::slice::from_ref(&item), Some("eu"))
            .await
            .unwrap();

        assert_eq!(mock.poll(&job_id, Some("eu")).await.unwrap(), BatchJobStatus::Running);
        let Ok(BatchJobStatus::Succeeded(outcomes)) = mock.poll(&job_id, Some("eu")).await else {
            panic!("expected completion on second poll");
        };
        assert_eq!(outcomes[&item.row_id], AttemptOutcome::Success("ABC".to_string()));
        assert_eq!(mock.submissions()[0].region.as_deref(), Some("eu"));
        assert_eq!(mock.poll_count(), 2);
    }

    #[tokio::test]
    async fn test_mock_job_is_unknown_outside_its_region() {
        let mock = MockBatchClient::new();
        let job_id = mock.submit(BatchJobId::new(), &[], Some("eu")).await.unwrap();

        assert!(matches!(
            mock.poll(&job_id, None).await,
            Err(GenerationError::InvalidRequest { status: 404, .. })
        ));
        assert!(mock.poll(&job_id, Some("us")).await.is_err());
        assert!(mock.poll(&job_id, Some("eu")).await.is_ok());
        assert_eq!(
            mock.polls().iter().map(|poll| poll.region.as_deref()).collect::<Vec<_>>(),
            vec![None, Some("us"), Some("eu")]
        );
    }

    #[tokio::test]
    async fn test_mock_submit_failure_is_consumed() {
        let mock = MockBatchClient::new();
        mock.fail_next_submit(GenerationError::Transport("down".to_string()));

        assert!(mock.submit(BatchJobId::new(), &[], None).await.is_err());
        assert!(mock.submit(BatchJobId::new(), &[], None).await.is_ok());
        assert_eq!(mock.submit_count(), 1);
    }
}
