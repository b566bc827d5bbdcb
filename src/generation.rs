//! Generation service client abstraction.
//!
//! This module defines the `GenerationClient` trait to abstract one call to a
//! text-generation service, enabling testability with mock implementations.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;

use crate::domain::request::RequestContent;
use crate::error::Result;

/// Why a single generation attempt failed.
///
/// The classification decides whether the attempt may be retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    /// Connection reset, DNS failure, or other transport-level problem.
    #[error("transport error: {0}")]
    Transport(String),

    /// The call did not finish within its timeout.
    #[error("timed out after {0}ms")]
    Timeout(u64),

    /// The service asked us to slow down (429).
    #[error("rate limited (status {status}): {body}")]
    RateLimited { status: u16, body: String },

    /// The service failed or was unavailable (5xx, 408).
    #[error("service error (status {status}): {body}")]
    ServiceUnavailable { status: u16, body: String },

    /// The request itself is wrong and will never succeed (other 4xx, builder errors).
    #[error("invalid request (status {status}): {body}")]
    InvalidRequest { status: u16, body: String },

    /// The service refused to generate for this content.
    #[error("rejected by content policy: {0}")]
    PolicyRejection(String),

    /// The service answered but the body could not be understood.
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl GenerationError {
    /// Returns true if this failure should be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            GenerationError::Transport(_) => true,
            GenerationError::Timeout(_) => true,
            GenerationError::RateLimited { .. } => true,
            GenerationError::ServiceUnavailable { .. } => true,
            GenerationError::InvalidRequest { .. } => false,
            GenerationError::PolicyRejection(_) => false,
            GenerationError::MalformedResponse(_) => true,
        }
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            429 => GenerationError::RateLimited { status, body },
            408 | 500..=599 => GenerationError::ServiceUnavailable { status, body },
            403 | 451 if body.contains("policy") => GenerationError::PolicyRejection(body),
            _ => GenerationError::InvalidRequest { status, body },
        }
    }
}

/// Trait for making one generation call.
///
/// This abstraction allows for different implementations (production vs. testing)
/// and makes the retry and clearing logic testable without making real HTTP calls.
///
/// # Example
/// ```ignore
/// let client = ReqwestGenerationClient::new("https://api.example.com");
/// let text = client.generate(&content, Some("eu-west"), Duration::from_secs(30)).await?;
/// ```
#[async_trait]
pub trait GenerationClient: Send + Sync {
    /// Generate a completion for `content`.
    ///
    /// # Arguments
    /// * `content` - Model, history, query, and generation parameters
    /// * `region` - Region to route the call to, if regions are configured
    /// * `timeout` - Upper bound for the call
    async fn generate(
        &self,
        content: &RequestContent,
        region: Option<&str>,
        timeout: Duration,
    ) -> std::result::Result<String, GenerationError>;
}

// ============================================================================
// Chat-completions wire format
// ============================================================================

/// Build an OpenAI-compatible chat-completions body for `content`.
///
/// Generation parameters are merged into the top level; they cannot override the model or
/// the messages.
pub(crate) fn chat_completion_body(content: &RequestContent) -> Value {
    let mut messages: Vec<Value> = content
        .history
        .iter()
        .map(|message| json!({ "role": message.role, "content": message.content }))
        .collect();
    messages.push(json!({ "role": "user", "content": content.query }));

    let mut body = serde_json::Map::new();
    if let Value::Object(params) = &content.generation_params {
        for (key, value) in params {
            body.insert(key.clone(), value.clone());
        }
    }
    body.insert("model".to_string(), Value::String(content.model.clone()));
    body.insert("messages".to_string(), Value::Array(messages));
    Value::Object(body)
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Pull the generated text out of a chat-completions response body.
pub(crate) fn completion_text(body: Value) -> std::result::Result<String, GenerationError> {
    let completion: ChatCompletion = serde_json::from_value(body)
        .map_err(|e| GenerationError::MalformedResponse(e.to_string()))?;

    let Some(choice) = completion.choices.into_iter().next() else {
        return Err(GenerationError::MalformedResponse(
            "response contained no choices".to_string(),
        ));
    };

    if choice.finish_reason.as_deref() == Some("content_filter") {
        return Err(GenerationError::PolicyRejection(
            "completion stopped by content filter".to_string(),
        ));
    }

    choice.message.content.ok_or_else(|| {
        GenerationError::MalformedResponse("first choice has no message content".to_string())
    })
}

// ============================================================================
// Production Implementation using reqwest
// ============================================================================

/// Production generation client calling an OpenAI-compatible chat-completions endpoint.
#[derive(Clone)]
pub struct ReqwestGenerationClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    region_urls: HashMap<String, String>,
}

impl ReqwestGenerationClient {
    /// Create a client for `base_url` (e.g. `https://api.openai.com`).
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: None,
            region_urls: HashMap::new(),
        }
    }

    /// Create a client with a connect timeout on the underlying connection pool.
    pub fn with_connect_timeout(
        base_url: impl Into<String>,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            client,
            ..Self::new(base_url)
        })
    }

    /// Send `Authorization: Bearer <api_key>` with every call.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Route calls for `region` to `base_url` instead of the default.
    pub fn with_region(mut self, region: impl Into<String>, base_url: impl Into<String>) -> Self {
        self.region_urls.insert(region.into(), base_url.into());
        self
    }

    fn base_url_for(&self, region: Option<&str>) -> &str {
        region
            .and_then(|region| self.region_urls.get(region))
            .map(String::as_str)
            .unwrap_or(&self.base_url)
    }
}

/// Map a reqwest send error onto the attempt taxonomy.
pub(crate) fn classify_send_error(error: &reqwest::Error, timeout: Duration) -> GenerationError {
    if error.is_builder() {
        GenerationError::InvalidRequest {
            status: 0,
            body: error.to_string(),
        }
    } else if error.is_timeout() {
        GenerationError::Timeout(timeout.as_millis() as u64)
    } else {
        GenerationError::Transport(error.to_string())
    }
}

#[async_trait]
impl GenerationClient for ReqwestGenerationClient {
    #[tracing::instrument(skip(self, content), fields(model = %content.model, region = ?region))]
    async fn generate(
        &self,
        content: &RequestContent,
        region: Option<&str>,
        timeout: Duration,
    ) -> std::result::Result<String, GenerationError> {
        let url = format!(
            "{}/v1/chat/completions",
            self.base_url_for(region).trim_end_matches('/')
        );

        tracing::debug!(
            url = %url,
            timeout_ms = timeout.as_millis() as u64,
            "Executing generation request"
        );

        let mut req = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(&chat_completion_body(content));

        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key);
        }

        let response = req.send().await.map_err(|e| {
            tracing::warn!(url = %url, error = %e, "Generation request failed");
            classify_send_error(&e, timeout)
        })?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| classify_send_error(&e, timeout))?;

        if !(200..300).contains(&status) {
            tracing::debug!(
                status,
                response_len = body.len(),
                "Generation request returned error status"
            );
            return Err(GenerationError::from_status(status, body));
        }

        let parsed: Value = serde_json::from_str(&body)
            .map_err(|e| GenerationError::MalformedResponse(e.to_string()))?;
        let text = completion_text(parsed)?;

        tracing::debug!(status, response_len = text.len(), "Generation request completed");

        Ok(text)
    }
}

// ============================================================================
// Test/Mock Implementation
// ============================================================================

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::oneshot;

type MockResult = std::result::Result<String, GenerationError>;

/// Mock generation client for testing.
///
/// Responses are queued per query text and returned in FIFO order. A response queued under
/// `"*"` is used for any query with no queue of its own.
///
/// # Example
/// ```ignore
/// let mock = MockGenerationClient::new();
/// mock.add_response("What is 2+2?", Ok("4".to_string()));
/// mock.add_response("What is 2+2?", Err(GenerationError::Transport("reset".into())));
/// ```
#[derive(Clone, Default)]
pub struct MockGenerationClient {
    responses: Arc<Mutex<HashMap<String, Vec<MockResponse>>>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
    in_flight: Arc<AtomicUsize>,
}

/// A mock response that can optionally wait for a trigger before completing.
enum MockResponse {
    Immediate(MockResult),
    Triggered {
        response: MockResult,
        trigger: oneshot::Receiver<()>,
    },
}

/// Record of a call made to the mock client.
#[derive(Debug, Clone, PartialEq)]
pub struct MockCall {
    pub model: String,
    pub query: String,
    pub region: Option<String>,
    pub timeout_ms: u64,
}

/// Queue key matching any query.
pub const ANY_QUERY: &str = "*";

impl MockGenerationClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for calls whose query is `query`.
    pub fn add_response(&self, query: &str, response: MockResult) {
        self.responses
            .lock()
            .entry(query.to_string())
            .or_default()
            .push(MockResponse::Immediate(response));
    }

    /// Queue a response that completes only once the returned sender fires or is dropped.
    pub fn add_response_with_trigger(
        &self,
        query: &str,
        response: MockResult,
    ) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.responses
            .lock()
            .entry(query.to_string())
            .or_default()
            .push(MockResponse::Triggered {
                response,
                trigger: rx,
            });
        tx
    }

    pub fn get_calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Calls currently waiting on a trigger or otherwise executing.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn next_response(&self, query: &str) -> Option<MockResponse> {
        let mut responses = self.responses.lock();
        for key in [query, ANY_QUERY] {
            if let Some(queue) = responses.get_mut(key)
                && !queue.is_empty()
            {
                return Some(queue.remove(0));
            }
        }
        None
    }
}

#[async_trait]
impl GenerationClient for MockGenerationClient {
    async fn generate(
        &self,
        content: &RequestContent,
        region: Option<&str>,
        timeout: Duration,
    ) -> std::result::Result<String, GenerationError> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.in_flight.clone();
        let _guard = scopeguard::guard((), move |_| {
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });

        self.calls.lock().push(MockCall {
            model: content.model.clone(),
            query: content.query.clone(),
            region: region.map(str::to_string),
            timeout_ms: timeout.as_millis() as u64,
        });

        match self.next_response(&content.query) {
            Some(MockResponse::Immediate(response)) => response,
            Some(MockResponse::Triggered { response, trigger }) => {
                // Proceed whether the trigger fired or was dropped
                let _ = trigger.await;
                response
            }
            None => Err(GenerationError::InvalidRequest {
                status: 404,
                body: format!("no mock response configured for query '{}'", content.query),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::request::ChatMessage;

    fn content(query: &str) -> RequestContent {
        RequestContent::new("test-model", query)
    }

    #[test]
    fn test_status_classification() {
        assert!(GenerationError::from_status(429, String::new()).is_retryable());
        assert!(GenerationError::from_status(408, String::new()).is_retryable());
        assert!(GenerationError::from_status(503, String::new()).is_retryable());
        assert!(!GenerationError::from_status(400, String::new()).is_retryable());
        assert!(!GenerationError::from_status(404, String::new()).is_retryable());
        assert_eq!(
            GenerationError::from_status(403, "blocked by usage policy".to_string()),
            GenerationError::PolicyRejection("blocked by usage policy".to_string())
        );
    }

    #[test]
    fn test_chat_body_keeps_model_and_messages() {
        let content = RequestContent::new("gpt-test", "and now?")
            .with_history(vec![ChatMessage::system("be brief"), ChatMessage::assistant("ok")])
            .with_params(json!({"temperature": 0.1, "model": "ignored", "messages": []}));

        let body = chat_completion_body(&content);

        assert_eq!(body["model"], "gpt-test");
        assert_eq!(body["temperature"], 0.1);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[2], json!({"role": "user", "content": "and now?"}));
    }

    #[test]
    fn test_completion_text_extraction() {
        let ok = json!({"choices": [{"message": {"role": "assistant", "content": "Paris"}, "finish_reason": "stop"}]});
        assert_eq!(completion_text(ok).unwrap(), "Paris");

        let empty = json!({"choices": []});
        assert!(matches!(
            completion_text(empty),
            Err(GenerationError::MalformedResponse(_))
        ));

        let filtered = json!({"choices": [{"message": {"content": null}, "finish_reason": "content_filter"}]});
        assert!(matches!(
            completion_text(filtered),
            Err(GenerationError::PolicyRejection(_))
        ));
    }

    #[tokio::test]
    async fn test_mock_client_fifo_and_fallback() {
        let mock = MockGenerationClient::new();
        mock.add_response("q", Ok("first".to_string()));
        mock.add_response("q", Ok("second".to_string()));
        mock.add_response(ANY_QUERY, Ok("anything".to_string()));

        let timeout = Duration::from_secs(5);
        assert_eq!(mock.generate(&content("q"), None, timeout).await.unwrap(), "first");
        assert_eq!(mock.generate(&content("q"), Some("eu"), timeout).await.unwrap(), "second");
        assert_eq!(mock.generate(&content("q"), None, timeout).await.unwrap(), "anything");

        let unknown = mock.generate(&content("q"), None, timeout).await;
        assert!(matches!(unknown, Err(GenerationError::InvalidRequest { status: 404, .. })));

        let calls = mock.get_calls();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[1].region.as_deref(), Some("eu"));
        assert_eq!(calls[0].timeout_ms, 5000);
    }

    #[tokio::test]
    async fn test_mock_client_with_trigger() {
        let mock = MockGenerationClient::new();
        let trigger = mock.add_response_with_trigger("slow", Ok("done".to_string()));

        let mock_clone = mock.clone();
        let handle = tokio::spawn(async move {
            mock_clone
                .generate(&content("slow"), None, Duration::from_secs(5))
                .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.is_finished());
        assert_eq!(mock.in_flight_count(), 1);

        trigger.send(()).unwrap();

        assert_eq!(handle.await.unwrap().unwrap(), "done");
        assert_eq!(mock.in_flight_count(), 0);
    }
}
