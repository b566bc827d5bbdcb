//! Single-attempt execution.
//!
//! One call to the generation service under a hard timeout, classified into an
//! [`AttemptOutcome`]. Nothing here touches the store.

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};

use crate::domain::request::RequestContent;
use crate::generation::{GenerationClient, GenerationError};

/// Classified result of one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success(String),
    RetryableFailure(String),
    FatalFailure(String),
}

impl AttemptOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AttemptOutcome::Success(_))
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, AttemptOutcome::FatalFailure(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            AttemptOutcome::Success(_) => "success",
            AttemptOutcome::RetryableFailure(_) => "retryable_failure",
            AttemptOutcome::FatalFailure(_) => "fatal_failure",
        }
    }
}

impl From<std::result::Result<String, GenerationError>> for AttemptOutcome {
    fn from(result: std::result::Result<String, GenerationError>) -> Self {
        match result {
            Ok(text) => AttemptOutcome::Success(text),
            Err(e) if e.is_retryable() => AttemptOutcome::RetryableFailure(e.to_string()),
            Err(e) => AttemptOutcome::FatalFailure(e.to_string()),
        }
    }
}

/// Runs single attempts against a generation client.
pub struct AttemptExecutor<G> {
    client: Arc<G>,
    timeout: Duration,
}

impl<G> Clone for AttemptExecutor<G> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            timeout: self.timeout,
        }
    }
}

impl<G: GenerationClient> AttemptExecutor<G> {
    pub fn new(client: Arc<G>, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Make one call for `content`, giving up after the configured timeout.
    pub async fn attempt(&self, content: &RequestContent, region: Option<&str>) -> AttemptOutcome {
        let started = Instant::now();
        let call = self.client.generate(content, region, self.timeout);

        let result = match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(GenerationError::Timeout(self.timeout.as_millis() as u64)),
        };
        let outcome = AttemptOutcome::from(result);

        counter!(
            "barrage_attempts_total",
            "model" => content.model.clone(),
            "outcome" => outcome.label()
        )
        .increment(1);
        histogram!("barrage_attempt_duration_seconds", "model" => content.model.clone())
            .record(started.elapsed().as_secs_f64());

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::MockGenerationClient;

    fn executor(
        mock: &MockGenerationClient,
        timeout_ms: u64,
    ) -> AttemptExecutor<MockGenerationClient> {
        AttemptExecutor::new(Arc::new(mock.clone()), Duration::from_millis(timeout_ms))
    }

    #[tokio::test]
    async fn test_classifies_outcomes() {
        let mock = MockGenerationClient::new();
        mock.add_response("q", Ok("text".to_string()));
        mock.add_response(
            "q",
            Err(GenerationError::RateLimited {
                status: 429,
                body: "slow down".to_string(),
            }),
        );
        mock.add_response("q", Err(GenerationError::PolicyRejection("nope".to_string())));

        let executor = executor(&mock, 1000);
        let content = RequestContent::new("m", "q");

        assert_eq!(
            executor.attempt(&content, None).await,
            AttemptOutcome::Success("text".to_string())
        );
        assert!(matches!(
            executor.attempt(&content, None).await,
            AttemptOutcome::RetryableFailure(reason) if reason.contains("429")
        ));
        assert!(matches!(
            executor.attempt(&content, None).await,
            AttemptOutcome::FatalFailure(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retryable() {
        let mock = MockGenerationClient::new();
        // Never fired: the call hangs until the executor gives up.
        let _trigger = mock.add_response_with_trigger("q", Ok("late".to_string()));

        let outcome = executor(&mock, 500)
            .attempt(&RequestContent::new("m", "q"), Some("us"))
            .await;

        assert_eq!(outcome, AttemptOutcome::RetryableFailure("timed out after 500ms".to_string()));
        assert_eq!(mock.in_flight_count(), 0);
    }
}
