//! Request state transitions.
//!
//! # State Machine
//!
//! ```text
//! PENDING ──┬──> RUNNING ──┬──> SUCCEEDED
//!           │      ▲  │    ├──> FAILED
//!           │      │  │    └──> WAITING (batch timeout, submit rollback, stale recovery)
//!           └──> WAITING ──┘
//! ```
//!
//! Same-status updates are allowed for every non-terminal status so that attempt logs and
//! notes can be appended while the row keeps its status. `FAILED` and `SUCCEEDED` are sinks.
//! Retrying a `FAILED` row never edits it: a new version is inserted into the same lineage
//! (see [`NewRow::next_version`](super::state::NewRow::next_version)).
//!
//! Every write goes through [`RowUpdate::apply`], which validates the edge and the row
//! invariants before the store persists anything.
//!
//! # Backoff
//!
//! Fast-path retries wait `cooldown_ms * attempt_number`, capped at `max_backoff_ms`:
//!
//! ```rust
//! # use barrage::domain::request::transitions::RetryConfig;
//! let config = RetryConfig {
//!     attempts_cap: 3,
//!     cooldown_ms: 1000,      // 1s after the first failure
//!     max_backoff_ms: 60000,  // never more than a minute
//! };
//! assert_eq!(config.backoff(2).as_millis(), 2000);
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::domain::batch::BatchJobId;
use crate::error::{BarrageError, Result};

use super::state::{AttemptRecord, NewRow, RequestRow, RequestStatus};

impl RequestStatus {
    /// Whether `self -> next` is an edge of the state machine.
    pub fn can_transition_to(self, next: RequestStatus) -> bool {
        use RequestStatus::*;
        matches!(
            (self, next),
            (Pending, Pending)
                | (Pending, Running)
                | (Pending, Waiting)
                | (Waiting, Waiting)
                | (Waiting, Running)
                | (Running, Running)
                | (Running, Waiting)
                | (Running, Succeeded)
                | (Running, Failed)
        )
    }
}

/// Field changes for one compare-and-update.
///
/// Fields left as `None` keep their stored value. `current_batch` is doubly optional so
/// that an update can explicitly clear the batch reference.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowUpdate {
    pub status: Option<RequestStatus>,
    pub failure_count: Option<u32>,
    pub attempt: Option<AttemptRecord>,
    pub response: Option<String>,
    pub current_batch: Option<Option<BatchJobId>>,
    pub notes: Option<String>,
}

impl RowUpdate {
    /// Move to `status`.
    pub fn to(status: RequestStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Store the generated text and finish the row.
    pub fn succeeded(response: String, attempt: AttemptRecord) -> Self {
        Self::to(RequestStatus::Succeeded)
            .with_response(response)
            .with_attempt(attempt)
    }

    /// Record a failed attempt against `row`.
    ///
    /// The failure count is incremented and clamped to the cap. The row finishes as `Failed`
    /// when the failure is not retryable or the cap is reached; otherwise it moves to
    /// `otherwise`. The batch reference is always cleared.
    pub fn failure(row: &RequestRow, attempt: AttemptRecord, otherwise: RequestStatus) -> Self {
        let failure_count = (row.failure_count + 1).min(row.attempts_cap);
        let status = if !attempt.retryable || failure_count >= row.attempts_cap {
            RequestStatus::Failed
        } else {
            otherwise
        };
        Self::to(status)
            .with_failure_count(failure_count)
            .with_attempt(attempt)
            .with_batch(None)
    }

    pub fn with_failure_count(mut self, failure_count: u32) -> Self {
        self.failure_count = Some(failure_count);
        self
    }

    pub fn with_attempt(mut self, attempt: AttemptRecord) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_response(mut self, response: String) -> Self {
        self.response = Some(response);
        self
    }

    pub fn with_batch(mut self, batch: Option<BatchJobId>) -> Self {
        self.current_batch = Some(batch);
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    /// Target status when applied to a row currently in `current`.
    pub fn target(&self, current: RequestStatus) -> RequestStatus {
        self.status.unwrap_or(current)
    }

    /// Validate this update against `row` and return the row as it should be stored.
    ///
    /// Rejects edits to sinks, edges outside the state machine, a response on anything but a
    /// success, a success without a response, a decreasing or over-cap failure count, and a
    /// capped row that would stay non-terminal.
    pub fn apply(self, row: &RequestRow, now: DateTime<Utc>) -> Result<RequestRow> {
        let from = row.status;
        let to = self.target(from);

        if from.is_terminal() || !from.can_transition_to(to) {
            return Err(BarrageError::InvalidTransition {
                id: row.id,
                from,
                to,
            });
        }

        let mut next = row.clone();
        next.status = to;

        if let Some(failure_count) = self.failure_count {
            if failure_count < row.failure_count {
                return Err(BarrageError::ValidationError(format!(
                    "failure count of request {} cannot decrease ({} -> {})",
                    row.id, row.failure_count, failure_count
                )));
            }
            if failure_count > row.attempts_cap {
                return Err(BarrageError::ValidationError(format!(
                    "failure count {} of request {} exceeds its cap {}",
                    failure_count, row.id, row.attempts_cap
                )));
            }
            next.failure_count = failure_count;
        }

        match (to, self.response) {
            (RequestStatus::Succeeded, Some(response)) => next.response = Some(response),
            (RequestStatus::Succeeded, None) => {
                return Err(BarrageError::ValidationError(format!(
                    "request {} cannot succeed without a response",
                    row.id
                )));
            }
            (_, Some(_)) => {
                return Err(BarrageError::ValidationError(format!(
                    "request {} can only store a response when it succeeds",
                    row.id
                )));
            }
            (_, None) => {}
        }

        if next.failure_count >= next.attempts_cap && !to.is_terminal() {
            return Err(BarrageError::ValidationError(format!(
                "request {} reached its attempts cap and must fail",
                row.id
            )));
        }

        if let Some(attempt) = self.attempt {
            next.attempts_metadata.push(attempt);
        }
        if let Some(batch) = self.current_batch {
            next.current_batch = batch;
        }
        if matches!(
            to,
            RequestStatus::Pending | RequestStatus::Failed | RequestStatus::Succeeded
        ) {
            next.current_batch = None;
        }
        if let Some(notes) = self.notes {
            next.notes = Some(notes);
        }
        next.access_timestamps.push(now);

        Ok(next)
    }
}

impl NewRow {
    /// Check that this row may be inserted.
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.status, RequestStatus::Pending | RequestStatus::Waiting) {
            return Err(BarrageError::ValidationError(format!(
                "new rows must be pending or waiting, not {}",
                self.status
            )));
        }
        if self.attempts_cap == 0 {
            return Err(BarrageError::ValidationError(
                "attempts cap must be at least 1".to_string(),
            ));
        }
        if self.failure_count >= self.attempts_cap {
            return Err(BarrageError::ValidationError(format!(
                "lineage {} already exhausted its attempts ({}/{})",
                self.content_hash, self.failure_count, self.attempts_cap
            )));
        }
        if self.content.model.trim().is_empty() {
            return Err(BarrageError::ValidationError(
                "model must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Retry limits and fast-path backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    pub attempts_cap: u32,
    pub cooldown_ms: u64,
    pub max_backoff_ms: u64,
}

impl RetryConfig {
    /// Delay before the attempt following failure number `attempt_number`.
    pub fn backoff(&self, attempt_number: u32) -> Duration {
        let linear = self.cooldown_ms.saturating_mul(u64::from(attempt_number));
        Duration::from_millis(linear.min(self.max_backoff_ms))
    }
}

impl From<&crate::config::EngineConfig> for RetryConfig {
    fn from(config: &crate::config::EngineConfig) -> Self {
        RetryConfig {
            attempts_cap: config.attempts_cap,
            cooldown_ms: config.cooldown_ms,
            max_backoff_ms: config.max_backoff_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::request::state::{RequestContent, RowId, Tags};

    fn row(status: RequestStatus) -> RequestRow {
        let mut row = NewRow::new(
            RequestContent::new("gpt-test", "hello"),
            Tags::new(["eval"]),
            3,
        )
        .into_row(RowId::new(), Utc::now());
        row.status = status;
        row
    }

    #[test]
    fn test_transition_table() {
        use RequestStatus::*;
        let all = [Pending, Running, Waiting, Failed, Succeeded];

        let allowed: Vec<_> = all
            .iter()
            .flat_map(|from| all.iter().map(move |to| (*from, *to)))
            .filter(|(from, to)| from.can_transition_to(*to))
            .collect();

        assert_eq!(
            allowed,
            vec![
                (Pending, Pending),
                (Pending, Running),
                (Pending, Waiting),
                (Running, Running),
                (Running, Waiting),
                (Running, Failed),
                (Running, Succeeded),
                (Waiting, Running),
                (Waiting, Waiting),
            ]
        );
    }

    #[test]
    fn test_sinks_reject_every_update() {
        for status in [RequestStatus::Failed, RequestStatus::Succeeded] {
            let row = row(status);
            let result = RowUpdate::default().with_notes("late").apply(&row, Utc::now());
            assert!(matches!(
                result,
                Err(BarrageError::InvalidTransition { from, .. }) if from == status
            ));
        }
    }

    #[test]
    fn test_success_stores_response_and_clears_batch() {
        let mut running = row(RequestStatus::Running);
        running.current_batch = Some(BatchJobId::new());

        let next = RowUpdate::succeeded(
            "hi there".to_string(),
            AttemptRecord::succeeded(running.current_batch, None),
        )
        .apply(&running, Utc::now())
        .unwrap();

        assert_eq!(next.status, RequestStatus::Succeeded);
        assert_eq!(next.response.as_deref(), Some("hi there"));
        assert_eq!(next.current_batch, None);
        assert_eq!(next.attempts_metadata.len(), 1);
        assert_eq!(next.access_timestamps.len(), 2);
    }

    #[test]
    fn test_response_only_on_success() {
        let running = row(RequestStatus::Running);
        let result = RowUpdate::to(RequestStatus::Waiting)
            .with_response("oops".to_string())
            .apply(&running, Utc::now());
        assert!(matches!(result, Err(BarrageError::ValidationError(_))));

        let result = RowUpdate::to(RequestStatus::Succeeded).apply(&running, Utc::now());
        assert!(matches!(result, Err(BarrageError::ValidationError(_))));
    }

    #[test]
    fn test_failure_update_fails_at_cap() {
        let mut running = row(RequestStatus::Running);
        running.failure_count = 2;

        let attempt = AttemptRecord::failed(None, None, "503", true);
        let update = RowUpdate::failure(&running, attempt, RequestStatus::Running);
        assert_eq!(update.status, Some(RequestStatus::Failed));
        assert_eq!(update.failure_count, Some(3));

        let next = update.apply(&running, Utc::now()).unwrap();
        assert_eq!(next.failure_count, next.attempts_cap);
    }

    #[test]
    fn test_failure_update_non_retryable_fails_immediately() {
        let running = row(RequestStatus::Running);
        let attempt = AttemptRecord::failed(None, None, "400 bad request", false);
        let update = RowUpdate::failure(&running, attempt, RequestStatus::Running);

        assert_eq!(update.status, Some(RequestStatus::Failed));
        assert_eq!(update.failure_count, Some(1));
    }

    #[test]
    fn test_capped_row_cannot_stay_running() {
        let mut running = row(RequestStatus::Running);
        running.failure_count = 2;

        let result = RowUpdate::to(RequestStatus::Running)
            .with_failure_count(3)
            .apply(&running, Utc::now());
        assert!(matches!(result, Err(BarrageError::ValidationError(_))));
    }

    #[test]
    fn test_failure_count_never_decreases() {
        let mut running = row(RequestStatus::Running);
        running.failure_count = 2;

        let result = RowUpdate::to(RequestStatus::Running)
            .with_failure_count(1)
            .apply(&running, Utc::now());
        assert!(matches!(result, Err(BarrageError::ValidationError(_))));
    }

    #[test]
    fn test_new_row_validation() {
        let content = RequestContent::new("gpt-test", "hello");
        assert!(NewRow::new(content.clone(), Tags::default(), 3).validate().is_ok());

        let running = NewRow::new(content.clone(), Tags::default(), 3)
            .with_status(RequestStatus::Running);
        assert!(running.validate().is_err());

        assert!(NewRow::new(content, Tags::default(), 0).validate().is_err());
        assert!(
            NewRow::new(RequestContent::new(" ", "hello"), Tags::default(), 3)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_backoff_is_linear_and_capped() {
        let config = RetryConfig {
            attempts_cap: 10,
            cooldown_ms: 1000,
            max_backoff_ms: 2500,
        };

        assert_eq!(config.backoff(1), Duration::from_millis(1000));
        assert_eq!(config.backoff(2), Duration::from_millis(2000));
        assert_eq!(config.backoff(3), Duration::from_millis(2500));
        assert_eq!(config.backoff(u32::MAX), Duration::from_millis(2500));
    }
}
