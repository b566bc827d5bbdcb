//! Batch job types.
//!
//! A batch job is one submission of a group of WAITING rows to the external batch service.
//! The job record is persisted next to the rows so any engine instance can pick up its
//! monitoring after a restart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a batch job, assigned before submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchJobId(pub Uuid);

impl BatchJobId {
    pub fn new() -> Self {
        BatchJobId(Uuid::new_v4())
    }
}

impl Default for BatchJobId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for BatchJobId {
    fn from(uuid: Uuid) -> Self {
        BatchJobId(uuid)
    }
}

impl std::ops::Deref for BatchJobId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for BatchJobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// How a batch job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchJobOutcome {
    /// The service returned results; rows were reconciled individually.
    Completed,
    /// The service reported the whole job as failed.
    Failed,
    /// The job outlived its deadline.
    TimedOut,
}

impl BatchJobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchJobOutcome::Completed => "completed",
            BatchJobOutcome::Failed => "failed",
            BatchJobOutcome::TimedOut => "timed_out",
        }
    }
}

impl std::fmt::Display for BatchJobOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BatchJobOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(BatchJobOutcome::Completed),
            "failed" => Ok(BatchJobOutcome::Failed),
            "timed_out" => Ok(BatchJobOutcome::TimedOut),
            other => Err(format!("unknown batch outcome '{}'", other)),
        }
    }
}

/// A submitted batch job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJobRecord {
    pub batch_id: BatchJobId,
    /// Identifier assigned by the batch service
    pub job_id: String,
    /// Tag whose clearing loop launched the job
    pub tag: String,
    pub row_count: usize,
    pub region: Option<String>,
    pub submitted_at: DateTime<Utc>,
    /// submitted_at + batch timeout
    pub deadline: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub outcome: Option<BatchJobOutcome>,
}

impl BatchJobRecord {
    pub fn is_open(&self) -> bool {
        self.closed_at.is_none()
    }

    /// Time left before the deadline; zero once it has passed.
    pub fn remaining(&self, now: DateTime<Utc>) -> std::time::Duration {
        (self.deadline - now).to_std().unwrap_or_default()
    }
}
