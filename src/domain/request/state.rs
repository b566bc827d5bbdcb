//! Core request types.
//!
//! A request row is one immutable-identity version of a piece of request content. Rows move
//! through [`RequestStatus`] via compare-and-update; retrying a failed row appends a new
//! version to the same lineage instead of rewriting the failed one.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::batch::BatchJobId;
use crate::identity;

/// Lifecycle status stored in the row's `status` column.
///
/// `Failed` and `Succeeded` are sinks: a row in either status is never modified again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    /// Stored, not yet dispatched to either path.
    Pending,
    /// An attempt is in flight (fast call or batch slot).
    Running,
    /// Parked for the next batch launch.
    Waiting,
    /// Terminal failure.
    Failed,
    /// Terminal success; the response text is stored.
    Succeeded,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Running => "running",
            RequestStatus::Waiting => "waiting",
            RequestStatus::Failed => "failed",
            RequestStatus::Succeeded => "succeeded",
        }
    }

    /// Check if this status is a sink (Failed or Succeeded).
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Failed | RequestStatus::Succeeded)
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RequestStatus::Pending),
            "running" => Ok(RequestStatus::Running),
            "waiting" => Ok(RequestStatus::Waiting),
            "failed" => Ok(RequestStatus::Failed),
            "succeeded" => Ok(RequestStatus::Succeeded),
            other => Err(format!("unknown request status '{}'", other)),
        }
    }
}

/// Why a row version exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Cause {
    /// Submitted by a caller.
    #[default]
    Intentional,
    /// Created by the engine to retry a failed version.
    Backup,
}

impl Cause {
    pub fn as_str(&self) -> &'static str {
        match self {
            Cause::Intentional => "intentional",
            Cause::Backup => "backup",
        }
    }
}

impl std::fmt::Display for Cause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Cause {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "intentional" => Ok(Cause::Intentional),
            "backup" => Ok(Cause::Backup),
            other => Err(format!("unknown cause '{}'", other)),
        }
    }
}

/// Unique identifier for a stored request row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowId(pub Uuid);

impl RowId {
    pub fn new() -> Self {
        RowId(Uuid::new_v4())
    }
}

impl Default for RowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Display only first 8 characters for readability in logs
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl From<Uuid> for RowId {
    fn from(uuid: Uuid) -> Self {
        RowId(uuid)
    }
}

impl std::ops::Deref for RowId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Hex-encoded SHA-256 fingerprint of a request's semantic content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(pub String);

impl ContentHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let short = self.0.get(..12).unwrap_or(&self.0);
        f.write_str(short)
    }
}

/// Canonical, order-insensitive set of labels used to group rows for clearing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tags(BTreeSet<String>);

impl Tags {
    pub fn new<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Tags(tags.into_iter().map(Into::into).collect())
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.0.contains(tag)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Sorted tag list, as stored in the `tags` column.
    pub fn to_vec(&self) -> Vec<String> {
        self.0.iter().cloned().collect()
    }
}

impl<S: Into<String>> FromIterator<S> for Tags {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Tags::new(iter)
    }
}

impl std::fmt::Display for Tags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.to_vec().join(","))
    }
}

/// One turn of conversation preceding the query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

/// The semantic content of a request. Everything here participates in the content hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestContent {
    /// Target model identifier
    pub model: String,

    /// Conversation history sent before the query
    #[serde(default)]
    pub history: Vec<ChatMessage>,

    /// The final user message
    pub query: String,

    /// Sampling parameters (temperature, max_tokens, ...) as a JSON object
    #[serde(default = "empty_params")]
    pub generation_params: serde_json::Value,

    /// Distinguishes otherwise-identical requests the caller wants generated separately
    #[serde(default)]
    pub duplication_index: u32,
}

fn empty_params() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

impl RequestContent {
    pub fn new(model: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            history: Vec::new(),
            query: query.into(),
            generation_params: empty_params(),
            duplication_index: 0,
        }
    }

    pub fn with_history(mut self, history: Vec<ChatMessage>) -> Self {
        self.history = history;
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.generation_params = params;
        self
    }

    pub fn with_duplication_index(mut self, index: u32) -> Self {
        self.duplication_index = index;
        self
    }

    /// Deterministic fingerprint of this content.
    pub fn fingerprint(&self) -> ContentHash {
        identity::content_hash(self)
    }
}

/// One entry of a row's attempt log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub at: DateTime<Utc>,
    /// Batch the attempt ran in; `None` for fast-path calls
    pub batch: Option<BatchJobId>,
    pub region: Option<String>,
    /// Error text for failed attempts
    pub error: Option<String>,
    /// Whether the failure may be retried; `true` for successes
    pub retryable: bool,
}

impl AttemptRecord {
    pub fn succeeded(batch: Option<BatchJobId>, region: Option<String>) -> Self {
        Self {
            at: Utc::now(),
            batch,
            region,
            error: None,
            retryable: true,
        }
    }

    pub fn failed(
        batch: Option<BatchJobId>,
        region: Option<String>,
        error: impl Into<String>,
        retryable: bool,
    ) -> Self {
        Self {
            at: Utc::now(),
            batch,
            region,
            error: Some(error.into()),
            retryable,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}

/// A stored request row version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRow {
    pub id: RowId,
    pub content_hash: ContentHash,
    pub content: RequestContent,
    pub tags: Tags,
    pub cause: Cause,
    pub status: RequestStatus,

    /// Failed attempts so far, carried across versions of a lineage
    pub failure_count: u32,

    /// Maximum failed attempts before the lineage is exhausted
    pub attempts_cap: u32,

    pub attempts_metadata: Vec<AttemptRecord>,

    /// Generated text, present only when `status` is `Succeeded`
    pub response: Option<String>,

    /// Batch job currently holding this row
    pub current_batch: Option<BatchJobId>,

    /// When the caller first asked for this content
    pub request_timestamp: DateTime<Utc>,

    /// Insertion time followed by every subsequent read-for-return or update
    pub access_timestamps: Vec<DateTime<Utc>>,

    pub insertion_timestamp: DateTime<Utc>,

    /// Substitute a synthetic response instead of raising when the row fails
    pub allow_failure: bool,

    pub notes: Option<String>,
}

impl RequestRow {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn attempts_remaining(&self) -> u32 {
        self.attempts_cap.saturating_sub(self.failure_count)
    }

    pub fn last_attempt(&self) -> Option<&AttemptRecord> {
        self.attempts_metadata.last()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.attempts_metadata
            .iter()
            .rev()
            .find_map(|attempt| attempt.error.as_deref())
    }

    pub fn last_accessed(&self) -> DateTime<Utc> {
        self.access_timestamps
            .last()
            .copied()
            .unwrap_or(self.insertion_timestamp)
    }

    /// A failed row whose last failure was retryable and whose lineage is under its cap.
    pub fn is_requeueable(&self) -> bool {
        self.status == RequestStatus::Failed
            && self.failure_count < self.attempts_cap
            && self.last_attempt().is_some_and(|attempt| attempt.retryable)
    }

    /// Whether the next failure would reach the attempts cap.
    pub fn is_near_cap(&self) -> bool {
        self.failure_count + 1 >= self.attempts_cap
    }
}

/// A row about to be inserted; the store assigns the id and insertion timestamp.
#[derive(Debug, Clone)]
pub struct NewRow {
    pub content_hash: ContentHash,
    pub content: RequestContent,
    pub tags: Tags,
    pub cause: Cause,
    pub status: RequestStatus,
    pub failure_count: u32,
    pub attempts_cap: u32,
    pub attempts_metadata: Vec<AttemptRecord>,
    pub request_timestamp: DateTime<Utc>,
    pub allow_failure: bool,
    pub notes: Option<String>,
}

impl NewRow {
    /// First version of a lineage.
    pub fn new(content: RequestContent, tags: Tags, attempts_cap: u32) -> Self {
        Self {
            content_hash: content.fingerprint(),
            content,
            tags,
            cause: Cause::Intentional,
            status: RequestStatus::Pending,
            failure_count: 0,
            attempts_cap,
            attempts_metadata: Vec::new(),
            request_timestamp: Utc::now(),
            allow_failure: false,
            notes: None,
        }
    }

    /// Next version of a failed lineage, carrying its failure count and attempt log.
    pub fn next_version(previous: &RequestRow, status: RequestStatus, cause: Cause) -> Self {
        Self {
            content_hash: previous.content_hash.clone(),
            content: previous.content.clone(),
            tags: previous.tags.clone(),
            cause,
            status,
            failure_count: previous.failure_count,
            attempts_cap: previous.attempts_cap,
            attempts_metadata: previous.attempts_metadata.clone(),
            request_timestamp: previous.request_timestamp,
            allow_failure: previous.allow_failure,
            notes: Some(format!("requeued from {}", previous.id.0)),
        }
    }

    pub fn with_status(mut self, status: RequestStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_cause(mut self, cause: Cause) -> Self {
        self.cause = cause;
        self
    }

    pub fn with_allow_failure(mut self, allow_failure: bool) -> Self {
        self.allow_failure = allow_failure;
        self
    }

    pub fn with_notes(mut self, notes: Option<String>) -> Self {
        self.notes = notes;
        self
    }

    /// Materialize the stored row.
    pub fn into_row(self, id: RowId, inserted_at: DateTime<Utc>) -> RequestRow {
        RequestRow {
            id,
            content_hash: self.content_hash,
            content: self.content,
            tags: self.tags,
            cause: self.cause,
            status: self.status,
            failure_count: self.failure_count,
            attempts_cap: self.attempts_cap,
            attempts_metadata: self.attempts_metadata,
            response: None,
            current_batch: None,
            request_timestamp: self.request_timestamp,
            access_timestamps: vec![inserted_at],
            insertion_timestamp: inserted_at,
            allow_failure: self.allow_failure,
            notes: self.notes,
        }
    }
}
