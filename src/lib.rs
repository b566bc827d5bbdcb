//! Lifecycle engine for large populations of text-generation requests.
//!
//! Requests are fingerprinted by their content so identical submissions resolve to the same
//! stored row. Each row then moves through an explicit status state machine on one of two
//! execution paths: a direct ("fast") call wrapped in a bounded retry loop, or a slot in an
//! external batch job that is submitted, polled and reconciled by the clearing loop.
//!
//! The request store is the only shared mutable resource. Every row update is a
//! compare-and-update on the row's observed status, so concurrent workers can never both
//! finalize a row and a successful result is never overwritten.

pub mod batch;
pub mod clearing;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod executor;
pub mod generation;
pub mod identity;
pub mod retry;
pub mod scheduling;
pub mod storage;

// Re-export commonly used types
pub use batch::{BatchClient, BatchCoordinator, BatchJobStatus, MockBatchClient, ReqwestBatchClient};
pub use clearing::{ClearingLoop, ClearingOptions, ClearingReport, StopReason};
pub use config::{EngineConfig, ExecutionMode};
pub use domain::batch::{BatchJobId, BatchJobOutcome, BatchJobRecord};
pub use domain::request::*;
pub use engine::{Completion, Engine, SubmitOptions};
pub use error::{BarrageError, Result};
pub use executor::{AttemptExecutor, AttemptOutcome};
pub use generation::{
    GenerationClient, GenerationError, MockGenerationClient, ReqwestGenerationClient,
};
pub use scheduling::{
    FixedInterval, PollSchedule, RegionSelector, RoundRobinRegions, SteppedInterval,
};
#[cfg(feature = "postgres")]
pub use storage::postgres::PostgresRequestStore;
pub use storage::{Capabilities, InMemoryRequestStore, RequestStore, ScanFilter};

/// Get the barrage database migrator
///
/// Returns a migrator that can be run against a connection pool.
#[cfg(feature = "postgres")]
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}
