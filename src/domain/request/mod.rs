//! Request aggregate - row model and state transitions.
//!
//! This module contains the core domain logic for request rows:
//! - Row, content, and lineage types
//! - The status state machine and validated row updates
//! - Retry limits and backoff

pub mod state;
pub mod transitions;

// Re-export commonly used types
pub use state::*;
pub use transitions::{RetryConfig, RowUpdate};
