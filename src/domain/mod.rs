//! Core domain types for the request engine.
//!
//! This module contains pure domain types with no persistence dependencies:
//! - Request rows, lineages, and the status state machine
//! - Batch job records

pub mod batch;
pub mod request;
