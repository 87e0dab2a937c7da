//! Shared domain types for Kiln.
//!
//! This crate contains the core domain types used across the Kiln batch
//! runtime: the job definition graph, execution tracking records, and the
//! error taxonomy used by the exception classifier.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod error;
pub mod execution;
pub mod job;
