//! Batch execution engine core: definition validation, the chunk loop, and
//! the execution graph walker.
//!
//! This module contains the "brain" of the runtime:
//! - `definition` -- YAML parsing, structural and graph validation
//! - `pattern` -- exit-status glob matching for transition rules
//! - `classifier` -- skippable/retryable/no-rollback exception resolution
//! - `context` -- job and step contexts handed to artifacts
//! - `transaction` -- the commit/rollback boundary abstraction
//! - `checkpoint` -- durable chunk-progress manager over the repository
//! - `chunk` -- the read-process-write loop with retry/skip handling
//! - `step` -- single-step execution: batchlets, chunks, partitions
//! - `graph` -- element sequencing, flows, splits, deciders, transitions
//! - `operator` -- the operator surface: start, restart, stop, queries

pub mod checkpoint;
pub(crate) mod chunk;
pub mod classifier;
pub mod context;
pub mod definition;
pub(crate) mod graph;
pub mod operator;
pub mod pattern;
pub(crate) mod step;
pub mod transaction;
