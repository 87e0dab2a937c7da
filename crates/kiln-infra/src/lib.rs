//! Infrastructure layer for Kiln.
//!
//! Contains the SQLite implementation of the repository trait defined in
//! `kiln-core`: a split read/write connection pool in WAL mode and the
//! `SqliteJobRepository` that persists job instances, executions, step and
//! partition records, and chunk checkpoints across process restarts.

pub mod sqlite;
