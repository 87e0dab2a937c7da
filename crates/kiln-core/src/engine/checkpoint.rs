//! Durable checkpoint manager for chunk progress.
//!
//! Wraps `JobRepository` to provide a higher-level API for recording chunk
//! progress: reader/writer positions and the skip/retry counts that span
//! restarts. The chunk engine persists through this manager at every commit
//! and reads back once, at step (re)start. It is the sole writer of
//! checkpoint records.

use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use kiln_types::execution::ChunkCheckpoint;

use crate::repository::job::JobRepository;

/// Where a checkpoint belongs: one (instance, step, partition) slot.
#[derive(Debug, Clone)]
pub struct CheckpointScope {
    pub instance_id: Uuid,
    pub step_id: String,
    pub partition: Option<u32>,
}

/// Manages durable chunk checkpoints for step executions.
///
/// Generic over `R: JobRepository` so it works with any storage backend
/// (SQLite, in-memory). Every chunk commit persists through here before the
/// engine moves on, keeping restart positions crash-safe.
pub struct CheckpointManager<R: JobRepository> {
    repo: R,
}

impl<R: JobRepository> CheckpointManager<R> {
    /// Create a new checkpoint manager backed by the given repository.
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    /// Access the underlying repository.
    pub fn repo(&self) -> &R {
        &self.repo
    }

    /// Load the checkpoint for a step restart, if one was committed.
    pub async fn load(
        &self,
        scope: &CheckpointScope,
    ) -> Result<Option<ChunkCheckpoint>, CheckpointError> {
        self.repo
            .get_checkpoint(&scope.instance_id, &scope.step_id, scope.partition)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    /// Persist chunk progress at a commit boundary.
    pub async fn save(
        &self,
        scope: &CheckpointScope,
        reader: Option<serde_json::Value>,
        writer: Option<serde_json::Value>,
        skip_count: u32,
        retry_count: u32,
    ) -> Result<(), CheckpointError> {
        let checkpoint = ChunkCheckpoint {
            instance_id: scope.instance_id,
            step_id: scope.step_id.clone(),
            partition: scope.partition,
            reader,
            writer,
            skip_count,
            retry_count,
            updated_at: Utc::now(),
        };
        self.repo
            .save_checkpoint(&checkpoint)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        tracing::debug!(
            step_id = scope.step_id.as_str(),
            partition = ?scope.partition,
            "checkpointed chunk progress"
        );
        Ok(())
    }

    /// Drop the checkpoint once the step completes, so a later re-run via
    /// allow-start-if-complete starts from the top of the data.
    pub async fn clear(&self, scope: &CheckpointScope) -> Result<(), CheckpointError> {
        self.repo
            .clear_checkpoint(&scope.instance_id, &scope.step_id, scope.partition)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        tracing::debug!(
            step_id = scope.step_id.as_str(),
            partition = ?scope.partition,
            "cleared checkpoint after step completion"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during checkpoint operations.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// Underlying repository operation failed.
    #[error("checkpoint repository error: {0}")]
    Repository(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
