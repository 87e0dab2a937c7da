//! Chunk engine: the read-process-write loop.
//!
//! Drives one chunk step to completion. Each chunk runs inside a transaction
//! boundary: items are read and processed one at a time until the checkpoint
//! policy triggers (item count, time limit, or a custom algorithm), the
//! buffered batch is written, and reader/writer checkpoints are persisted
//! with the commit. Failures are resolved through the exception classifier:
//!
//! - retryable, under the retry limit: the chunk rolls back, the reader and
//!   writer reposition at the last committed checkpoint, and the failed
//!   chunk replays in one-item chunks before normal chunking resumes.
//!   No-rollback classes re-attempt in place instead.
//! - skippable, under the skip limit: the item (or buffered write) is
//!   discarded and the loop continues.
//! - anything else: chunk listeners see the error, the chunk rolls back,
//!   and the step fails.
//!
//! Stop requests are honored between chunks, never mid-chunk. Skip and retry
//! counts persist with the checkpoint so the limits span restarts.

use std::time::Instant;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use kiln_types::error::BatchError;
use kiln_types::execution::{PartitionExecution, StepExecution};
use kiln_types::job::ChunkConfig;

use crate::artifact::{Item, ItemReader, ItemWriter};
use crate::registry::{ArtifactRegistry, RegistryError, ResolvedListeners};
use crate::repository::job::JobRepository;

use super::checkpoint::{CheckpointError, CheckpointManager, CheckpointScope};
use super::classifier::ExceptionClassifier;
use super::context::StepContext;
use super::transaction::{TransactionBoundary, TransactionError};

// ---------------------------------------------------------------------------
// Outcome and failure types
// ---------------------------------------------------------------------------

/// How a chunk step finished when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChunkOutcome {
    /// Reader signalled end of data and the final chunk committed.
    Completed,
    /// A stop request was honored at a chunk boundary.
    Stopped,
}

/// Terminal failure of a chunk step.
#[derive(Debug, Error)]
pub(crate) enum ChunkFailure {
    /// Unhandled artifact error (or a retry/skip limit was exceeded).
    #[error("chunk artifact failure: {0}")]
    Artifact(BatchError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error("chunk repository error: {0}")]
    Repository(String),
}

/// What the classifier decided for a failure, given the remaining budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    RetryInPlace,
    RetryRollback,
    Skip,
    Fail,
}

/// Result of processing one read item.
enum Processed {
    Output(Option<Item>),
    Skipped,
}

/// The durable record the chunk engine re-persists at every commit: the
/// step's own record, or the partition record when running one partition.
pub(crate) enum ChunkProgress<'a> {
    Step(&'a mut StepExecution),
    Partition(&'a mut PartitionExecution),
}

// ---------------------------------------------------------------------------
// ChunkRunner
// ---------------------------------------------------------------------------

/// Runs the chunk loop for one step (or one partition of a step).
pub(crate) struct ChunkRunner<'a, R: JobRepository> {
    pub checkpoint: &'a CheckpointManager<R>,
    pub registry: &'a ArtifactRegistry,
    pub txn: &'a dyn TransactionBoundary,
    pub config: &'a ChunkConfig,
    pub scope: CheckpointScope,
    pub cancel: CancellationToken,
    classifier: ExceptionClassifier,
}

impl<'a, R: JobRepository> ChunkRunner<'a, R> {
    pub fn new(
        checkpoint: &'a CheckpointManager<R>,
        registry: &'a ArtifactRegistry,
        txn: &'a dyn TransactionBoundary,
        config: &'a ChunkConfig,
        scope: CheckpointScope,
        cancel: CancellationToken,
    ) -> Self {
        let classifier = ExceptionClassifier::from_config(config);
        Self {
            checkpoint,
            registry,
            txn,
            config,
            scope,
            cancel,
            classifier,
        }
    }

    fn disposition(&self, error: &BatchError, skip_count: u32, retry_count: u32) -> Disposition {
        let retry_budget_open = self
            .config
            .retry_limit
            .map_or(true, |limit| retry_count < limit);
        if self.classifier.is_retryable(error) && retry_budget_open {
            return if self.classifier.is_no_rollback(error) {
                Disposition::RetryInPlace
            } else {
                Disposition::RetryRollback
            };
        }
        let skip_budget_open = self
            .config
            .skip_limit
            .map_or(true, |limit| skip_count < limit);
        if self.classifier.is_skippable(error) && skip_budget_open {
            return Disposition::Skip;
        }
        Disposition::Fail
    }

    /// Roll the in-flight chunk back and reposition both artifacts at the
    /// last committed checkpoint.
    fn rollback_and_reposition(
        &self,
        ctx: &mut StepContext,
        reader: &mut Box<dyn ItemReader>,
        writer: &mut Box<dyn ItemWriter>,
        last_reader_cp: &Option<serde_json::Value>,
        last_writer_cp: &Option<serde_json::Value>,
    ) -> Result<(), ChunkFailure> {
        self.txn.rollback()?;
        ctx.metrics.rollback_count += 1;
        if let Err(error) = reader.close() {
            tracing::warn!(%error, "reader close failed during retry repositioning");
        }
        if let Err(error) = writer.close() {
            tracing::warn!(%error, "writer close failed during retry repositioning");
        }
        reader
            .open(last_reader_cp.clone())
            .map_err(ChunkFailure::Artifact)?;
        writer
            .open(last_writer_cp.clone())
            .map_err(ChunkFailure::Artifact)?;
        Ok(())
    }

    /// Run the chunk loop to completion, stop, or failure.
    ///
    /// `progress` is re-persisted at every commit so metrics and persistent
    /// user data are crash-safe alongside the checkpoint.
    pub async fn run(
        &self,
        ctx: &mut StepContext,
        progress: &mut ChunkProgress<'_>,
        listeners: &mut ResolvedListeners,
    ) -> Result<ChunkOutcome, ChunkFailure> {
        let config = self.config;
        let mut reader = self.registry.resolve_reader(&config.reader)?;
        let mut processor = match &config.processor {
            Some(reference) => Some(self.registry.resolve_processor(reference)?),
            None => None,
        };
        let mut writer = self.registry.resolve_writer(&config.writer)?;
        let mut algorithm = match &config.checkpoint_algorithm {
            Some(reference) => Some(self.registry.resolve_checkpoint_algorithm(reference)?),
            None => None,
        };

        let prior = self.checkpoint.load(&self.scope).await?;
        let (mut last_reader_cp, mut last_writer_cp, mut skip_count, mut retry_count) = match prior
        {
            Some(cp) => (cp.reader, cp.writer, cp.skip_count, cp.retry_count),
            None => (None, None, 0, 0),
        };

        if let Err(error) = reader.open(last_reader_cp.clone()) {
            return Err(ChunkFailure::Artifact(error));
        }
        if let Err(error) = writer.open(last_writer_cp.clone()) {
            let _ = reader.close();
            return Err(ChunkFailure::Artifact(error));
        }

        // Single-item chunks left to run after a rollback retry.
        let mut replay_remaining: u32 = 0;

        let outcome: Result<ChunkOutcome, ChunkFailure> = 'chunks: loop {
            if self.cancel.is_cancelled() {
                tracing::info!(
                    step_id = self.scope.step_id.as_str(),
                    "stop observed at chunk boundary"
                );
                break 'chunks Ok(ChunkOutcome::Stopped);
            }

            let target = if replay_remaining > 0 {
                1
            } else {
                config.item_count
            };

            if let Err(error) = self.txn.begin() {
                break 'chunks Err(error.into());
            }
            if let Err(error) = notify_before_chunk(listeners) {
                let _ = self.txn.rollback();
                ctx.metrics.rollback_count += 1;
                break 'chunks Err(ChunkFailure::Artifact(error));
            }

            let time_limit = match algorithm.as_deref_mut() {
                Some(algorithm) => {
                    if let Err(error) = algorithm.begin_checkpoint() {
                        let _ = self.txn.rollback();
                        ctx.metrics.rollback_count += 1;
                        break 'chunks Err(ChunkFailure::Artifact(error));
                    }
                    match algorithm.checkpoint_timeout() {
                        Ok(timeout) => timeout,
                        Err(error) => {
                            let _ = self.txn.rollback();
                            ctx.metrics.rollback_count += 1;
                            break 'chunks Err(ChunkFailure::Artifact(error));
                        }
                    }
                }
                None => config.time_limit_secs,
            };
            let chunk_start = Instant::now();

            let mut buffer: Vec<Item> = Vec::new();
            let mut chunk_reads: u32 = 0;
            let mut chunk_filtered: u64 = 0;
            let mut eof = false;

            // Read-process loop. Breaks with Some(failure) on a terminal
            // error (rollback still pending), None at a checkpoint boundary
            // or end of data.
            let failure: Option<ChunkFailure> = 'items: loop {
                if chunk_reads > 0 {
                    let boundary = match algorithm.as_deref_mut() {
                        Some(algorithm) => match algorithm.is_ready_to_checkpoint() {
                            Ok(ready) => ready,
                            Err(error) => break 'items Some(ChunkFailure::Artifact(error)),
                        },
                        None => chunk_reads >= target,
                    };
                    // The time limit is evaluated between items: the item
                    // in flight always completes first.
                    let timed_out =
                        time_limit > 0 && chunk_start.elapsed().as_secs() >= time_limit;
                    if boundary || timed_out {
                        break 'items None;
                    }
                }

                // ---- read ----
                let item = 'read: loop {
                    match reader.read_item() {
                        Ok(Some(item)) => break 'read Some(item),
                        Ok(None) => {
                            eof = true;
                            break 'read None;
                        }
                        Err(error) => match self.disposition(&error, skip_count, retry_count) {
                            Disposition::RetryInPlace => {
                                retry_count += 1;
                                ctx.metrics.retry_count += 1;
                                if let Err(le) = notify_retry_read(listeners, &error) {
                                    break 'items Some(ChunkFailure::Artifact(le));
                                }
                                continue 'read;
                            }
                            Disposition::RetryRollback => {
                                retry_count += 1;
                                ctx.metrics.retry_count += 1;
                                if let Err(le) = notify_retry_read(listeners, &error) {
                                    break 'items Some(ChunkFailure::Artifact(le));
                                }
                                match self.rollback_and_reposition(
                                    ctx,
                                    &mut reader,
                                    &mut writer,
                                    &last_reader_cp,
                                    &last_writer_cp,
                                ) {
                                    Ok(()) => {
                                        replay_remaining = chunk_reads + 1;
                                        continue 'chunks;
                                    }
                                    Err(failure) => break 'chunks Err(failure),
                                }
                            }
                            Disposition::Skip => {
                                skip_count += 1;
                                ctx.metrics.read_skip_count += 1;
                                if let Err(le) = notify_skip_read(listeners, &error) {
                                    break 'items Some(ChunkFailure::Artifact(le));
                                }
                                continue 'read;
                            }
                            Disposition::Fail => {
                                notify_error(listeners, &error);
                                break 'items Some(ChunkFailure::Artifact(error));
                            }
                        },
                    }
                };

                let Some(item) = item else {
                    break 'items None;
                };
                chunk_reads += 1;

                // ---- process ----
                let processed = if let Some(processor) = processor.as_deref_mut() {
                    'process: loop {
                        match processor.process_item(item.clone()) {
                            Ok(output) => break 'process Processed::Output(output),
                            Err(error) => {
                                match self.disposition(&error, skip_count, retry_count) {
                                    Disposition::RetryInPlace => {
                                        retry_count += 1;
                                        ctx.metrics.retry_count += 1;
                                        if let Err(le) =
                                            notify_retry_process(listeners, &item, &error)
                                        {
                                            break 'items Some(ChunkFailure::Artifact(le));
                                        }
                                        continue 'process;
                                    }
                                    Disposition::RetryRollback => {
                                        retry_count += 1;
                                        ctx.metrics.retry_count += 1;
                                        if let Err(le) =
                                            notify_retry_process(listeners, &item, &error)
                                        {
                                            break 'items Some(ChunkFailure::Artifact(le));
                                        }
                                        match self.rollback_and_reposition(
                                            ctx,
                                            &mut reader,
                                            &mut writer,
                                            &last_reader_cp,
                                            &last_writer_cp,
                                        ) {
                                            Ok(()) => {
                                                replay_remaining = chunk_reads;
                                                continue 'chunks;
                                            }
                                            Err(failure) => break 'chunks Err(failure),
                                        }
                                    }
                                    Disposition::Skip => {
                                        skip_count += 1;
                                        ctx.metrics.process_skip_count += 1;
                                        if let Err(le) =
                                            notify_skip_process(listeners, &item, &error)
                                        {
                                            break 'items Some(ChunkFailure::Artifact(le));
                                        }
                                        break 'process Processed::Skipped;
                                    }
                                    Disposition::Fail => {
                                        notify_error(listeners, &error);
                                        break 'items Some(ChunkFailure::Artifact(error));
                                    }
                                }
                            }
                        }
                    }
                } else {
                    Processed::Output(Some(item))
                };

                match processed {
                    Processed::Output(Some(output)) => buffer.push(output),
                    Processed::Output(None) => chunk_filtered += 1,
                    Processed::Skipped => {}
                }
            };

            if let Some(failure) = failure {
                let _ = self.txn.rollback();
                ctx.metrics.rollback_count += 1;
                break 'chunks Err(failure);
            }

            // ---- write ----
            let mut write_failure: Option<ChunkFailure> = None;
            if !buffer.is_empty() {
                'write: loop {
                    match writer.write_items(&buffer) {
                        Ok(()) => break 'write,
                        Err(error) => match self.disposition(&error, skip_count, retry_count) {
                            Disposition::RetryInPlace => {
                                retry_count += 1;
                                ctx.metrics.retry_count += 1;
                                if let Err(le) = notify_retry_write(listeners, &buffer, &error) {
                                    write_failure = Some(ChunkFailure::Artifact(le));
                                    break 'write;
                                }
                                continue 'write;
                            }
                            Disposition::RetryRollback => {
                                retry_count += 1;
                                ctx.metrics.retry_count += 1;
                                if let Err(le) = notify_retry_write(listeners, &buffer, &error) {
                                    write_failure = Some(ChunkFailure::Artifact(le));
                                    break 'write;
                                }
                                match self.rollback_and_reposition(
                                    ctx,
                                    &mut reader,
                                    &mut writer,
                                    &last_reader_cp,
                                    &last_writer_cp,
                                ) {
                                    Ok(()) => {
                                        replay_remaining = chunk_reads;
                                        continue 'chunks;
                                    }
                                    Err(failure) => break 'chunks Err(failure),
                                }
                            }
                            Disposition::Skip => {
                                skip_count += 1;
                                ctx.metrics.write_skip_count += 1;
                                if let Err(le) = notify_skip_write(listeners, &buffer, &error) {
                                    write_failure = Some(ChunkFailure::Artifact(le));
                                    break 'write;
                                }
                                buffer.clear();
                                break 'write;
                            }
                            Disposition::Fail => {
                                notify_error(listeners, &error);
                                write_failure = Some(ChunkFailure::Artifact(error));
                                break 'write;
                            }
                        },
                    }
                }
            }
            if let Some(failure) = write_failure {
                let _ = self.txn.rollback();
                ctx.metrics.rollback_count += 1;
                break 'chunks Err(failure);
            }

            // ---- checkpoint and commit ----
            let reader_cp = match reader.checkpoint_info() {
                Ok(cp) => cp,
                Err(error) => {
                    let _ = self.txn.rollback();
                    ctx.metrics.rollback_count += 1;
                    break 'chunks Err(ChunkFailure::Artifact(error));
                }
            };
            let writer_cp = match writer.checkpoint_info() {
                Ok(cp) => cp,
                Err(error) => {
                    let _ = self.txn.rollback();
                    ctx.metrics.rollback_count += 1;
                    break 'chunks Err(ChunkFailure::Artifact(error));
                }
            };
            if let Err(error) = self
                .checkpoint
                .save(
                    &self.scope,
                    reader_cp.clone(),
                    writer_cp.clone(),
                    skip_count,
                    retry_count,
                )
                .await
            {
                let _ = self.txn.rollback();
                ctx.metrics.rollback_count += 1;
                break 'chunks Err(error.into());
            }

            ctx.metrics.read_count += chunk_reads as u64;
            ctx.metrics.filter_count += chunk_filtered;
            ctx.metrics.write_count += buffer.len() as u64;
            ctx.metrics.commit_count += 1;
            let persisted = match progress {
                ChunkProgress::Step(step_execution) => {
                    step_execution.metrics = ctx.metrics;
                    step_execution.persistent_user_data = ctx.take_persistent_user_data();
                    self.checkpoint
                        .repo()
                        .update_step_execution(step_execution)
                        .await
                }
                ChunkProgress::Partition(partition_execution) => {
                    partition_execution.metrics = ctx.metrics;
                    partition_execution.persistent_user_data = ctx.take_persistent_user_data();
                    self.checkpoint
                        .repo()
                        .update_partition_execution(partition_execution)
                        .await
                }
            };
            if let Err(error) = persisted {
                let _ = self.txn.rollback();
                ctx.metrics.rollback_count += 1;
                break 'chunks Err(ChunkFailure::Repository(error.to_string()));
            }

            if let Some(algorithm) = algorithm.as_deref_mut() {
                if let Err(error) = algorithm.end_checkpoint() {
                    let _ = self.txn.rollback();
                    ctx.metrics.rollback_count += 1;
                    break 'chunks Err(ChunkFailure::Artifact(error));
                }
            }
            if let Err(error) = self.txn.commit() {
                break 'chunks Err(error.into());
            }
            if let Err(error) = notify_after_chunk(listeners) {
                break 'chunks Err(ChunkFailure::Artifact(error));
            }

            last_reader_cp = reader_cp;
            last_writer_cp = writer_cp;
            if replay_remaining > 0 {
                replay_remaining -= 1;
            }
            if eof {
                break 'chunks Ok(ChunkOutcome::Completed);
            }
        };

        // Close both artifacts; a close failure on a clean run fails the step.
        let reader_close = reader.close();
        let writer_close = writer.close();
        match outcome {
            Ok(result) => {
                reader_close.map_err(ChunkFailure::Artifact)?;
                writer_close.map_err(ChunkFailure::Artifact)?;
                Ok(result)
            }
            Err(failure) => {
                if let Err(error) = reader_close {
                    tracing::warn!(%error, "reader close failed after chunk failure");
                }
                if let Err(error) = writer_close {
                    tracing::warn!(%error, "writer close failed after chunk failure");
                }
                Err(failure)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Listener notification helpers
// ---------------------------------------------------------------------------

fn notify_before_chunk(listeners: &mut ResolvedListeners) -> Result<(), BatchError> {
    for listener in listeners.chunk.iter_mut() {
        listener.before_chunk()?;
    }
    Ok(())
}

fn notify_after_chunk(listeners: &mut ResolvedListeners) -> Result<(), BatchError> {
    for listener in listeners.chunk.iter_mut() {
        listener.after_chunk()?;
    }
    Ok(())
}

/// Chunk listeners see every unhandled failure; their own errors are logged
/// and dropped since the step is already failing.
fn notify_error(listeners: &mut ResolvedListeners, error: &BatchError) {
    for listener in listeners.chunk.iter_mut() {
        if let Err(listener_error) = listener.on_error(error) {
            tracing::warn!(%listener_error, "chunk on_error listener failed");
        }
    }
}

fn notify_retry_read(listeners: &mut ResolvedListeners, error: &BatchError) -> Result<(), BatchError> {
    for listener in listeners.retry.iter_mut() {
        listener.on_retry_read(error)?;
    }
    Ok(())
}

fn notify_retry_process(
    listeners: &mut ResolvedListeners,
    item: &Item,
    error: &BatchError,
) -> Result<(), BatchError> {
    for listener in listeners.retry.iter_mut() {
        listener.on_retry_process(item, error)?;
    }
    Ok(())
}

fn notify_retry_write(
    listeners: &mut ResolvedListeners,
    items: &[Item],
    error: &BatchError,
) -> Result<(), BatchError> {
    for listener in listeners.retry.iter_mut() {
        listener.on_retry_write(items, error)?;
    }
    Ok(())
}

fn notify_skip_read(listeners: &mut ResolvedListeners, error: &BatchError) -> Result<(), BatchError> {
    for listener in listeners.skip.iter_mut() {
        listener.on_skip_read(error)?;
    }
    Ok(())
}

fn notify_skip_process(
    listeners: &mut ResolvedListeners,
    item: &Item,
    error: &BatchError,
) -> Result<(), BatchError> {
    for listener in listeners.skip.iter_mut() {
        listener.on_skip_process(item, error)?;
    }
    Ok(())
}

fn notify_skip_write(
    listeners: &mut ResolvedListeners,
    items: &[Item],
    error: &BatchError,
) -> Result<(), BatchError> {
    for listener in listeners.skip.iter_mut() {
        listener.on_skip_write(items, error)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
