//! Batch artifact contracts.
//!
//! User code plugs into the runtime through these traits: readers,
//! processors and writers for chunk steps, batchlets for task steps,
//! deciders for decision elements, checkpoint algorithms, partition
//! artifacts, and the listener families. Artifacts are synchronous; the
//! engines drive them from async code between checkpoint boundaries.
//!
//! Items and checkpoint payloads are opaque `serde_json::Value`s. Resources
//! an artifact needs (connections, file handles) are passed into its factory
//! at registration time, never looked up globally.

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use kiln_types::error::BatchError;
use kiln_types::execution::{BatchStatus, StepExecution};

use crate::engine::context::StepContext;

/// An item flowing through a chunk step.
pub type Item = Value;

// ---------------------------------------------------------------------------
// Stop signal
// ---------------------------------------------------------------------------

/// Cooperative stop signal handed to long-running artifacts.
///
/// Set when an operator requests a stop; batchlets should observe it between
/// units of work. Chunk artifacts never need it -- the engine itself honors
/// stop requests at chunk boundaries.
#[derive(Debug, Clone)]
pub struct StopSignal {
    token: CancellationToken,
}

impl StopSignal {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// Whether a stop has been requested for the owning execution.
    pub fn is_requested(&self) -> bool {
        self.token.is_cancelled()
    }
}

// ---------------------------------------------------------------------------
// Chunk artifacts
// ---------------------------------------------------------------------------

/// Reads items one at a time for a chunk step.
pub trait ItemReader: Send {
    /// Open the reader, positioned at `checkpoint` when restarting.
    fn open(&mut self, checkpoint: Option<Value>) -> Result<(), BatchError>;

    /// Read the next item; `None` signals end of data.
    fn read_item(&mut self) -> Result<Option<Item>, BatchError>;

    /// The reader's current position, persisted at each chunk commit.
    fn checkpoint_info(&mut self) -> Result<Option<Value>, BatchError> {
        Ok(None)
    }

    fn close(&mut self) -> Result<(), BatchError> {
        Ok(())
    }
}

/// Transforms one item; `None` filters the item out of the write buffer.
pub trait ItemProcessor: Send {
    fn process_item(&mut self, item: Item) -> Result<Option<Item>, BatchError>;
}

/// Writes a buffered batch of items at each checkpoint boundary.
pub trait ItemWriter: Send {
    fn open(&mut self, checkpoint: Option<Value>) -> Result<(), BatchError>;

    fn write_items(&mut self, items: &[Item]) -> Result<(), BatchError>;

    /// The writer's current position, persisted at each chunk commit.
    fn checkpoint_info(&mut self) -> Result<Option<Value>, BatchError> {
        Ok(None)
    }

    fn close(&mut self) -> Result<(), BatchError> {
        Ok(())
    }
}

/// Custom checkpoint boundary policy for a chunk step. When configured it
/// replaces the item-count/time policy entirely.
pub trait CheckpointAlgorithm: Send {
    /// Called when a new chunk begins.
    fn begin_checkpoint(&mut self) -> Result<(), BatchError> {
        Ok(())
    }

    /// Evaluated between items; `true` closes the current chunk.
    fn is_ready_to_checkpoint(&mut self) -> Result<bool, BatchError>;

    /// Called after the chunk commits.
    fn end_checkpoint(&mut self) -> Result<(), BatchError> {
        Ok(())
    }

    /// Upper bound in seconds for one chunk (0 = none).
    fn checkpoint_timeout(&mut self) -> Result<u64, BatchError> {
        Ok(0)
    }
}

// ---------------------------------------------------------------------------
// Batchlet and decider
// ---------------------------------------------------------------------------

/// A task-oriented step: one synchronous invocation inside a transaction
/// boundary.
pub trait Batchlet: Send {
    /// Run the task. The returned string, when present, becomes the step's
    /// exit status. Long-running batchlets should poll `stop` and return
    /// early when a stop is requested.
    fn process(
        &mut self,
        ctx: &mut StepContext,
        stop: &StopSignal,
    ) -> Result<Option<String>, BatchError>;
}

/// Chooses the next transition after a step, flow, or split.
///
/// Receives the StepExecution of the preceding step or flow tail-step, or
/// the set of last StepExecutions of each branch after a split. The return
/// value becomes the job's current exit status for transition matching; a
/// decision is never itself executed as a step.
pub trait Decider: Send {
    fn decide(&mut self, executions: &[StepExecution]) -> Result<String, BatchError>;
}

// ---------------------------------------------------------------------------
// Partition artifacts
// ---------------------------------------------------------------------------

/// Supplies the partition plan for a partitioned step at runtime.
pub trait PartitionMapper: Send {
    fn map_partitions(&mut self) -> Result<kiln_types::job::PartitionPlan, BatchError>;
}

/// Runs inside each partition; its payload is delivered to the analyzer.
pub trait PartitionCollector: Send {
    fn collect_partition_data(&mut self) -> Result<Value, BatchError>;
}

/// Runs at step level, aggregating partition results into the step outcome.
pub trait PartitionAnalyzer: Send {
    /// Receives each partition's collector payload, in completion order.
    fn analyze_collector_data(&mut self, data: Value) -> Result<(), BatchError> {
        let _ = data;
        Ok(())
    }

    /// Receives each partition's terminal status. May set the step exit
    /// status through the context.
    fn analyze_status(
        &mut self,
        ctx: &mut StepContext,
        batch_status: BatchStatus,
        exit_status: &str,
    ) -> Result<(), BatchError>;
}

// ---------------------------------------------------------------------------
// Listeners
// ---------------------------------------------------------------------------

/// Invoked around the whole job execution.
pub trait JobListener: Send {
    fn before_job(&mut self) -> Result<(), BatchError> {
        Ok(())
    }
    fn after_job(&mut self) -> Result<(), BatchError> {
        Ok(())
    }
}

/// Invoked around each step execution.
pub trait StepListener: Send {
    fn before_step(&mut self, ctx: &mut StepContext) -> Result<(), BatchError> {
        let _ = ctx;
        Ok(())
    }
    fn after_step(&mut self, ctx: &mut StepContext) -> Result<(), BatchError> {
        let _ = ctx;
        Ok(())
    }
}

/// Invoked around each chunk, and when a chunk fails.
pub trait ChunkListener: Send {
    fn before_chunk(&mut self) -> Result<(), BatchError> {
        Ok(())
    }
    fn after_chunk(&mut self) -> Result<(), BatchError> {
        Ok(())
    }
    fn on_error(&mut self, error: &BatchError) -> Result<(), BatchError> {
        let _ = error;
        Ok(())
    }
}

/// Invoked when an item is skipped under the skippable-exception policy.
pub trait SkipListener: Send {
    fn on_skip_read(&mut self, error: &BatchError) -> Result<(), BatchError> {
        let _ = error;
        Ok(())
    }
    fn on_skip_process(&mut self, item: &Item, error: &BatchError) -> Result<(), BatchError> {
        let _ = (item, error);
        Ok(())
    }
    fn on_skip_write(&mut self, items: &[Item], error: &BatchError) -> Result<(), BatchError> {
        let _ = (items, error);
        Ok(())
    }
}

/// Invoked when an operation is about to be retried under the
/// retryable-exception policy.
pub trait RetryListener: Send {
    fn on_retry_read(&mut self, error: &BatchError) -> Result<(), BatchError> {
        let _ = error;
        Ok(())
    }
    fn on_retry_process(&mut self, item: &Item, error: &BatchError) -> Result<(), BatchError> {
        let _ = (item, error);
        Ok(())
    }
    fn on_retry_write(&mut self, items: &[Item], error: &BatchError) -> Result<(), BatchError> {
        let _ = (items, error);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
