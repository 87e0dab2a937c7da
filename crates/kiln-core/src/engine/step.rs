//! Step executor: runs exactly one step element per invocation.
//!
//! Applies the start-limit and allow-start-if-complete policies against the
//! instance's execution history, dispatches to the chunk engine or a
//! batchlet invocation, and fans partitioned steps out onto concurrent
//! tasks. Every actual run creates and finalizes a `StepExecution` record;
//! a replayed step (previously completed, not re-enterable) reuses its
//! prior record as transition input and creates nothing.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use kiln_types::error::BatchError;
use kiln_types::execution::{BatchStatus, PartitionExecution, StepExecution, StepMetrics};
use kiln_types::job::{
    ArtifactRef, PartitionConfig, PartitionSource, Properties, StepDefinition, StepPayload,
};

use crate::artifact::StopSignal;
use crate::registry::{ArtifactRegistry, RegistryError, ResolvedListeners};
use crate::repository::job::JobRepository;

use super::checkpoint::{CheckpointError, CheckpointManager, CheckpointScope};
use super::chunk::{ChunkFailure, ChunkOutcome, ChunkProgress, ChunkRunner};
use super::context::{JobContext, StepContext};
use super::transaction::{TransactionBoundary, TransactionError};

// ---------------------------------------------------------------------------
// Outcome and error types
// ---------------------------------------------------------------------------

/// Result of running (or replaying) one step.
#[derive(Debug)]
pub(crate) struct StepOutcome {
    pub batch_status: BatchStatus,
    pub exit_status: String,
    /// The step execution backing this outcome: newly recorded for a real
    /// run, the prior record for a replay.
    pub execution: StepExecution,
    pub replayed: bool,
}

/// Errors that abort the job walk rather than just failing the step.
#[derive(Debug, Error)]
pub(crate) enum StepRunError {
    /// The step has already started `limit` times across this instance.
    #[error("step '{step_id}' exceeded its start limit of {limit}")]
    StartLimitExceeded { step_id: String, limit: u32 },

    #[error("step repository error: {0}")]
    Repository(String),
}

/// Failures inside the step's own execution; they mark the step FAILED and
/// let the job continue into transition resolution.
#[derive(Debug, Error)]
enum PayloadError {
    #[error("artifact failure: {0}")]
    Artifact(#[from] BatchError),

    #[error(transparent)]
    Chunk(#[from] ChunkFailure),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("repository error: {0}")]
    Repository(String),

    #[error("partition task failed: {0}")]
    Join(String),
}

/// How the payload finished when it did not fail.
enum PayloadResult {
    /// Finished normally; a batchlet may supply an exit status.
    Completed(Option<String>),
    /// A stop request was honored at a safe boundary.
    Stopped,
}

// ---------------------------------------------------------------------------
// StepRunner
// ---------------------------------------------------------------------------

/// Executes single steps for the graph walker.
pub(crate) struct StepRunner<R: JobRepository> {
    checkpoint: Arc<CheckpointManager<R>>,
    registry: Arc<ArtifactRegistry>,
    txn: Arc<dyn TransactionBoundary>,
}

impl<R: JobRepository> Clone for StepRunner<R> {
    fn clone(&self) -> Self {
        Self {
            checkpoint: Arc::clone(&self.checkpoint),
            registry: Arc::clone(&self.registry),
            txn: Arc::clone(&self.txn),
        }
    }
}

impl<R: JobRepository + 'static> StepRunner<R> {
    pub fn new(
        checkpoint: Arc<CheckpointManager<R>>,
        registry: Arc<ArtifactRegistry>,
        txn: Arc<dyn TransactionBoundary>,
    ) -> Self {
        Self {
            checkpoint,
            registry,
            txn,
        }
    }

    /// Run one step within the given job execution.
    pub async fn run(
        &self,
        step: &StepDefinition,
        job_ctx: &JobContext,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, StepRunError> {
        let repo = self.checkpoint.repo();
        let prior = repo
            .latest_step_execution(&job_ctx.instance_id, &step.id)
            .await
            .map_err(|e| StepRunError::Repository(e.to_string()))?;

        // A completed, non-reenterable step replays its prior execution as
        // transition input without running and without counting a start.
        if let Some(prior) = &prior {
            if prior.batch_status == BatchStatus::Completed && !step.allow_start_if_complete {
                tracing::info!(
                    step_id = step.id.as_str(),
                    "replaying completed step on restart"
                );
                return Ok(StepOutcome {
                    batch_status: BatchStatus::Completed,
                    exit_status: prior.effective_exit_status().to_string(),
                    execution: prior.clone(),
                    replayed: true,
                });
            }
        }

        if step.start_limit > 0 {
            let starts = repo
                .count_step_starts(&job_ctx.instance_id, &step.id)
                .await
                .map_err(|e| StepRunError::Repository(e.to_string()))?;
            if starts >= step.start_limit {
                tracing::warn!(
                    step_id = step.id.as_str(),
                    starts,
                    limit = step.start_limit,
                    "start limit exceeded"
                );
                return Err(StepRunError::StartLimitExceeded {
                    step_id: step.id.clone(),
                    limit: step.start_limit,
                });
            }
        }

        let prior_completed = prior
            .as_ref()
            .is_some_and(|p| p.batch_status == BatchStatus::Completed);

        let mut execution = StepExecution {
            id: Uuid::now_v7(),
            job_execution_id: job_ctx.execution_id,
            instance_id: job_ctx.instance_id,
            step_id: step.id.clone(),
            batch_status: BatchStatus::Started,
            exit_status: None,
            metrics: StepMetrics::default(),
            persistent_user_data: prior.as_ref().and_then(|p| p.persistent_user_data.clone()),
            start_time: Some(Utc::now()),
            end_time: None,
        };
        repo.create_step_execution(&execution)
            .await
            .map_err(|e| StepRunError::Repository(e.to_string()))?;

        tracing::info!(
            step_id = step.id.as_str(),
            execution_id = %job_ctx.execution_id,
            "starting step execution"
        );

        let mut ctx = StepContext::new(
            step.id.clone(),
            execution.id,
            job_ctx.clone(),
            execution.persistent_user_data.clone(),
        );

        let result = self
            .execute(step, &mut ctx, &mut execution, cancel, prior_completed)
            .await;

        let (batch_status, payload_exit) = match result {
            Ok(PayloadResult::Completed(exit)) => (BatchStatus::Completed, exit),
            Ok(PayloadResult::Stopped) => (BatchStatus::Stopped, None),
            Err(error) => {
                tracing::error!(
                    step_id = step.id.as_str(),
                    %error,
                    "step execution failed"
                );
                (BatchStatus::Failed, None)
            }
        };

        // Step exit status: context override, then the batchlet's return
        // value, then the batch status name.
        let exit_status = ctx
            .exit_status()
            .map(str::to_string)
            .or(payload_exit)
            .unwrap_or_else(|| batch_status.as_str().to_string());

        if batch_status == BatchStatus::Completed {
            let scope = CheckpointScope {
                instance_id: job_ctx.instance_id,
                step_id: step.id.clone(),
                partition: None,
            };
            self.checkpoint
                .clear(&scope)
                .await
                .map_err(|e| StepRunError::Repository(e.to_string()))?;
        }

        execution.batch_status = batch_status;
        execution.exit_status = Some(exit_status.clone());
        execution.metrics = ctx.metrics;
        execution.persistent_user_data = ctx.take_persistent_user_data();
        execution.end_time = Some(Utc::now());
        repo.update_step_execution(&execution)
            .await
            .map_err(|e| StepRunError::Repository(e.to_string()))?;

        tracing::info!(
            step_id = step.id.as_str(),
            status = %batch_status,
            exit_status = exit_status.as_str(),
            "step execution finished"
        );

        Ok(StepOutcome {
            batch_status,
            exit_status,
            execution,
            replayed: false,
        })
    }

    /// Run listeners and payload; any error marks the step FAILED.
    async fn execute(
        &self,
        step: &StepDefinition,
        ctx: &mut StepContext,
        execution: &mut StepExecution,
        cancel: &CancellationToken,
        prior_completed: bool,
    ) -> Result<PayloadResult, PayloadError> {
        let mut listeners = ResolvedListeners::resolve(&self.registry, &step.listeners)?;

        for listener in listeners.step.iter_mut() {
            listener.before_step(ctx)?;
        }

        let result = match &step.partition {
            Some(partition) => {
                self.run_partitions(step, partition, ctx, cancel, prior_completed)
                    .await?
            }
            None => {
                self.run_payload(
                    &step.payload,
                    &step.id,
                    &step.listeners,
                    ctx,
                    ChunkProgress::Step(execution),
                    cancel,
                    None,
                )
                .await?
            }
        };

        for listener in listeners.step.iter_mut() {
            listener.after_step(ctx)?;
        }

        Ok(result)
    }

    /// Dispatch one unpartitioned payload (or one partition of it).
    #[allow(clippy::too_many_arguments)]
    async fn run_payload(
        &self,
        payload: &StepPayload,
        step_id: &str,
        listener_refs: &[ArtifactRef],
        ctx: &mut StepContext,
        mut progress: ChunkProgress<'_>,
        cancel: &CancellationToken,
        partition: Option<u32>,
    ) -> Result<PayloadResult, PayloadError> {
        match payload {
            StepPayload::Batchlet(reference) => {
                let mut batchlet = self.registry.resolve_batchlet(reference)?;
                let stop = StopSignal::new(cancel.clone());

                self.txn.begin()?;
                match batchlet.process(ctx, &stop) {
                    Ok(exit) => {
                        self.txn.commit()?;
                        if cancel.is_cancelled() {
                            // The stop request landed while the batchlet ran;
                            // honored now that it finished.
                            Ok(PayloadResult::Stopped)
                        } else {
                            Ok(PayloadResult::Completed(exit))
                        }
                    }
                    Err(error) => {
                        self.txn.rollback()?;
                        Err(PayloadError::Artifact(error))
                    }
                }
            }
            StepPayload::Chunk(config) => {
                let scope = CheckpointScope {
                    instance_id: ctx.job().instance_id,
                    step_id: step_id.to_string(),
                    partition,
                };
                // Chunk steps resolve their listeners per scope so each
                // partition gets its own instances.
                let mut listeners = ResolvedListeners::resolve(&self.registry, listener_refs)?;
                let runner = ChunkRunner::new(
                    &self.checkpoint,
                    &self.registry,
                    self.txn.as_ref(),
                    config,
                    scope,
                    cancel.clone(),
                );
                match runner.run(ctx, &mut progress, &mut listeners).await? {
                    ChunkOutcome::Completed => Ok(PayloadResult::Completed(None)),
                    ChunkOutcome::Stopped => Ok(PayloadResult::Stopped),
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Partitions
    // -----------------------------------------------------------------------

    /// Fan the step out across its partitions and aggregate the results.
    async fn run_partitions(
        &self,
        step: &StepDefinition,
        partition: &PartitionConfig,
        ctx: &mut StepContext,
        cancel: &CancellationToken,
        prior_completed: bool,
    ) -> Result<PayloadResult, PayloadError> {
        let plan = match &partition.source {
            PartitionSource::Plan(plan) => plan.clone(),
            PartitionSource::Mapper(reference) => {
                let mut mapper = self.registry.resolve_partition_mapper(reference)?;
                mapper.map_partitions()?
            }
        };

        // On restart, partitions that already completed are skipped --
        // unless the whole step is re-running via allow-start-if-complete.
        let completed: Vec<u32> = if prior_completed {
            Vec::new()
        } else {
            self.checkpoint
                .repo()
                .latest_partition_executions(&ctx.job().instance_id, &step.id)
                .await
                .map_err(|e| PayloadError::Repository(e.to_string()))?
                .into_iter()
                .filter(|p| p.batch_status == BatchStatus::Completed)
                .map(|p| p.partition)
                .collect()
        };

        let mut analyzer = match &partition.analyzer {
            Some(reference) => Some(self.registry.resolve_partition_analyzer(reference)?),
            None => None,
        };

        let mut join_set = JoinSet::new();
        for index in 0..plan.count {
            if completed.contains(&index) {
                tracing::debug!(
                    step_id = step.id.as_str(),
                    partition = index,
                    "skipping completed partition on restart"
                );
                continue;
            }

            let runner = self.clone();
            let step = step.clone();
            let overrides = plan.properties_for(index);
            let collector_ref = partition.collector.clone();
            let job_ctx = ctx.job().clone();
            let cancel = cancel.clone();
            let step_execution_id = ctx.step_execution_id;

            join_set.spawn(async move {
                runner
                    .run_one_partition(
                        step,
                        index,
                        overrides,
                        collector_ref,
                        job_ctx,
                        cancel,
                        step_execution_id,
                    )
                    .await
            });
        }

        let mut any_failed = false;
        let mut any_stopped = false;
        while let Some(joined) = join_set.join_next().await {
            let result = joined.map_err(|e| PayloadError::Join(e.to_string()))?;
            let outcome = result?;

            if let Some(analyzer) = analyzer.as_deref_mut() {
                if let Some(data) = outcome.collector_data {
                    analyzer.analyze_collector_data(data)?;
                }
                analyzer.analyze_status(ctx, outcome.batch_status, &outcome.exit_status)?;
            }

            ctx.metrics.merge(&outcome.metrics);
            match outcome.batch_status {
                BatchStatus::Failed => any_failed = true,
                BatchStatus::Stopped => any_stopped = true,
                _ => {}
            }
        }

        if any_failed {
            Err(PayloadError::Artifact(BatchError::tagged(
                "partition.failed",
                format!("one or more partitions of step '{}' failed", step.id),
            )))
        } else if any_stopped {
            Ok(PayloadResult::Stopped)
        } else {
            Ok(PayloadResult::Completed(None))
        }
    }

    /// Run a single partition on its own task, with its own records.
    #[allow(clippy::too_many_arguments)]
    async fn run_one_partition(
        self,
        step: StepDefinition,
        index: u32,
        overrides: Properties,
        collector_ref: Option<ArtifactRef>,
        job_ctx: JobContext,
        cancel: CancellationToken,
        step_execution_id: Uuid,
    ) -> Result<PartitionOutcome, PayloadError> {
        let repo = self.checkpoint.repo();
        let prior = repo
            .latest_partition_executions(&job_ctx.instance_id, &step.id)
            .await
            .map_err(|e| PayloadError::Repository(e.to_string()))?
            .into_iter()
            .find(|p| p.partition == index);

        let mut record = PartitionExecution {
            id: Uuid::now_v7(),
            step_execution_id,
            instance_id: job_ctx.instance_id,
            step_id: step.id.clone(),
            partition: index,
            batch_status: BatchStatus::Started,
            exit_status: None,
            metrics: StepMetrics::default(),
            persistent_user_data: prior.and_then(|p| p.persistent_user_data),
        };
        repo.create_partition_execution(&record)
            .await
            .map_err(|e| PayloadError::Repository(e.to_string()))?;

        let mut ctx = StepContext::new(
            step.id.clone(),
            step_execution_id,
            job_ctx.clone(),
            record.persistent_user_data.clone(),
        );

        let payload = merge_partition_properties(&step.payload, &overrides);
        let result = self
            .run_payload(
                &payload,
                &step.id,
                &step.listeners,
                &mut ctx,
                ChunkProgress::Partition(&mut record),
                &cancel,
                Some(index),
            )
            .await;

        let batch_status = match &result {
            Ok(PayloadResult::Completed(_)) => BatchStatus::Completed,
            Ok(PayloadResult::Stopped) => BatchStatus::Stopped,
            Err(error) => {
                tracing::error!(
                    step_id = step.id.as_str(),
                    partition = index,
                    %error,
                    "partition failed"
                );
                BatchStatus::Failed
            }
        };
        let exit_status = ctx
            .exit_status()
            .map(str::to_string)
            .unwrap_or_else(|| batch_status.as_str().to_string());

        if batch_status == BatchStatus::Completed {
            let scope = CheckpointScope {
                instance_id: job_ctx.instance_id,
                step_id: step.id.clone(),
                partition: Some(index),
            };
            self.checkpoint
                .clear(&scope)
                .await
                .map_err(|e| PayloadError::Repository(e.to_string()))?;
        }

        let collector_data = match (&collector_ref, batch_status) {
            (Some(reference), BatchStatus::Completed) => {
                let mut collector = self.registry.resolve_partition_collector(reference)?;
                Some(collector.collect_partition_data()?)
            }
            _ => None,
        };

        record.batch_status = batch_status;
        record.exit_status = Some(exit_status.clone());
        record.metrics = ctx.metrics;
        record.persistent_user_data = ctx.take_persistent_user_data();
        repo.update_partition_execution(&record)
            .await
            .map_err(|e| PayloadError::Repository(e.to_string()))?;

        Ok(PartitionOutcome {
            batch_status,
            exit_status,
            metrics: record.metrics,
            collector_data,
        })
    }
}

/// What one partition task reports back for aggregation.
struct PartitionOutcome {
    batch_status: BatchStatus,
    exit_status: String,
    metrics: StepMetrics,
    collector_data: Option<serde_json::Value>,
}

/// Overlay partition properties onto every artifact reference of a payload.
fn merge_partition_properties(payload: &StepPayload, overrides: &Properties) -> StepPayload {
    if overrides.is_empty() {
        return payload.clone();
    }
    let merge = |reference: &ArtifactRef| {
        let mut merged = reference.clone();
        for (key, value) in overrides {
            merged.properties.insert(key.clone(), value.clone());
        }
        merged
    };
    match payload {
        StepPayload::Batchlet(reference) => StepPayload::Batchlet(merge(reference)),
        StepPayload::Chunk(config) => {
            let mut config = config.clone();
            config.reader = merge(&config.reader);
            config.writer = merge(&config.writer);
            config.processor = config.processor.as_ref().map(&merge);
            config.checkpoint_algorithm = config.checkpoint_algorithm.as_ref().map(&merge);
            StepPayload::Chunk(config)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{Batchlet, ItemReader, ItemWriter, PartitionAnalyzer};
    use crate::engine::transaction::LocalTransactionBoundary;
    use crate::registry::Artifact;
    use crate::repository::memory::InMemoryJobRepository;
    use kiln_types::job::PartitionPlan;
    use serde_json::Value;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct Env {
        runner: StepRunner<InMemoryJobRepository>,
        job_ctx: JobContext,
    }

    fn env_with(registry: ArtifactRegistry) -> Env {
        let runner = StepRunner::new(
            Arc::new(CheckpointManager::new(InMemoryJobRepository::new())),
            Arc::new(registry),
            Arc::new(LocalTransactionBoundary),
        );
        let job_ctx = JobContext::new(
            "test-job".to_string(),
            Uuid::now_v7(),
            Uuid::now_v7(),
            HashMap::new(),
        );
        Env { runner, job_ctx }
    }

    fn batchlet_step(id: &str, artifact: &str) -> StepDefinition {
        StepDefinition {
            id: id.to_string(),
            start_limit: 0,
            allow_start_if_complete: false,
            payload: StepPayload::Batchlet(ArtifactRef::named(artifact)),
            partition: None,
            listeners: vec![],
            transitions: vec![],
        }
    }

    /// Batchlet that counts invocations and returns a fixed exit status.
    struct CountingBatchlet {
        invocations: Arc<AtomicU32>,
        exit: Option<String>,
        fail: bool,
    }

    impl Batchlet for CountingBatchlet {
        fn process(
            &mut self,
            _ctx: &mut StepContext,
            _stop: &StopSignal,
        ) -> Result<Option<String>, BatchError> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(BatchError::tagged("app.task", "batchlet exploded"));
            }
            Ok(self.exit.clone())
        }
    }

    fn counting_registry(exit: Option<&str>, fail: bool) -> (ArtifactRegistry, Arc<AtomicU32>) {
        let invocations = Arc::new(AtomicU32::new(0));
        let mut registry = ArtifactRegistry::new();
        {
            let invocations = Arc::clone(&invocations);
            let exit = exit.map(str::to_string);
            registry.register("task", move |_props| {
                Artifact::Batchlet(Box::new(CountingBatchlet {
                    invocations: Arc::clone(&invocations),
                    exit: exit.clone(),
                    fail,
                }))
            });
        }
        (registry, invocations)
    }

    #[tokio::test]
    async fn test_batchlet_completes_with_exit_status() {
        let (registry, invocations) = counting_registry(Some("ALL_DONE"), false);
        let env = env_with(registry);
        let step = batchlet_step("work", "task");

        let outcome = env
            .runner
            .run(&step, &env.job_ctx, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.batch_status, BatchStatus::Completed);
        assert_eq!(outcome.exit_status, "ALL_DONE");
        assert!(!outcome.replayed);
        assert_eq!(invocations.load(Ordering::SeqCst), 1);

        let recorded = env
            .runner
            .checkpoint
            .repo()
            .latest_step_execution(&env.job_ctx.instance_id, "work")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(recorded.batch_status, BatchStatus::Completed);
        assert_eq!(recorded.exit_status.as_deref(), Some("ALL_DONE"));
        assert!(recorded.end_time.is_some());
    }

    #[tokio::test]
    async fn test_batchlet_default_exit_is_batch_status() {
        let (registry, _) = counting_registry(None, false);
        let env = env_with(registry);
        let outcome = env
            .runner
            .run(&batchlet_step("work", "task"), &env.job_ctx, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.exit_status, "COMPLETED");
    }

    #[tokio::test]
    async fn test_failed_batchlet_marks_step_failed() {
        let (registry, _) = counting_registry(None, true);
        let env = env_with(registry);
        let outcome = env
            .runner
            .run(&batchlet_step("work", "task"), &env.job_ctx, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.batch_status, BatchStatus::Failed);
        assert_eq!(outcome.exit_status, "FAILED");
    }

    #[tokio::test]
    async fn test_replay_of_completed_step_skips_artifacts() {
        let (registry, invocations) = counting_registry(Some("FIRST"), false);
        let env = env_with(registry);
        let step = batchlet_step("work", "task");

        let first = env
            .runner
            .run(&step, &env.job_ctx, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!first.replayed);

        let second = env
            .runner
            .run(&step, &env.job_ctx, &CancellationToken::new())
            .await
            .unwrap();
        assert!(second.replayed, "completed non-reenterable step replays");
        assert_eq!(second.exit_status, "FIRST", "prior exit status is reused");
        assert_eq!(invocations.load(Ordering::SeqCst), 1, "artifact not re-invoked");

        let starts = env
            .runner
            .checkpoint
            .repo()
            .count_step_starts(&env.job_ctx.instance_id, "work")
            .await
            .unwrap();
        assert_eq!(starts, 1, "replay does not count against start limit");
    }

    #[tokio::test]
    async fn test_allow_start_if_complete_reexecutes() {
        let (registry, invocations) = counting_registry(None, false);
        let env = env_with(registry);
        let mut step = batchlet_step("work", "task");
        step.allow_start_if_complete = true;

        env.runner
            .run(&step, &env.job_ctx, &CancellationToken::new())
            .await
            .unwrap();
        let second = env
            .runner
            .run(&step, &env.job_ctx, &CancellationToken::new())
            .await
            .unwrap();

        assert!(!second.replayed);
        assert_eq!(invocations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_start_limit_exceeded() {
        let (registry, invocations) = counting_registry(None, true);
        let env = env_with(registry);
        let mut step = batchlet_step("work", "task");
        step.start_limit = 2;

        // Two failed runs use up the limit.
        for _ in 0..2 {
            let outcome = env
                .runner
                .run(&step, &env.job_ctx, &CancellationToken::new())
                .await
                .unwrap();
            assert_eq!(outcome.batch_status, BatchStatus::Failed);
        }

        let err = env
            .runner
            .run(&step, &env.job_ctx, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StepRunError::StartLimitExceeded { limit: 2, .. }));
        assert_eq!(invocations.load(Ordering::SeqCst), 2, "third run never executed");
    }

    // -----------------------------------------------------------------------
    // Chunk dispatch
    // -----------------------------------------------------------------------

    /// Reads `start..=end` from properties, resuming from its checkpoint.
    struct RangeReader {
        position: u64,
        end: u64,
    }

    impl ItemReader for RangeReader {
        fn open(&mut self, checkpoint: Option<Value>) -> Result<(), BatchError> {
            if let Some(cp) = checkpoint.and_then(|cp| cp.as_u64()) {
                self.position = cp;
            }
            Ok(())
        }

        fn read_item(&mut self) -> Result<Option<Value>, BatchError> {
            if self.position >= self.end {
                return Ok(None);
            }
            self.position += 1;
            Ok(Some(Value::from(self.position)))
        }

        fn checkpoint_info(&mut self) -> Result<Option<Value>, BatchError> {
            Ok(Some(Value::from(self.position)))
        }
    }

    struct SharedSinkWriter {
        sink: Arc<Mutex<Vec<u64>>>,
    }

    impl ItemWriter for SharedSinkWriter {
        fn open(&mut self, _checkpoint: Option<Value>) -> Result<(), BatchError> {
            Ok(())
        }

        fn write_items(&mut self, items: &[Value]) -> Result<(), BatchError> {
            self.sink
                .lock()
                .unwrap()
                .extend(items.iter().filter_map(Value::as_u64));
            Ok(())
        }
    }

    fn range_registry(sink: &Arc<Mutex<Vec<u64>>>) -> ArtifactRegistry {
        let mut registry = ArtifactRegistry::new();
        registry.register("range-reader", |props: &Properties| {
            let start: u64 = props.get("start").and_then(|v| v.parse().ok()).unwrap_or(1);
            let end: u64 = props.get("end").and_then(|v| v.parse().ok()).unwrap_or(0);
            Artifact::Reader(Box::new(RangeReader {
                position: start - 1,
                end,
            }))
        });
        {
            let sink = Arc::clone(sink);
            registry.register("shared-sink", move |_props| {
                Artifact::Writer(Box::new(SharedSinkWriter {
                    sink: Arc::clone(&sink),
                }))
            });
        }
        registry
    }

    fn chunk_step(id: &str, end: u64) -> StepDefinition {
        let mut reader = ArtifactRef::named("range-reader");
        reader.properties.insert("end".to_string(), end.to_string());
        StepDefinition {
            id: id.to_string(),
            start_limit: 0,
            allow_start_if_complete: false,
            payload: StepPayload::Chunk(kiln_types::job::ChunkConfig {
                reader,
                processor: None,
                writer: ArtifactRef::named("shared-sink"),
                item_count: 5,
                time_limit_secs: 0,
                checkpoint_algorithm: None,
                skip_limit: None,
                retry_limit: None,
                skippable_exceptions: vec![],
                retryable_exceptions: vec![],
                no_rollback_exceptions: vec![],
            }),
            partition: None,
            listeners: vec![],
            transitions: vec![],
        }
    }

    #[tokio::test]
    async fn test_chunk_step_completes_and_clears_checkpoint() {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let env = env_with(range_registry(&sink));
        let step = chunk_step("load", 12);

        let outcome = env
            .runner
            .run(&step, &env.job_ctx, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.batch_status, BatchStatus::Completed);
        assert_eq!(*sink.lock().unwrap(), (1..=12).collect::<Vec<_>>());
        assert_eq!(outcome.execution.metrics.read_count, 12);

        let checkpoint = env
            .runner
            .checkpoint
            .repo()
            .get_checkpoint(&env.job_ctx.instance_id, "load", None)
            .await
            .unwrap();
        assert!(checkpoint.is_none(), "completion clears the checkpoint");
    }

    // -----------------------------------------------------------------------
    // Partitions
    // -----------------------------------------------------------------------

    /// Analyzer summing partition exit statuses into the step exit status.
    struct CountingAnalyzer {
        completed: u32,
    }

    impl PartitionAnalyzer for CountingAnalyzer {
        fn analyze_status(
            &mut self,
            ctx: &mut StepContext,
            batch_status: BatchStatus,
            _exit_status: &str,
        ) -> Result<(), BatchError> {
            if batch_status == BatchStatus::Completed {
                self.completed += 1;
            }
            ctx.set_exit_status(format!("PARTITIONS_OK_{}", self.completed));
            Ok(())
        }
    }

    fn partitioned_step(sink_count: u32) -> StepDefinition {
        let mut step = chunk_step("fanout", 0);
        step.partition = Some(PartitionConfig {
            source: PartitionSource::Plan(PartitionPlan {
                count: sink_count,
                properties: (0..sink_count)
                    .map(|i| {
                        Properties::from([
                            ("start".to_string(), (i * 10 + 1).to_string()),
                            ("end".to_string(), ((i + 1) * 10).to_string()),
                        ])
                    })
                    .collect(),
            }),
            collector: None,
            analyzer: Some(ArtifactRef::named("totals")),
        });
        step
    }

    fn partition_registry(sink: &Arc<Mutex<Vec<u64>>>) -> ArtifactRegistry {
        let mut registry = range_registry(sink);
        registry.register("totals", |_props| {
            Artifact::PartitionAnalyzer(Box::new(CountingAnalyzer { completed: 0 }))
        });
        registry
    }

    #[tokio::test]
    async fn test_partitions_run_concurrently_and_aggregate() {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let env = env_with(partition_registry(&sink));
        let step = partitioned_step(3);

        let outcome = env
            .runner
            .run(&step, &env.job_ctx, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.batch_status, BatchStatus::Completed);
        assert_eq!(outcome.exit_status, "PARTITIONS_OK_3");

        let mut written = sink.lock().unwrap().clone();
        written.sort_unstable();
        assert_eq!(written, (1..=30).collect::<Vec<_>>());
        assert_eq!(outcome.execution.metrics.read_count, 30, "metrics merged");
    }

    #[tokio::test]
    async fn test_partition_restart_reruns_only_incomplete() {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let mut registry = partition_registry(&sink);

        // Partition 1's reader fails on the first run.
        let failures = Arc::new(AtomicU32::new(1));
        {
            let failures = Arc::clone(&failures);
            registry.register("range-reader", move |props: &Properties| {
                let start: u64 = props.get("start").and_then(|v| v.parse().ok()).unwrap_or(1);
                let end: u64 = props.get("end").and_then(|v| v.parse().ok()).unwrap_or(0);
                if start == 11 && failures.load(Ordering::SeqCst) > 0 {
                    failures.fetch_sub(1, Ordering::SeqCst);
                    return Artifact::Reader(Box::new(FailingReader));
                }
                Artifact::Reader(Box::new(RangeReader {
                    position: start - 1,
                    end,
                }))
            });
        }
        struct FailingReader;
        impl ItemReader for FailingReader {
            fn open(&mut self, _checkpoint: Option<Value>) -> Result<(), BatchError> {
                Ok(())
            }
            fn read_item(&mut self) -> Result<Option<Value>, BatchError> {
                Err(BatchError::tagged("app.io", "partition source down"))
            }
        }

        let env = env_with(registry);
        let step = partitioned_step(3);

        let first = env
            .runner
            .run(&step, &env.job_ctx, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(first.batch_status, BatchStatus::Failed);

        let after_first = sink.lock().unwrap().len();
        assert_eq!(after_first, 20, "partitions 0 and 2 completed");

        // Restart: only partition 1 re-runs.
        let second = env
            .runner
            .run(&step, &env.job_ctx, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(second.batch_status, BatchStatus::Completed);

        let mut written = sink.lock().unwrap().clone();
        written.sort_unstable();
        assert_eq!(written, (1..=30).collect::<Vec<_>>(), "no partition ran twice");
    }

    #[tokio::test]
    async fn test_persistent_user_data_survives_restart() {
        struct CursorBatchlet;
        impl Batchlet for CursorBatchlet {
            fn process(
                &mut self,
                ctx: &mut StepContext,
                _stop: &StopSignal,
            ) -> Result<Option<String>, BatchError> {
                let cursor = ctx
                    .persistent_user_data()
                    .and_then(|data| data["cursor"].as_u64());
                match cursor {
                    None => {
                        ctx.set_persistent_user_data(serde_json::json!({"cursor": 42}));
                        Err(BatchError::tagged("app.task", "first run fails"))
                    }
                    Some(cursor) => Ok(Some(format!("RESUMED_AT_{cursor}"))),
                }
            }
        }

        let mut registry = ArtifactRegistry::new();
        registry.register("cursor", |_props| {
            Artifact::Batchlet(Box::new(CursorBatchlet))
        });
        let env = env_with(registry);
        let step = batchlet_step("work", "cursor");

        let first = env
            .runner
            .run(&step, &env.job_ctx, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(first.batch_status, BatchStatus::Failed);

        let second = env
            .runner
            .run(&step, &env.job_ctx, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(second.batch_status, BatchStatus::Completed);
        assert_eq!(second.exit_status, "RESUMED_AT_42");
    }

    #[tokio::test]
    async fn test_unknown_artifact_fails_step_not_job() {
        let env = env_with(ArtifactRegistry::new());
        let outcome = env
            .runner
            .run(&batchlet_step("work", "ghost"), &env.job_ctx, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.batch_status, BatchStatus::Failed);
    }
}
