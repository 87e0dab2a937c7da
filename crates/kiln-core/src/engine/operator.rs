//! Job operator: the top-level lifecycle surface.
//!
//! Owns JobExecution creation and status transitions. `start` validates the
//! definition synchronously, creates the instance and execution records, and
//! runs the graph walk on its own tokio task; `restart` resumes the latest
//! execution of an instance from its recorded position; `stop` requests a
//! cooperative stop honored at the next safe boundary; `abandon` retires a
//! stopped or failed execution. Query methods return entity snapshots.
//!
//! At most one execution of a JobInstance is active at a time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use kiln_types::execution::{BatchStatus, JobExecution, JobInstance, StepExecution};
use kiln_types::job::JobDefinition;

use crate::registry::ArtifactRegistry;
use crate::repository::job::JobRepository;

use super::checkpoint::CheckpointManager;
use super::definition::{self, DefinitionError};
use super::graph::JobRunner;
use super::transaction::{LocalTransactionBoundary, TransactionBoundary};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced synchronously from operator calls.
///
/// Anything that happens after an execution is under way is reported through
/// its status and exit status instead.
#[derive(Debug, Error)]
pub enum OperatorError {
    /// The definition failed structural or graph validation.
    #[error(transparent)]
    InvalidDefinition(#[from] DefinitionError),

    /// The definition references an artifact the registry does not know.
    #[error("unknown artifact '{0}' referenced by the job definition")]
    UnknownArtifact(String),

    #[error("job execution not found: {0}")]
    NotFound(Uuid),

    /// Restart was asked for an execution superseded by a newer one.
    #[error("execution {0} is not the most recent for its job instance")]
    NotMostRecent(Uuid),

    /// The execution is in a status that does not admit a restart.
    #[error("execution {execution_id} is not restartable from status {status}")]
    NotRestartable {
        execution_id: Uuid,
        status: BatchStatus,
    },

    /// The definition disables restarts entirely.
    #[error("job '{0}' is not restartable by definition")]
    RestartDisabled(String),

    /// The instance already has an execution in flight.
    #[error("job instance {0} already has an active execution")]
    InstanceBusy(Uuid),

    /// Stop was requested for an execution that is not running here.
    #[error("execution {0} is not running")]
    NotRunning(Uuid),

    /// Abandon was requested from a non-terminal or already-abandoned status.
    #[error("execution {execution_id} cannot be abandoned from status {status}")]
    NotAbandonable {
        execution_id: Uuid,
        status: BatchStatus,
    },

    #[error("repository error: {0}")]
    Repository(String),
}

// ---------------------------------------------------------------------------
// JobOperator
// ---------------------------------------------------------------------------

struct RunningExecution {
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

/// The operator surface over one repository and artifact registry.
pub struct JobOperator<R: JobRepository> {
    checkpoint: Arc<CheckpointManager<R>>,
    registry: Arc<ArtifactRegistry>,
    runner: JobRunner<R>,
    running: Arc<DashMap<Uuid, RunningExecution>>,
    active_instances: Arc<DashMap<Uuid, Uuid>>,
}

impl<R: JobRepository + 'static> JobOperator<R> {
    /// Create an operator with the default local (no-op) transaction
    /// boundary.
    pub fn new(repo: R, registry: ArtifactRegistry) -> Self {
        Self::with_transaction_boundary(repo, registry, Arc::new(LocalTransactionBoundary))
    }

    /// Create an operator with an environment-supplied transaction boundary.
    pub fn with_transaction_boundary(
        repo: R,
        registry: ArtifactRegistry,
        txn: Arc<dyn TransactionBoundary>,
    ) -> Self {
        let checkpoint = Arc::new(CheckpointManager::new(repo));
        let registry = Arc::new(registry);
        let runner = JobRunner::new(Arc::clone(&checkpoint), Arc::clone(&registry), txn);
        Self {
            checkpoint,
            registry,
            runner,
            running: Arc::new(DashMap::new()),
            active_instances: Arc::new(DashMap::new()),
        }
    }

    /// Access the underlying repository.
    pub fn repo(&self) -> &R {
        self.checkpoint.repo()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start a new job: validates the definition, creates a fresh
    /// JobInstance and JobExecution, and runs the walk asynchronously.
    ///
    /// Returns the new execution's id; callers observe progress through the
    /// query surface or `wait_for_completion`.
    pub async fn start(
        &self,
        definition: Arc<JobDefinition>,
        parameters: HashMap<String, String>,
    ) -> Result<Uuid, OperatorError> {
        self.validate(&definition)?;

        let repo = self.checkpoint.repo();
        let instance = JobInstance {
            id: Uuid::now_v7(),
            job_name: definition.name.clone(),
            create_time: Utc::now(),
        };
        repo.create_instance(&instance)
            .await
            .map_err(|e| OperatorError::Repository(e.to_string()))?;

        let execution = JobExecution {
            id: Uuid::now_v7(),
            instance_id: instance.id,
            job_name: definition.name.clone(),
            batch_status: BatchStatus::Starting,
            exit_status: None,
            parameters,
            restart_position: None,
            create_time: Utc::now(),
            start_time: None,
            end_time: None,
        };
        repo.create_job_execution(&execution)
            .await
            .map_err(|e| OperatorError::Repository(e.to_string()))?;

        tracing::info!(
            job = definition.name.as_str(),
            instance_id = %instance.id,
            execution_id = %execution.id,
            "job start accepted"
        );

        let execution_id = execution.id;
        self.spawn_run(definition, execution, None);
        Ok(execution_id)
    }

    /// Restart the given execution under the same JobInstance.
    ///
    /// Fails when the execution is not the instance's most recent, when its
    /// status is not restartable, or when the instance is still active.
    /// Previously completed, non-reenterable steps replay from their stored
    /// StepExecutions; a recorded stop restart position is honored.
    pub async fn restart(
        &self,
        execution_id: Uuid,
        definition: Arc<JobDefinition>,
        parameters: HashMap<String, String>,
    ) -> Result<Uuid, OperatorError> {
        self.validate(&definition)?;

        let repo = self.checkpoint.repo();
        let prior = repo
            .get_job_execution(&execution_id)
            .await
            .map_err(|e| OperatorError::Repository(e.to_string()))?
            .ok_or(OperatorError::NotFound(execution_id))?;

        if prior.job_name != definition.name {
            return Err(OperatorError::InvalidDefinition(DefinitionError::Validation(
                format!(
                    "definition '{}' does not match execution's job '{}'",
                    definition.name, prior.job_name
                ),
            )));
        }
        if !definition.restartable {
            return Err(OperatorError::RestartDisabled(definition.name.clone()));
        }

        let latest = repo
            .latest_job_execution(&prior.instance_id)
            .await
            .map_err(|e| OperatorError::Repository(e.to_string()))?
            .ok_or(OperatorError::NotFound(execution_id))?;
        if latest.id != execution_id {
            return Err(OperatorError::NotMostRecent(execution_id));
        }
        if !prior.batch_status.is_restartable() {
            return Err(OperatorError::NotRestartable {
                execution_id,
                status: prior.batch_status,
            });
        }
        if self.active_instances.contains_key(&prior.instance_id) {
            return Err(OperatorError::InstanceBusy(prior.instance_id));
        }

        let execution = JobExecution {
            id: Uuid::now_v7(),
            instance_id: prior.instance_id,
            job_name: prior.job_name.clone(),
            batch_status: BatchStatus::Starting,
            exit_status: None,
            parameters,
            restart_position: None,
            create_time: Utc::now(),
            start_time: None,
            end_time: None,
        };
        repo.create_job_execution(&execution)
            .await
            .map_err(|e| OperatorError::Repository(e.to_string()))?;

        tracing::info!(
            job = prior.job_name.as_str(),
            prior_execution_id = %execution_id,
            execution_id = %execution.id,
            restart_at = ?prior.restart_position,
            "job restart accepted"
        );

        let new_id = execution.id;
        self.spawn_run(definition, execution, prior.restart_position);
        Ok(new_id)
    }

    /// Request a cooperative stop; honored at the next chunk boundary or
    /// batchlet completion.
    pub async fn stop(&self, execution_id: Uuid) -> Result<(), OperatorError> {
        let entry = self
            .running
            .get(&execution_id)
            .ok_or(OperatorError::NotRunning(execution_id))?;
        let cancel = entry.cancel.clone();
        drop(entry);

        let repo = self.checkpoint.repo();
        if let Some(mut execution) = repo
            .get_job_execution(&execution_id)
            .await
            .map_err(|e| OperatorError::Repository(e.to_string()))?
        {
            if matches!(
                execution.batch_status,
                BatchStatus::Starting | BatchStatus::Started
            ) {
                execution.batch_status = BatchStatus::Stopping;
                repo.update_job_execution(&execution)
                    .await
                    .map_err(|e| OperatorError::Repository(e.to_string()))?;
            }
        }

        tracing::info!(execution_id = %execution_id, "stop requested");
        cancel.cancel();
        Ok(())
    }

    /// Mark a stopped or failed execution ABANDONED (terminal,
    /// non-restartable).
    pub async fn abandon(&self, execution_id: Uuid) -> Result<(), OperatorError> {
        let repo = self.checkpoint.repo();
        let mut execution = repo
            .get_job_execution(&execution_id)
            .await
            .map_err(|e| OperatorError::Repository(e.to_string()))?
            .ok_or(OperatorError::NotFound(execution_id))?;

        if !matches!(
            execution.batch_status,
            BatchStatus::Stopped | BatchStatus::Failed
        ) {
            return Err(OperatorError::NotAbandonable {
                execution_id,
                status: execution.batch_status,
            });
        }

        execution.batch_status = BatchStatus::Abandoned;
        repo.update_job_execution(&execution)
            .await
            .map_err(|e| OperatorError::Repository(e.to_string()))?;
        tracing::info!(execution_id = %execution_id, "execution abandoned");
        Ok(())
    }

    /// Block until the execution reaches a terminal status and return its
    /// final snapshot.
    pub async fn wait_for_completion(
        &self,
        execution_id: Uuid,
    ) -> Result<JobExecution, OperatorError> {
        loop {
            if let Some(entry) = self.running.get(&execution_id) {
                let mut done = entry.done.clone();
                drop(entry);
                // The sender flips to true after the terminal status is
                // persisted; a closed channel means the task is gone too.
                let _ = done.wait_for(|finished| *finished).await;
            }

            let execution = self
                .checkpoint
                .repo()
                .get_job_execution(&execution_id)
                .await
                .map_err(|e| OperatorError::Repository(e.to_string()))?
                .ok_or(OperatorError::NotFound(execution_id))?;
            if execution.batch_status.is_terminal() {
                return Ok(execution);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Start a job and block until it finishes.
    pub async fn start_and_wait(
        &self,
        definition: Arc<JobDefinition>,
        parameters: HashMap<String, String>,
    ) -> Result<JobExecution, OperatorError> {
        let execution_id = self.start(definition, parameters).await?;
        self.wait_for_completion(execution_id).await
    }

    /// Restart a job and block until it finishes.
    pub async fn restart_and_wait(
        &self,
        execution_id: Uuid,
        definition: Arc<JobDefinition>,
        parameters: HashMap<String, String>,
    ) -> Result<JobExecution, OperatorError> {
        let new_id = self.restart(execution_id, definition, parameters).await?;
        self.wait_for_completion(new_id).await
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// The JobInstance owning the given execution.
    pub async fn get_job_instance(
        &self,
        execution_id: Uuid,
    ) -> Result<JobInstance, OperatorError> {
        let repo = self.checkpoint.repo();
        let execution = repo
            .get_job_execution(&execution_id)
            .await
            .map_err(|e| OperatorError::Repository(e.to_string()))?
            .ok_or(OperatorError::NotFound(execution_id))?;
        repo.get_instance(&execution.instance_id)
            .await
            .map_err(|e| OperatorError::Repository(e.to_string()))?
            .ok_or(OperatorError::NotFound(execution.instance_id))
    }

    pub async fn get_job_execution(
        &self,
        execution_id: Uuid,
    ) -> Result<JobExecution, OperatorError> {
        self.checkpoint
            .repo()
            .get_job_execution(&execution_id)
            .await
            .map_err(|e| OperatorError::Repository(e.to_string()))?
            .ok_or(OperatorError::NotFound(execution_id))
    }

    /// All executions of an instance, oldest first.
    pub async fn get_job_executions(
        &self,
        instance_id: Uuid,
    ) -> Result<Vec<JobExecution>, OperatorError> {
        self.checkpoint
            .repo()
            .list_job_executions(&instance_id)
            .await
            .map_err(|e| OperatorError::Repository(e.to_string()))
    }

    /// Step executions recorded under one job execution.
    pub async fn get_step_executions(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<StepExecution>, OperatorError> {
        self.checkpoint
            .repo()
            .list_step_executions(&execution_id)
            .await
            .map_err(|e| OperatorError::Repository(e.to_string()))
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Definition validation plus registry resolution of every referenced
    /// artifact name; both are start-time configuration errors.
    fn validate(&self, def: &JobDefinition) -> Result<(), OperatorError> {
        definition::validate_definition(def)?;
        for reference in definition::artifact_refs(def) {
            if !self.registry.contains(&reference.name) {
                return Err(OperatorError::UnknownArtifact(reference.name.clone()));
            }
        }
        Ok(())
    }

    fn spawn_run(
        &self,
        definition: Arc<JobDefinition>,
        execution: JobExecution,
        start_at: Option<String>,
    ) {
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        self.running.insert(
            execution.id,
            RunningExecution {
                cancel: cancel.clone(),
                done: done_rx,
            },
        );
        self.active_instances
            .insert(execution.instance_id, execution.id);

        let runner = self.runner.clone();
        let running = Arc::clone(&self.running);
        let active_instances = Arc::clone(&self.active_instances);
        tokio::spawn(async move {
            let finished = runner.run_job(definition, execution, start_at, cancel).await;
            active_instances.remove(&finished.instance_id);
            running.remove(&finished.id);
            let _ = done_tx.send(true);
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
