//! Job repository trait definition.
//!
//! Defines the storage interface for job instances, executions, step
//! executions, partition executions, and chunk checkpoints. Records must
//! survive process restart for the restart-from-checkpoint contract to hold;
//! the in-memory implementation trades that away for tests and embedding.
//!
//! Uses native async fn in traits (Rust 2024 edition, no async_trait macro).

use uuid::Uuid;

use kiln_types::error::RepositoryError;
use kiln_types::execution::{
    ChunkCheckpoint, JobExecution, JobInstance, PartitionExecution, StepExecution,
};

/// Repository trait for batch runtime persistence.
///
/// Covers four entity families:
/// - **Instances:** logical job identities, created once per first start.
/// - **Job executions:** one record per start/restart attempt.
/// - **Step executions:** one record per actual step run (replayed steps do
///   not create records), plus partition-scoped variants.
/// - **Chunk checkpoints:** durable chunk progress keyed by
///   (instance, step, partition).
pub trait JobRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Instances
    // -----------------------------------------------------------------------

    fn create_instance(
        &self,
        instance: &JobInstance,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_instance(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<JobInstance>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Job executions
    // -----------------------------------------------------------------------

    fn create_job_execution(
        &self,
        execution: &JobExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Persist status, exit status, timestamps, and restart position.
    fn update_job_execution(
        &self,
        execution: &JobExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_job_execution(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<JobExecution>, RepositoryError>> + Send;

    /// All executions of an instance, ordered by create time ascending.
    fn list_job_executions(
        &self,
        instance_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<JobExecution>, RepositoryError>> + Send;

    /// The most recent execution of an instance, if any.
    fn latest_job_execution(
        &self,
        instance_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<JobExecution>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Step executions
    // -----------------------------------------------------------------------

    fn create_step_execution(
        &self,
        step: &StepExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn update_step_execution(
        &self,
        step: &StepExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Step executions of one job execution, ordered by start time ascending.
    fn list_step_executions(
        &self,
        job_execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<StepExecution>, RepositoryError>> + Send;

    /// The most recent execution of a step across the whole instance.
    fn latest_step_execution(
        &self,
        instance_id: &Uuid,
        step_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<StepExecution>, RepositoryError>> + Send;

    /// How many times a step actually started across the instance (replayed
    /// steps create no record and therefore do not count).
    fn count_step_starts(
        &self,
        instance_id: &Uuid,
        step_id: &str,
    ) -> impl std::future::Future<Output = Result<u32, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Partition executions
    // -----------------------------------------------------------------------

    fn create_partition_execution(
        &self,
        partition: &PartitionExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn update_partition_execution(
        &self,
        partition: &PartitionExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Latest partition record per partition index for (instance, step).
    fn latest_partition_executions(
        &self,
        instance_id: &Uuid,
        step_id: &str,
    ) -> impl std::future::Future<Output = Result<Vec<PartitionExecution>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Chunk checkpoints
    // -----------------------------------------------------------------------

    /// Upsert the checkpoint for (instance, step, partition).
    fn save_checkpoint(
        &self,
        checkpoint: &ChunkCheckpoint,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_checkpoint(
        &self,
        instance_id: &Uuid,
        step_id: &str,
        partition: Option<u32>,
    ) -> impl std::future::Future<Output = Result<Option<ChunkCheckpoint>, RepositoryError>> + Send;

    /// Remove the checkpoint once the step completes, so a later re-run via
    /// allow-start-if-complete begins from the top of the data.
    fn clear_checkpoint(
        &self,
        instance_id: &Uuid,
        step_id: &str,
        partition: Option<u32>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}
