//! In-memory job repository.
//!
//! Backs the engines for embedded use and tests. Does not survive process
//! restart; within one process it honors the full repository contract,
//! including restart-from-checkpoint across executions of an instance.

use dashmap::DashMap;
use uuid::Uuid;

use kiln_types::error::RepositoryError;
use kiln_types::execution::{
    ChunkCheckpoint, JobExecution, JobInstance, PartitionExecution, StepExecution,
};

use super::job::JobRepository;

/// Checkpoint key: (instance, step, partition or u32::MAX for none).
type CheckpointKey = (Uuid, String, u32);

fn partition_key(partition: Option<u32>) -> u32 {
    partition.unwrap_or(u32::MAX)
}

/// Thread-safe in-memory implementation of `JobRepository`.
#[derive(Default)]
pub struct InMemoryJobRepository {
    instances: DashMap<Uuid, JobInstance>,
    job_executions: DashMap<Uuid, JobExecution>,
    step_executions: DashMap<Uuid, StepExecution>,
    partition_executions: DashMap<Uuid, PartitionExecution>,
    checkpoints: DashMap<CheckpointKey, ChunkCheckpoint>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobRepository for InMemoryJobRepository {
    async fn create_instance(&self, instance: &JobInstance) -> Result<(), RepositoryError> {
        if self.instances.contains_key(&instance.id) {
            return Err(RepositoryError::Conflict(format!(
                "instance {} already exists",
                instance.id
            )));
        }
        self.instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn get_instance(&self, id: &Uuid) -> Result<Option<JobInstance>, RepositoryError> {
        Ok(self.instances.get(id).map(|entry| entry.clone()))
    }

    async fn create_job_execution(&self, execution: &JobExecution) -> Result<(), RepositoryError> {
        if self.job_executions.contains_key(&execution.id) {
            return Err(RepositoryError::Conflict(format!(
                "job execution {} already exists",
                execution.id
            )));
        }
        self.job_executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn update_job_execution(&self, execution: &JobExecution) -> Result<(), RepositoryError> {
        if !self.job_executions.contains_key(&execution.id) {
            return Err(RepositoryError::NotFound);
        }
        self.job_executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn get_job_execution(&self, id: &Uuid) -> Result<Option<JobExecution>, RepositoryError> {
        Ok(self.job_executions.get(id).map(|entry| entry.clone()))
    }

    async fn list_job_executions(
        &self,
        instance_id: &Uuid,
    ) -> Result<Vec<JobExecution>, RepositoryError> {
        let mut executions: Vec<JobExecution> = self
            .job_executions
            .iter()
            .filter(|entry| entry.instance_id == *instance_id)
            .map(|entry| entry.clone())
            .collect();
        executions.sort_by_key(|execution| execution.create_time);
        Ok(executions)
    }

    async fn latest_job_execution(
        &self,
        instance_id: &Uuid,
    ) -> Result<Option<JobExecution>, RepositoryError> {
        Ok(self
            .list_job_executions(instance_id)
            .await?
            .into_iter()
            .last())
    }

    async fn create_step_execution(&self, step: &StepExecution) -> Result<(), RepositoryError> {
        if self.step_executions.contains_key(&step.id) {
            return Err(RepositoryError::Conflict(format!(
                "step execution {} already exists",
                step.id
            )));
        }
        self.step_executions.insert(step.id, step.clone());
        Ok(())
    }

    async fn update_step_execution(&self, step: &StepExecution) -> Result<(), RepositoryError> {
        if !self.step_executions.contains_key(&step.id) {
            return Err(RepositoryError::NotFound);
        }
        self.step_executions.insert(step.id, step.clone());
        Ok(())
    }

    async fn list_step_executions(
        &self,
        job_execution_id: &Uuid,
    ) -> Result<Vec<StepExecution>, RepositoryError> {
        let mut steps: Vec<StepExecution> = self
            .step_executions
            .iter()
            .filter(|entry| entry.job_execution_id == *job_execution_id)
            .map(|entry| entry.clone())
            .collect();
        steps.sort_by_key(|step| (step.start_time, step.id));
        Ok(steps)
    }

    async fn latest_step_execution(
        &self,
        instance_id: &Uuid,
        step_id: &str,
    ) -> Result<Option<StepExecution>, RepositoryError> {
        let mut steps: Vec<StepExecution> = self
            .step_executions
            .iter()
            .filter(|entry| entry.instance_id == *instance_id && entry.step_id == step_id)
            .map(|entry| entry.clone())
            .collect();
        steps.sort_by_key(|step| (step.start_time, step.id));
        Ok(steps.into_iter().last())
    }

    async fn count_step_starts(
        &self,
        instance_id: &Uuid,
        step_id: &str,
    ) -> Result<u32, RepositoryError> {
        let count = self
            .step_executions
            .iter()
            .filter(|entry| entry.instance_id == *instance_id && entry.step_id == step_id)
            .count();
        Ok(count as u32)
    }

    async fn create_partition_execution(
        &self,
        partition: &PartitionExecution,
    ) -> Result<(), RepositoryError> {
        self.partition_executions
            .insert(partition.id, partition.clone());
        Ok(())
    }

    async fn update_partition_execution(
        &self,
        partition: &PartitionExecution,
    ) -> Result<(), RepositoryError> {
        if !self.partition_executions.contains_key(&partition.id) {
            return Err(RepositoryError::NotFound);
        }
        self.partition_executions
            .insert(partition.id, partition.clone());
        Ok(())
    }

    async fn latest_partition_executions(
        &self,
        instance_id: &Uuid,
        step_id: &str,
    ) -> Result<Vec<PartitionExecution>, RepositoryError> {
        let mut partitions: Vec<PartitionExecution> = self
            .partition_executions
            .iter()
            .filter(|entry| entry.instance_id == *instance_id && entry.step_id == step_id)
            .map(|entry| entry.clone())
            .collect();
        // UUIDv7 ids are time-ordered; the last record per index is latest.
        partitions.sort_by_key(|partition| partition.id);
        let mut latest: Vec<PartitionExecution> = Vec::new();
        for partition in partitions {
            if let Some(existing) = latest
                .iter_mut()
                .find(|existing| existing.partition == partition.partition)
            {
                *existing = partition;
            } else {
                latest.push(partition);
            }
        }
        latest.sort_by_key(|partition| partition.partition);
        Ok(latest)
    }

    async fn save_checkpoint(&self, checkpoint: &ChunkCheckpoint) -> Result<(), RepositoryError> {
        let key = (
            checkpoint.instance_id,
            checkpoint.step_id.clone(),
            partition_key(checkpoint.partition),
        );
        self.checkpoints.insert(key, checkpoint.clone());
        Ok(())
    }

    async fn get_checkpoint(
        &self,
        instance_id: &Uuid,
        step_id: &str,
        partition: Option<u32>,
    ) -> Result<Option<ChunkCheckpoint>, RepositoryError> {
        let key = (*instance_id, step_id.to_string(), partition_key(partition));
        Ok(self.checkpoints.get(&key).map(|entry| entry.clone()))
    }

    async fn clear_checkpoint(
        &self,
        instance_id: &Uuid,
        step_id: &str,
        partition: Option<u32>,
    ) -> Result<(), RepositoryError> {
        let key = (*instance_id, step_id.to_string(), partition_key(partition));
        self.checkpoints.remove(&key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
