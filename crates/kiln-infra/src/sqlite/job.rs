//! SQLite job repository implementation.
//!
//! Implements `JobRepository` from `kiln-core` using sqlx with split
//! read/write pools. Statuses are stored as their canonical uppercase
//! names, timestamps as RFC 3339 strings, metrics and user data as JSON
//! blobs. Records survive process restart, which is what makes
//! restart-from-checkpoint work across crashes.

use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use kiln_core::repository::job::JobRepository;
use kiln_types::error::RepositoryError;
use kiln_types::execution::{
    BatchStatus, ChunkCheckpoint, JobExecution, JobInstance, PartitionExecution, StepExecution,
    StepMetrics,
};

use super::pool::DatabasePool;

/// Stored partition index for unpartitioned scopes (primary keys reject
/// NULL).
const NO_PARTITION: i64 = -1;

/// SQLite-backed implementation of `JobRepository`.
pub struct SqliteJobRepository {
    pool: DatabasePool,
}

impl SqliteJobRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Parse helpers
// ---------------------------------------------------------------------------

fn parse_uuid(value: &str) -> Result<Uuid, RepositoryError> {
    Uuid::parse_str(value).map_err(|_| RepositoryError::Query(format!("invalid uuid: '{value}'")))
}

fn parse_datetime(value: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| RepositoryError::Query(format!("invalid timestamp: '{value}'")))
}

fn parse_status(value: &str) -> Result<BatchStatus, RepositoryError> {
    value.parse().map_err(RepositoryError::Query)
}

fn parse_metrics(value: &str) -> Result<StepMetrics, RepositoryError> {
    serde_json::from_str(value)
        .map_err(|e| RepositoryError::Query(format!("invalid metrics JSON: {e}")))
}

fn parse_json_opt(value: Option<&str>) -> Result<Option<serde_json::Value>, RepositoryError> {
    value
        .map(|s| {
            serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid JSON: {e}")))
        })
        .transpose()
}

fn partition_to_db(partition: Option<u32>) -> i64 {
    partition.map_or(NO_PARTITION, i64::from)
}

fn db_error(error: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(error.to_string())
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct JobExecutionRow {
    id: String,
    instance_id: String,
    job_name: String,
    batch_status: String,
    exit_status: Option<String>,
    parameters: String,
    restart_position: Option<String>,
    create_time: String,
    start_time: Option<String>,
    end_time: Option<String>,
}

impl JobExecutionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            instance_id: row.try_get("instance_id")?,
            job_name: row.try_get("job_name")?,
            batch_status: row.try_get("batch_status")?,
            exit_status: row.try_get("exit_status")?,
            parameters: row.try_get("parameters")?,
            restart_position: row.try_get("restart_position")?,
            create_time: row.try_get("create_time")?,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
        })
    }

    fn into_execution(self) -> Result<JobExecution, RepositoryError> {
        Ok(JobExecution {
            id: parse_uuid(&self.id)?,
            instance_id: parse_uuid(&self.instance_id)?,
            job_name: self.job_name,
            batch_status: parse_status(&self.batch_status)?,
            exit_status: self.exit_status,
            parameters: serde_json::from_str(&self.parameters)
                .map_err(|e| RepositoryError::Query(format!("invalid parameters JSON: {e}")))?,
            restart_position: self.restart_position,
            create_time: parse_datetime(&self.create_time)?,
            start_time: self.start_time.as_deref().map(parse_datetime).transpose()?,
            end_time: self.end_time.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

struct StepExecutionRow {
    id: String,
    job_execution_id: String,
    instance_id: String,
    step_id: String,
    batch_status: String,
    exit_status: Option<String>,
    metrics: String,
    persistent_user_data: Option<String>,
    start_time: Option<String>,
    end_time: Option<String>,
}

impl StepExecutionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            job_execution_id: row.try_get("job_execution_id")?,
            instance_id: row.try_get("instance_id")?,
            step_id: row.try_get("step_id")?,
            batch_status: row.try_get("batch_status")?,
            exit_status: row.try_get("exit_status")?,
            metrics: row.try_get("metrics")?,
            persistent_user_data: row.try_get("persistent_user_data")?,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
        })
    }

    fn into_step(self) -> Result<StepExecution, RepositoryError> {
        Ok(StepExecution {
            id: parse_uuid(&self.id)?,
            job_execution_id: parse_uuid(&self.job_execution_id)?,
            instance_id: parse_uuid(&self.instance_id)?,
            step_id: self.step_id,
            batch_status: parse_status(&self.batch_status)?,
            exit_status: self.exit_status,
            metrics: parse_metrics(&self.metrics)?,
            persistent_user_data: parse_json_opt(self.persistent_user_data.as_deref())?,
            start_time: self.start_time.as_deref().map(parse_datetime).transpose()?,
            end_time: self.end_time.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

struct PartitionExecutionRow {
    id: String,
    step_execution_id: String,
    instance_id: String,
    step_id: String,
    partition_index: i64,
    batch_status: String,
    exit_status: Option<String>,
    metrics: String,
    persistent_user_data: Option<String>,
}

impl PartitionExecutionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            step_execution_id: row.try_get("step_execution_id")?,
            instance_id: row.try_get("instance_id")?,
            step_id: row.try_get("step_id")?,
            partition_index: row.try_get("partition_index")?,
            batch_status: row.try_get("batch_status")?,
            exit_status: row.try_get("exit_status")?,
            metrics: row.try_get("metrics")?,
            persistent_user_data: row.try_get("persistent_user_data")?,
        })
    }

    fn into_partition(self) -> Result<PartitionExecution, RepositoryError> {
        Ok(PartitionExecution {
            id: parse_uuid(&self.id)?,
            step_execution_id: parse_uuid(&self.step_execution_id)?,
            instance_id: parse_uuid(&self.instance_id)?,
            step_id: self.step_id,
            partition: self.partition_index as u32,
            batch_status: parse_status(&self.batch_status)?,
            exit_status: self.exit_status,
            metrics: parse_metrics(&self.metrics)?,
            persistent_user_data: parse_json_opt(self.persistent_user_data.as_deref())?,
        })
    }
}

// ---------------------------------------------------------------------------
// JobRepository implementation
// ---------------------------------------------------------------------------

impl JobRepository for SqliteJobRepository {
    async fn create_instance(&self, instance: &JobInstance) -> Result<(), RepositoryError> {
        sqlx::query("INSERT INTO job_instances (id, job_name, create_time) VALUES (?, ?, ?)")
            .bind(instance.id.to_string())
            .bind(&instance.job_name)
            .bind(instance.create_time.to_rfc3339())
            .execute(&self.pool.writer)
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn get_instance(&self, id: &Uuid) -> Result<Option<JobInstance>, RepositoryError> {
        let row = sqlx::query("SELECT id, job_name, create_time FROM job_instances WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(db_error)?;

        row.map(|row| -> Result<JobInstance, RepositoryError> {
            let id: String = row.try_get("id").map_err(db_error)?;
            let job_name: String = row.try_get("job_name").map_err(db_error)?;
            let create_time: String = row.try_get("create_time").map_err(db_error)?;
            Ok(JobInstance {
                id: parse_uuid(&id)?,
                job_name,
                create_time: parse_datetime(&create_time)?,
            })
        })
        .transpose()
    }

    async fn create_job_execution(&self, execution: &JobExecution) -> Result<(), RepositoryError> {
        let parameters = serde_json::to_string(&execution.parameters)
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        sqlx::query(
            "INSERT INTO job_executions \
             (id, instance_id, job_name, batch_status, exit_status, parameters, \
              restart_position, create_time, start_time, end_time) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(execution.id.to_string())
        .bind(execution.instance_id.to_string())
        .bind(&execution.job_name)
        .bind(execution.batch_status.as_str())
        .bind(&execution.exit_status)
        .bind(parameters)
        .bind(&execution.restart_position)
        .bind(execution.create_time.to_rfc3339())
        .bind(execution.start_time.map(|t| t.to_rfc3339()))
        .bind(execution.end_time.map(|t| t.to_rfc3339()))
        .execute(&self.pool.writer)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn update_job_execution(&self, execution: &JobExecution) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE job_executions SET batch_status = ?, exit_status = ?, \
             restart_position = ?, start_time = ?, end_time = ? WHERE id = ?",
        )
        .bind(execution.batch_status.as_str())
        .bind(&execution.exit_status)
        .bind(&execution.restart_position)
        .bind(execution.start_time.map(|t| t.to_rfc3339()))
        .bind(execution.end_time.map(|t| t.to_rfc3339()))
        .bind(execution.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn get_job_execution(&self, id: &Uuid) -> Result<Option<JobExecution>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM job_executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(db_error)?;

        row.map(|row| {
            JobExecutionRow::from_row(&row)
                .map_err(db_error)
                .and_then(JobExecutionRow::into_execution)
        })
        .transpose()
    }

    async fn list_job_executions(
        &self,
        instance_id: &Uuid,
    ) -> Result<Vec<JobExecution>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM job_executions WHERE instance_id = ? ORDER BY create_time ASC, id ASC",
        )
        .bind(instance_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(db_error)?;

        rows.iter()
            .map(|row| {
                JobExecutionRow::from_row(row)
                    .map_err(db_error)
                    .and_then(JobExecutionRow::into_execution)
            })
            .collect()
    }

    async fn latest_job_execution(
        &self,
        instance_id: &Uuid,
    ) -> Result<Option<JobExecution>, RepositoryError> {
        let row = sqlx::query(
            "SELECT * FROM job_executions WHERE instance_id = ? \
             ORDER BY create_time DESC, id DESC LIMIT 1",
        )
        .bind(instance_id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(db_error)?;

        row.map(|row| {
            JobExecutionRow::from_row(&row)
                .map_err(db_error)
                .and_then(JobExecutionRow::into_execution)
        })
        .transpose()
    }

    async fn create_step_execution(&self, step: &StepExecution) -> Result<(), RepositoryError> {
        let metrics = serde_json::to_string(&step.metrics)
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        let user_data = step
            .persistent_user_data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        sqlx::query(
            "INSERT INTO step_executions \
             (id, job_execution_id, instance_id, step_id, batch_status, exit_status, \
              metrics, persistent_user_data, start_time, end_time) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(step.id.to_string())
        .bind(step.job_execution_id.to_string())
        .bind(step.instance_id.to_string())
        .bind(&step.step_id)
        .bind(step.batch_status.as_str())
        .bind(&step.exit_status)
        .bind(metrics)
        .bind(user_data)
        .bind(step.start_time.map(|t| t.to_rfc3339()))
        .bind(step.end_time.map(|t| t.to_rfc3339()))
        .execute(&self.pool.writer)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn update_step_execution(&self, step: &StepExecution) -> Result<(), RepositoryError> {
        let metrics = serde_json::to_string(&step.metrics)
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        let user_data = step
            .persistent_user_data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        let result = sqlx::query(
            "UPDATE step_executions SET batch_status = ?, exit_status = ?, metrics = ?, \
             persistent_user_data = ?, start_time = ?, end_time = ? WHERE id = ?",
        )
        .bind(step.batch_status.as_str())
        .bind(&step.exit_status)
        .bind(metrics)
        .bind(user_data)
        .bind(step.start_time.map(|t| t.to_rfc3339()))
        .bind(step.end_time.map(|t| t.to_rfc3339()))
        .bind(step.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn list_step_executions(
        &self,
        job_execution_id: &Uuid,
    ) -> Result<Vec<StepExecution>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM step_executions WHERE job_execution_id = ? \
             ORDER BY start_time ASC, id ASC",
        )
        .bind(job_execution_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(db_error)?;

        rows.iter()
            .map(|row| {
                StepExecutionRow::from_row(row)
                    .map_err(db_error)
                    .and_then(StepExecutionRow::into_step)
            })
            .collect()
    }

    async fn latest_step_execution(
        &self,
        instance_id: &Uuid,
        step_id: &str,
    ) -> Result<Option<StepExecution>, RepositoryError> {
        let row = sqlx::query(
            "SELECT * FROM step_executions WHERE instance_id = ? AND step_id = ? \
             ORDER BY start_time DESC, id DESC LIMIT 1",
        )
        .bind(instance_id.to_string())
        .bind(step_id)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(db_error)?;

        row.map(|row| {
            StepExecutionRow::from_row(&row)
                .map_err(db_error)
                .and_then(StepExecutionRow::into_step)
        })
        .transpose()
    }

    async fn count_step_starts(
        &self,
        instance_id: &Uuid,
        step_id: &str,
    ) -> Result<u32, RepositoryError> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM step_executions WHERE instance_id = ? AND step_id = ?",
        )
        .bind(instance_id.to_string())
        .bind(step_id)
        .fetch_one(&self.pool.reader)
        .await
        .map_err(db_error)?;
        Ok(count.0 as u32)
    }

    async fn create_partition_execution(
        &self,
        partition: &PartitionExecution,
    ) -> Result<(), RepositoryError> {
        let metrics = serde_json::to_string(&partition.metrics)
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        let user_data = partition
            .persistent_user_data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        sqlx::query(
            "INSERT INTO partition_executions \
             (id, step_execution_id, instance_id, step_id, partition_index, \
              batch_status, exit_status, metrics, persistent_user_data) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(partition.id.to_string())
        .bind(partition.step_execution_id.to_string())
        .bind(partition.instance_id.to_string())
        .bind(&partition.step_id)
        .bind(i64::from(partition.partition))
        .bind(partition.batch_status.as_str())
        .bind(&partition.exit_status)
        .bind(metrics)
        .bind(user_data)
        .execute(&self.pool.writer)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn update_partition_execution(
        &self,
        partition: &PartitionExecution,
    ) -> Result<(), RepositoryError> {
        let metrics = serde_json::to_string(&partition.metrics)
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        let user_data = partition
            .persistent_user_data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        let result = sqlx::query(
            "UPDATE partition_executions SET batch_status = ?, exit_status = ?, \
             metrics = ?, persistent_user_data = ? WHERE id = ?",
        )
        .bind(partition.batch_status.as_str())
        .bind(&partition.exit_status)
        .bind(metrics)
        .bind(user_data)
        .bind(partition.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn latest_partition_executions(
        &self,
        instance_id: &Uuid,
        step_id: &str,
    ) -> Result<Vec<PartitionExecution>, RepositoryError> {
        // UUIDv7 ids are time-ordered, so the last row per index is latest.
        let rows = sqlx::query(
            "SELECT * FROM partition_executions WHERE instance_id = ? AND step_id = ? \
             ORDER BY id ASC",
        )
        .bind(instance_id.to_string())
        .bind(step_id)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(db_error)?;

        let mut latest: Vec<PartitionExecution> = Vec::new();
        for row in &rows {
            let partition = PartitionExecutionRow::from_row(row)
                .map_err(db_error)
                .and_then(PartitionExecutionRow::into_partition)?;
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
        let reader = checkpoint
            .reader
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        let writer = checkpoint
            .writer
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        sqlx::query(
            "INSERT INTO chunk_checkpoints \
             (instance_id, step_id, partition_index, reader_checkpoint, writer_checkpoint, \
              skip_count, retry_count, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(instance_id, step_id, partition_index) DO UPDATE SET \
             reader_checkpoint = excluded.reader_checkpoint, \
             writer_checkpoint = excluded.writer_checkpoint, \
             skip_count = excluded.skip_count, \
             retry_count = excluded.retry_count, \
             updated_at = excluded.updated_at",
        )
        .bind(checkpoint.instance_id.to_string())
        .bind(&checkpoint.step_id)
        .bind(partition_to_db(checkpoint.partition))
        .bind(reader)
        .bind(writer)
        .bind(i64::from(checkpoint.skip_count))
        .bind(i64::from(checkpoint.retry_count))
        .bind(checkpoint.updated_at.to_rfc3339())
        .execute(&self.pool.writer)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn get_checkpoint(
        &self,
        instance_id: &Uuid,
        step_id: &str,
        partition: Option<u32>,
    ) -> Result<Option<ChunkCheckpoint>, RepositoryError> {
        let row = sqlx::query(
            "SELECT * FROM chunk_checkpoints \
             WHERE instance_id = ? AND step_id = ? AND partition_index = ?",
        )
        .bind(instance_id.to_string())
        .bind(step_id)
        .bind(partition_to_db(partition))
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(db_error)?;

        row.map(|row| -> Result<ChunkCheckpoint, RepositoryError> {
            let instance_id: String = row.try_get("instance_id").map_err(db_error)?;
            let step_id: String = row.try_get("step_id").map_err(db_error)?;
            let partition_index: i64 = row.try_get("partition_index").map_err(db_error)?;
            let reader: Option<String> = row.try_get("reader_checkpoint").map_err(db_error)?;
            let writer: Option<String> = row.try_get("writer_checkpoint").map_err(db_error)?;
            let skip_count: i64 = row.try_get("skip_count").map_err(db_error)?;
            let retry_count: i64 = row.try_get("retry_count").map_err(db_error)?;
            let updated_at: String = row.try_get("updated_at").map_err(db_error)?;
            Ok(ChunkCheckpoint {
                instance_id: parse_uuid(&instance_id)?,
                step_id,
                partition: (partition_index != NO_PARTITION).then_some(partition_index as u32),
                reader: parse_json_opt(reader.as_deref())?,
                writer: parse_json_opt(writer.as_deref())?,
                skip_count: skip_count as u32,
                retry_count: retry_count as u32,
                updated_at: parse_datetime(&updated_at)?,
            })
        })
        .transpose()
    }

    async fn clear_checkpoint(
        &self,
        instance_id: &Uuid,
        step_id: &str,
        partition: Option<u32>,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "DELETE FROM chunk_checkpoints \
             WHERE instance_id = ? AND step_id = ? AND partition_index = ?",
        )
        .bind(instance_id.to_string())
        .bind(step_id)
        .bind(partition_to_db(partition))
        .execute(&self.pool.writer)
        .await
        .map_err(db_error)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
