//! Execution tracking types: instances, executions, metrics, checkpoints.
//!
//! `JobInstance` identifies a logical job; each start or restart produces a
//! `JobExecution` under it, which in turn owns `StepExecution` records. All
//! of these are persisted through the repository so a crashed or failed run
//! can restart from its last committed checkpoint.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// BatchStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of a job or step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Starting,
    Started,
    Stopping,
    Stopped,
    Failed,
    Completed,
    Abandoned,
}

impl BatchStatus {
    /// The canonical uppercase name, also the default exit status.
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Starting => "STARTING",
            BatchStatus::Started => "STARTED",
            BatchStatus::Stopping => "STOPPING",
            BatchStatus::Stopped => "STOPPED",
            BatchStatus::Failed => "FAILED",
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Abandoned => "ABANDONED",
        }
    }

    /// Whether this status admits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Stopped
                | BatchStatus::Failed
                | BatchStatus::Completed
                | BatchStatus::Abandoned
        )
    }

    /// Whether an execution in this status may be restarted.
    ///
    /// Completed executions are restartable as a replay walk; only Abandoned
    /// and still-active statuses are not.
    pub fn is_restartable(&self) -> bool {
        matches!(
            self,
            BatchStatus::Stopped | BatchStatus::Failed | BatchStatus::Completed
        )
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STARTING" => Ok(BatchStatus::Starting),
            "STARTED" => Ok(BatchStatus::Started),
            "STOPPING" => Ok(BatchStatus::Stopping),
            "STOPPED" => Ok(BatchStatus::Stopped),
            "FAILED" => Ok(BatchStatus::Failed),
            "COMPLETED" => Ok(BatchStatus::Completed),
            "ABANDONED" => Ok(BatchStatus::Abandoned),
            other => Err(format!("unknown batch status: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// JobInstance / JobExecution
// ---------------------------------------------------------------------------

/// Logical identity of a job: created on first start, shared by restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInstance {
    /// UUIDv7 instance id.
    pub id: Uuid,
    /// Name from the job definition.
    pub job_name: String,
    pub create_time: DateTime<Utc>,
}

/// One attempt to run a `JobInstance`. Immutable once terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecution {
    /// UUIDv7 execution id.
    pub id: Uuid,
    pub instance_id: Uuid,
    /// Job name (denormalized for display and queries).
    pub job_name: String,
    pub batch_status: BatchStatus,
    /// Free-form exit status; defaults to the batch status name when unset
    /// at completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<String>,
    /// Parameters passed to start/restart.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    /// Element id a `stop` transition designated for the next restart.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_position: Option<String>,
    pub create_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

impl JobExecution {
    /// The effective exit status: the explicit one, or the batch status name.
    pub fn effective_exit_status(&self) -> &str {
        self.exit_status
            .as_deref()
            .unwrap_or_else(|| self.batch_status.as_str())
    }
}

// ---------------------------------------------------------------------------
// StepExecution
// ---------------------------------------------------------------------------

/// One attempt to run a step within a `JobExecution`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    /// UUIDv7 step execution id.
    pub id: Uuid,
    pub job_execution_id: Uuid,
    /// Owning instance (denormalized for instance-wide history queries).
    pub instance_id: Uuid,
    /// Step id from the definition.
    pub step_id: String,
    pub batch_status: BatchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<String>,
    #[serde(default)]
    pub metrics: StepMetrics,
    /// Opaque user data carried across restarts of this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_user_data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

impl StepExecution {
    /// The effective exit status: the explicit one, or the batch status name.
    pub fn effective_exit_status(&self) -> &str {
        self.exit_status
            .as_deref()
            .unwrap_or_else(|| self.batch_status.as_str())
    }
}

/// Item accounting for a chunk step execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepMetrics {
    pub read_count: u64,
    pub write_count: u64,
    pub commit_count: u64,
    pub rollback_count: u64,
    pub read_skip_count: u64,
    pub process_skip_count: u64,
    pub write_skip_count: u64,
    /// Items the processor filtered out (returned no output for).
    pub filter_count: u64,
    pub retry_count: u64,
}

impl StepMetrics {
    /// Sum counter-wise, used to aggregate partition metrics into the step.
    pub fn merge(&mut self, other: &StepMetrics) {
        self.read_count += other.read_count;
        self.write_count += other.write_count;
        self.commit_count += other.commit_count;
        self.rollback_count += other.rollback_count;
        self.read_skip_count += other.read_skip_count;
        self.process_skip_count += other.process_skip_count;
        self.write_skip_count += other.write_skip_count;
        self.filter_count += other.filter_count;
        self.retry_count += other.retry_count;
    }

    /// Total items skipped at any phase.
    pub fn total_skips(&self) -> u64 {
        self.read_skip_count + self.process_skip_count + self.write_skip_count
    }
}

// ---------------------------------------------------------------------------
// Partition execution
// ---------------------------------------------------------------------------

/// Execution record for one partition of a partitioned step.
///
/// Keyed by (instance, step, partition index) for restart: a restart re-runs
/// only partitions whose latest record is not COMPLETED.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionExecution {
    pub id: Uuid,
    pub step_execution_id: Uuid,
    pub instance_id: Uuid,
    pub step_id: String,
    pub partition: u32,
    pub batch_status: BatchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<String>,
    #[serde(default)]
    pub metrics: StepMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_user_data: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Chunk checkpoint
// ---------------------------------------------------------------------------

/// Durable chunk progress, persisted with every successful chunk commit and
/// cleared when the step completes.
///
/// Keyed by (instance, step, partition). `partition` is `None` for
/// unpartitioned steps. Skip/retry counts persist so the limits span
/// restarts of the same step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkCheckpoint {
    pub instance_id: Uuid,
    pub step_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<u32>,
    /// Opaque reader position, as supplied by `ItemReader::checkpoint_info`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reader: Option<serde_json::Value>,
    /// Opaque writer position.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub writer: Option<serde_json::Value>,
    pub skip_count: u32,
    pub retry_count: u32,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_status_roundtrip() {
        for status in [
            BatchStatus::Starting,
            BatchStatus::Started,
            BatchStatus::Stopping,
            BatchStatus::Stopped,
            BatchStatus::Failed,
            BatchStatus::Completed,
            BatchStatus::Abandoned,
        ] {
            let parsed: BatchStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);

            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
            let back: BatchStatus = serde_json::from_str(&json).unwrap();
            assert_eq!(back, status);
        }
        assert!("RUNNING".parse::<BatchStatus>().is_err());
    }

    #[test]
    fn test_batch_status_terminal_and_restartable() {
        assert!(BatchStatus::Completed.is_terminal());
        assert!(BatchStatus::Failed.is_terminal());
        assert!(BatchStatus::Abandoned.is_terminal());
        assert!(!BatchStatus::Started.is_terminal());
        assert!(!BatchStatus::Stopping.is_terminal());

        assert!(BatchStatus::Stopped.is_restartable());
        assert!(BatchStatus::Failed.is_restartable());
        assert!(BatchStatus::Completed.is_restartable());
        assert!(!BatchStatus::Abandoned.is_restartable());
        assert!(!BatchStatus::Started.is_restartable());
    }

    #[test]
    fn test_effective_exit_status_defaults_to_batch_status() {
        let mut execution = JobExecution {
            id: Uuid::now_v7(),
            instance_id: Uuid::now_v7(),
            job_name: "payroll".to_string(),
            batch_status: BatchStatus::Failed,
            exit_status: None,
            parameters: HashMap::new(),
            restart_position: None,
            create_time: Utc::now(),
            start_time: None,
            end_time: None,
        };
        assert_eq!(execution.effective_exit_status(), "FAILED");

        execution.exit_status = Some("BAD_INPUT".to_string());
        assert_eq!(execution.effective_exit_status(), "BAD_INPUT");
    }

    #[test]
    fn test_step_metrics_merge() {
        let mut a = StepMetrics {
            read_count: 10,
            write_count: 8,
            commit_count: 2,
            read_skip_count: 1,
            ..Default::default()
        };
        let b = StepMetrics {
            read_count: 5,
            write_count: 5,
            commit_count: 1,
            write_skip_count: 2,
            ..Default::default()
        };
        a.merge(&b);
        assert_eq!(a.read_count, 15);
        assert_eq!(a.write_count, 13);
        assert_eq!(a.commit_count, 3);
        assert_eq!(a.total_skips(), 3);
    }

    #[test]
    fn test_step_execution_json_roundtrip() {
        let step = StepExecution {
            id: Uuid::now_v7(),
            job_execution_id: Uuid::now_v7(),
            instance_id: Uuid::now_v7(),
            step_id: "load".to_string(),
            batch_status: BatchStatus::Completed,
            exit_status: Some("COMPLETED".to_string()),
            metrics: StepMetrics {
                read_count: 30,
                write_count: 30,
                commit_count: 3,
                ..Default::default()
            },
            persistent_user_data: Some(serde_json::json!({"cursor": 30})),
            start_time: Some(Utc::now()),
            end_time: Some(Utc::now()),
        };
        let json = serde_json::to_string(&step).unwrap();
        let parsed: StepExecution = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.step_id, "load");
        assert_eq!(parsed.metrics.read_count, 30);
        assert_eq!(parsed.persistent_user_data, step.persistent_user_data);
    }

    #[test]
    fn test_chunk_checkpoint_roundtrip() {
        let checkpoint = ChunkCheckpoint {
            instance_id: Uuid::now_v7(),
            step_id: "load".to_string(),
            partition: Some(2),
            reader: Some(serde_json::json!(14)),
            writer: None,
            skip_count: 1,
            retry_count: 0,
            updated_at: Utc::now(),
        };
        let json = serde_json::to_string(&checkpoint).unwrap();
        let parsed: ChunkCheckpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.partition, Some(2));
        assert_eq!(parsed.reader, Some(serde_json::json!(14)));
        assert_eq!(parsed.skip_count, 1);
    }
}
