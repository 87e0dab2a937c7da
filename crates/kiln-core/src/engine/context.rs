//! Job and step contexts handed to artifacts.
//!
//! `JobContext` is shared across every element of one job execution --
//! including concurrent split branches -- so its mutable state sits behind a
//! mutex. `StepContext` is owned by a single step execution and passed to
//! artifacts by mutable reference.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use uuid::Uuid;

use kiln_types::execution::StepMetrics;

// ---------------------------------------------------------------------------
// JobContext
// ---------------------------------------------------------------------------

/// Per-execution job context: identity, parameters, and the job-level exit
/// status artifacts and deciders may set.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_name: String,
    pub instance_id: Uuid,
    pub execution_id: Uuid,
    /// Job-level definition properties merged with start/restart parameters
    /// (parameters win).
    parameters: Arc<HashMap<String, String>>,
    shared: Arc<Mutex<JobContextShared>>,
}

#[derive(Debug, Default)]
struct JobContextShared {
    exit_status: Option<String>,
    transient_user_data: Option<Value>,
}

impl JobContext {
    pub fn new(
        job_name: String,
        instance_id: Uuid,
        execution_id: Uuid,
        parameters: HashMap<String, String>,
    ) -> Self {
        Self {
            job_name,
            instance_id,
            execution_id,
            parameters: Arc::new(parameters),
            shared: Arc::new(Mutex::new(JobContextShared::default())),
        }
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    pub fn parameters(&self) -> &HashMap<String, String> {
        &self.parameters
    }

    /// Set the job-level exit status. Deciders do this implicitly; batchlets
    /// and chunk artifacts may call it through their step context.
    pub fn set_exit_status(&self, exit_status: impl Into<String>) {
        self.shared
            .lock()
            .expect("job context mutex poisoned")
            .exit_status = Some(exit_status.into());
    }

    pub fn exit_status(&self) -> Option<String> {
        self.shared
            .lock()
            .expect("job context mutex poisoned")
            .exit_status
            .clone()
    }

    pub fn set_transient_user_data(&self, data: Value) {
        self.shared
            .lock()
            .expect("job context mutex poisoned")
            .transient_user_data = Some(data);
    }

    pub fn transient_user_data(&self) -> Option<Value> {
        self.shared
            .lock()
            .expect("job context mutex poisoned")
            .transient_user_data
            .clone()
    }
}

// ---------------------------------------------------------------------------
// StepContext
// ---------------------------------------------------------------------------

/// Per-step-execution context: exit status, user data, and metrics.
///
/// Transient user data lives only for this execution; persistent user data
/// is loaded from the step's previous execution on restart and persisted
/// with every chunk commit and at step end.
#[derive(Debug)]
pub struct StepContext {
    pub step_id: String,
    pub step_execution_id: Uuid,
    job: JobContext,
    exit_status: Option<String>,
    transient_user_data: Option<Value>,
    persistent_user_data: Option<Value>,
    pub metrics: StepMetrics,
}

impl StepContext {
    pub fn new(
        step_id: String,
        step_execution_id: Uuid,
        job: JobContext,
        persistent_user_data: Option<Value>,
    ) -> Self {
        Self {
            step_id,
            step_execution_id,
            job,
            exit_status: None,
            transient_user_data: None,
            persistent_user_data,
            metrics: StepMetrics::default(),
        }
    }

    /// The owning job's context, shared across the execution.
    pub fn job(&self) -> &JobContext {
        &self.job
    }

    pub fn set_exit_status(&mut self, exit_status: impl Into<String>) {
        self.exit_status = Some(exit_status.into());
    }

    pub fn exit_status(&self) -> Option<&str> {
        self.exit_status.as_deref()
    }

    pub fn set_transient_user_data(&mut self, data: Value) {
        self.transient_user_data = Some(data);
    }

    pub fn transient_user_data(&self) -> Option<&Value> {
        self.transient_user_data.as_ref()
    }

    pub fn set_persistent_user_data(&mut self, data: Value) {
        self.persistent_user_data = Some(data);
    }

    pub fn persistent_user_data(&self) -> Option<&Value> {
        self.persistent_user_data.as_ref()
    }

    pub(crate) fn take_persistent_user_data(&self) -> Option<Value> {
        self.persistent_user_data.clone()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
