//! Execution graph walker.
//!
//! Sequences a job's elements: steps, flows, splits, and decisions. After
//! each element the walker matches its exit status against the element's
//! transition rules (glob patterns, declared order, first match wins);
//! `end`/`stop`/`fail` terminate the job, `next` jumps within the current
//! scope, and no match falls through to the next sequential element. Flows
//! walk their inner sequence recursively; splits run their member flows on
//! concurrent tasks and join them before the successor element.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use kiln_types::error::BatchError;
use kiln_types::execution::{BatchStatus, JobExecution, StepExecution};
use kiln_types::job::{JobDefinition, JobElement, SplitDefinition, Transition};

use crate::artifact::JobListener;
use crate::registry::{ArtifactRegistry, RegistryError};
use crate::repository::job::JobRepository;

use super::checkpoint::CheckpointManager;
use super::context::JobContext;
use super::pattern;
use super::step::{StepOutcome, StepRunner};
use super::transaction::TransactionBoundary;

// ---------------------------------------------------------------------------
// Outcome types
// ---------------------------------------------------------------------------

/// Terminal action requested by a transition rule.
#[derive(Debug, Clone)]
enum TerminalAction {
    Complete {
        exit_override: Option<String>,
    },
    Stop {
        exit_override: Option<String>,
        restart: Option<String>,
    },
    Fail {
        exit_override: Option<String>,
    },
}

/// Result of walking one sequence scope.
enum SequenceOutcome {
    /// A terminal transition fired; bubbles out of all enclosing scopes.
    Terminal(TerminalAction),
    /// The walk fell off the end of the sequence.
    Fallthrough {
        last_executions: Vec<StepExecution>,
        exit_status: Option<String>,
    },
}

/// Errors that abort the walk; the job execution is marked FAILED.
#[derive(Debug, Error)]
pub(crate) enum EngineError {
    #[error(transparent)]
    Step(#[from] super::step::StepRunError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("decider failure: {0}")]
    Decider(BatchError),

    #[error("listener failure: {0}")]
    Listener(BatchError),

    #[error("transition target '{0}' not found at runtime")]
    UnknownTarget(String),

    #[error("split branch task failed: {0}")]
    Join(String),
}

// ---------------------------------------------------------------------------
// JobRunner
// ---------------------------------------------------------------------------

/// Walks one job execution to a terminal status.
pub(crate) struct JobRunner<R: JobRepository> {
    checkpoint: Arc<CheckpointManager<R>>,
    registry: Arc<ArtifactRegistry>,
    steps: StepRunner<R>,
}

impl<R: JobRepository> Clone for JobRunner<R> {
    fn clone(&self) -> Self {
        Self {
            checkpoint: Arc::clone(&self.checkpoint),
            registry: Arc::clone(&self.registry),
            steps: self.steps.clone(),
        }
    }
}

impl<R: JobRepository + 'static> JobRunner<R> {
    pub fn new(
        checkpoint: Arc<CheckpointManager<R>>,
        registry: Arc<ArtifactRegistry>,
        txn: Arc<dyn TransactionBoundary>,
    ) -> Self {
        let steps = StepRunner::new(Arc::clone(&checkpoint), Arc::clone(&registry), txn);
        Self {
            checkpoint,
            registry,
            steps,
        }
    }

    /// Run a job execution to its terminal status and persist the result.
    ///
    /// `start_at` is the restart position recorded by a previous `stop`
    /// transition; `None` walks from the first element (replaying completed
    /// steps per their allow-start-if-complete policy).
    pub async fn run_job(
        &self,
        definition: Arc<JobDefinition>,
        mut execution: JobExecution,
        start_at: Option<String>,
        cancel: CancellationToken,
    ) -> JobExecution {
        let repo = self.checkpoint.repo();

        execution.batch_status = BatchStatus::Started;
        execution.start_time = Some(Utc::now());
        if let Err(error) = repo.update_job_execution(&execution).await {
            tracing::error!(%error, "failed to mark job execution started");
        }

        // Start/restart parameters overlay job-level properties.
        let mut parameters = definition.properties.clone();
        parameters.extend(execution.parameters.clone());
        let job_ctx = JobContext::new(
            definition.name.clone(),
            execution.instance_id,
            execution.id,
            parameters,
        );

        tracing::info!(
            execution_id = %execution.id,
            job = definition.name.as_str(),
            restart_at = ?start_at,
            "starting job execution"
        );

        let mut listeners: Vec<Box<dyn JobListener>> = Vec::new();
        let walk_result: Result<SequenceOutcome, EngineError> = async {
            for reference in &definition.listeners {
                listeners.push(self.registry.resolve_job_listener(reference)?);
            }
            for listener in listeners.iter_mut() {
                listener.before_job().map_err(EngineError::Listener)?;
            }
            self.run_sequence(&definition.elements, start_at.as_deref(), &job_ctx, &cancel)
                .await
        }
        .await;

        let mut after_job_failed = false;
        for listener in listeners.iter_mut() {
            if let Err(error) = listener.after_job() {
                tracing::warn!(%error, "after_job listener failed");
                after_job_failed = true;
            }
        }

        let (mut batch_status, exit_override, restart_position) = match walk_result {
            Ok(SequenceOutcome::Fallthrough { .. }) => (BatchStatus::Completed, None, None),
            Ok(SequenceOutcome::Terminal(TerminalAction::Complete { exit_override })) => {
                (BatchStatus::Completed, exit_override, None)
            }
            Ok(SequenceOutcome::Terminal(TerminalAction::Stop {
                exit_override,
                restart,
            })) => (BatchStatus::Stopped, exit_override, restart),
            Ok(SequenceOutcome::Terminal(TerminalAction::Fail { exit_override })) => {
                (BatchStatus::Failed, exit_override, None)
            }
            Err(error) => {
                tracing::error!(execution_id = %execution.id, %error, "job walk failed");
                (BatchStatus::Failed, None, None)
            }
        };
        if after_job_failed && batch_status == BatchStatus::Completed {
            batch_status = BatchStatus::Failed;
        }

        let exit_status = exit_override
            .or_else(|| job_ctx.exit_status())
            .unwrap_or_else(|| batch_status.as_str().to_string());

        execution.batch_status = batch_status;
        execution.exit_status = Some(exit_status);
        execution.restart_position = restart_position;
        execution.end_time = Some(Utc::now());
        if let Err(error) = repo.update_job_execution(&execution).await {
            tracing::error!(%error, "failed to persist terminal job execution");
        }

        tracing::info!(
            execution_id = %execution.id,
            status = %execution.batch_status,
            exit_status = execution.effective_exit_status(),
            "job execution finished"
        );
        execution
    }

    /// Boxed indirection so flows can recurse through `run_sequence`.
    fn run_sequence_boxed<'a>(
        &'a self,
        elements: &'a [JobElement],
        start_at: Option<&'a str>,
        job_ctx: &'a JobContext,
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<SequenceOutcome, EngineError>> + Send + 'a>> {
        Box::pin(self.run_sequence(elements, start_at, job_ctx, cancel))
    }

    async fn run_sequence(
        &self,
        elements: &[JobElement],
        start_at: Option<&str>,
        job_ctx: &JobContext,
        cancel: &CancellationToken,
    ) -> Result<SequenceOutcome, EngineError> {
        let mut index = match start_at {
            Some(id) => position_of(elements, id).unwrap_or(0),
            None => 0,
        };
        let mut last_executions: Vec<StepExecution> = Vec::new();
        let mut last_exit: Option<String> = None;

        loop {
            if index >= elements.len() {
                return Ok(SequenceOutcome::Fallthrough {
                    last_executions,
                    exit_status: last_exit,
                });
            }
            if cancel.is_cancelled() {
                tracing::info!("stop observed between elements");
                return Ok(SequenceOutcome::Terminal(TerminalAction::Stop {
                    exit_override: None,
                    restart: None,
                }));
            }

            let element = &elements[index];
            let (exit_status, element_failed) = match element {
                JobElement::Step(step) => {
                    let StepOutcome {
                        batch_status,
                        exit_status,
                        execution,
                        replayed: _,
                    } = self.steps.run(step, job_ctx, cancel).await?;
                    last_executions = vec![execution];
                    if batch_status == BatchStatus::Stopped {
                        // The stop was honored inside the step at a safe
                        // boundary; the job stops with it.
                        return Ok(SequenceOutcome::Terminal(TerminalAction::Stop {
                            exit_override: None,
                            restart: None,
                        }));
                    }
                    (exit_status, batch_status == BatchStatus::Failed)
                }
                JobElement::Decision(decision) => {
                    let mut decider = self.registry.resolve_decider(&decision.decider)?;
                    let exit = decider
                        .decide(&last_executions)
                        .map_err(EngineError::Decider)?;
                    tracing::debug!(
                        decision_id = decision.id.as_str(),
                        exit_status = exit.as_str(),
                        "decider returned"
                    );
                    // The decider's verdict becomes the job's exit status
                    // unless something later overrides it.
                    job_ctx.set_exit_status(exit.clone());
                    (exit, false)
                }
                JobElement::Flow(flow) => {
                    match self
                        .run_sequence_boxed(&flow.elements, None, job_ctx, cancel)
                        .await?
                    {
                        SequenceOutcome::Terminal(action) => {
                            return Ok(SequenceOutcome::Terminal(action));
                        }
                        SequenceOutcome::Fallthrough {
                            last_executions: tail,
                            exit_status,
                        } => {
                            last_executions = tail;
                            let exit = exit_status
                                .unwrap_or_else(|| BatchStatus::Completed.as_str().to_string());
                            (exit, false)
                        }
                    }
                }
                JobElement::Split(split) => {
                    let aggregate = self.run_split(split, job_ctx, cancel).await?;
                    last_executions = aggregate.tails;
                    if aggregate.stopped && !aggregate.failed {
                        return Ok(SequenceOutcome::Terminal(TerminalAction::Stop {
                            exit_override: None,
                            restart: None,
                        }));
                    }
                    let status = if aggregate.failed {
                        BatchStatus::Failed
                    } else {
                        BatchStatus::Completed
                    };
                    (status.as_str().to_string(), aggregate.failed)
                }
            };

            last_exit = Some(exit_status.clone());

            let matched = element
                .transitions()
                .iter()
                .find(|transition| pattern::matches(transition.on(), &exit_status));

            match matched {
                Some(Transition::Next { to, .. }) => {
                    index = position_of(elements, to)
                        .ok_or_else(|| EngineError::UnknownTarget(to.clone()))?;
                }
                Some(Transition::End { exit_status, .. }) => {
                    return Ok(SequenceOutcome::Terminal(TerminalAction::Complete {
                        exit_override: exit_status.clone(),
                    }));
                }
                Some(Transition::Stop {
                    exit_status,
                    restart,
                    ..
                }) => {
                    return Ok(SequenceOutcome::Terminal(TerminalAction::Stop {
                        exit_override: exit_status.clone(),
                        restart: restart.clone(),
                    }));
                }
                Some(Transition::Fail { exit_status, .. }) => {
                    return Ok(SequenceOutcome::Terminal(TerminalAction::Fail {
                        exit_override: exit_status.clone(),
                    }));
                }
                None => {
                    if element_failed {
                        // A failed element with no matching transition fails
                        // the job with the step's own status intact.
                        return Ok(SequenceOutcome::Terminal(TerminalAction::Fail {
                            exit_override: None,
                        }));
                    }
                    index += 1;
                }
            }
        }
    }

    async fn run_split(
        &self,
        split: &SplitDefinition,
        job_ctx: &JobContext,
        cancel: &CancellationToken,
    ) -> Result<SplitAggregate, EngineError> {
        tracing::debug!(
            split_id = split.id.as_str(),
            branches = split.flows.len(),
            "starting split"
        );

        let mut join_set = JoinSet::new();
        for flow in &split.flows {
            let runner = self.clone();
            let elements = flow.elements.clone();
            let job_ctx = job_ctx.clone();
            let cancel = cancel.clone();
            let flow_id = flow.id.clone();
            join_set.spawn(async move {
                let result = runner
                    .run_sequence_boxed(&elements, None, &job_ctx, &cancel)
                    .await;
                (flow_id, result)
            });
        }

        let mut aggregate = SplitAggregate::default();
        while let Some(joined) = join_set.join_next().await {
            let (flow_id, result) = joined.map_err(|e| EngineError::Join(e.to_string()))?;
            match result? {
                SequenceOutcome::Fallthrough {
                    last_executions, ..
                } => aggregate.tails.extend(last_executions),
                SequenceOutcome::Terminal(TerminalAction::Fail { .. }) => {
                    tracing::warn!(flow_id = flow_id.as_str(), "split branch failed");
                    aggregate.failed = true;
                }
                SequenceOutcome::Terminal(TerminalAction::Stop { .. }) => {
                    aggregate.stopped = true;
                }
                SequenceOutcome::Terminal(TerminalAction::Complete { .. }) => {}
            }
        }
        Ok(aggregate)
    }
}

/// Join result of a split's branches.
#[derive(Default)]
struct SplitAggregate {
    tails: Vec<StepExecution>,
    failed: bool,
    stopped: bool,
}

fn position_of(elements: &[JobElement], id: &str) -> Option<usize> {
    elements.iter().position(|element| element.id() == id)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{Batchlet, Decider, StopSignal};
    use crate::engine::context::StepContext;
    use crate::engine::transaction::LocalTransactionBoundary;
    use crate::registry::Artifact;
    use crate::repository::memory::InMemoryJobRepository;
    use kiln_types::execution::JobInstance;
    use kiln_types::job::{ArtifactRef, FlowDefinition, StepDefinition, StepPayload};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use uuid::Uuid;

    /// Batchlet appending its configured tag to a shared trace and exiting
    /// with a configured status.
    struct TraceBatchlet {
        tag: String,
        exit: Option<String>,
        fail: bool,
        trace: Arc<Mutex<Vec<String>>>,
    }

    impl Batchlet for TraceBatchlet {
        fn process(
            &mut self,
            _ctx: &mut StepContext,
            _stop: &StopSignal,
        ) -> Result<Option<String>, BatchError> {
            self.trace.lock().unwrap().push(self.tag.clone());
            if self.fail {
                return Err(BatchError::tagged("app.task", format!("{} failed", self.tag)));
            }
            Ok(self.exit.clone())
        }
    }

    struct Harness {
        runner: JobRunner<InMemoryJobRepository>,
        trace: Arc<Mutex<Vec<String>>>,
    }

    fn harness() -> Harness {
        let trace: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ArtifactRegistry::new();
        {
            let trace = Arc::clone(&trace);
            registry.register("trace", move |props| {
                Artifact::Batchlet(Box::new(TraceBatchlet {
                    tag: props.get("tag").cloned().unwrap_or_default(),
                    exit: props.get("exit").cloned(),
                    fail: props.get("fail").map(String::as_str) == Some("true"),
                    trace: Arc::clone(&trace),
                }))
            });
        }

        /// Decider echoing the previous step's exit status with a prefix.
        struct EchoDecider;
        impl Decider for EchoDecider {
            fn decide(&mut self, executions: &[StepExecution]) -> Result<String, BatchError> {
                let prior = executions
                    .first()
                    .map(|e| e.effective_exit_status().to_string())
                    .unwrap_or_default();
                Ok(format!("DECIDER_EXIT_STATUS_{prior}"))
            }
        }
        registry.register("echo-decider", |_props| {
            Artifact::Decider(Box::new(EchoDecider))
        });

        /// Decider counting the executions it was handed.
        struct CountDecider;
        impl Decider for CountDecider {
            fn decide(&mut self, executions: &[StepExecution]) -> Result<String, BatchError> {
                Ok(format!("SAW_{}", executions.len()))
            }
        }
        registry.register("count-decider", |_props| {
            Artifact::Decider(Box::new(CountDecider))
        });

        let runner = JobRunner::new(
            Arc::new(CheckpointManager::new(InMemoryJobRepository::new())),
            Arc::new(registry),
            Arc::new(LocalTransactionBoundary),
        );
        Harness { runner, trace }
    }

    fn trace_step(id: &str, props: &[(&str, &str)], transitions: Vec<Transition>) -> JobElement {
        let mut reference = ArtifactRef::named("trace");
        reference
            .properties
            .insert("tag".to_string(), id.to_string());
        for (key, value) in props {
            reference
                .properties
                .insert(key.to_string(), value.to_string());
        }
        JobElement::Step(StepDefinition {
            id: id.to_string(),
            start_limit: 0,
            allow_start_if_complete: false,
            payload: StepPayload::Batchlet(reference),
            partition: None,
            listeners: vec![],
            transitions,
        })
    }

    fn definition(name: &str, elements: Vec<JobElement>) -> Arc<JobDefinition> {
        Arc::new(JobDefinition {
            name: name.to_string(),
            restartable: true,
            properties: Default::default(),
            listeners: vec![],
            elements,
        })
    }

    async fn run(harness: &Harness, definition: Arc<JobDefinition>) -> JobExecution {
        let repo = harness.runner.checkpoint.repo();
        let instance = JobInstance {
            id: Uuid::now_v7(),
            job_name: definition.name.clone(),
            create_time: Utc::now(),
        };
        repo.create_instance(&instance).await.unwrap();
        let execution = JobExecution {
            id: Uuid::now_v7(),
            instance_id: instance.id,
            job_name: definition.name.clone(),
            batch_status: BatchStatus::Starting,
            exit_status: None,
            parameters: HashMap::new(),
            restart_position: None,
            create_time: Utc::now(),
            start_time: None,
            end_time: None,
        };
        repo.create_job_execution(&execution).await.unwrap();
        harness
            .runner
            .run_job(definition, execution, None, CancellationToken::new())
            .await
    }

    #[tokio::test]
    async fn test_sequential_fallthrough_completes() {
        let harness = harness();
        let def = definition(
            "seq",
            vec![trace_step("a", &[], vec![]), trace_step("b", &[], vec![])],
        );
        let execution = run(&harness, def).await;

        assert_eq!(execution.batch_status, BatchStatus::Completed);
        assert_eq!(execution.effective_exit_status(), "COMPLETED");
        assert_eq!(*harness.trace.lock().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_next_transition_jumps() {
        let harness = harness();
        let def = definition(
            "jump",
            vec![
                trace_step(
                    "a",
                    &[("exit", "GO_C")],
                    vec![Transition::Next {
                        on: "GO_?".to_string(),
                        to: "c".to_string(),
                    }],
                ),
                trace_step("b", &[], vec![]),
                trace_step("c", &[], vec![]),
            ],
        );
        let execution = run(&harness, def).await;

        assert_eq!(execution.batch_status, BatchStatus::Completed);
        assert_eq!(*harness.trace.lock().unwrap(), vec!["a", "c"], "b skipped");
    }

    #[tokio::test]
    async fn test_end_transition_overrides_exit_status() {
        let harness = harness();
        let def = definition(
            "ender",
            vec![
                trace_step(
                    "a",
                    &[],
                    vec![Transition::End {
                        on: "COMPLETED".to_string(),
                        exit_status: Some("EARLY_OUT".to_string()),
                    }],
                ),
                trace_step("b", &[], vec![]),
            ],
        );
        let execution = run(&harness, def).await;

        assert_eq!(execution.batch_status, BatchStatus::Completed);
        assert_eq!(execution.effective_exit_status(), "EARLY_OUT");
        assert_eq!(*harness.trace.lock().unwrap(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_fail_transition() {
        let harness = harness();
        let def = definition(
            "failer",
            vec![trace_step(
                "a",
                &[("exit", "BAD_DATA")],
                vec![Transition::Fail {
                    on: "BAD*".to_string(),
                    exit_status: Some("REJECTED".to_string()),
                }],
            )],
        );
        let execution = run(&harness, def).await;

        assert_eq!(execution.batch_status, BatchStatus::Failed);
        assert_eq!(execution.effective_exit_status(), "REJECTED");
    }

    #[tokio::test]
    async fn test_stop_transition_records_restart_position() {
        let harness = harness();
        let def = definition(
            "stopper",
            vec![
                trace_step(
                    "a",
                    &[("exit", "PAUSE")],
                    vec![Transition::Stop {
                        on: "PAUSE".to_string(),
                        exit_status: Some("ON_HOLD".to_string()),
                        restart: Some("b".to_string()),
                    }],
                ),
                trace_step("b", &[], vec![]),
            ],
        );
        let execution = run(&harness, def).await;

        assert_eq!(execution.batch_status, BatchStatus::Stopped);
        assert_eq!(execution.effective_exit_status(), "ON_HOLD");
        assert_eq!(execution.restart_position.as_deref(), Some("b"));
        assert_eq!(*harness.trace.lock().unwrap(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_failed_step_without_transition_fails_job() {
        let harness = harness();
        let def = definition(
            "boom",
            vec![
                trace_step("a", &[("fail", "true")], vec![]),
                trace_step("b", &[], vec![]),
            ],
        );
        let execution = run(&harness, def).await;

        assert_eq!(execution.batch_status, BatchStatus::Failed);
        assert_eq!(execution.effective_exit_status(), "FAILED");
        assert_eq!(*harness.trace.lock().unwrap(), vec!["a"], "b never ran");
    }

    #[tokio::test]
    async fn test_failed_step_with_matching_transition_continues() {
        let harness = harness();
        let def = definition(
            "recover",
            vec![
                trace_step(
                    "a",
                    &[("fail", "true")],
                    vec![Transition::Next {
                        on: "FAILED".to_string(),
                        to: "cleanup".to_string(),
                    }],
                ),
                trace_step("cleanup", &[], vec![]),
            ],
        );
        let execution = run(&harness, def).await;

        assert_eq!(execution.batch_status, BatchStatus::Completed);
        assert_eq!(*harness.trace.lock().unwrap(), vec!["a", "cleanup"]);
    }

    #[tokio::test]
    async fn test_decider_glob_matching() {
        let harness = harness();
        let def = definition(
            "decided",
            vec![
                trace_step("work", &[("exit", "VERY_GOOD_INVOCATION")], vec![]),
                JobElement::Decision(kiln_types::job::DecisionDefinition {
                    id: "verdict".to_string(),
                    decider: ArtifactRef::named("echo-decider"),
                    transitions: vec![
                        Transition::End {
                            on: "DECIDER_EXIT_STATUS*".to_string(),
                            exit_status: None,
                        },
                        Transition::Fail {
                            on: "*".to_string(),
                            exit_status: None,
                        },
                    ],
                }),
            ],
        );
        let execution = run(&harness, def).await;

        assert_eq!(execution.batch_status, BatchStatus::Completed);
        // The decider's return value became the job exit status.
        assert_eq!(
            execution.effective_exit_status(),
            "DECIDER_EXIT_STATUS_VERY_GOOD_INVOCATION"
        );
    }

    #[tokio::test]
    async fn test_flow_walks_inner_sequence() {
        let harness = harness();
        let def = definition(
            "flowing",
            vec![
                JobElement::Flow(FlowDefinition {
                    id: "prep".to_string(),
                    elements: vec![
                        trace_step("p1", &[], vec![]),
                        trace_step("p2", &[("exit", "PREPPED")], vec![]),
                    ],
                    transitions: vec![Transition::Next {
                        on: "PREPPED".to_string(),
                        to: "final".to_string(),
                    }],
                }),
                trace_step("final", &[], vec![]),
            ],
        );
        let execution = run(&harness, def).await;

        assert_eq!(execution.batch_status, BatchStatus::Completed);
        assert_eq!(*harness.trace.lock().unwrap(), vec!["p1", "p2", "final"]);
    }

    #[tokio::test]
    async fn test_flow_failure_bubbles() {
        let harness = harness();
        let def = definition(
            "flow-fail",
            vec![
                JobElement::Flow(FlowDefinition {
                    id: "prep".to_string(),
                    elements: vec![trace_step("p1", &[("fail", "true")], vec![])],
                    transitions: vec![],
                }),
                trace_step("after", &[], vec![]),
            ],
        );
        let execution = run(&harness, def).await;

        assert_eq!(execution.batch_status, BatchStatus::Failed);
        assert_eq!(*harness.trace.lock().unwrap(), vec!["p1"]);
    }

    #[tokio::test]
    async fn test_split_joins_branches_before_successor() {
        let harness = harness();
        let def = definition(
            "splitter",
            vec![
                JobElement::Split(SplitDefinition {
                    id: "fan".to_string(),
                    flows: vec![
                        FlowDefinition {
                            id: "left".to_string(),
                            elements: vec![trace_step("l1", &[], vec![])],
                            transitions: vec![],
                        },
                        FlowDefinition {
                            id: "right".to_string(),
                            elements: vec![trace_step("r1", &[], vec![])],
                            transitions: vec![],
                        },
                    ],
                    transitions: vec![],
                }),
                JobElement::Decision(kiln_types::job::DecisionDefinition {
                    id: "tally".to_string(),
                    decider: ArtifactRef::named("count-decider"),
                    transitions: vec![Transition::End {
                        on: "SAW_2".to_string(),
                        exit_status: Some("BOTH_BRANCHES_SEEN".to_string()),
                    }],
                }),
            ],
        );
        let execution = run(&harness, def).await;

        assert_eq!(execution.batch_status, BatchStatus::Completed);
        assert_eq!(execution.effective_exit_status(), "BOTH_BRANCHES_SEEN");
        let trace = harness.trace.lock().unwrap();
        assert_eq!(trace.len(), 2);
        assert!(trace.contains(&"l1".to_string()));
        assert!(trace.contains(&"r1".to_string()));
    }

    #[tokio::test]
    async fn test_split_branch_failure_fails_job() {
        let harness = harness();
        let def = definition(
            "split-fail",
            vec![JobElement::Split(SplitDefinition {
                id: "fan".to_string(),
                flows: vec![
                    FlowDefinition {
                        id: "good".to_string(),
                        elements: vec![trace_step("ok", &[], vec![])],
                        transitions: vec![],
                    },
                    FlowDefinition {
                        id: "bad".to_string(),
                        elements: vec![trace_step("broken", &[("fail", "true")], vec![])],
                        transitions: vec![],
                    },
                ],
                transitions: vec![],
            })],
        );
        let execution = run(&harness, def).await;

        assert_eq!(execution.batch_status, BatchStatus::Failed);
    }

    #[tokio::test]
    async fn test_cancel_between_elements_stops_job() {
        let harness = harness();
        let def = definition(
            "cancellable",
            vec![trace_step("a", &[], vec![]), trace_step("b", &[], vec![])],
        );

        let repo = harness.runner.checkpoint.repo();
        let instance = JobInstance {
            id: Uuid::now_v7(),
            job_name: "cancellable".to_string(),
            create_time: Utc::now(),
        };
        repo.create_instance(&instance).await.unwrap();
        let execution = JobExecution {
            id: Uuid::now_v7(),
            instance_id: instance.id,
            job_name: "cancellable".to_string(),
            batch_status: BatchStatus::Starting,
            exit_status: None,
            parameters: HashMap::new(),
            restart_position: None,
            create_time: Utc::now(),
            start_time: None,
            end_time: None,
        };
        repo.create_job_execution(&execution).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = harness.runner.run_job(def, execution, None, cancel).await;
        assert_eq!(result.batch_status, BatchStatus::Stopped);
        assert_eq!(result.effective_exit_status(), "STOPPED");
        assert!(harness.trace.lock().unwrap().is_empty(), "no step ran");
    }
}
