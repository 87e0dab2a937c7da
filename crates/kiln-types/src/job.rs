//! Job definition types for Kiln.
//!
//! Defines the canonical intermediate representation for batch jobs: an
//! immutable graph of execution elements (steps, flows, splits, decisions)
//! with transition rules matched against exit statuses. The runtime never
//! parses XML or any other job description language itself; a definition is
//! supplied fully parsed, either built programmatically or loaded from YAML.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Artifact configuration properties (name/value pairs from the definition).
pub type Properties = HashMap<String, String>;

// ---------------------------------------------------------------------------
// Job definition (canonical IR)
// ---------------------------------------------------------------------------

/// The canonical batch job definition.
///
/// An immutable graph of execution elements, loaded once per job start.
/// Execution begins at the first element and proceeds by sequential
/// fallthrough or explicit transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    /// Job name. Identifies the `JobInstance` family this definition starts.
    pub name: String,
    /// Whether the job may be restarted after stopping or failing.
    #[serde(default = "default_true")]
    pub restartable: bool,
    /// Job-level properties, visible to artifacts through the job context.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub properties: Properties,
    /// Job listener artifact references.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub listeners: Vec<ArtifactRef>,
    /// Top-level execution elements, in declaration order.
    pub elements: Vec<JobElement>,
}

fn default_true() -> bool {
    true
}

/// A reference to a named artifact plus its configuration properties.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Registry name of the artifact.
    pub name: String,
    /// Properties handed to the artifact factory.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub properties: Properties,
}

impl ArtifactRef {
    /// Reference an artifact by name with no properties.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: Properties::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Execution elements
// ---------------------------------------------------------------------------

/// One node of the job execution graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobElement {
    /// A unit of work: batchlet or chunk.
    Step(StepDefinition),
    /// An inner sequence with its own transition scope.
    Flow(FlowDefinition),
    /// Concurrent flows joined before the successor element.
    Split(SplitDefinition),
    /// A decider invocation whose return value drives transitions.
    Decision(DecisionDefinition),
}

impl JobElement {
    /// The element's id, unique across the whole definition.
    pub fn id(&self) -> &str {
        match self {
            JobElement::Step(s) => &s.id,
            JobElement::Flow(f) => &f.id,
            JobElement::Split(s) => &s.id,
            JobElement::Decision(d) => &d.id,
        }
    }

    /// The element's transition rules, in declaration order.
    pub fn transitions(&self) -> &[Transition] {
        match self {
            JobElement::Step(s) => &s.transitions,
            JobElement::Flow(f) => &f.transitions,
            JobElement::Split(s) => &s.transitions,
            JobElement::Decision(d) => &d.transitions,
        }
    }
}

/// A single step: batchlet or chunk, with restart policy and transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Step id, unique within the definition.
    pub id: String,
    /// Maximum times this step may start across the job instance
    /// (0 = unlimited).
    #[serde(default)]
    pub start_limit: u32,
    /// Whether a previously completed step re-executes on restart.
    #[serde(default)]
    pub allow_start_if_complete: bool,
    /// The step's work: `batchlet: {...}` or `chunk: {...}`.
    #[serde(flatten)]
    pub payload: StepPayload,
    /// Optional partition fan-out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<PartitionConfig>,
    /// Step/chunk/skip/retry listener artifact references.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub listeners: Vec<ArtifactRef>,
    /// Transition rules evaluated against the step's exit status.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<Transition>,
}

/// The work a step performs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPayload {
    /// Single synchronous artifact invocation.
    Batchlet(ArtifactRef),
    /// Chunk-oriented read-process-write loop.
    Chunk(ChunkConfig),
}

/// An inner sequence of elements with its own transition scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub id: String,
    /// Member elements; transitions inside the flow may only target these.
    pub elements: Vec<JobElement>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<Transition>,
}

/// Concurrent member flows, joined before the split's successor runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitDefinition {
    pub id: String,
    pub flows: Vec<FlowDefinition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<Transition>,
}

/// A decision point. The decider artifact receives the StepExecution(s) of
/// the immediately preceding element and returns a new exit status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionDefinition {
    pub id: String,
    pub decider: ArtifactRef,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<Transition>,
}

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

/// A transition rule matched against an element's exit status.
///
/// The `on` pattern uses glob semantics: `*` matches any substring, `?` any
/// single character. Rules are evaluated in declaration order; the first
/// match wins. No match falls through to the next sequential element.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transition {
    /// Continue at the named element.
    Next { on: String, to: String },
    /// Complete the job, optionally overriding the job exit status.
    End {
        on: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_status: Option<String>,
    },
    /// Stop the job (resumable). `restart` names the element the next
    /// restart begins at instead of the top of the graph.
    Stop {
        on: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_status: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        restart: Option<String>,
    },
    /// Fail the job, optionally overriding the job exit status.
    Fail {
        on: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_status: Option<String>,
    },
}

impl Transition {
    /// The glob pattern this rule matches against.
    pub fn on(&self) -> &str {
        match self {
            Transition::Next { on, .. }
            | Transition::End { on, .. }
            | Transition::Stop { on, .. }
            | Transition::Fail { on, .. } => on,
        }
    }
}

// ---------------------------------------------------------------------------
// Chunk configuration
// ---------------------------------------------------------------------------

/// Configuration for a chunk-oriented step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkConfig {
    pub reader: ArtifactRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processor: Option<ArtifactRef>,
    pub writer: ArtifactRef,
    /// Checkpoint boundary: commit after this many items (default 10).
    #[serde(default = "default_item_count")]
    pub item_count: u32,
    /// Checkpoint boundary: commit after this many seconds mid-chunk
    /// (0 = no time limit). Evaluated between items, never preemptively.
    #[serde(default)]
    pub time_limit_secs: u64,
    /// Custom checkpoint algorithm. When set, its readiness predicate and
    /// timeout replace the item-count/time policy entirely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_algorithm: Option<ArtifactRef>,
    /// Maximum skippable failures before the step fails (None = unlimited
    /// when skippable rules are configured, otherwise irrelevant).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_limit: Option<u32>,
    /// Maximum retryable failures before the step fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skippable_exceptions: Vec<ExceptionRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retryable_exceptions: Vec<ExceptionRule>,
    /// Retryable classes that re-attempt in place instead of rolling the
    /// chunk back.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub no_rollback_exceptions: Vec<ExceptionRule>,
}

fn default_item_count() -> u32 {
    10
}

/// One entry of an exception class rule list.
///
/// `class` is a dot-separated error class path (see `ErrorClass`); an entry
/// applies to the class itself and everything beneath it. The most specific
/// applicable entry wins; on an include/exclude tie at equal depth the
/// exclusion wins. The pattern `*` applies to every class at depth zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExceptionRule {
    pub class: String,
    #[serde(default)]
    pub action: RuleAction,
}

impl ExceptionRule {
    /// Include rule for the given class path.
    pub fn include(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            action: RuleAction::Include,
        }
    }

    /// Exclude rule for the given class path.
    pub fn exclude(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            action: RuleAction::Exclude,
        }
    }
}

/// Whether a rule includes or excludes the classes it covers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    #[default]
    Include,
    Exclude,
}

// ---------------------------------------------------------------------------
// Partition configuration
// ---------------------------------------------------------------------------

/// Partition fan-out for a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionConfig {
    /// Where the plan comes from: `plan: {...}` or `mapper: {...}`.
    #[serde(flatten)]
    pub source: PartitionSource,
    /// Per-partition collector artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collector: Option<ArtifactRef>,
    /// Step-level analyzer artifact aggregating partition results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analyzer: Option<ArtifactRef>,
}

/// Static plan or mapper-supplied plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionSource {
    Plan(PartitionPlan),
    Mapper(ArtifactRef),
}

/// A concrete partition plan: how many partitions and their properties.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionPlan {
    pub count: u32,
    /// Per-partition property overrides, indexed by partition number.
    /// Missing entries mean no overrides for that partition.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub properties: Vec<Properties>,
}

impl PartitionPlan {
    /// Properties for partition `index`, merged over the step's own
    /// artifact properties by the caller.
    pub fn properties_for(&self, index: u32) -> Properties {
        self.properties
            .get(index as usize)
            .cloned()
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
