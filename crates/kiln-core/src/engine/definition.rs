//! Job definition parsing and validation.
//!
//! Converts between YAML files and the canonical `JobDefinition` IR,
//! provides discovery for job files on disk, and validates the execution
//! graph before a job is allowed to start: unique element ids, resolvable
//! transition targets, no decision as the first element, and reachability of
//! every element. Validation failures surface synchronously from
//! `start`/`restart`, never as runtime failures.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use thiserror::Error;

use kiln_types::job::{
    ArtifactRef, JobDefinition, JobElement, PartitionSource, StepPayload, Transition,
};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Configuration errors detected before a job starts.
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// YAML parse failure.
    #[error("parse error: {0}")]
    Parse(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    Validation(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Two elements share an id.
    #[error("duplicate element id: '{0}'")]
    DuplicateId(String),

    /// A transition names an element outside its scope.
    #[error("element '{element}' transitions to unknown or out-of-scope target '{target}'")]
    UnresolvedTarget { element: String, target: String },

    /// A decision cannot be the first element of a job or flow.
    #[error("decision '{0}' cannot be the first element of its sequence")]
    DecisionFirst(String),

    /// An element can never be reached from the start of its sequence.
    #[error("element '{0}' is unreachable")]
    Unreachable(String),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `JobDefinition`.
///
/// Runs `validate_definition` after deserialization, so the returned value
/// is guaranteed to be structurally valid.
pub fn parse_job_yaml(yaml: &str) -> Result<JobDefinition, DefinitionError> {
    let def: JobDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::Parse(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Serialize a `JobDefinition` to a YAML string.
pub fn serialize_job_yaml(def: &JobDefinition) -> Result<String, DefinitionError> {
    serde_yaml_ng::to_string(def).map_err(|e| DefinitionError::Parse(e.to_string()))
}

/// Load a job definition from a YAML file.
pub fn load_job_file(path: &Path) -> Result<JobDefinition, DefinitionError> {
    let content = std::fs::read_to_string(path)?;
    parse_job_yaml(&content)
}

/// Save a job definition to a YAML file, creating parent directories.
pub fn save_job_file(path: &Path, def: &JobDefinition) -> Result<(), DefinitionError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let yaml = serialize_job_yaml(def)?;
    std::fs::write(path, yaml)?;
    Ok(())
}

/// Discover all job definition YAML files under `base_dir`.
///
/// Scans for `.yaml` and `.yml` files recursively. Each file is parsed,
/// validated, and returned alongside its path. Files that fail to parse or
/// validate are skipped with a warning (they may not be job definitions).
pub fn discover_jobs(base_dir: &Path) -> Result<Vec<(PathBuf, JobDefinition)>, DefinitionError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, JobDefinition)>,
) -> Result<(), DefinitionError> {
    let entries = std::fs::read_dir(dir)?;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
        } else if let Some(ext) = path.extension() {
            if ext == "yaml" || ext == "yml" {
                match load_job_file(&path) {
                    Ok(def) => results.push((path, def)),
                    Err(_) => {
                        tracing::warn!(?path, "skipping unparseable job file");
                    }
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a job definition's structure and execution graph.
///
/// Checks:
/// - Name is non-empty, alphanumeric plus hyphens/underscores
/// - At least one element; flows and splits are non-empty
/// - Element ids unique across the whole definition (all nesting levels)
/// - The first element of the job and of every flow is not a decision
/// - `next` targets resolve to a sibling in the same sequence scope
/// - `stop` restart targets resolve to a top-level element
/// - Flows inside a split declare no transitions (the split joins them)
/// - Chunk `item_count` and static partition counts are at least 1
/// - Every element is reachable from the start of its sequence
pub fn validate_definition(def: &JobDefinition) -> Result<(), DefinitionError> {
    if def.name.is_empty() {
        return Err(DefinitionError::Validation(
            "job name must not be empty".to_string(),
        ));
    }
    if !def
        .name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(DefinitionError::Validation(format!(
            "job name '{}' contains invalid characters (only alphanumeric, hyphens and underscores allowed)",
            def.name
        )));
    }

    if def.elements.is_empty() {
        return Err(DefinitionError::Validation(
            "job must have at least one element".to_string(),
        ));
    }

    // Unique ids across all nesting levels.
    let mut seen = HashSet::new();
    collect_ids(&def.elements, &mut seen)?;

    let top_level_ids: HashSet<&str> = def.elements.iter().map(|e| e.id()).collect();

    validate_sequence(&def.elements, &top_level_ids)
}

fn collect_ids<'a>(
    elements: &'a [JobElement],
    seen: &mut HashSet<&'a str>,
) -> Result<(), DefinitionError> {
    for element in elements {
        if !seen.insert(element.id()) {
            return Err(DefinitionError::DuplicateId(element.id().to_string()));
        }
        match element {
            JobElement::Flow(flow) => collect_ids(&flow.elements, seen)?,
            JobElement::Split(split) => {
                for flow in &split.flows {
                    if !seen.insert(flow.id.as_str()) {
                        return Err(DefinitionError::DuplicateId(flow.id.clone()));
                    }
                    collect_ids(&flow.elements, seen)?;
                }
            }
            JobElement::Step(_) | JobElement::Decision(_) => {}
        }
    }
    Ok(())
}

fn validate_sequence(
    elements: &[JobElement],
    top_level_ids: &HashSet<&str>,
) -> Result<(), DefinitionError> {
    if elements.is_empty() {
        return Err(DefinitionError::Validation(
            "flow must have at least one element".to_string(),
        ));
    }
    if let JobElement::Decision(decision) = &elements[0] {
        return Err(DefinitionError::DecisionFirst(decision.id.clone()));
    }

    let sibling_ids: HashSet<&str> = elements.iter().map(|e| e.id()).collect();

    for element in elements {
        for transition in element.transitions() {
            match transition {
                Transition::Next { to, .. } => {
                    if !sibling_ids.contains(to.as_str()) {
                        return Err(DefinitionError::UnresolvedTarget {
                            element: element.id().to_string(),
                            target: to.clone(),
                        });
                    }
                }
                Transition::Stop {
                    restart: Some(restart),
                    ..
                } => {
                    if !top_level_ids.contains(restart.as_str()) {
                        return Err(DefinitionError::UnresolvedTarget {
                            element: element.id().to_string(),
                            target: restart.clone(),
                        });
                    }
                }
                Transition::Stop { .. } | Transition::End { .. } | Transition::Fail { .. } => {}
            }
        }

        match element {
            JobElement::Step(step) => {
                if let StepPayload::Chunk(chunk) = &step.payload {
                    if chunk.item_count == 0 {
                        return Err(DefinitionError::Validation(format!(
                            "step '{}': chunk item_count must be at least 1",
                            step.id
                        )));
                    }
                }
                if let Some(partition) = &step.partition {
                    if let kiln_types::job::PartitionSource::Plan(plan) = &partition.source {
                        if plan.count == 0 {
                            return Err(DefinitionError::Validation(format!(
                                "step '{}': partition count must be at least 1",
                                step.id
                            )));
                        }
                    }
                }
            }
            JobElement::Flow(flow) => {
                validate_sequence(&flow.elements, top_level_ids)?;
            }
            JobElement::Split(split) => {
                if split.flows.is_empty() {
                    return Err(DefinitionError::Validation(format!(
                        "split '{}' must have at least one flow",
                        split.id
                    )));
                }
                for flow in &split.flows {
                    if !flow.transitions.is_empty() {
                        return Err(DefinitionError::Validation(format!(
                            "flow '{}' inside split '{}' must not declare transitions",
                            flow.id, split.id
                        )));
                    }
                    validate_sequence(&flow.elements, top_level_ids)?;
                }
            }
            JobElement::Decision(_) => {}
        }
    }

    check_reachability(elements)
}

/// Every element of a sequence must be reachable from its first element,
/// following sequential fallthrough and explicit `next` transitions. An
/// element with a catch-all (`on: "*"`) rule never falls through.
fn check_reachability(elements: &[JobElement]) -> Result<(), DefinitionError> {
    let mut graph = DiGraph::<&str, ()>::new();
    let nodes: Vec<NodeIndex> = elements.iter().map(|e| graph.add_node(e.id())).collect();
    let index_of: HashMap<&str, usize> = elements
        .iter()
        .enumerate()
        .map(|(i, e)| (e.id(), i))
        .collect();

    for (i, element) in elements.iter().enumerate() {
        let has_catch_all = element.transitions().iter().any(|t| t.on() == "*");
        if !has_catch_all && i + 1 < elements.len() {
            graph.add_edge(nodes[i], nodes[i + 1], ());
        }
        for transition in element.transitions() {
            if let Transition::Next { to, .. } = transition {
                // Target existence was validated above.
                if let Some(&target) = index_of.get(to.as_str()) {
                    graph.add_edge(nodes[i], nodes[target], ());
                }
            }
        }
    }

    let mut reached = HashSet::new();
    let mut dfs = Dfs::new(&graph, nodes[0]);
    while let Some(node) = dfs.next(&graph) {
        reached.insert(node);
    }

    for (i, element) in elements.iter().enumerate() {
        if !reached.contains(&nodes[i]) {
            return Err(DefinitionError::Unreachable(element.id().to_string()));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Artifact reference collection
// ---------------------------------------------------------------------------

/// Every artifact reference a definition names, across all nesting levels.
///
/// The operator checks each against the registry before a job starts, so a
/// missing artifact is a start-time configuration error rather than a
/// mid-run surprise.
pub fn artifact_refs(def: &JobDefinition) -> Vec<&ArtifactRef> {
    let mut refs: Vec<&ArtifactRef> = def.listeners.iter().collect();
    collect_refs(&def.elements, &mut refs);
    refs
}

fn collect_refs<'a>(elements: &'a [JobElement], refs: &mut Vec<&'a ArtifactRef>) {
    for element in elements {
        match element {
            JobElement::Step(step) => {
                refs.extend(step.listeners.iter());
                match &step.payload {
                    StepPayload::Batchlet(reference) => refs.push(reference),
                    StepPayload::Chunk(chunk) => {
                        refs.push(&chunk.reader);
                        refs.push(&chunk.writer);
                        if let Some(processor) = &chunk.processor {
                            refs.push(processor);
                        }
                        if let Some(algorithm) = &chunk.checkpoint_algorithm {
                            refs.push(algorithm);
                        }
                    }
                }
                if let Some(partition) = &step.partition {
                    if let PartitionSource::Mapper(mapper) = &partition.source {
                        refs.push(mapper);
                    }
                    if let Some(collector) = &partition.collector {
                        refs.push(collector);
                    }
                    if let Some(analyzer) = &partition.analyzer {
                        refs.push(analyzer);
                    }
                }
            }
            JobElement::Flow(flow) => collect_refs(&flow.elements, refs),
            JobElement::Split(split) => {
                for flow in &split.flows {
                    collect_refs(&flow.elements, refs);
                }
            }
            JobElement::Decision(decision) => refs.push(&decision.decider),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_types::job::{ArtifactRef, DecisionDefinition, StepDefinition};

    fn batchlet_step(id: &str, transitions: Vec<Transition>) -> JobElement {
        JobElement::Step(StepDefinition {
            id: id.to_string(),
            start_limit: 0,
            allow_start_if_complete: false,
            payload: StepPayload::Batchlet(ArtifactRef::named("noop")),
            partition: None,
            listeners: vec![],
            transitions,
        })
    }

    fn job(name: &str, elements: Vec<JobElement>) -> JobDefinition {
        JobDefinition {
            name: name.to_string(),
            restartable: true,
            properties: Default::default(),
            listeners: vec![],
            elements,
        }
    }

    #[test]
    fn test_valid_two_step_job() {
        let def = job(
            "two-steps",
            vec![
                batchlet_step(
                    "first",
                    vec![Transition::Next {
                        on: "COMPLETED".to_string(),
                        to: "second".to_string(),
                    }],
                ),
                batchlet_step("second", vec![]),
            ],
        );
        assert!(validate_definition(&def).is_ok());
    }

    #[test]
    fn test_rejects_empty_job() {
        let err = validate_definition(&job("empty", vec![])).unwrap_err();
        assert!(err.to_string().contains("at least one element"));
    }

    #[test]
    fn test_rejects_invalid_name() {
        let def = job("bad name!", vec![batchlet_step("a", vec![])]);
        let err = validate_definition(&def).unwrap_err();
        assert!(err.to_string().contains("invalid characters"));
    }

    #[test]
    fn test_rejects_duplicate_ids_across_nesting() {
        let def = job(
            "dupes",
            vec![
                batchlet_step("a", vec![]),
                JobElement::Flow(kiln_types::job::FlowDefinition {
                    id: "f".to_string(),
                    elements: vec![batchlet_step("a", vec![])],
                    transitions: vec![],
                }),
            ],
        );
        let err = validate_definition(&def).unwrap_err();
        assert!(matches!(err, DefinitionError::DuplicateId(id) if id == "a"));
    }

    #[test]
    fn test_rejects_decision_first() {
        let def = job(
            "decision-first",
            vec![
                JobElement::Decision(DecisionDefinition {
                    id: "d".to_string(),
                    decider: ArtifactRef::named("judge"),
                    transitions: vec![],
                }),
                batchlet_step("a", vec![]),
            ],
        );
        let err = validate_definition(&def).unwrap_err();
        assert!(matches!(err, DefinitionError::DecisionFirst(id) if id == "d"));
    }

    #[test]
    fn test_rejects_unresolved_next_target() {
        let def = job(
            "dangling",
            vec![batchlet_step(
                "a",
                vec![Transition::Next {
                    on: "*".to_string(),
                    to: "nowhere".to_string(),
                }],
            )],
        );
        let err = validate_definition(&def).unwrap_err();
        assert!(
            matches!(&err, DefinitionError::UnresolvedTarget { target, .. } if target == "nowhere"),
            "got: {err}"
        );
    }

    #[test]
    fn test_rejects_flow_scope_escape() {
        // A transition inside a flow targeting a top-level element is
        // out of scope.
        let def = job(
            "scope-escape",
            vec![
                JobElement::Flow(kiln_types::job::FlowDefinition {
                    id: "f".to_string(),
                    elements: vec![batchlet_step(
                        "inner",
                        vec![Transition::Next {
                            on: "*".to_string(),
                            to: "outer".to_string(),
                        }],
                    )],
                    transitions: vec![],
                }),
                batchlet_step("outer", vec![]),
            ],
        );
        let err = validate_definition(&def).unwrap_err();
        assert!(matches!(&err, DefinitionError::UnresolvedTarget { target, .. } if target == "outer"));
    }

    #[test]
    fn test_stop_restart_must_target_top_level() {
        let ok = job(
            "stoppable",
            vec![
                batchlet_step(
                    "a",
                    vec![Transition::Stop {
                        on: "PAUSE".to_string(),
                        exit_status: None,
                        restart: Some("b".to_string()),
                    }],
                ),
                batchlet_step("b", vec![]),
            ],
        );
        assert!(validate_definition(&ok).is_ok());

        let bad = job(
            "stop-bad",
            vec![batchlet_step(
                "a",
                vec![Transition::Stop {
                    on: "PAUSE".to_string(),
                    exit_status: None,
                    restart: Some("ghost".to_string()),
                }],
            )],
        );
        let err = validate_definition(&bad).unwrap_err();
        assert!(matches!(&err, DefinitionError::UnresolvedTarget { target, .. } if target == "ghost"));
    }

    #[test]
    fn test_rejects_unreachable_element() {
        // `a` ends unconditionally, so `b` can never run.
        let def = job(
            "island",
            vec![
                batchlet_step(
                    "a",
                    vec![Transition::End {
                        on: "*".to_string(),
                        exit_status: None,
                    }],
                ),
                batchlet_step("b", vec![]),
            ],
        );
        let err = validate_definition(&def).unwrap_err();
        assert!(matches!(&err, DefinitionError::Unreachable(id) if id == "b"));
    }

    #[test]
    fn test_backward_next_keeps_elements_reachable() {
        let def = job(
            "looping",
            vec![
                batchlet_step(
                    "a",
                    vec![Transition::Next {
                        on: "AGAIN".to_string(),
                        to: "a".to_string(),
                    }],
                ),
                batchlet_step("b", vec![]),
            ],
        );
        assert!(validate_definition(&def).is_ok());
    }

    #[test]
    fn test_split_member_flow_rules() {
        let def = job(
            "splitjob",
            vec![JobElement::Split(kiln_types::job::SplitDefinition {
                id: "s".to_string(),
                flows: vec![kiln_types::job::FlowDefinition {
                    id: "branch".to_string(),
                    elements: vec![batchlet_step("inner", vec![])],
                    transitions: vec![Transition::End {
                        on: "*".to_string(),
                        exit_status: None,
                    }],
                }],
                transitions: vec![],
            })],
        );
        let err = validate_definition(&def).unwrap_err();
        assert!(err.to_string().contains("must not declare transitions"));
    }

    #[test]
    fn test_parse_yaml_runs_validation() {
        let yaml = r#"
name: invalid
elements:
  - type: decision
    id: d
    decider: { name: judge }
  - type: step
    id: a
    batchlet: { name: noop }
"#;
        let err = parse_job_yaml(yaml).unwrap_err();
        assert!(matches!(err, DefinitionError::DecisionFirst(_)));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs/two-steps.yaml");

        let def = job(
            "two-steps",
            vec![
                batchlet_step(
                    "first",
                    vec![Transition::Next {
                        on: "COMPLETED".to_string(),
                        to: "second".to_string(),
                    }],
                ),
                batchlet_step("second", vec![]),
            ],
        );
        save_job_file(&path, &def).expect("should save");
        let loaded = load_job_file(&path).expect("should load");
        assert_eq!(loaded.name, "two-steps");
        assert_eq!(loaded.elements.len(), 2);
    }

    #[test]
    fn test_discover_jobs() {
        let dir = tempfile::tempdir().unwrap();

        // Two valid job files (one nested) and one non-job YAML.
        let one = job("job-one", vec![batchlet_step("a", vec![])]);
        let two = job("job-two", vec![batchlet_step("b", vec![])]);
        save_job_file(&dir.path().join("one.yaml"), &one).unwrap();
        save_job_file(&dir.path().join("sub/two.yml"), &two).unwrap();
        std::fs::write(dir.path().join("not-a-job.yaml"), "key: value").unwrap();

        let found = discover_jobs(dir.path()).expect("should discover");
        assert_eq!(found.len(), 2, "only the valid job files are returned");
        let mut names: Vec<&str> = found.iter().map(|(_, def)| def.name.as_str()).collect();
        names.sort_unstable();
        assert_eq!(names, vec!["job-one", "job-two"]);
    }

    #[test]
    fn test_discover_nonexistent_dir() {
        let found = discover_jobs(Path::new("/nonexistent/path")).unwrap();
        assert!(found.is_empty());
    }
}
