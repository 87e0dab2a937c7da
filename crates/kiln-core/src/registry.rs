//! Explicit artifact registry.
//!
//! Replaces reflective lookup-by-name with a plain map from artifact name to
//! a factory closure. Factories receive the properties declared on the
//! artifact reference in the job definition and return a fresh instance;
//! the engines resolve every artifact a step needs once, at step entry.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use kiln_types::job::{ArtifactRef, Properties};

use crate::artifact::{
    Batchlet, CheckpointAlgorithm, ChunkListener, Decider, ItemProcessor, ItemReader, ItemWriter,
    JobListener, PartitionAnalyzer, PartitionCollector, PartitionMapper, RetryListener,
    SkipListener, StepListener,
};

// ---------------------------------------------------------------------------
// Artifact
// ---------------------------------------------------------------------------

/// A freshly constructed batch artifact of any kind.
pub enum Artifact {
    Reader(Box<dyn ItemReader>),
    Processor(Box<dyn ItemProcessor>),
    Writer(Box<dyn ItemWriter>),
    Batchlet(Box<dyn Batchlet>),
    Decider(Box<dyn Decider>),
    CheckpointAlgorithm(Box<dyn CheckpointAlgorithm>),
    PartitionMapper(Box<dyn PartitionMapper>),
    PartitionCollector(Box<dyn PartitionCollector>),
    PartitionAnalyzer(Box<dyn PartitionAnalyzer>),
    JobListener(Box<dyn JobListener>),
    StepListener(Box<dyn StepListener>),
    ChunkListener(Box<dyn ChunkListener>),
    SkipListener(Box<dyn SkipListener>),
    RetryListener(Box<dyn RetryListener>),
}

impl Artifact {
    /// The kind name used in wrong-kind error messages.
    fn kind(&self) -> &'static str {
        match self {
            Artifact::Reader(_) => "reader",
            Artifact::Processor(_) => "processor",
            Artifact::Writer(_) => "writer",
            Artifact::Batchlet(_) => "batchlet",
            Artifact::Decider(_) => "decider",
            Artifact::CheckpointAlgorithm(_) => "checkpoint_algorithm",
            Artifact::PartitionMapper(_) => "partition_mapper",
            Artifact::PartitionCollector(_) => "partition_collector",
            Artifact::PartitionAnalyzer(_) => "partition_analyzer",
            Artifact::JobListener(_) => "job_listener",
            Artifact::StepListener(_) => "step_listener",
            Artifact::ChunkListener(_) => "chunk_listener",
            Artifact::SkipListener(_) => "skip_listener",
            Artifact::RetryListener(_) => "retry_listener",
        }
    }
}

/// Factory producing an artifact from its declared properties.
pub type ArtifactFactory = Arc<dyn Fn(&Properties) -> Artifact + Send + Sync>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors resolving artifacts from the registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No factory registered under the requested name.
    #[error("no artifact registered under name '{0}'")]
    UnknownArtifact(String),

    /// The factory produced a different artifact kind than the caller needs.
    #[error("artifact '{name}' is a {actual}, expected a {expected}")]
    WrongKind {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },
}

// ---------------------------------------------------------------------------
// ArtifactRegistry
// ---------------------------------------------------------------------------

/// Name -> factory map for every artifact a job definition references.
#[derive(Default)]
pub struct ArtifactRegistry {
    factories: HashMap<String, ArtifactFactory>,
}

impl ArtifactRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `name`, replacing any previous registration.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&Properties) -> Artifact + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Whether a factory is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Construct the artifact referenced by `artifact_ref`.
    pub fn resolve(&self, artifact_ref: &ArtifactRef) -> Result<Artifact, RegistryError> {
        let factory = self
            .factories
            .get(&artifact_ref.name)
            .ok_or_else(|| RegistryError::UnknownArtifact(artifact_ref.name.clone()))?;
        Ok(factory(&artifact_ref.properties))
    }

    pub fn resolve_reader(
        &self,
        artifact_ref: &ArtifactRef,
    ) -> Result<Box<dyn ItemReader>, RegistryError> {
        match self.resolve(artifact_ref)? {
            Artifact::Reader(reader) => Ok(reader),
            other => Err(wrong_kind(artifact_ref, "reader", &other)),
        }
    }

    pub fn resolve_processor(
        &self,
        artifact_ref: &ArtifactRef,
    ) -> Result<Box<dyn ItemProcessor>, RegistryError> {
        match self.resolve(artifact_ref)? {
            Artifact::Processor(processor) => Ok(processor),
            other => Err(wrong_kind(artifact_ref, "processor", &other)),
        }
    }

    pub fn resolve_writer(
        &self,
        artifact_ref: &ArtifactRef,
    ) -> Result<Box<dyn ItemWriter>, RegistryError> {
        match self.resolve(artifact_ref)? {
            Artifact::Writer(writer) => Ok(writer),
            other => Err(wrong_kind(artifact_ref, "writer", &other)),
        }
    }

    pub fn resolve_batchlet(
        &self,
        artifact_ref: &ArtifactRef,
    ) -> Result<Box<dyn Batchlet>, RegistryError> {
        match self.resolve(artifact_ref)? {
            Artifact::Batchlet(batchlet) => Ok(batchlet),
            other => Err(wrong_kind(artifact_ref, "batchlet", &other)),
        }
    }

    pub fn resolve_decider(
        &self,
        artifact_ref: &ArtifactRef,
    ) -> Result<Box<dyn Decider>, RegistryError> {
        match self.resolve(artifact_ref)? {
            Artifact::Decider(decider) => Ok(decider),
            other => Err(wrong_kind(artifact_ref, "decider", &other)),
        }
    }

    pub fn resolve_checkpoint_algorithm(
        &self,
        artifact_ref: &ArtifactRef,
    ) -> Result<Box<dyn CheckpointAlgorithm>, RegistryError> {
        match self.resolve(artifact_ref)? {
            Artifact::CheckpointAlgorithm(algorithm) => Ok(algorithm),
            other => Err(wrong_kind(artifact_ref, "checkpoint_algorithm", &other)),
        }
    }

    pub fn resolve_partition_mapper(
        &self,
        artifact_ref: &ArtifactRef,
    ) -> Result<Box<dyn PartitionMapper>, RegistryError> {
        match self.resolve(artifact_ref)? {
            Artifact::PartitionMapper(mapper) => Ok(mapper),
            other => Err(wrong_kind(artifact_ref, "partition_mapper", &other)),
        }
    }

    pub fn resolve_partition_collector(
        &self,
        artifact_ref: &ArtifactRef,
    ) -> Result<Box<dyn PartitionCollector>, RegistryError> {
        match self.resolve(artifact_ref)? {
            Artifact::PartitionCollector(collector) => Ok(collector),
            other => Err(wrong_kind(artifact_ref, "partition_collector", &other)),
        }
    }

    pub fn resolve_partition_analyzer(
        &self,
        artifact_ref: &ArtifactRef,
    ) -> Result<Box<dyn PartitionAnalyzer>, RegistryError> {
        match self.resolve(artifact_ref)? {
            Artifact::PartitionAnalyzer(analyzer) => Ok(analyzer),
            other => Err(wrong_kind(artifact_ref, "partition_analyzer", &other)),
        }
    }

    pub fn resolve_job_listener(
        &self,
        artifact_ref: &ArtifactRef,
    ) -> Result<Box<dyn JobListener>, RegistryError> {
        match self.resolve(artifact_ref)? {
            Artifact::JobListener(listener) => Ok(listener),
            other => Err(wrong_kind(artifact_ref, "job_listener", &other)),
        }
    }
}

fn wrong_kind(artifact_ref: &ArtifactRef, expected: &'static str, actual: &Artifact) -> RegistryError {
    RegistryError::WrongKind {
        name: artifact_ref.name.clone(),
        expected,
        actual: actual.kind(),
    }
}

// ---------------------------------------------------------------------------
// Resolved listeners
// ---------------------------------------------------------------------------

/// The listener artifacts a step resolved at entry, grouped by family.
#[derive(Default)]
pub struct ResolvedListeners {
    pub step: Vec<Box<dyn StepListener>>,
    pub chunk: Vec<Box<dyn ChunkListener>>,
    pub skip: Vec<Box<dyn SkipListener>>,
    pub retry: Vec<Box<dyn RetryListener>>,
}

impl ResolvedListeners {
    /// Resolve all of a step's listener references, sorting each artifact
    /// into its family. Non-listener artifacts are a wrong-kind error.
    pub fn resolve(
        registry: &ArtifactRegistry,
        refs: &[ArtifactRef],
    ) -> Result<Self, RegistryError> {
        let mut listeners = Self::default();
        for artifact_ref in refs {
            match registry.resolve(artifact_ref)? {
                Artifact::StepListener(l) => listeners.step.push(l),
                Artifact::ChunkListener(l) => listeners.chunk.push(l),
                Artifact::SkipListener(l) => listeners.skip.push(l),
                Artifact::RetryListener(l) => listeners.retry.push(l),
                other => return Err(wrong_kind(artifact_ref, "listener", &other)),
            }
        }
        Ok(listeners)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
