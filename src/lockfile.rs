use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::graph::DependencyGraph;
use crate::spec::{PipelineSpec, StageSpec};

/// Frozen view of a pipeline document: the resolved execution order plus a
/// content hash per stage, so drift between an audited document and what
/// actually runs is detectable.
#[derive(Debug, Serialize)]
pub struct PipelineLock {
    pub pipeline: String,
    pub document_version: u32,
    pub generated_at: DateTime<Utc>,
    pub resolved_order: Vec<String>,
    pub stages: Vec<StageLock>,
}

#[derive(Debug, Serialize)]
pub struct StageLock {
    pub name: String,
    pub required: bool,
    pub needs: Vec<String>,
    pub content_hash: String,
}

pub fn generate_lock(spec: &PipelineSpec, path: &Path) -> Result<()> {
    let graph = DependencyGraph::new(spec)?;
    let resolved_order = graph.topological_order()?;

    let stages = spec
        .stages
        .iter()
        .map(|stage| StageLock {
            name: stage.name.clone(),
            required: stage.required,
            needs: stage.dependencies().iter().map(|dep| dep.to_string()).collect(),
            content_hash: hash_stage(stage),
        })
        .collect();

    let lock = PipelineLock {
        pipeline: spec.pipeline.clone(),
        document_version: spec.version,
        generated_at: Utc::now(),
        resolved_order,
        stages,
    };

    let file = File::create(path)
        .with_context(|| format!("Failed to create lockfile: {}", path.display()))?;
    serde_yaml::to_writer(file, &lock)
        .with_context(|| format!("Failed to write lockfile: {}", path.display()))?;

    Ok(())
}

fn hash_stage(stage: &StageSpec) -> String {
    let mut hasher = Sha256::new();
    hasher.update(stage.name.as_bytes());
    hasher.update(serde_json::to_vec(&stage.steps).unwrap_or_default());
    hasher.update(serde_json::to_vec(&stage.toolchains).unwrap_or_default());
    hasher.update(serde_json::to_vec(&stage.timeout_secs).unwrap_or_default());
    format!("{:x}", hasher.finalize())
}
