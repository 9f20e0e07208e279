use std::collections::BTreeSet;

use serde::Serialize;

use crate::graph::DependencyGraph;
use crate::provision::ProvisionerRegistry;
use crate::spec::{PipelineSpec, StageSpec};

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

/// Pre-flight validation. Every error here aborts the run before any step
/// executes; a malformed pipeline is a spec problem, not a runtime one.
pub fn validate_pipeline(spec: &PipelineSpec, registry: &ProvisionerRegistry) -> ValidationReport {
    let mut report = ValidationReport::default();

    if spec.version != 1 {
        report
            .errors
            .push(format!("Unsupported pipeline version: {}", spec.version));
    }

    if spec.pipeline.trim().is_empty() {
        report.errors.push("Pipeline name cannot be empty".into());
    }

    if spec.stages.is_empty() {
        report
            .errors
            .push("Pipeline must declare at least one stage".into());
    }

    let mut seen: BTreeSet<&str> = BTreeSet::new();
    for stage in &spec.stages {
        if stage.name.trim().is_empty() {
            report.errors.push("Stage names cannot be empty".into());
        }
        if !seen.insert(stage.name.as_str()) {
            report
                .errors
                .push(format!("Duplicate stage name '{}'", stage.name));
        }
    }

    for stage in &spec.stages {
        for dep in stage.dependencies() {
            if spec.stage(dep).is_none() {
                report.errors.push(format!(
                    "Stage '{}' depends on unknown stage '{}'",
                    stage.name, dep
                ));
            }
        }
    }

    // Cycle detection is only meaningful once names resolve.
    if report.errors.is_empty()
        && let Err(err) = DependencyGraph::new(spec).and_then(|graph| graph.topological_order())
    {
        report.errors.push(err.to_string());
    }

    for (idx, stage) in spec.stages.iter().enumerate() {
        report.merge(validate_stage(idx, stage, spec, registry));
    }

    if let Some(artifact) = &spec.artifact
        && artifact.name.trim().is_empty()
    {
        report.errors.push("Artifact name cannot be empty".into());
    }

    report
}

fn validate_stage(
    idx: usize,
    stage: &StageSpec,
    spec: &PipelineSpec,
    registry: &ProvisionerRegistry,
) -> ValidationReport {
    let mut report = ValidationReport::default();
    let label = format!("Stage {} ('{}')", idx + 1, stage.name);

    if stage.steps.is_empty() && stage.toolchains.is_empty() {
        report
            .warnings
            .push(format!("{label} declares neither toolchains nor steps"));
    }

    if stage.timeout_secs == Some(0) {
        report
            .errors
            .push(format!("{label} timeout must be at least one second"));
    }

    for hard in &stage.hard_needs {
        if spec.stage(hard).map(|dep| dep.required).unwrap_or(false) {
            report.warnings.push(format!(
                "{label} lists required stage '{hard}' as a hard dependency, which is redundant"
            ));
        }
    }

    for (step_idx, step) in stage.steps.iter().enumerate() {
        if step.run.trim().is_empty() {
            report
                .errors
                .push(format!("{label} step {} has an empty command", step_idx + 1));
        }
        let mut outputs: BTreeSet<&str> = BTreeSet::new();
        for pattern in &step.outputs {
            if let Err(err) = glob::Pattern::new(pattern) {
                report.errors.push(format!(
                    "{label} step {} output '{pattern}' is not a valid glob: {err}",
                    step_idx + 1
                ));
            }
            if !outputs.insert(pattern.as_str()) {
                report.warnings.push(format!(
                    "{label} step {} declares output '{pattern}' more than once",
                    step_idx + 1
                ));
            }
        }
    }

    for toolchain in &stage.toolchains {
        if let Err(err) = registry.create(toolchain) {
            report.errors.push(format!("{label}: {err:#}"));
        }
    }

    report
}
