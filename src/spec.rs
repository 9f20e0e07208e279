use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// A declarative release pipeline document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSpec {
    pub version: u32,
    pub pipeline: String,
    /// Trigger conditions are opaque metadata consumed by an external
    /// trigger collaborator; the orchestrator never interprets them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggers: Option<serde_yaml::Value>,
    pub stages: Vec<StageSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactSpec>,
}

impl PipelineSpec {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;
        let spec: PipelineSpec = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse pipeline YAML: {}", path.display()))?;
        Ok(spec)
    }

    pub fn stage(&self, name: &str) -> Option<&StageSpec> {
        self.stages.iter().find(|stage| stage.name == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: String,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub needs: Vec<String>,
    /// Dependencies this stage cannot run without even when the upstream
    /// stage is optional and its failure would otherwise be tolerated.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hard_needs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub toolchains: Vec<ToolchainSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StepSpec>,
    /// Wall-clock budget for the stage's steps, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl StageSpec {
    /// Every upstream edge: `needs` in declared order, then `hard_needs`
    /// entries not already listed.
    pub fn dependencies(&self) -> Vec<&str> {
        let mut deps: Vec<&str> = self.needs.iter().map(String::as_str).collect();
        for hard in &self.hard_needs {
            if !deps.contains(&hard.as_str()) {
                deps.push(hard);
            }
        }
        deps
    }

    pub fn is_hard_dependency(&self, name: &str) -> bool {
        self.hard_needs.iter().any(|dep| dep == name)
    }
}

fn default_required() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    /// Shell command line, run through the platform shell.
    pub run: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Glob patterns the step must satisfy after a zero exit. Matches are
    /// collected as the stage's artifacts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolchainSpec {
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    /// Minimum version constraint, e.g. ">=3.11" or a bare "3.11".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Command printing the tool version; defaults to `<tool> --version`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe: Option<String>,
    /// Commands run when the requirement is not yet satisfied.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub install: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path_prepend: Vec<PathBuf>,
}

fn default_kind() -> String {
    "tool".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactSpec {
    pub name: String,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_retention_days() -> u32 {
    30
}
