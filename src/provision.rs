use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use tracing::{debug, info};

use crate::context::{EnvDelta, LogSink};
use crate::error::StageError;
use crate::spec::ToolchainSpec;
use crate::step::shell_command;

/// Ensures one toolchain requirement is met on the execution host, yielding
/// the environment delta later steps need to locate the tool.
pub trait Provisioner: Send + Sync {
    /// Idempotence key: a requirement already recorded as satisfied in the
    /// run context is never re-provisioned.
    fn key(&self) -> String;

    fn describe(&self) -> String;

    fn ensure(
        &self,
        env: &BTreeMap<String, String>,
        cwd: &Path,
        sink: &LogSink,
    ) -> Result<EnvDelta, StageError>;
}

type ProvisionerConstructor =
    Arc<dyn Fn(&ToolchainSpec) -> Result<Box<dyn Provisioner>> + Send + Sync>;

pub struct ProvisionerRegistry {
    factories: HashMap<String, ProvisionerConstructor>,
}

impl Default for ProvisionerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProvisionerRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        register_defaults(&mut registry);
        registry
    }

    pub fn register<F>(&mut self, kind: impl Into<String>, constructor: F)
    where
        F: Fn(&ToolchainSpec) -> Result<Box<dyn Provisioner>> + Send + Sync + 'static,
    {
        self.factories.insert(kind.into(), Arc::new(constructor));
    }

    pub fn create(&self, spec: &ToolchainSpec) -> Result<Box<dyn Provisioner>> {
        let factory = self.factories.get(&spec.kind).ok_or_else(|| {
            anyhow!(
                "Unknown toolchain kind '{}'. Available kinds: {}",
                spec.kind,
                self.known_kinds().join(", ")
            )
        })?;
        factory(spec)
    }

    pub fn known_kinds(&self) -> Vec<String> {
        let mut kinds: Vec<_> = self.factories.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

pub fn register_defaults(registry: &mut ProvisionerRegistry) {
    registry.register("tool", |spec| {
        Ok(Box::new(ToolProvisioner::from_spec(spec)?))
    });
    registry.register("env", |spec| {
        Ok(Box::new(EnvProvisioner::from_spec(spec)?))
    });
}

/// Probes a tool on the execution host and, when the version constraint is
/// not met, runs the declared install commands and probes again.
struct ToolProvisioner {
    tool: String,
    minimum: Option<Vec<u64>>,
    minimum_raw: Option<String>,
    probe: String,
    install: Vec<String>,
    exports: EnvDelta,
}

impl ToolProvisioner {
    fn from_spec(spec: &ToolchainSpec) -> Result<Self> {
        let tool = spec
            .tool
            .clone()
            .ok_or_else(|| anyhow!("'tool' toolchains require a 'tool' name"))?;
        let minimum_raw = spec
            .version
            .as_ref()
            .map(|raw| raw.trim().trim_start_matches(">=").trim().to_string());
        let minimum = match &minimum_raw {
            Some(raw) => Some(
                parse_version(raw)
                    .ok_or_else(|| anyhow!("Unparsable version constraint '{raw}' for '{tool}'"))?,
            ),
            None => None,
        };
        let probe = spec
            .probe
            .clone()
            .unwrap_or_else(|| format!("{tool} --version"));

        Ok(Self {
            tool,
            minimum,
            minimum_raw,
            probe,
            install: spec.install.clone(),
            exports: EnvDelta {
                vars: spec.env.clone(),
                path_prepend: spec.path_prepend.clone(),
                satisfied: Default::default(),
            },
        })
    }

    fn probe_satisfied(&self, env: &BTreeMap<String, String>, cwd: &Path, sink: &LogSink) -> bool {
        let mut command = shell_command(&self.probe);
        command.current_dir(cwd).env_clear().envs(env);
        let output = match command.output() {
            Ok(output) => output,
            Err(err) => {
                debug!(tool = self.tool.as_str(), error = %err, "Probe could not run");
                return false;
            }
        };
        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        sink.append(&text);

        if !output.status.success() {
            return false;
        }
        let Some(minimum) = &self.minimum else {
            return true;
        };
        match extract_version(&text) {
            Some(found) => version_at_least(&found, minimum),
            None => {
                debug!(
                    tool = self.tool.as_str(),
                    "Probe output carried no parsable version"
                );
                false
            }
        }
    }

    fn run_install(
        &self,
        env: &BTreeMap<String, String>,
        cwd: &Path,
        sink: &LogSink,
    ) -> Result<(), StageError> {
        for install in &self.install {
            info!(tool = self.tool.as_str(), command = install.as_str(), "Installing toolchain");
            let mut command = shell_command(install);
            command.current_dir(cwd).env_clear().envs(env);
            let output = command.output().map_err(|err| StageError::Provision {
                tool: self.tool.clone(),
                cause: format!("install step '{install}' could not be launched: {err}"),
            })?;
            let mut text = String::from_utf8_lossy(&output.stdout).to_string();
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            sink.append(&text);
            if !output.status.success() {
                return Err(StageError::Provision {
                    tool: self.tool.clone(),
                    cause: format!(
                        "install step '{install}' exited with status {}",
                        output.status.code().unwrap_or(-1)
                    ),
                });
            }
        }
        Ok(())
    }
}

impl Provisioner for ToolProvisioner {
    fn key(&self) -> String {
        format!(
            "tool:{}@{}",
            self.tool,
            self.minimum_raw.as_deref().unwrap_or("*")
        )
    }

    fn describe(&self) -> String {
        match &self.minimum_raw {
            Some(version) => format!("{} >= {}", self.tool, version),
            None => self.tool.clone(),
        }
    }

    fn ensure(
        &self,
        env: &BTreeMap<String, String>,
        cwd: &Path,
        sink: &LogSink,
    ) -> Result<EnvDelta, StageError> {
        // Probe against the environment the steps will actually see.
        let mut probe_env = env.clone();
        for (key, value) in &self.exports.vars {
            probe_env.insert(key.clone(), value.clone());
        }

        if self.probe_satisfied(&probe_env, cwd, sink) {
            debug!(tool = self.tool.as_str(), "Toolchain already satisfied");
            return Ok(self.exports.clone());
        }

        if self.install.is_empty() {
            return Err(StageError::Provision {
                tool: self.tool.clone(),
                cause: match &self.minimum_raw {
                    Some(version) => {
                        format!("version constraint >={version} not satisfied and no install steps declared")
                    }
                    None => "tool not found and no install steps declared".to_string(),
                },
            });
        }

        self.run_install(&probe_env, cwd, sink)?;

        if !self.probe_satisfied(&probe_env, cwd, sink) {
            return Err(StageError::Provision {
                tool: self.tool.clone(),
                cause: "requirement still unsatisfied after install steps".to_string(),
            });
        }

        Ok(self.exports.clone())
    }
}

/// Exports fixed environment variables and PATH entries; nothing to probe.
struct EnvProvisioner {
    exports: EnvDelta,
}

impl EnvProvisioner {
    fn from_spec(spec: &ToolchainSpec) -> Result<Self> {
        if spec.env.is_empty() && spec.path_prepend.is_empty() {
            anyhow::bail!("'env' toolchains must declare 'env' variables or 'path_prepend' entries");
        }
        Ok(Self {
            exports: EnvDelta {
                vars: spec.env.clone(),
                path_prepend: spec.path_prepend.clone(),
                satisfied: Default::default(),
            },
        })
    }
}

impl Provisioner for EnvProvisioner {
    fn key(&self) -> String {
        let vars: Vec<String> = self
            .exports
            .vars
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        let paths: Vec<String> = self
            .exports
            .path_prepend
            .iter()
            .map(|dir| dir.to_string_lossy().to_string())
            .collect();
        format!("env:{};path:{}", vars.join(","), paths.join(","))
    }

    fn describe(&self) -> String {
        format!("{} environment export(s)", self.exports.vars.len())
    }

    fn ensure(
        &self,
        _env: &BTreeMap<String, String>,
        _cwd: &Path,
        _sink: &LogSink,
    ) -> Result<EnvDelta, StageError> {
        Ok(self.exports.clone())
    }
}

fn parse_version(raw: &str) -> Option<Vec<u64>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    raw.split('.').map(|part| part.parse::<u64>().ok()).collect()
}

/// First dotted-numeric token in probe output, e.g. "Python 3.11.4" -> [3, 11, 4].
fn extract_version(output: &str) -> Option<Vec<u64>> {
    for token in output.split_whitespace() {
        let trimmed = token.trim_matches(|c: char| !c.is_ascii_digit() && c != '.');
        if trimmed.chars().next().is_some_and(|c| c.is_ascii_digit())
            && let Some(version) = parse_version(trimmed)
        {
            return Some(version);
        }
    }
    None
}

fn version_at_least(found: &[u64], minimum: &[u64]) -> bool {
    for idx in 0..found.len().max(minimum.len()) {
        let have = found.get(idx).copied().unwrap_or(0);
        let want = minimum.get(idx).copied().unwrap_or(0);
        if have != want {
            return have > want;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_version_from_noisy_output() {
        assert_eq!(
            extract_version("Python 3.11.4 (main, build 2023)"),
            Some(vec![3, 11, 4])
        );
        assert_eq!(extract_version("v1.2"), Some(vec![1, 2]));
        assert_eq!(extract_version("no digits here"), None);
    }

    #[test]
    fn version_comparison_pads_shorter_side() {
        assert!(version_at_least(&[3, 11, 4], &[3, 11]));
        assert!(version_at_least(&[3, 11], &[3, 11, 0]));
        assert!(!version_at_least(&[3, 10], &[3, 11]));
    }
}
