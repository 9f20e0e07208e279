use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};

#[cfg(windows)]
const PATH_SEPARATOR: &str = ";";
#[cfg(not(windows))]
const PATH_SEPARATOR: &str = ":";

/// Environment changes produced by provisioning one stage. Deltas stay local
/// to the stage until it succeeds, then merge into the run context before
/// any dependent starts.
#[derive(Debug, Clone, Default)]
pub struct EnvDelta {
    pub vars: BTreeMap<String, String>,
    pub path_prepend: Vec<PathBuf>,
    /// Requirement keys this delta satisfies.
    pub satisfied: BTreeSet<String>,
}

impl EnvDelta {
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty() && self.path_prepend.is_empty() && self.satisfied.is_empty()
    }

    pub fn extend(&mut self, other: EnvDelta) {
        self.vars.extend(other.vars);
        self.path_prepend.extend(other.path_prepend);
        self.satisfied.extend(other.satisfied);
    }
}

/// Process-wide state for one pipeline invocation: the resolved environment
/// set, working directory, satisfied toolchain requirements, and the
/// accumulating log sink.
#[derive(Debug)]
pub struct RunContext {
    env: BTreeMap<String, String>,
    cwd: PathBuf,
    satisfied: BTreeSet<String>,
    log: LogSink,
}

impl RunContext {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            env: std::env::vars().collect(),
            cwd: cwd.into(),
            satisfied: BTreeSet::new(),
            log: LogSink::default(),
        }
    }

    pub fn current() -> Result<Self> {
        let cwd = std::env::current_dir().context("Failed to determine current directory")?;
        Ok(Self::new(cwd))
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn log(&self) -> &LogSink {
        &self.log
    }

    pub fn is_satisfied(&self, key: &str) -> bool {
        self.satisfied.contains(key)
    }

    /// The environment a stage runs with: the shared set plus the stage's
    /// local deltas.
    pub fn env_with(&self, delta: &EnvDelta) -> BTreeMap<String, String> {
        let mut env = self.env.clone();
        apply_delta(&mut env, delta);
        env
    }

    /// Fold a succeeded stage's deltas into the shared state.
    pub fn merge(&mut self, delta: EnvDelta) {
        self.satisfied.extend(delta.satisfied.iter().cloned());
        apply_delta(&mut self.env, &delta);
    }
}

fn apply_delta(env: &mut BTreeMap<String, String>, delta: &EnvDelta) {
    for (key, value) in &delta.vars {
        env.insert(key.clone(), value.clone());
    }
    if !delta.path_prepend.is_empty() {
        let mut parts: Vec<String> = delta
            .path_prepend
            .iter()
            .map(|dir| dir.to_string_lossy().to_string())
            .collect();
        if let Some(existing) = env.get("PATH")
            && !existing.is_empty()
        {
            parts.push(existing.clone());
        }
        env.insert("PATH".to_string(), parts.join(PATH_SEPARATOR));
    }
}

/// Accumulating transcript of every step's combined output, shared across
/// the whole run.
#[derive(Debug, Clone, Default)]
pub struct LogSink {
    inner: Arc<Mutex<String>>,
}

impl LogSink {
    pub fn append(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Ok(mut guard) = self.inner.lock() {
            guard.push_str(text);
            if !text.ends_with('\n') {
                guard.push('\n');
            }
        }
    }

    pub fn contents(&self) -> String {
        self.inner.lock().map(|guard| guard.clone()).unwrap_or_default()
    }
}

/// Cooperative cancellation shared between the executor and its caller.
/// In-flight steps are killed and reaped within a bounded grace period; any
/// stage not yet succeeded at cancellation time ends failed, never succeeded.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
