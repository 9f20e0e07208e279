use thiserror::Error;

/// Pre-flight errors: the pipeline document itself is malformed. These abort
/// the run before any step executes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpecError {
    #[error("dependency cycle detected: {}", .0.join(" -> "))]
    CycleDetected(Vec<String>),

    #[error("stage '{stage}' depends on unknown stage '{missing}'")]
    UnknownDependency { stage: String, missing: String },
}

/// Execution-time errors, always scoped to a single stage.
#[derive(Debug, Clone, Error)]
pub enum StageError {
    #[error("failed to provision '{tool}': {cause}")]
    Provision { tool: String, cause: String },

    #[error("step {index} of stage '{stage}' could not be launched: {cause}")]
    Spawn {
        stage: String,
        index: usize,
        cause: String,
    },

    #[error("step {index} of stage '{stage}' exited with status {code}")]
    StepExit {
        stage: String,
        index: usize,
        code: i32,
        tail: String,
    },

    /// The step exited zero but a declared output is missing. A step that
    /// produces none of its declared artifacts did not actually succeed.
    #[error("step {index} of stage '{stage}' produced no file matching '{pattern}'")]
    MissingOutput {
        stage: String,
        index: usize,
        pattern: String,
    },

    #[error("step {index} of stage '{stage}' exceeded the {seconds}s stage timeout")]
    Timeout {
        stage: String,
        index: usize,
        seconds: u64,
    },

    #[error("step {index} of stage '{stage}' was cancelled")]
    Cancelled { stage: String, index: usize },
}

impl StageError {
    /// Provisioning failures disable the whole stage regardless of its
    /// optional flag: an unprovisioned toolchain makes later steps meaningless.
    pub fn is_provisioning(&self) -> bool {
        matches!(self, StageError::Provision { .. })
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, StageError::Cancelled { .. })
    }
}

/// Distribution failed after the pipeline itself succeeded. Reported on top
/// of the successful result, never overwriting stage statuses.
#[derive(Debug, Clone, Error)]
#[error("failed to publish artifact '{name}': {cause}")]
pub struct PublishError {
    pub name: String,
    pub cause: String,
}

impl PublishError {
    pub fn new(name: impl Into<String>, cause: impl ToString) -> Self {
        Self {
            name: name.into(),
            cause: cause.to_string(),
        }
    }
}
