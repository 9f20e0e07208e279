use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::context::{CancelToken, LogSink};
use crate::error::StageError;
use crate::spec::StepSpec;

/// How long a killed step may take to exit before the executor stops waiting.
pub const KILL_GRACE: Duration = Duration::from_secs(5);
/// Captured output retained per stage for the final report.
pub const LOG_TAIL_BYTES: usize = 4096;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Wall-clock budget a step runs under, derived from its stage.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepBudget {
    pub deadline: Option<Instant>,
    pub timeout_secs: u64,
}

#[derive(Debug)]
pub struct StepOutcome {
    pub combined_output: String,
    pub artifacts: Vec<PathBuf>,
}

/// Wrap a command line in the platform shell.
pub fn shell_command(command: &str) -> Command {
    #[cfg(windows)]
    {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    }
    #[cfg(not(windows))]
    {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    }
}

enum WaitEnd {
    Exited(ExitStatus),
    Cancelled,
    TimedOut,
}

/// Run one step: spawn the command with the stage-local environment, capture
/// combined output into the sink, wait for exit, then verify every declared
/// output pattern matches at least one existing file.
#[allow(clippy::too_many_arguments)]
pub fn run_step(
    step: &StepSpec,
    stage: &str,
    index: usize,
    env: &BTreeMap<String, String>,
    base_cwd: &Path,
    budget: StepBudget,
    cancel: &CancelToken,
    sink: &LogSink,
) -> Result<StepOutcome, StageError> {
    let cwd = match &step.cwd {
        Some(dir) if dir.is_absolute() => dir.clone(),
        Some(dir) => base_cwd.join(dir),
        None => base_cwd.to_path_buf(),
    };

    let mut command = shell_command(&step.run);
    command
        .current_dir(&cwd)
        .env_clear()
        .envs(env)
        .envs(&step.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command.spawn().map_err(|err| StageError::Spawn {
        stage: stage.to_string(),
        index,
        cause: err.to_string(),
    })?;

    // Drain both pipes off-thread so a chatty step cannot fill the pipe
    // buffer and stall against our wait loop.
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdout_reader = std::thread::spawn(move || read_all(stdout));
    let stderr_reader = std::thread::spawn(move || read_all(stderr));

    let end = loop {
        match child.try_wait() {
            Ok(Some(status)) => break WaitEnd::Exited(status),
            Ok(None) => {}
            Err(err) => {
                kill_and_reap(&mut child);
                return Err(StageError::Spawn {
                    stage: stage.to_string(),
                    index,
                    cause: format!("failed to poll child process: {err}"),
                });
            }
        }
        if cancel.is_cancelled() {
            kill_and_reap(&mut child);
            break WaitEnd::Cancelled;
        }
        if let Some(deadline) = budget.deadline
            && Instant::now() >= deadline
        {
            kill_and_reap(&mut child);
            break WaitEnd::TimedOut;
        }
        std::thread::sleep(POLL_INTERVAL);
    };

    let mut combined = stdout_reader.join().unwrap_or_default();
    let err_output = stderr_reader.join().unwrap_or_default();
    if !err_output.is_empty() {
        if !combined.is_empty() && !combined.ends_with('\n') {
            combined.push('\n');
        }
        combined.push_str(&err_output);
    }
    sink.append(&combined);

    match end {
        WaitEnd::Cancelled => Err(StageError::Cancelled {
            stage: stage.to_string(),
            index,
        }),
        WaitEnd::TimedOut => Err(StageError::Timeout {
            stage: stage.to_string(),
            index,
            seconds: budget.timeout_secs,
        }),
        WaitEnd::Exited(status) if !status.success() => Err(StageError::StepExit {
            stage: stage.to_string(),
            index,
            code: status.code().unwrap_or(-1),
            tail: log_tail(&combined),
        }),
        WaitEnd::Exited(_) => {
            let artifacts = collect_outputs(step, stage, index, &cwd)?;
            Ok(StepOutcome {
                combined_output: combined,
                artifacts,
            })
        }
    }
}

/// Postcondition check: every declared output pattern must match at least
/// one existing file after a zero exit.
fn collect_outputs(
    step: &StepSpec,
    stage: &str,
    index: usize,
    cwd: &Path,
) -> Result<Vec<PathBuf>, StageError> {
    let mut artifacts = Vec::new();
    for pattern in &step.outputs {
        let resolved = if Path::new(pattern).is_absolute() {
            pattern.clone()
        } else {
            cwd.join(pattern).to_string_lossy().to_string()
        };
        let missing = || StageError::MissingOutput {
            stage: stage.to_string(),
            index,
            pattern: pattern.clone(),
        };

        let entries = glob::glob(&resolved).map_err(|_| missing())?;
        let mut matched = false;
        for entry in entries.flatten() {
            if entry.is_file() {
                artifacts.push(entry);
                matched = true;
            }
        }
        if !matched {
            return Err(missing());
        }
    }
    debug!(stage, step = index, artifacts = artifacts.len(), "Declared outputs verified");
    Ok(artifacts)
}

fn kill_and_reap(child: &mut Child) {
    let _ = child.kill();
    let deadline = Instant::now() + KILL_GRACE;
    while Instant::now() < deadline {
        match child.try_wait() {
            Ok(Some(_)) | Err(_) => return,
            Ok(None) => std::thread::sleep(POLL_INTERVAL),
        }
    }
}

fn read_all<R: Read>(pipe: Option<R>) -> String {
    let Some(mut pipe) = pipe else {
        return String::new();
    };
    let mut buffer = Vec::new();
    let _ = pipe.read_to_end(&mut buffer);
    String::from_utf8_lossy(&buffer).to_string()
}

/// The last `LOG_TAIL_BYTES` of captured output, on a char boundary.
pub fn log_tail(output: &str) -> String {
    if output.len() <= LOG_TAIL_BYTES {
        return output.to_string();
    }
    let mut start = output.len() - LOG_TAIL_BYTES;
    while !output.is_char_boundary(start) {
        start += 1;
    }
    output[start..].to_string()
}
