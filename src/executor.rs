use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::context::{CancelToken, EnvDelta, RunContext};
use crate::error::StageError;
use crate::graph::DependencyGraph;
use crate::observability::MetricsCollector;
use crate::provision::ProvisionerRegistry;
use crate::scheduler::{Concurrency, plan_waves};
use crate::spec::{PipelineSpec, StageSpec};
use crate::step::{self, StepBudget};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// Terminal record of one stage. Immutable once created.
#[derive(Debug, Clone, Serialize)]
pub struct StageResult {
    pub name: String,
    pub status: StageStatus,
    /// Why the stage failed, or which upstream outcome caused a skip.
    pub reason: Option<String>,
    pub log_tail: String,
    pub artifacts: Vec<PathBuf>,
    pub duration_ms: f64,
    #[serde(skip)]
    provision_failed: bool,
}

impl StageResult {
    fn succeeded(name: &str, artifacts: Vec<PathBuf>, log_tail: String, elapsed: Duration) -> Self {
        Self {
            name: name.to_string(),
            status: StageStatus::Succeeded,
            reason: None,
            log_tail,
            artifacts,
            duration_ms: elapsed.as_secs_f64() * 1_000.0,
            provision_failed: false,
        }
    }

    fn failed(
        name: &str,
        reason: String,
        provision_failed: bool,
        log_tail: String,
        elapsed: Duration,
    ) -> Self {
        Self {
            name: name.to_string(),
            status: StageStatus::Failed,
            reason: Some(reason),
            log_tail,
            artifacts: Vec::new(),
            duration_ms: elapsed.as_secs_f64() * 1_000.0,
            provision_failed,
        }
    }

    fn skipped(name: &str, reason: String) -> Self {
        Self {
            name: name.to_string(),
            status: StageStatus::Skipped,
            reason: Some(reason),
            log_tail: String::new(),
            artifacts: Vec::new(),
            duration_ms: 0.0,
            provision_failed: false,
        }
    }

    /// Provisioning failures are treated as required failures even on
    /// optional stages.
    pub fn is_provision_failure(&self) -> bool {
        self.provision_failed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Succeeded,
    Failed,
}

/// Terminal object of a run: every stage's result in schedule order plus
/// the aggregate status the exit code derives from.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub pipeline: String,
    pub status: PipelineStatus,
    pub stages: Vec<StageResult>,
}

impl PipelineResult {
    pub fn succeeded(&self) -> bool {
        self.status == PipelineStatus::Succeeded
    }

    pub fn stage(&self, name: &str) -> Option<&StageResult> {
        self.stages.iter().find(|result| result.name == name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecutorOptions {
    pub concurrency: Concurrency,
    /// Restrict the run to one stage plus its transitive ancestry.
    pub only: Option<String>,
}

pub struct PipelineExecutor {
    spec: PipelineSpec,
    registry: ProvisionerRegistry,
    options: ExecutorOptions,
    metrics: MetricsCollector,
    cancel: CancelToken,
}

impl PipelineExecutor {
    pub fn new(spec: PipelineSpec, registry: ProvisionerRegistry, options: ExecutorOptions) -> Self {
        Self {
            spec,
            registry,
            options,
            metrics: MetricsCollector::new(),
            cancel: CancelToken::default(),
        }
    }

    pub fn spec(&self) -> &PipelineSpec {
        &self.spec
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Resolve the schedule without executing anything.
    pub fn plan(&self) -> Result<Vec<String>> {
        let graph = DependencyGraph::new(&self.spec)?;
        let order = graph.topological_order()?;
        self.filter_only(&graph, order)
    }

    #[instrument(skip(self, ctx), fields(pipeline = self.spec.pipeline.as_str()))]
    pub fn execute(&self, ctx: &mut RunContext) -> Result<PipelineResult> {
        self.metrics.reset();
        let total_start = Instant::now();

        // Spec validation failures abort before any step executes.
        let graph = DependencyGraph::new(&self.spec)?;
        let order = graph.topological_order()?;
        let order = self.filter_only(&graph, order)?;

        let mut results: Vec<StageResult> = Vec::with_capacity(order.len());
        match self.options.concurrency {
            Concurrency::Sequential => self.run_sequential(&order, ctx, &mut results)?,
            Concurrency::Parallel => self.run_parallel(&graph, &order, ctx, &mut results)?,
        }

        self.metrics.record_total_duration(total_start.elapsed());
        Ok(PipelineResult {
            pipeline: self.spec.pipeline.clone(),
            status: self.overall(&results),
            stages: results,
        })
    }

    fn filter_only(&self, graph: &DependencyGraph, order: Vec<String>) -> Result<Vec<String>> {
        let Some(only) = &self.options.only else {
            return Ok(order);
        };
        let closure = graph
            .ancestry(only)
            .with_context(|| format!("Unknown stage '{only}'"))?;
        Ok(order.into_iter().filter(|name| closure.contains(name)).collect())
    }

    fn run_sequential(
        &self,
        order: &[String],
        ctx: &mut RunContext,
        results: &mut Vec<StageResult>,
    ) -> Result<()> {
        for name in order {
            let stage = self
                .spec
                .stage(name)
                .with_context(|| format!("Stage '{name}' missing from spec"))?;

            if self.cancel.is_cancelled() {
                results.push(StageResult::failed(
                    name,
                    "run cancelled before stage started".to_string(),
                    false,
                    String::new(),
                    Duration::ZERO,
                ));
                self.metrics.record_stage_failed();
                continue;
            }

            if let Some(reason) = self.skip_reason(stage, results) {
                info!(stage = name.as_str(), reason = reason.as_str(), "Stage skipped");
                results.push(StageResult::skipped(name, reason));
                self.metrics.record_stage_skipped();
                continue;
            }

            let (result, delta) = self.run_stage(stage, ctx);
            if result.status == StageStatus::Succeeded {
                self.metrics.record_stage_succeeded();
                if let Some(delta) = delta {
                    ctx.merge(delta);
                }
            } else {
                self.metrics.record_stage_failed();
            }
            results.push(result);
        }
        Ok(())
    }

    fn run_parallel(
        &self,
        graph: &DependencyGraph,
        order: &[String],
        ctx: &mut RunContext,
        results: &mut Vec<StageResult>,
    ) -> Result<()> {
        let waves = plan_waves(graph, order)?;
        for wave in waves {
            if self.cancel.is_cancelled() {
                for name in &wave {
                    results.push(StageResult::failed(
                        name,
                        "run cancelled before stage started".to_string(),
                        false,
                        String::new(),
                        Duration::ZERO,
                    ));
                    self.metrics.record_stage_failed();
                }
                continue;
            }

            // Skips are decided against completed waves only, so every
            // stage in this wave sees the same upstream picture.
            let mut to_run: Vec<&StageSpec> = Vec::new();
            for name in &wave {
                let stage = self
                    .spec
                    .stage(name)
                    .with_context(|| format!("Stage '{name}' missing from spec"))?;
                if let Some(reason) = self.skip_reason(stage, results) {
                    info!(stage = name.as_str(), reason = reason.as_str(), "Stage skipped");
                    results.push(StageResult::skipped(name, reason));
                    self.metrics.record_stage_skipped();
                } else {
                    to_run.push(stage);
                }
            }

            let shared: &RunContext = ctx;
            let outcomes: Vec<(StageResult, Option<EnvDelta>)> = std::thread::scope(|scope| {
                let handles: Vec<_> = to_run
                    .iter()
                    .map(|&stage| scope.spawn(move || self.run_stage(stage, shared)))
                    .collect();
                handles
                    .into_iter()
                    .zip(&to_run)
                    .map(|(handle, stage)| {
                        handle.join().unwrap_or_else(|_| {
                            (
                                StageResult::failed(
                                    &stage.name,
                                    "stage worker panicked".to_string(),
                                    false,
                                    String::new(),
                                    Duration::ZERO,
                                ),
                                None,
                            )
                        })
                    })
                    .collect()
            });

            // Merge env deltas in declaration order to keep runs deterministic.
            for (result, delta) in outcomes {
                if result.status == StageStatus::Succeeded {
                    self.metrics.record_stage_succeeded();
                    if let Some(delta) = delta {
                        ctx.merge(delta);
                    }
                } else {
                    self.metrics.record_stage_failed();
                }
                results.push(result);
            }
        }
        Ok(())
    }

    /// Per-edge failure policy. A required upstream failure (or any skip)
    /// propagates; an optional upstream failure is tolerated unless the
    /// edge is declared hard or the upstream failed while provisioning.
    fn skip_reason(&self, stage: &StageSpec, results: &[StageResult]) -> Option<String> {
        for dep in stage.dependencies() {
            let Some(prior) = results.iter().find(|result| result.name == dep) else {
                continue;
            };
            match prior.status {
                StageStatus::Succeeded => {}
                StageStatus::Skipped => {
                    return Some(format!("dependency '{dep}' was skipped"));
                }
                StageStatus::Failed => {
                    let dep_required = self
                        .spec
                        .stage(dep)
                        .map(|spec| spec.required)
                        .unwrap_or(true);
                    if prior.is_provision_failure() {
                        return Some(format!("dependency '{dep}' failed while provisioning"));
                    }
                    if dep_required {
                        return Some(format!("required dependency '{dep}' failed"));
                    }
                    if stage.is_hard_dependency(dep) {
                        return Some(format!("hard dependency '{dep}' failed"));
                    }
                    debug!(
                        stage = stage.name.as_str(),
                        dependency = dep,
                        "Tolerating optional dependency failure"
                    );
                }
            }
        }
        None
    }

    fn run_stage(&self, stage: &StageSpec, ctx: &RunContext) -> (StageResult, Option<EnvDelta>) {
        let span = tracing::span!(tracing::Level::DEBUG, "stage", stage = stage.name.as_str());
        let _span_guard = span.enter();
        let _timer = self.metrics.start_stage(&stage.name);
        let started = Instant::now();

        let mut delta = EnvDelta::default();
        for toolchain in &stage.toolchains {
            let provisioner = match self.registry.create(toolchain) {
                Ok(provisioner) => provisioner,
                Err(err) => {
                    let tool = toolchain.tool.clone().unwrap_or_else(|| toolchain.kind.clone());
                    let error = StageError::Provision {
                        tool,
                        cause: err.to_string(),
                    };
                    warn!(error = %error, "Provisioning failed");
                    return (
                        StageResult::failed(
                            &stage.name,
                            error.to_string(),
                            true,
                            String::new(),
                            started.elapsed(),
                        ),
                        None,
                    );
                }
            };

            let key = provisioner.key();
            if ctx.is_satisfied(&key) || delta.satisfied.contains(&key) {
                debug!(
                    requirement = provisioner.describe().as_str(),
                    "Requirement already satisfied; skipping provisioning"
                );
                continue;
            }

            info!(requirement = provisioner.describe().as_str(), "Provisioning toolchain");
            let env = ctx.env_with(&delta);
            match provisioner.ensure(&env, ctx.cwd(), ctx.log()) {
                Ok(tool_delta) => {
                    delta.extend(tool_delta);
                    delta.satisfied.insert(key);
                }
                Err(error) => {
                    warn!(error = %error, "Provisioning failed");
                    return (
                        StageResult::failed(
                            &stage.name,
                            error.to_string(),
                            true,
                            String::new(),
                            started.elapsed(),
                        ),
                        None,
                    );
                }
            }
        }

        let env = ctx.env_with(&delta);
        let budget = StepBudget {
            deadline: stage
                .timeout_secs
                .map(|secs| started + Duration::from_secs(secs)),
            timeout_secs: stage.timeout_secs.unwrap_or(0),
        };

        let mut transcript = String::new();
        let mut artifacts = Vec::new();
        for (index, step_spec) in stage.steps.iter().enumerate() {
            if self.cancel.is_cancelled() {
                let error = StageError::Cancelled {
                    stage: stage.name.clone(),
                    index,
                };
                return (
                    StageResult::failed(
                        &stage.name,
                        error.to_string(),
                        false,
                        step::log_tail(&transcript),
                        started.elapsed(),
                    ),
                    None,
                );
            }

            info!(step = index, command = step_spec.run.as_str(), "Running step");
            match step::run_step(
                step_spec,
                &stage.name,
                index,
                &env,
                ctx.cwd(),
                budget,
                &self.cancel,
                ctx.log(),
            ) {
                Ok(outcome) => {
                    self.metrics.record_step();
                    if !outcome.combined_output.is_empty() {
                        transcript.push_str(&outcome.combined_output);
                        if !transcript.ends_with('\n') {
                            transcript.push('\n');
                        }
                    }
                    artifacts.extend(outcome.artifacts);
                }
                Err(error) => {
                    let tail = match &error {
                        StageError::StepExit { tail, .. } => tail.clone(),
                        _ => step::log_tail(&transcript),
                    };
                    warn!(error = %error, "Stage failed");
                    return (
                        StageResult::failed(
                            &stage.name,
                            error.to_string(),
                            error.is_provisioning(),
                            tail,
                            started.elapsed(),
                        ),
                        None,
                    );
                }
            }
        }

        info!(artifacts = artifacts.len(), "Stage succeeded");
        (
            StageResult::succeeded(
                &stage.name,
                artifacts,
                step::log_tail(&transcript),
                started.elapsed(),
            ),
            Some(delta),
        )
    }

    /// Failed iff a required stage failed; optional failures never fail the
    /// pipeline on their own.
    fn overall(&self, results: &[StageResult]) -> PipelineStatus {
        let failed = results.iter().any(|result| {
            result.status == StageStatus::Failed
                && (result.is_provision_failure()
                    || self
                        .spec
                        .stage(&result.name)
                        .map(|stage| stage.required)
                        .unwrap_or(true))
        });
        if failed {
            PipelineStatus::Failed
        } else {
            PipelineStatus::Succeeded
        }
    }
}
