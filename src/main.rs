use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser, Subcommand, ValueHint};
use clap_complete::Shell;
use serde_json::to_writer_pretty;
use stagehand::executor::{ExecutorOptions, PipelineExecutor, PipelineResult, StageStatus};
use stagehand::lockfile::generate_lock;
use stagehand::observability::log_snapshot;
#[cfg(feature = "metrics-server")]
use stagehand::observability::server::MetricsServer;
use stagehand::presets::{generate_preset, known_presets};
use stagehand::provision::ProvisionerRegistry;
use stagehand::publish::{ArtifactStore, LocalDirStore, build_manifest};
use stagehand::scheduler::Concurrency;
use stagehand::spec::PipelineSpec;
use stagehand::validation::validate_pipeline;
use stagehand::{RunContext, StageResult};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

#[cfg(feature = "otel")]
use opentelemetry::KeyValue;
#[cfg(feature = "otel")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "otel")]
use opentelemetry_sdk::{resource::Resource, trace as sdktrace};
#[cfg(feature = "metrics-server")]
use std::net::SocketAddr;

const EXIT_PIPELINE_FAILED: i32 = 1;
const EXIT_PUBLISH_FAILED: i32 = 2;
const EXIT_VALIDATION_FAILED: i32 = 3;

fn main() -> Result<()> {
    let cli = Cli::parse();
    let Cli {
        command,
        quick_args,
    } = cli;

    if command.is_some() && !quick_args.is_empty() {
        Cli::command()
            .error(
                ErrorKind::ArgumentConflict,
                "Quick run arguments cannot be combined with subcommands",
            )
            .exit();
    }

    let otlp_endpoint_for_tracing = command.as_ref().and_then(|command| match command {
        Commands::Run { otlp_endpoint, .. } => otlp_endpoint.clone(),
        _ => None,
    });

    configure_tracing(otlp_endpoint_for_tracing.as_deref())?;

    let outcome: Result<i32> = if let Some(command) = command {
        match command {
            Commands::Run {
                pipeline,
                dry_run,
                only,
                artifact_name,
                artifact_dir,
                report,
                concurrency,
                print_metrics,
                metrics_json,
                metrics_prometheus,
                metrics_listen,
                otlp_endpoint,
            } => {
                let _ = otlp_endpoint; // already handled in tracing configuration
                run_pipeline(RunParams {
                    pipeline,
                    dry_run,
                    only,
                    artifact_name,
                    artifact_dir,
                    report,
                    concurrency,
                    print_metrics,
                    metrics_json,
                    metrics_prometheus,
                    metrics_listen,
                })
            }
            Commands::Validate { pipeline } => validate_pipeline_cmd(pipeline),
            Commands::Lock { pipeline, output } => lock_pipeline(pipeline, output),
            Commands::Pipeline { action } => pipeline_command(action),
            Commands::Completions { shell } => {
                let mut cmd = Cli::command();
                let name = cmd.get_name().to_string();
                clap_complete::generate(shell, &mut cmd, name, &mut io::stdout());
                Ok(0)
            }
        }
    } else if quick_args.is_empty() {
        Cli::command().print_help()?;
        println!();
        Ok(0)
    } else {
        quick_run(quick_args)
    };

    #[cfg(feature = "otel")]
    if otlp_endpoint_for_tracing.is_some() {
        opentelemetry::global::shutdown_tracer_provider();
    }

    match outcome? {
        0 => Ok(()),
        code => std::process::exit(code),
    }
}

fn configure_tracing(otlp_endpoint: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(feature = "otel")]
    {
        if let Some(endpoint) = otlp_endpoint {
            let tracer =
                opentelemetry_otlp::new_pipeline()
                    .tracing()
                    .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(
                        vec![KeyValue::new("service.name", "stagehand")],
                    )))
                    .with_exporter(
                        opentelemetry_otlp::new_exporter()
                            .tonic()
                            .with_endpoint(endpoint),
                    )
                    .install_simple()?;

            tracing_subscriber::registry()
                .with(filter.clone())
                .with(tracing_subscriber::fmt::layer())
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
        } else {
            tracing_subscriber::registry()
                .with(filter.clone())
                .with(tracing_subscriber::fmt::layer())
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
        }
    }

    #[cfg(not(feature = "otel"))]
    {
        if let Some(endpoint) = otlp_endpoint {
            eprintln!(
                "warning: --otlp-endpoint '{}' requested but OpenTelemetry support is not enabled. Rebuild with --features otel.",
                endpoint
            );
        }

        tracing_subscriber::registry()
            .with(filter.clone())
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(|err| anyhow!(err.to_string()))?;
    }

    Ok(())
}

struct RunParams {
    pipeline: PathBuf,
    dry_run: bool,
    only: Option<String>,
    artifact_name: Option<String>,
    artifact_dir: PathBuf,
    report: Option<PathBuf>,
    concurrency: Concurrency,
    print_metrics: bool,
    metrics_json: Option<PathBuf>,
    metrics_prometheus: Option<PathBuf>,
    metrics_listen: Option<String>,
}

fn run_pipeline(params: RunParams) -> Result<i32> {
    let spec = PipelineSpec::load(&params.pipeline)?;
    let registry = ProvisionerRegistry::with_defaults();

    let report = validate_pipeline(&spec, &registry);
    for warning in &report.warnings {
        warn!(file = %params.pipeline.display(), "{warning}");
    }
    if !report.is_ok() {
        for error_msg in &report.errors {
            error!(file = %params.pipeline.display(), "{error_msg}");
        }
        return Ok(EXIT_VALIDATION_FAILED);
    }

    let artifact_spec = spec.artifact.clone();
    let executor = PipelineExecutor::new(
        spec,
        registry,
        ExecutorOptions {
            concurrency: params.concurrency,
            only: params.only,
        },
    );

    if params.dry_run {
        let planned = executor.plan()?;
        println!(
            "Execution plan for '{}' ({} stage(s)):",
            executor.spec().pipeline,
            planned.len()
        );
        for (idx, name) in planned.iter().enumerate() {
            let required = executor
                .spec()
                .stage(name)
                .map(|stage| stage.required)
                .unwrap_or(true);
            println!(
                "{:>3}. {} [{}]",
                idx + 1,
                name,
                if required { "required" } else { "optional" }
            );
        }
        return Ok(0);
    }

    let metrics_handle = executor.metrics();

    #[cfg(feature = "metrics-server")]
    let metrics_server = if let Some(addr_str) = params.metrics_listen {
        let addr: SocketAddr = addr_str
            .parse()
            .with_context(|| format!("Invalid metrics listen address: {addr_str}"))?;
        Some(MetricsServer::start(addr, metrics_handle.clone())?)
    } else {
        None
    };

    #[cfg(not(feature = "metrics-server"))]
    if let Some(addr_str) = params.metrics_listen {
        warn!(
            "Metrics server feature not enabled; ignoring --metrics-listen={}.",
            addr_str
        );
    }

    let mut ctx = RunContext::current()?;
    let result = executor.execute(&mut ctx)?;

    render_report(&result);

    if params.print_metrics || params.metrics_json.is_some() || params.metrics_prometheus.is_some()
    {
        let snapshot = metrics_handle.snapshot();
        if params.print_metrics {
            log_snapshot(&snapshot);
        }
        if let Some(path) = params.metrics_json {
            write_json(&path, &snapshot, "metrics")?;
            info!(metrics = %path.display(), "Metrics JSON written");
        }
        if let Some(path) = params.metrics_prometheus {
            ensure_parent(&path, "metrics")?;
            fs::write(&path, snapshot.to_prometheus()).with_context(|| {
                format!("Failed to write Prometheus metrics: {}", path.display())
            })?;
            info!(metrics = %path.display(), "Prometheus metrics written");
        }
    }

    if let Some(path) = &params.report {
        write_json(path, &result, "report")?;
        info!(report = %path.display(), "Run report written");
    }

    #[cfg(feature = "metrics-server")]
    if let Some(mut server) = metrics_server {
        server.stop();
    }

    if !result.succeeded() {
        return Ok(EXIT_PIPELINE_FAILED);
    }

    let (artifact_name, retention_days) = match (params.artifact_name, artifact_spec) {
        (Some(name), Some(artifact)) => (name, artifact.retention_days),
        (Some(name), None) => (name, 30),
        (None, Some(artifact)) => (artifact.name, artifact.retention_days),
        (None, None) => {
            info!("No artifact declared; skipping publish");
            return Ok(0);
        }
    };

    let manifest = match build_manifest(&artifact_name, retention_days, &result) {
        Ok(manifest) => manifest,
        Err(err) => {
            error!(artifact = artifact_name.as_str(), "{err}");
            return Ok(EXIT_PUBLISH_FAILED);
        }
    };
    if manifest.entries.is_empty() {
        warn!(
            artifact = artifact_name.as_str(),
            "No declared outputs were collected; publishing manifest only"
        );
    }

    let store = LocalDirStore::new(&params.artifact_dir);
    match store.publish(&manifest) {
        Ok(location) => {
            info!(
                artifact = location.name.as_str(),
                uri = location.uri.as_str(),
                retention_days = location.retention_days,
                "Artifact available"
            );
            Ok(0)
        }
        Err(err) => {
            // The build itself succeeded; only distribution failed. Both
            // facts are surfaced distinctly.
            error!("{err}");
            Ok(EXIT_PUBLISH_FAILED)
        }
    }
}

fn render_report(result: &PipelineResult) {
    for stage in &result.stages {
        match stage.status {
            StageStatus::Succeeded => info!(
                stage = stage.name.as_str(),
                duration_ms = stage.duration_ms,
                artifacts = stage.artifacts.len(),
                "Stage succeeded"
            ),
            StageStatus::Failed => {
                error!(
                    stage = stage.name.as_str(),
                    reason = stage.reason.as_deref().unwrap_or("unknown"),
                    "Stage failed"
                );
                dump_tail(stage);
            }
            StageStatus::Skipped => warn!(
                stage = stage.name.as_str(),
                reason = stage.reason.as_deref().unwrap_or("unknown"),
                "Stage skipped"
            ),
        }
    }

    if result.succeeded() {
        info!(pipeline = result.pipeline.as_str(), "Pipeline succeeded");
    } else {
        error!(pipeline = result.pipeline.as_str(), "Pipeline failed");
    }
}

fn dump_tail(stage: &StageResult) {
    if stage.log_tail.is_empty() {
        return;
    }
    eprintln!("── captured output: {} ──", stage.name);
    eprintln!("{}", stage.log_tail.trim_end());
}

fn quick_run(args: Vec<String>) -> Result<i32> {
    if args.len() != 1 {
        bail!("Quick run usage: stagehand <pipeline-file>");
    }
    let pipeline = PathBuf::from(&args[0]);
    if !pipeline.exists() {
        bail!("Pipeline file '{}' not found", pipeline.display());
    }
    run_pipeline(RunParams {
        pipeline,
        dry_run: false,
        only: None,
        artifact_name: None,
        artifact_dir: PathBuf::from("artifacts"),
        report: None,
        concurrency: Concurrency::Sequential,
        print_metrics: false,
        metrics_json: None,
        metrics_prometheus: None,
        metrics_listen: None,
    })
}

fn validate_pipeline_cmd(pipeline_path: PathBuf) -> Result<i32> {
    let spec = PipelineSpec::load(&pipeline_path)?;
    let registry = ProvisionerRegistry::with_defaults();
    let report = validate_pipeline(&spec, &registry);

    for warning in &report.warnings {
        warn!(file = %pipeline_path.display(), "{warning}");
    }

    if report.is_ok() {
        info!(file = %pipeline_path.display(), "Pipeline validation passed");
        Ok(0)
    } else {
        for error_msg in &report.errors {
            error!(file = %pipeline_path.display(), "{error_msg}");
        }
        error!(
            "Pipeline validation failed with {} error(s)",
            report.errors.len()
        );
        Ok(EXIT_VALIDATION_FAILED)
    }
}

fn lock_pipeline(pipeline_path: PathBuf, output_path: PathBuf) -> Result<i32> {
    let spec = PipelineSpec::load(&pipeline_path)?;
    let registry = ProvisionerRegistry::with_defaults();
    let report = validate_pipeline(&spec, &registry);

    for warning in &report.warnings {
        warn!(file = %pipeline_path.display(), "{warning}");
    }

    if !report.is_ok() {
        for error_msg in &report.errors {
            error!(file = %pipeline_path.display(), "{error_msg}");
        }
        error!(
            "Cannot generate lockfile due to {} validation error(s)",
            report.errors.len()
        );
        return Ok(EXIT_VALIDATION_FAILED);
    }

    ensure_parent(&output_path, "lockfile")?;
    generate_lock(&spec, &output_path)?;
    info!(
        lockfile = %output_path.display(),
        "Lockfile generated successfully"
    );

    Ok(0)
}

fn pipeline_command(command: PipelineCommands) -> Result<i32> {
    match command {
        PipelineCommands::New { preset, output } => {
            let destination =
                output.unwrap_or_else(|| PathBuf::from(format!("pipelines/{preset}.yaml")));
            if !known_presets().contains(&preset.as_str()) {
                bail!(
                    "Unknown preset '{preset}'. Known presets: {}",
                    known_presets().join(", ")
                );
            }
            let generated = generate_preset(&preset, &destination)?;
            info!(
                preset = %preset,
                path = %generated.display(),
                "Preset pipeline generated"
            );
            Ok(0)
        }
        PipelineCommands::Lint { pipelines } => lint_pipelines(&pipelines),
        PipelineCommands::Diff { lhs, rhs } => diff_pipelines(&lhs, &rhs),
    }
}

fn lint_pipelines(pipelines: &[PathBuf]) -> Result<i32> {
    if pipelines.is_empty() {
        bail!("No pipeline files supplied for linting");
    }

    let registry = ProvisionerRegistry::with_defaults();
    let mut failures = 0usize;

    for pipeline_path in pipelines {
        match PipelineSpec::load(pipeline_path) {
            Ok(spec) => {
                let report = validate_pipeline(&spec, &registry);
                for warning in &report.warnings {
                    warn!(file = %pipeline_path.display(), "{warning}");
                }
                if report.is_ok() {
                    info!(file = %pipeline_path.display(), "Lint passed");
                } else {
                    failures += 1;
                    for error_msg in &report.errors {
                        error!(file = %pipeline_path.display(), "{error_msg}");
                    }
                }
            }
            Err(err) => {
                failures += 1;
                error!(file = %pipeline_path.display(), "Failed to load pipeline: {err}");
            }
        }
    }

    if failures > 0 {
        error!("Lint failed for {failures} pipeline(s)");
        return Ok(EXIT_VALIDATION_FAILED);
    }

    info!("All pipeline lint checks passed");
    Ok(0)
}

fn diff_pipelines(lhs: &Path, rhs: &Path) -> Result<i32> {
    let left = PipelineSpec::load(lhs)?;
    let right = PipelineSpec::load(rhs)?;

    let mut differences = Vec::new();

    if left.version != right.version {
        differences.push(format!(
            "Version mismatch: {} vs {}",
            left.version, right.version
        ));
    }

    if left.pipeline != right.pipeline {
        differences.push(format!(
            "Pipeline name differs: '{}' vs '{}'",
            left.pipeline, right.pipeline
        ));
    }

    let min_len = left.stages.len().min(right.stages.len());
    if left.stages.len() != right.stages.len() {
        differences.push(format!(
            "Stage count differs: {} vs {}",
            left.stages.len(),
            right.stages.len()
        ));
    }

    for (idx, (l_stage, r_stage)) in left
        .stages
        .iter()
        .take(min_len)
        .zip(right.stages.iter())
        .enumerate()
    {
        if l_stage.name != r_stage.name {
            differences.push(format!(
                "Stage {} name differs: '{}' vs '{}'",
                idx + 1,
                l_stage.name,
                r_stage.name
            ));
            continue;
        }
        if l_stage.required != r_stage.required {
            differences.push(format!(
                "Stage '{}' required flag differs: {} vs {}",
                l_stage.name, l_stage.required, r_stage.required
            ));
        }
        if l_stage.dependencies() != r_stage.dependencies() {
            differences.push(format!(
                "Stage '{}' dependencies differ: {:?} vs {:?}",
                l_stage.name,
                l_stage.dependencies(),
                r_stage.dependencies()
            ));
        }
        let l_steps = serde_json::to_value(&l_stage.steps).unwrap_or_default();
        let r_steps = serde_json::to_value(&r_stage.steps).unwrap_or_default();
        if l_steps != r_steps {
            differences.push(format!(
                "Stage '{}' steps differ: {} vs {}",
                l_stage.name,
                serde_json::to_string(&l_steps).unwrap_or_else(|_| "<invalid>".into()),
                serde_json::to_string(&r_steps).unwrap_or_else(|_| "<invalid>".into())
            ));
        }
        let l_toolchains = serde_json::to_value(&l_stage.toolchains).unwrap_or_default();
        let r_toolchains = serde_json::to_value(&r_stage.toolchains).unwrap_or_default();
        if l_toolchains != r_toolchains {
            differences.push(format!(
                "Stage '{}' toolchains differ: {} vs {}",
                l_stage.name,
                serde_json::to_string(&l_toolchains).unwrap_or_else(|_| "<invalid>".into()),
                serde_json::to_string(&r_toolchains).unwrap_or_else(|_| "<invalid>".into())
            ));
        }
    }

    if left.stages.len() > min_len {
        for (extra_idx, stage) in left.stages[min_len..].iter().enumerate() {
            differences.push(format!(
                "Extra stage in left pipeline at position {}: '{}'",
                min_len + extra_idx + 1,
                stage.name
            ));
        }
    }

    if right.stages.len() > min_len {
        for (extra_idx, stage) in right.stages[min_len..].iter().enumerate() {
            differences.push(format!(
                "Extra stage in right pipeline at position {}: '{}'",
                min_len + extra_idx + 1,
                stage.name
            ));
        }
    }

    let left_artifact = serde_json::to_value(&left.artifact).unwrap_or_default();
    let right_artifact = serde_json::to_value(&right.artifact).unwrap_or_default();
    if left_artifact != right_artifact {
        differences.push(format!(
            "Artifact declaration differs: {} vs {}",
            serde_json::to_string(&left_artifact).unwrap_or_else(|_| "<invalid>".into()),
            serde_json::to_string(&right_artifact).unwrap_or_else(|_| "<invalid>".into())
        ));
    }

    if differences.is_empty() {
        info!(
            left = %lhs.display(),
            right = %rhs.display(),
            "Pipelines are equivalent"
        );
        println!("Pipelines match: {} == {}", lhs.display(), rhs.display());
        Ok(0)
    } else {
        println!(
            "Pipeline differences between '{}' and '{}':",
            lhs.display(),
            rhs.display()
        );
        for diff in &differences {
            println!("- {diff}");
        }
        error!("Pipelines differ ({} difference(s) found)", differences.len());
        Ok(EXIT_VALIDATION_FAILED)
    }
}

fn ensure_parent(path: &Path, label: &str) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {label} directory: {}", parent.display()))?;
    }
    Ok(())
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T, label: &str) -> Result<()> {
    ensure_parent(path, label)?;
    let file = File::create(path)
        .with_context(|| format!("Failed to create {label} file: {}", path.display()))?;
    to_writer_pretty(file, value)
        .with_context(|| format!("Failed to write {label} JSON: {}", path.display()))?;
    Ok(())
}

#[derive(Parser)]
#[command(
    name = "stagehand",
    version,
    about = "Staged build/release pipeline orchestrator"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    #[arg(
        value_name = "PIPELINE",
        help = "Quick run syntax: stagehand <pipeline-file>",
        value_hint = ValueHint::FilePath,
        num_args = 0..
    )]
    quick_args: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a pipeline document and publish its artifact.
    Run {
        pipeline: PathBuf,
        /// Resolve and print the execution order without running anything.
        #[arg(long)]
        dry_run: bool,
        /// Run a single stage plus its transitive ancestry.
        #[arg(long)]
        only: Option<String>,
        /// Override the artifact name declared in the document.
        #[arg(long = "artifact-name")]
        artifact_name: Option<String>,
        #[arg(long = "artifact-dir", default_value = "artifacts")]
        artifact_dir: PathBuf,
        /// Write the full run report as JSON.
        #[arg(long)]
        report: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = Concurrency::Sequential)]
        concurrency: Concurrency,
        #[arg(long)]
        print_metrics: bool,
        #[arg(long = "metrics-json")]
        metrics_json: Option<PathBuf>,
        #[arg(long = "metrics-prometheus")]
        metrics_prometheus: Option<PathBuf>,
        #[arg(long = "metrics-listen")]
        metrics_listen: Option<String>,
        #[arg(long = "otlp-endpoint")]
        otlp_endpoint: Option<String>,
    },
    /// Pre-flight validation of a pipeline document.
    Validate {
        pipeline: PathBuf,
    },
    /// Freeze the resolved order and stage content hashes.
    Lock {
        pipeline: PathBuf,
        output: PathBuf,
    },
    Pipeline {
        #[command(subcommand)]
        action: PipelineCommands,
    },
    /// Emit shell completions.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum PipelineCommands {
    New {
        #[arg(long)]
        preset: String,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    Lint {
        #[arg(required = true)]
        pipelines: Vec<PathBuf>,
    },
    Diff {
        lhs: PathBuf,
        rhs: PathBuf,
    },
}
