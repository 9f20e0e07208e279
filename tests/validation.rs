use std::collections::BTreeMap;
use std::fs;

use stagehand::lockfile::generate_lock;
use stagehand::provision::ProvisionerRegistry;
use stagehand::spec::{PipelineSpec, StageSpec, StepSpec, ToolchainSpec};
use stagehand::validation::validate_pipeline;
use tempfile::tempdir;

fn step(run: &str) -> StepSpec {
    StepSpec {
        run: run.to_string(),
        cwd: None,
        env: BTreeMap::new(),
        outputs: Vec::new(),
    }
}

fn stage(name: &str, needs: &[&str]) -> StageSpec {
    StageSpec {
        name: name.to_string(),
        required: true,
        needs: needs.iter().map(|dep| dep.to_string()).collect(),
        hard_needs: Vec::new(),
        toolchains: Vec::new(),
        steps: vec![step("true")],
        timeout_secs: None,
    }
}

fn pipeline(stages: Vec<StageSpec>) -> PipelineSpec {
    PipelineSpec {
        version: 1,
        pipeline: "validation-test".to_string(),
        triggers: None,
        stages,
        artifact: None,
    }
}

fn registry() -> ProvisionerRegistry {
    ProvisionerRegistry::with_defaults()
}

#[test]
fn valid_pipeline_passes() {
    let spec = pipeline(vec![stage("build", &[]), stage("package", &["build"])]);
    let report = validate_pipeline(&spec, &registry());
    assert!(report.is_ok(), "unexpected errors: {:?}", report.errors);
}

#[test]
fn duplicate_stage_names_are_rejected() {
    let spec = pipeline(vec![stage("build", &[]), stage("build", &[])]);
    let report = validate_pipeline(&spec, &registry());
    assert!(!report.is_ok());
    assert!(
        report
            .errors
            .iter()
            .any(|err| err.contains("Duplicate stage name 'build'"))
    );
}

#[test]
fn unknown_dependency_is_rejected() {
    let spec = pipeline(vec![stage("build", &["ghost"])]);
    let report = validate_pipeline(&spec, &registry());
    assert!(
        report
            .errors
            .iter()
            .any(|err| err.contains("unknown stage 'ghost'"))
    );
}

#[test]
fn cycles_are_rejected() {
    let spec = pipeline(vec![stage("a", &["b"]), stage("b", &["a"])]);
    let report = validate_pipeline(&spec, &registry());
    assert!(
        report
            .errors
            .iter()
            .any(|err| err.contains("dependency cycle detected"))
    );
}

#[test]
fn empty_commands_and_bad_globs_are_rejected() {
    let mut broken = stage("build", &[]);
    broken.steps = vec![
        step("   "),
        StepSpec {
            run: "true".to_string(),
            cwd: None,
            env: BTreeMap::new(),
            outputs: vec!["[".to_string()],
        },
    ];
    let report = validate_pipeline(&pipeline(vec![broken]), &registry());
    assert!(
        report
            .errors
            .iter()
            .any(|err| err.contains("empty command"))
    );
    assert!(
        report
            .errors
            .iter()
            .any(|err| err.contains("not a valid glob"))
    );
}

#[test]
fn unsupported_version_and_zero_timeout_are_rejected() {
    let mut slow = stage("build", &[]);
    slow.timeout_secs = Some(0);
    let mut spec = pipeline(vec![slow]);
    spec.version = 2;
    let report = validate_pipeline(&spec, &registry());
    assert!(
        report
            .errors
            .iter()
            .any(|err| err.contains("Unsupported pipeline version"))
    );
    assert!(
        report
            .errors
            .iter()
            .any(|err| err.contains("timeout must be at least one second"))
    );
}

#[test]
fn toolchain_problems_are_surfaced() {
    let mut provision = stage("provision", &[]);
    provision.toolchains = vec![
        ToolchainSpec {
            kind: "container".to_string(),
            tool: None,
            version: None,
            probe: None,
            install: Vec::new(),
            env: BTreeMap::new(),
            path_prepend: Vec::new(),
        },
        ToolchainSpec {
            kind: "tool".to_string(),
            tool: None,
            version: None,
            probe: None,
            install: Vec::new(),
            env: BTreeMap::new(),
            path_prepend: Vec::new(),
        },
    ];
    let report = validate_pipeline(&pipeline(vec![provision]), &registry());
    assert!(
        report
            .errors
            .iter()
            .any(|err| err.contains("Unknown toolchain kind 'container'"))
    );
    assert!(
        report
            .errors
            .iter()
            .any(|err| err.contains("require a 'tool' name"))
    );
}

#[test]
fn redundant_hard_dependency_warns() {
    let mut sign = stage("sign", &["build"]);
    sign.hard_needs = vec!["build".to_string()];
    let spec = pipeline(vec![stage("build", &[]), sign]);
    let report = validate_pipeline(&spec, &registry());
    assert!(report.is_ok());
    assert!(
        report
            .warnings
            .iter()
            .any(|warning| warning.contains("redundant"))
    );
}

#[test]
fn lockfile_freezes_order_and_hashes() {
    let temp = tempdir().unwrap();
    let spec = pipeline(vec![stage("build", &[]), stage("package", &["build"])]);

    let lock_path = temp.path().join("pipeline.lock");
    generate_lock(&spec, &lock_path).unwrap();

    let content = fs::read_to_string(&lock_path).unwrap();
    assert!(content.contains("pipeline: validation-test"));
    assert!(content.contains("resolved_order"));
    assert!(content.contains("content_hash"));
}

#[test]
fn lockfile_hashes_are_deterministic() {
    let temp = tempdir().unwrap();
    let spec = pipeline(vec![stage("build", &[]), stage("package", &["build"])]);

    let first_path = temp.path().join("first.lock");
    let second_path = temp.path().join("second.lock");
    generate_lock(&spec, &first_path).unwrap();
    generate_lock(&spec, &second_path).unwrap();

    let hashes = |path: &std::path::Path| -> Vec<String> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .filter(|line| line.contains("content_hash"))
            .map(|line| line.trim().to_string())
            .collect()
    };
    let first = hashes(&first_path);
    assert_eq!(first.len(), 2);
    assert_eq!(first, hashes(&second_path));
}
