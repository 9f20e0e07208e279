use std::collections::BTreeMap;
use std::fs;

use stagehand::context::RunContext;
use stagehand::executor::{ExecutorOptions, PipelineExecutor, PipelineResult};
use stagehand::provision::ProvisionerRegistry;
use stagehand::publish::{ArtifactStore, LocalDirStore, build_manifest};
use stagehand::spec::{PipelineSpec, StageSpec, StepSpec};
use tempfile::tempdir;

fn stage(name: &str, needs: &[&str], run: &str, outputs: &[&str]) -> StageSpec {
    StageSpec {
        name: name.to_string(),
        required: true,
        needs: needs.iter().map(|dep| dep.to_string()).collect(),
        hard_needs: Vec::new(),
        toolchains: Vec::new(),
        steps: vec![StepSpec {
            run: run.to_string(),
            cwd: None,
            env: BTreeMap::new(),
            outputs: outputs.iter().map(|pattern| pattern.to_string()).collect(),
        }],
        timeout_secs: None,
    }
}

fn run_bundle_pipeline(dir: &std::path::Path) -> PipelineResult {
    let spec = PipelineSpec {
        version: 1,
        pipeline: "publish-test".to_string(),
        triggers: None,
        stages: vec![
            stage(
                "build",
                &[],
                "mkdir -p dist && printf 'binary payload' > dist/app.bin",
                &["dist/app.bin"],
            ),
            stage(
                "docs",
                &["build"],
                "mkdir -p docs && printf 'readme' > docs/app.bin",
                &["docs/app.bin"],
            ),
        ],
        artifact: None,
    };
    let executor = PipelineExecutor::new(
        spec,
        ProvisionerRegistry::with_defaults(),
        ExecutorOptions::default(),
    );
    let mut ctx = RunContext::new(dir);
    executor.execute(&mut ctx).unwrap()
}

#[test]
fn manifest_collects_outputs_and_disambiguates_collisions() {
    let temp = tempdir().unwrap();
    let result = run_bundle_pipeline(temp.path());
    assert!(result.succeeded());

    let manifest = build_manifest("bundle", 14, &result).unwrap();

    assert_eq!(manifest.name, "bundle");
    assert_eq!(manifest.retention_days, 14);
    assert_eq!(manifest.entries.len(), 2);
    let names: Vec<&str> = manifest
        .entries
        .iter()
        .map(|entry| entry.file_name.as_str())
        .collect();
    // Both stages produced a file called app.bin; the second gets a stage prefix.
    assert!(names.contains(&"app.bin"));
    assert!(names.contains(&"docs-app.bin"));
    assert!(manifest.entries.iter().all(|entry| entry.size_bytes > 0));
    assert!(manifest.entries.iter().all(|entry| entry.sha256.len() == 64));
}

#[test]
fn local_store_publishes_files_manifest_and_digests() {
    let temp = tempdir().unwrap();
    let result = run_bundle_pipeline(temp.path());
    let manifest = build_manifest("bundle", 30, &result).unwrap();

    let store_root = temp.path().join("store");
    let store = LocalDirStore::new(&store_root);
    let location = store.publish(&manifest).unwrap();

    assert_eq!(location.name, "bundle");
    assert_eq!(location.retention_days, 30);

    let dest = store_root.join("bundle");
    assert!(dest.join("app.bin").is_file());
    assert!(dest.join("docs-app.bin").is_file());

    let manifest_text = fs::read_to_string(dest.join("manifest.yaml")).unwrap();
    assert!(manifest_text.contains("name: bundle"));
    assert!(manifest_text.contains("pipeline: publish-test"));

    let sums = fs::read_to_string(dest.join("SHA256SUMS")).unwrap();
    assert_eq!(sums.lines().count(), 2);
    assert!(sums.contains("app.bin"));
}

#[test]
fn publish_failure_is_distinct_from_pipeline_failure() {
    let temp = tempdir().unwrap();
    let result = run_bundle_pipeline(temp.path());
    assert!(result.succeeded());

    let manifest = build_manifest("bundle", 30, &result).unwrap();

    // A plain file where the store root should be makes the copy impossible.
    let blocked_root = temp.path().join("occupied");
    fs::write(&blocked_root, b"not a directory").unwrap();
    let store = LocalDirStore::new(&blocked_root);

    let err = store.publish(&manifest).unwrap_err();
    assert!(err.to_string().contains("failed to publish artifact 'bundle'"));
    // The pipeline result is untouched by the distribution failure.
    assert!(result.succeeded());
}
