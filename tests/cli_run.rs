use std::fs;
use std::path::Path;

use assert_cmd::Command;
use tempfile::tempdir;

fn write_pipeline(dir: &Path, name: &str, content: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    fs::write(&path, content).expect("failed to write pipeline file");
    path
}

const DEMO_PIPELINE: &str = r#"version: 1
pipeline: demo
stages:
  - name: build
    steps:
      - run: "mkdir -p dist && printf 'payload' > dist/app.bin"
        outputs: ["dist/app.bin"]
artifact:
  name: demo-bundle
  retention_days: 7
"#;

#[test]
fn run_publishes_the_declared_artifact() {
    let temp = tempdir().unwrap();
    write_pipeline(temp.path(), "demo.yaml", DEMO_PIPELINE);

    Command::cargo_bin("stagehand")
        .expect("binary present")
        .current_dir(temp.path())
        .args(["run", "demo.yaml", "--artifact-dir", "store"])
        .assert()
        .success();

    let dest = temp.path().join("store").join("demo-bundle");
    assert!(dest.join("app.bin").is_file());
    assert!(dest.join("manifest.yaml").is_file());
    let sums = fs::read_to_string(dest.join("SHA256SUMS")).unwrap();
    assert!(sums.contains("app.bin"));
}

#[test]
fn dry_run_prints_the_plan_and_executes_nothing() {
    let temp = tempdir().unwrap();
    write_pipeline(temp.path(), "demo.yaml", DEMO_PIPELINE);

    let assert = Command::cargo_bin("stagehand")
        .expect("binary present")
        .current_dir(temp.path())
        .args(["run", "demo.yaml", "--dry-run"])
        .assert()
        .success();

    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).to_string();
    assert!(stdout.contains("Execution plan"));
    assert!(stdout.contains("build"));
    assert!(!temp.path().join("dist").exists());
}

#[test]
fn failed_required_stage_exits_one() {
    let temp = tempdir().unwrap();
    write_pipeline(
        temp.path(),
        "broken.yaml",
        r#"version: 1
pipeline: broken
stages:
  - name: build
    steps:
      - run: "exit 7"
"#,
    );

    Command::cargo_bin("stagehand")
        .expect("binary present")
        .current_dir(temp.path())
        .args(["run", "broken.yaml"])
        .assert()
        .code(1);
}

#[test]
fn invalid_document_exits_three() {
    let temp = tempdir().unwrap();
    write_pipeline(
        temp.path(),
        "dup.yaml",
        r#"version: 1
pipeline: dup
stages:
  - name: build
    steps:
      - run: "true"
  - name: build
    steps:
      - run: "true"
"#,
    );

    Command::cargo_bin("stagehand")
        .expect("binary present")
        .current_dir(temp.path())
        .args(["validate", "dup.yaml"])
        .assert()
        .code(3);
}

#[test]
fn quick_run_form_accepts_a_bare_pipeline_file() {
    let temp = tempdir().unwrap();
    write_pipeline(temp.path(), "demo.yaml", DEMO_PIPELINE);

    Command::cargo_bin("stagehand")
        .expect("binary present")
        .current_dir(temp.path())
        .arg("demo.yaml")
        .assert()
        .success();

    assert!(
        temp.path()
            .join("artifacts")
            .join("demo-bundle")
            .join("app.bin")
            .is_file()
    );
}
