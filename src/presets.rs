use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::spec::{ArtifactSpec, PipelineSpec, StageSpec, StepSpec, ToolchainSpec};

pub fn generate_preset(name: &str, destination: &Path) -> Result<PathBuf> {
    let spec = match name {
        "desktop-release" => desktop_release_preset(),
        "minimal" => minimal_preset(),
        other => anyhow::bail!("Unknown preset '{other}'"),
    };

    let rendered = serde_yaml::to_string(&spec)?;
    if let Some(parent) = destination.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(destination, rendered)
        .with_context(|| format!("Failed to write preset pipeline: {}", destination.display()))?;

    Ok(destination.to_path_buf())
}

pub fn known_presets() -> Vec<&'static str> {
    vec!["desktop-release", "minimal"]
}

/// The classic desktop bundling job: provision a runtime, compile a
/// one-file bundle, wrap an optional disk image, publish the result.
fn desktop_release_preset() -> PipelineSpec {
    PipelineSpec {
        version: 1,
        pipeline: "desktop-release".into(),
        triggers: serde_yaml::from_str("push:\n  tags: ['v*']\n").ok(),
        stages: vec![
            StageSpec {
                name: "provision".into(),
                required: true,
                needs: Vec::new(),
                hard_needs: Vec::new(),
                toolchains: vec![tool("python3", ">=3.11")],
                steps: vec![step("pip install --upgrade pyinstaller", &[])],
                timeout_secs: None,
            },
            StageSpec {
                name: "build".into(),
                required: true,
                needs: vec!["provision".into()],
                hard_needs: Vec::new(),
                toolchains: Vec::new(),
                steps: vec![step(
                    "pyinstaller --onefile --windowed app.py",
                    &["dist/app*"],
                )],
                timeout_secs: Some(1_800),
            },
            StageSpec {
                name: "package".into(),
                required: false,
                needs: vec!["build".into()],
                hard_needs: Vec::new(),
                toolchains: Vec::new(),
                steps: vec![step(
                    "hdiutil create -volname App -srcfolder dist -ov dist/app.dmg",
                    &["dist/*.dmg"],
                )],
                timeout_secs: Some(600),
            },
        ],
        artifact: Some(ArtifactSpec {
            name: "desktop-bundle".into(),
            retention_days: 30,
        }),
    }
}

fn minimal_preset() -> PipelineSpec {
    PipelineSpec {
        version: 1,
        pipeline: "minimal".into(),
        triggers: None,
        stages: vec![StageSpec {
            name: "build".into(),
            required: true,
            needs: Vec::new(),
            hard_needs: Vec::new(),
            toolchains: Vec::new(),
            steps: vec![step("make dist", &["dist/*"])],
            timeout_secs: None,
        }],
        artifact: Some(ArtifactSpec {
            name: "bundle".into(),
            retention_days: 14,
        }),
    }
}

fn step(run: &str, outputs: &[&str]) -> StepSpec {
    StepSpec {
        run: run.to_string(),
        cwd: None,
        env: BTreeMap::new(),
        outputs: outputs.iter().map(|pattern| pattern.to_string()).collect(),
    }
}

fn tool(name: &str, version: &str) -> ToolchainSpec {
    ToolchainSpec {
        kind: "tool".into(),
        tool: Some(name.to_string()),
        version: Some(version.to_string()),
        probe: None,
        install: Vec::new(),
        env: BTreeMap::new(),
        path_prepend: Vec::new(),
    }
}
