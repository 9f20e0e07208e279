use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::PublishError;
use crate::executor::{PipelineResult, StageStatus};

/// Everything a succeeded run declared as output, keyed by the artifact
/// name it publishes under. Built once, after the last required stage
/// succeeded.
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactManifest {
    pub name: String,
    pub pipeline: String,
    pub generated_at: DateTime<Utc>,
    pub retention_days: u32,
    pub entries: Vec<ArtifactEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactEntry {
    pub stage: String,
    pub source: PathBuf,
    pub file_name: String,
    pub size_bytes: u64,
    pub sha256: String,
}

/// Reference to a published artifact: a stable name, where it landed, and
/// how long the store keeps it.
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactLocation {
    pub name: String,
    pub uri: String,
    pub retention_days: u32,
}

/// Collect every declared output of every succeeded stage. File name
/// collisions across stages are disambiguated with a stage prefix.
pub fn build_manifest(
    name: &str,
    retention_days: u32,
    result: &PipelineResult,
) -> Result<ArtifactManifest, PublishError> {
    let mut entries = Vec::new();
    let mut taken: BTreeSet<String> = BTreeSet::new();

    for stage in &result.stages {
        if stage.status != StageStatus::Succeeded {
            continue;
        }
        for path in &stage.artifacts {
            let metadata = fs::metadata(path).map_err(|err| {
                PublishError::new(name, format!("cannot stat '{}': {err}", path.display()))
            })?;
            let digest = compute_sha256(path)
                .map_err(|err| PublishError::new(name, format!("{err:#}")))?;

            let base = path
                .file_name()
                .map(|file| file.to_string_lossy().to_string())
                .unwrap_or_else(|| "artifact".to_string());
            let file_name = if taken.contains(&base) {
                format!("{}-{}", stage.name, base)
            } else {
                base
            };
            taken.insert(file_name.clone());

            entries.push(ArtifactEntry {
                stage: stage.name.clone(),
                source: path.clone(),
                file_name,
                size_bytes: metadata.len(),
                sha256: digest,
            });
        }
    }

    Ok(ArtifactManifest {
        name: name.to_string(),
        pipeline: result.pipeline.clone(),
        generated_at: Utc::now(),
        retention_days,
        entries,
    })
}

/// Storage/transport capability for publishing a manifest. The exact
/// mechanism (directory, object store, CI artifact service) is a
/// collaborator behind this trait.
pub trait ArtifactStore {
    fn publish(&self, manifest: &ArtifactManifest) -> Result<ArtifactLocation, PublishError>;
}

/// Copies artifact files into `<root>/<name>/` next to a `manifest.yaml`
/// and a `SHA256SUMS` digest file.
pub struct LocalDirStore {
    root: PathBuf,
}

impl LocalDirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ArtifactStore for LocalDirStore {
    fn publish(&self, manifest: &ArtifactManifest) -> Result<ArtifactLocation, PublishError> {
        let dest = self.root.join(&manifest.name);
        fs::create_dir_all(&dest).map_err(|err| {
            PublishError::new(
                &manifest.name,
                format!("cannot create '{}': {err}", dest.display()),
            )
        })?;

        for entry in &manifest.entries {
            let target = dest.join(&entry.file_name);
            fs::copy(&entry.source, &target).map_err(|err| {
                PublishError::new(
                    &manifest.name,
                    format!(
                        "cannot copy '{}' to '{}': {err}",
                        entry.source.display(),
                        target.display()
                    ),
                )
            })?;
        }

        let manifest_path = dest.join("manifest.yaml");
        let file = File::create(&manifest_path).map_err(|err| {
            PublishError::new(
                &manifest.name,
                format!("cannot create '{}': {err}", manifest_path.display()),
            )
        })?;
        serde_yaml::to_writer(file, manifest).map_err(|err| {
            PublishError::new(
                &manifest.name,
                format!("cannot write '{}': {err}", manifest_path.display()),
            )
        })?;

        let sums_path = dest.join("SHA256SUMS");
        let mut sums = File::create(&sums_path).map_err(|err| {
            PublishError::new(
                &manifest.name,
                format!("cannot create '{}': {err}", sums_path.display()),
            )
        })?;
        for entry in &manifest.entries {
            writeln!(sums, "{}  {}", entry.sha256, entry.file_name).map_err(|err| {
                PublishError::new(
                    &manifest.name,
                    format!("cannot write '{}': {err}", sums_path.display()),
                )
            })?;
        }

        info!(
            artifact = manifest.name.as_str(),
            files = manifest.entries.len(),
            destination = %dest.display(),
            "Artifact published"
        );

        Ok(ArtifactLocation {
            name: manifest.name.clone(),
            uri: dest.display().to_string(),
            retention_days: manifest.retention_days,
        })
    }
}

/// Compute the SHA256 digest of the file at `path` and return it as a hex string.
pub fn compute_sha256(path: &Path) -> Result<String> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open file for hashing: {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn compute_sha256_is_stable() {
        let temp = tempdir().unwrap();
        let file_path = temp.path().join("digest.bin");
        let mut file = File::create(&file_path).unwrap();
        file.write_all(b"release artifact").unwrap();

        let digest = compute_sha256(&file_path).unwrap();
        assert_eq!(
            digest,
            "133cfccb5b503cf4040c95f3dfad56d07c1574283a1e39066b594f6ee33711ba"
        );
    }
}
