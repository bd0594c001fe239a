//! Completion tracking for shards.
//!
//! A shard counts as done once its manifest exists. Artifacts and manifest are
//! both written to a staging path and renamed into place after a synced write,
//! and the manifest is committed last, so a crash at any point leaves the shard
//! "not done" and the next run redoes it from scratch.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::scope::Scope;
use crate::shards::ShardHandle;
use crate::sink::{commit, staging_path};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    /// Relative to the output root.
    pub path: PathBuf,
    pub rows: usize,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionManifest {
    pub shard: PathBuf,
    pub run_id: Uuid,
    pub completed_at: DateTime<Utc>,
    pub lines_read: u64,
    pub records_decoded: u64,
    pub decode_errors: u64,
    pub artifacts: BTreeMap<Scope, ArtifactEntry>,
}

/// Outcome of re-hashing a shard's artifacts against its manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    NotDone,
    Intact,
    Mismatched(Vec<Scope>),
}

#[derive(Debug, Clone)]
pub struct IdempotencyGate {
    output_root: PathBuf,
    force: bool,
}

impl IdempotencyGate {
    pub fn new(output_root: impl Into<PathBuf>, force: bool) -> Self {
        Self { output_root: output_root.into(), force }
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    pub fn is_done(&self, shard: &ShardHandle) -> bool {
        !self.force && shard.manifest_path(&self.output_root).exists()
    }

    pub fn read_manifest(&self, shard: &ShardHandle) -> Result<Option<CompletionManifest>> {
        let path = shard.manifest_path(&self.output_root);
        if !path.exists() {
            return Ok(None);
        }
        let file = File::open(&path).with_context(|| format!("Failed to open manifest {}", path.display()))?;
        let manifest = serde_json::from_reader(file)
            .with_context(|| format!("Failed to parse manifest {}", path.display()))?;
        Ok(Some(manifest))
    }

    /// Withdraws the shard's manifest so it is not done until the next `mark_done`.
    pub fn clear(&self, shard: &ShardHandle) -> Result<()> {
        let path = shard.manifest_path(&self.output_root);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("Cleared manifest for {} ({})", shard, path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove manifest {}", path.display())),
        }
    }

    /// Commits the manifest, marking the shard done.
    pub fn mark_done(&self, shard: &ShardHandle, manifest: &CompletionManifest) -> Result<()> {
        let path = shard.manifest_path(&self.output_root);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create manifest directory {}", parent.display()))?;
        }
        let staging = staging_path(&path);
        {
            let file = File::create(&staging)
                .with_context(|| format!("Failed to create manifest {}", staging.display()))?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, manifest)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        commit(&staging, &path)?;
        debug!("Marked {} done ({})", shard, path.display());
        Ok(())
    }

    /// Re-hashes every artifact listed in the shard's manifest.
    pub fn verify(&self, shard: &ShardHandle) -> Result<Verification> {
        let Some(manifest) = self.read_manifest(shard)? else {
            return Ok(Verification::NotDone);
        };
        let mut mismatched = Vec::new();
        for (scope, entry) in &manifest.artifacts {
            let path = self.output_root.join(&entry.path);
            match sha256_file(&path) {
                Ok(digest) if digest == entry.sha256 => {}
                Ok(_) => {
                    warn!("Artifact {} for {} does not match its manifest", path.display(), shard);
                    mismatched.push(*scope);
                }
                Err(e) => {
                    warn!("Artifact {} for {} is unreadable: {}", path.display(), shard, e);
                    mismatched.push(*scope);
                }
            }
        }
        if mismatched.is_empty() {
            Ok(Verification::Intact)
        } else {
            Ok(Verification::Mismatched(mismatched))
        }
    }
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).with_context(|| format!("Failed to hash {}", path.display()))?;
    Ok(hex::encode(hasher.finalize()))
}
