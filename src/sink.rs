use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use csv::Writer;
use log::debug;

use crate::scope::{OutputRow, Scope};

const STAGING_SUFFIX: &str = ".partial";

/// Append-only CSV writer: one logical table per scope.
///
/// The header is written only when the artifact does not exist at call time, so
/// two writers appending to the same path concurrently can both write it. Every
/// shard owns its own artifact paths, which keeps that from happening.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScopeSink;

impl ScopeSink {
    pub fn append(&self, scope: Scope, rows: &[OutputRow], artifact_path: &Path) -> Result<usize> {
        if let Some((idx, row)) = rows.iter().enumerate().find(|(_, row)| row.len() != scope.arity()) {
            return Err(anyhow::anyhow!(
                "Row {} for scope '{}' has {} cells, expected {}: {:?}",
                idx,
                scope,
                row.len(),
                scope.arity(),
                row
            ));
        }

        let write_header = !artifact_path.exists();
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(artifact_path)
            .with_context(|| format!("Failed to open artifact for append: {}", artifact_path.display()))?;
        let mut writer = Writer::from_writer(file);
        if write_header {
            writer.write_record(scope.header())?;
        }
        for row in rows {
            writer.write_record(row)?;
        }
        let file = writer
            .into_inner()
            .map_err(|e| anyhow::anyhow!("Failed to flush {}: {}", artifact_path.display(), e.error()))?;
        file.sync_all()
            .with_context(|| format!("Failed to sync {}", artifact_path.display()))?;
        debug!("Appended {} {} rows to {}", rows.len(), scope, artifact_path.display());
        Ok(rows.len())
    }
}

/// Sibling path a file is written to before it is renamed into place.
pub fn staging_path(target: &Path) -> PathBuf {
    let mut name: OsString = target.file_name().map(OsString::from).unwrap_or_default();
    name.push(STAGING_SUFFIX);
    target.with_file_name(name)
}

pub fn is_staging_path(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(STAGING_SUFFIX))
}

/// Moves a fully written staging file onto its final path.
pub fn commit(staging: &Path, target: &Path) -> Result<()> {
    fs::rename(staging, target)
        .with_context(|| format!("Failed to move {} into place at {}", staging.display(), target.display()))
}
