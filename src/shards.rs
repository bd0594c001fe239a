use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use glob::{glob, Pattern};
use log::{info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::scope::Scope;

pub const DEFAULT_SHARD_PATTERN: &str = "*.gz";
const MANIFEST_DIR: &str = "_manifests";

/// One compressed line-delimited JSON source file and its place in the corpus.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardHandle {
    pub path: PathBuf,
    pub relative: PathBuf,
}

impl ShardHandle {
    pub fn new(root: &Path, path: PathBuf) -> Result<Self> {
        let relative = path
            .strip_prefix(root)
            .with_context(|| format!("Shard {} is not under corpus root {}", path.display(), root.display()))?
            .to_path_buf();
        Ok(Self { path, relative })
    }

    /// Relative path with the compression and JSON extensions replaced by `extension`.
    fn relative_with_extension(&self, extension: &str) -> PathBuf {
        let file_name = self
            .relative
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut stem = file_name.as_str();
        for suffix in [".gz", ".jsonl", ".ndjson", ".json"] {
            if let Some(stripped) = stem.strip_suffix(suffix) {
                stem = stripped;
            }
        }
        self.relative.with_file_name(format!("{}.{}", stem, extension))
    }

    /// Where this shard's rows for `scope` live. Unique per (shard, scope).
    pub fn artifact_path(&self, output_root: &Path, scope: Scope) -> PathBuf {
        output_root.join(scope.name()).join(self.relative_with_extension("csv"))
    }

    /// Where this shard's completion manifest lives.
    pub fn manifest_path(&self, output_root: &Path) -> PathBuf {
        output_root.join(MANIFEST_DIR).join(self.relative_with_extension("json"))
    }

    pub fn is_compressed(&self) -> bool {
        self.path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("gz"))
    }
}

impl fmt::Display for ShardHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.relative.display())
    }
}

/// Lists the shards of a corpus.
#[derive(Debug, Clone)]
pub struct ShardEnumerator {
    root: PathBuf,
    sub_path: Option<PathBuf>,
    pattern: String,
    shuffle_seed: Option<u64>,
    limit: Option<usize>,
}

impl ShardEnumerator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            sub_path: None,
            pattern: DEFAULT_SHARD_PATTERN.to_string(),
            shuffle_seed: None,
            limit: None,
        }
    }

    pub fn with_sub_path(mut self, sub_path: Option<PathBuf>) -> Self {
        self.sub_path = sub_path;
        self
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = pattern.into();
        self
    }

    pub fn with_shuffle_seed(mut self, seed: Option<u64>) -> Self {
        self.shuffle_seed = seed;
        self
    }

    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Sorted by relative path unless a shuffle seed is set. An unreadable root is an error.
    pub fn enumerate(&self) -> Result<Vec<ShardHandle>> {
        let search_root = match &self.sub_path {
            Some(sub) => self.root.join(sub),
            None => self.root.clone(),
        };
        fs::read_dir(&search_root)
            .with_context(|| format!("Corpus directory is not readable: {}", search_root.display()))?;

        let pattern = format!(
            "{}/**/{}",
            Pattern::escape(&search_root.to_string_lossy()),
            self.pattern
        );
        info!("Searching for shards matching pattern: {}", pattern);

        let mut shards = Vec::new();
        for entry in glob(&pattern).with_context(|| format!("Invalid shard pattern: {}", pattern))? {
            match entry {
                Ok(path) if path.is_file() => shards.push(ShardHandle::new(&self.root, path)?),
                Ok(_) => {}
                Err(e) => warn!("Skipping unreadable path during shard discovery: {}", e),
            }
        }
        shards.sort();
        check_unique_outputs(&shards)?;

        if let Some(seed) = self.shuffle_seed {
            shards.shuffle(&mut StdRng::seed_from_u64(seed));
        }
        if let Some(limit) = self.limit {
            shards.truncate(limit);
        }
        if shards.is_empty() {
            warn!("No shards found matching the pattern: {}", pattern);
        }
        Ok(shards)
    }
}

/// Two shards whose names differ only in their JSON or compression suffix would write the same artifacts.
fn check_unique_outputs(shards: &[ShardHandle]) -> Result<()> {
    let mut seen: HashMap<PathBuf, &ShardHandle> = HashMap::with_capacity(shards.len());
    for shard in shards {
        if let Some(other) = seen.insert(shard.relative_with_extension("csv"), shard) {
            bail!(
                "Shards {} and {} map to the same output files; narrow shard_pattern so only one of them matches",
                other.path.display(),
                shard.path.display()
            );
        }
    }
    Ok(())
}
