//! YAML run configuration.

use std::collections::BTreeMap;
use std::fs::File;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::dispatch::DEFAULT_RESERVED_CORES;
use crate::retry::RetryPolicy;
use crate::scope::Scope;
use crate::shards::DEFAULT_SHARD_PATTERN;
use crate::transform::DEFAULT_CITATION_FLOOR_YEAR;

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct IdSource {
    pub path: PathBuf,
    #[serde(default = "default_id_column")]
    pub id_column: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct BucketedIdSource {
    pub path: PathBuf,
    #[serde(default = "default_work_id_column")]
    pub id_column: String,
    #[serde(default = "default_year_column")]
    pub year_column: String,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct YearRange {
    pub start: i32,
    pub end: i32,
}

impl Default for YearRange {
    fn default() -> Self {
        Self { start: 2001, end: 2025 }
    }
}

impl YearRange {
    pub fn range(&self) -> RangeInclusive<i32> {
        self.start..=self.end
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct JoinConfig {
    pub path: PathBuf,
    #[serde(default = "default_work_id_column")]
    pub key_column: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct AuthorRollupConfig {
    pub relevant_ids: IdSource,
}

/// Which transform a run applies, and the reference data it needs.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProfileConfig {
    AuthorScopes {
        ids: IdSource,
    },
    CitationLinks {
        eligible: BucketedIdSource,
        #[serde(default = "default_floor_year")]
        floor_year: i32,
        #[serde(default)]
        years: YearRange,
    },
    WorkSummaries {
        #[serde(default)]
        ids: Option<IdSource>,
    },
    AffiliatedAuthors {
        ids: IdSource,
    },
    TopicCatalog,
}

impl ProfileConfig {
    pub fn name(&self) -> &'static str {
        match self {
            ProfileConfig::AuthorScopes { .. } => "author_scopes",
            ProfileConfig::CitationLinks { .. } => "citation_links",
            ProfileConfig::WorkSummaries { .. } => "work_summaries",
            ProfileConfig::AffiliatedAuthors { .. } => "affiliated_authors",
            ProfileConfig::TopicCatalog => "topic_catalog",
        }
    }

    pub fn scopes(&self) -> &'static [Scope] {
        match self {
            ProfileConfig::AuthorScopes { .. } => &[Scope::Works, Scope::Coauthors, Scope::AuthorCitations],
            ProfileConfig::CitationLinks { .. } => &[Scope::Citations],
            ProfileConfig::WorkSummaries { .. } => &[Scope::WorkSummaries],
            ProfileConfig::AffiliatedAuthors { .. } => &[Scope::Authors],
            ProfileConfig::TopicCatalog => &[Scope::Topics],
        }
    }

    fn resolve_paths(&mut self, base: &Path) {
        match self {
            ProfileConfig::AuthorScopes { ids } | ProfileConfig::AffiliatedAuthors { ids } => {
                ids.path = resolve(base, &ids.path)
            }
            ProfileConfig::CitationLinks { eligible, .. } => eligible.path = resolve(base, &eligible.path),
            ProfileConfig::WorkSummaries { ids } => {
                if let Some(ids) = ids {
                    ids.path = resolve(base, &ids.path);
                }
            }
            ProfileConfig::TopicCatalog => {}
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub description: Option<String>,
    pub corpus_root: PathBuf,
    #[serde(default)]
    pub sub_path: Option<PathBuf>,
    #[serde(default = "default_shard_pattern")]
    pub shard_pattern: String,
    pub output_root: PathBuf,
    #[serde(default)]
    pub aggregate_dir: Option<PathBuf>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default = "default_reserved_cores")]
    pub reserved_cores: usize,
    #[serde(default)]
    pub threads: Option<usize>,
    #[serde(default)]
    pub shuffle_seed: Option<u64>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub retry: RetryPolicy,
    pub profile: ProfileConfig,
    #[serde(default)]
    pub join: BTreeMap<Scope, JoinConfig>,
    #[serde(default)]
    pub author_rollup: Option<AuthorRollupConfig>,
}

impl RunConfig {
    /// Parses the YAML file and resolves relative paths against its directory.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Failed to open run configuration file: {}", path.display()))?;
        let mut config: RunConfig = serde_yaml::from_reader(file)
            .with_context(|| format!("Failed to parse run configuration YAML from {}", path.display()))?;
        let base = path.parent().map(Path::to_path_buf).unwrap_or_default();
        config.resolve_paths(&base);
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(yaml: &str, base: &Path) -> Result<Self> {
        let mut config: RunConfig = serde_yaml::from_str(yaml).context("Failed to parse run configuration YAML")?;
        config.resolve_paths(base);
        config.validate()?;
        Ok(config)
    }

    fn resolve_paths(&mut self, base: &Path) {
        self.corpus_root = resolve(base, &self.corpus_root);
        self.output_root = resolve(base, &self.output_root);
        if let Some(dir) = &self.aggregate_dir {
            self.aggregate_dir = Some(resolve(base, dir));
        }
        self.profile.resolve_paths(base);
        for join in self.join.values_mut() {
            join.path = resolve(base, &join.path);
        }
        if let Some(rollup) = &mut self.author_rollup {
            rollup.relevant_ids.path = resolve(base, &rollup.relevant_ids.path);
        }
    }

    fn validate(&self) -> Result<()> {
        if let ProfileConfig::CitationLinks { years, .. } = &self.profile {
            if years.start > years.end {
                anyhow::bail!("Invalid citation year range {}..={}", years.start, years.end);
            }
        }
        for scope in self.join.keys() {
            if !self.profile.scopes().contains(scope) {
                anyhow::bail!("Join configured for scope '{}', which profile '{}' does not produce", scope, self.profile.name());
            }
        }
        if self.author_rollup.is_some() && !self.join.contains_key(&Scope::Citations) {
            anyhow::bail!("author_rollup needs a citations join carrying work years and author ids");
        }
        Ok(())
    }

    /// Top-level `max_retries` overrides the one inside the `retry` block.
    pub fn retry_policy(&self) -> RetryPolicy {
        let mut policy = self.retry;
        if let Some(max_retries) = self.max_retries {
            policy.max_retries = max_retries;
        }
        policy
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn default_id_column() -> String {
    "id".to_string()
}

fn default_work_id_column() -> String {
    "work_id".to_string()
}

fn default_year_column() -> String {
    "year".to_string()
}

fn default_floor_year() -> i32 {
    DEFAULT_CITATION_FLOOR_YEAR
}

fn default_shard_pattern() -> String {
    DEFAULT_SHARD_PATTERN.to_string()
}

fn default_reserved_cores() -> usize {
    DEFAULT_RESERVED_CORES
}

#[cfg(test)]
mod tests {
    use super::*;

    const AUTHOR_RUN: &str = r#"
description: "author scopes"
corpus_root: data/works
output_root: out/academics
aggregate_dir: /abs/aggregated
max_retries: 5
retry: { initial_delay_ms: 10 }
profile:
  kind: author_scopes
  ids: { path: ids/academics.csv, id_column: OA_id }
"#;

    #[test]
    fn parses_and_resolves_relative_paths() {
        let config = RunConfig::from_yaml_str(AUTHOR_RUN, Path::new("/runs")).unwrap();
        assert_eq!(config.corpus_root, PathBuf::from("/runs/data/works"));
        assert_eq!(config.output_root, PathBuf::from("/runs/out/academics"));
        assert_eq!(config.aggregate_dir, Some(PathBuf::from("/abs/aggregated")));
        assert_eq!(config.shard_pattern, "*.gz");
        assert_eq!(config.reserved_cores, 2);
        assert!(!config.force);
        match &config.profile {
            ProfileConfig::AuthorScopes { ids } => {
                assert_eq!(ids.path, PathBuf::from("/runs/ids/academics.csv"));
                assert_eq!(ids.id_column, "OA_id");
            }
            other => panic!("unexpected profile {:?}", other),
        }

        let policy = config.retry_policy();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.initial_delay_ms, 10);
        assert_eq!(policy.max_delay_ms, 30_000);
    }

    #[test]
    fn citation_profile_defaults() {
        let yaml = r#"
corpus_root: works
output_root: out
profile:
  kind: citation_links
  eligible: { path: eligible.csv }
join:
  citations: { path: all_data.csv }
author_rollup:
  relevant_ids: { path: best.csv, id_column: OA_id }
"#;
        let config = RunConfig::from_yaml_str(yaml, Path::new("/r")).unwrap();
        let ProfileConfig::CitationLinks { eligible, floor_year, years } = &config.profile else {
            panic!("expected citation links")
        };
        assert_eq!(eligible.id_column, "work_id");
        assert_eq!(eligible.year_column, "year");
        assert_eq!(*floor_year, 2001);
        assert_eq!(years.range(), 2001..=2025);
        assert_eq!(config.join[&Scope::Citations].key_column, "work_id");
        assert_eq!(config.join[&Scope::Citations].path, PathBuf::from("/r/all_data.csv"));
        assert_eq!(config.retry_policy().max_retries, 3);
    }

    #[test]
    fn topic_catalog_needs_no_reference_data() {
        let yaml = "corpus_root: topics\noutput_root: out\nprofile: { kind: topic_catalog }\n";
        let config = RunConfig::from_yaml_str(yaml, Path::new("")).unwrap();
        assert_eq!(config.profile, ProfileConfig::TopicCatalog);
        assert_eq!(config.profile.scopes(), &[Scope::Topics]);
    }

    #[test]
    fn shipped_configs_parse() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("configs");
        for name in ["author_scopes.yaml", "citation_links.yaml"] {
            let config = RunConfig::load(&dir.join(name)).unwrap();
            assert!(config.corpus_root.starts_with(&dir));
        }
    }

    #[test]
    fn rejects_unknown_profile_and_mismatched_join() {
        let unknown = "corpus_root: a\noutput_root: b\nprofile: { kind: funders }\n";
        assert!(RunConfig::from_yaml_str(unknown, Path::new("")).is_err());

        let mismatched = r#"
corpus_root: a
output_root: b
profile: { kind: topic_catalog }
join:
  works: { path: x.csv }
"#;
        assert!(RunConfig::from_yaml_str(mismatched, Path::new("")).is_err());
    }
}
