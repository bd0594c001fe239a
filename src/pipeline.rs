//! One end-to-end run: reference data, dispatch, barrier, aggregation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{error, info, warn};
use uuid::Uuid;

use crate::aggregate::{citations_per_author, AggregationRule, Aggregator};
use crate::config::{ProfileConfig, RunConfig};
use crate::dispatch::{pool_size, DispatchReport, Dispatcher};
use crate::gate::{IdempotencyGate, Verification};
use crate::reference::{ReferenceIdSet, ReferenceTable, YearBucketedIds};
use crate::scope::Scope;
use crate::shards::{ShardEnumerator, ShardHandle};
use crate::transform::{AffiliatedAuthors, AuthorScopes, CitationLinks, RecordTransform, TopicCatalog, WorkSummaries};
use crate::util::format_elapsed;
use crate::worker::ShardWorker;

pub const ROLLUP_FILE_NAME: &str = "citations_per_author_per_year.csv";

#[derive(Debug, Default)]
pub struct AggregateSummary {
    pub written: BTreeMap<Scope, PathBuf>,
    pub failed: Vec<(Scope, anyhow::Error)>,
    pub rollup: Option<PathBuf>,
}

#[derive(Debug)]
pub struct RunSummary {
    pub profile: &'static str,
    pub run_id: Uuid,
    pub shards_found: usize,
    /// Shards the gate reported done before dispatch; never handed to a worker.
    pub already_done: usize,
    pub report: DispatchReport,
    pub aggregates: Option<AggregateSummary>,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.report.is_success()
    }
}

#[derive(Debug, Default)]
pub struct VerifyReport {
    pub total: usize,
    pub intact: usize,
    pub not_done: Vec<ShardHandle>,
    pub mismatched: Vec<(ShardHandle, Vec<Scope>)>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.not_done.is_empty() && self.mismatched.is_empty()
    }
}

/// Join tables and rollup ids, loaded before any shard is dispatched.
struct AggregationInputs {
    joins: BTreeMap<Scope, ReferenceTable>,
    relevant_authors: Option<ReferenceIdSet>,
}

pub struct Pipeline {
    config: RunConfig,
    threads: Option<usize>,
    show_progress: bool,
}

impl Pipeline {
    pub fn new(config: RunConfig) -> Self {
        let threads = config.threads;
        Self { config, threads, show_progress: true }
    }

    /// An explicit pool size; `None` or zero falls back to the config, then to auto.
    pub fn with_threads(mut self, threads: Option<usize>) -> Self {
        if let Some(n) = threads.filter(|n| *n > 0) {
            self.threads = Some(n);
        }
        self
    }

    /// Reprocesses shards even when their manifest says they are done.
    pub fn with_force(mut self, force: bool) -> Self {
        self.config.force |= force;
        self
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn run(&self) -> Result<RunSummary> {
        match &self.config.profile {
            ProfileConfig::AuthorScopes { ids } => {
                let authors = ReferenceIdSet::load(&ids.path, &ids.id_column)?;
                self.run_profile(AuthorScopes::new(Arc::new(authors)))
            }
            ProfileConfig::CitationLinks { eligible, floor_year, years } => {
                let eligible =
                    YearBucketedIds::load_bucketed(&eligible.path, &eligible.id_column, &eligible.year_column, years.range())?;
                self.run_profile(CitationLinks::new(Arc::new(eligible), *floor_year))
            }
            ProfileConfig::WorkSummaries { ids } => {
                let authors = match ids {
                    Some(ids) => Some(Arc::new(ReferenceIdSet::load(&ids.path, &ids.id_column)?)),
                    None => None,
                };
                self.run_profile(WorkSummaries::new(authors))
            }
            ProfileConfig::AffiliatedAuthors { ids } => {
                let institutions = ReferenceIdSet::load(&ids.path, &ids.id_column)?;
                self.run_profile(AffiliatedAuthors::new(Arc::new(institutions)))
            }
            ProfileConfig::TopicCatalog => self.run_profile(TopicCatalog),
        }
    }

    /// Runs a prepared transform over every pending shard, then aggregates.
    pub fn run_profile<T>(&self, transform: T) -> Result<RunSummary>
    where
        T: RecordTransform + 'static,
    {
        let start = Instant::now();
        let run_id = Uuid::new_v4();
        let profile = self.config.profile.name();
        info!("Starting run {} ({})", run_id, self.config.description.as_deref().unwrap_or(profile));

        let inputs = match &self.config.aggregate_dir {
            Some(_) => Some(self.load_aggregation_inputs()?),
            None => None,
        };

        let shards = self.enumerator().enumerate()?;
        let shards_found = shards.len();
        let gate = IdempotencyGate::new(&self.config.output_root, self.config.force);
        let (done, pending): (Vec<ShardHandle>, Vec<ShardHandle>) = shards.into_iter().partition(|s| gate.is_done(s));
        info!("Found {} shards: {} already done, {} to process", shards_found, done.len(), pending.len());

        let threads = pool_size(self.threads, self.config.reserved_cores);
        let dispatcher = Dispatcher::new(threads, self.config.retry_policy())?.with_progress(self.show_progress);
        let worker = Arc::new(ShardWorker::new(transform, gate, run_id));
        let report = dispatcher.run(pending, move |shard| worker.process(shard));

        if !report.is_success() {
            warn!("{} shards failed; aggregates will not include them", report.failed.len());
        }
        let aggregates = match (&self.config.aggregate_dir, inputs) {
            (Some(dir), Some(inputs)) => Some(self.aggregate_with(dir, &inputs)),
            _ => None,
        };

        let summary = RunSummary {
            profile,
            run_id,
            shards_found,
            already_done: done.len(),
            report,
            aggregates,
            elapsed: start.elapsed(),
        };
        info!("Run {} finished in {}", run_id, format_elapsed(summary.elapsed));
        Ok(summary)
    }

    /// Aggregation only, over whatever artifacts already exist.
    pub fn aggregate(&self) -> Result<AggregateSummary> {
        let dir = self
            .config
            .aggregate_dir
            .as_ref()
            .context("No aggregate_dir configured; nothing to aggregate into")?;
        let inputs = self.load_aggregation_inputs()?;
        Ok(self.aggregate_with(dir, &inputs))
    }

    /// Re-hashes every manifest-listed artifact of every enumerated shard.
    pub fn verify(&self) -> Result<VerifyReport> {
        let shards = self.enumerator().enumerate()?;
        let gate = IdempotencyGate::new(&self.config.output_root, false);
        let mut report = VerifyReport { total: shards.len(), ..Default::default() };
        for shard in shards {
            match gate.verify(&shard)? {
                Verification::Intact => report.intact += 1,
                Verification::NotDone => report.not_done.push(shard),
                Verification::Mismatched(scopes) => report.mismatched.push((shard, scopes)),
            }
        }
        info!(
            "Verified {} shards: {} intact, {} not done, {} mismatched",
            report.total,
            report.intact,
            report.not_done.len(),
            report.mismatched.len()
        );
        Ok(report)
    }

    fn enumerator(&self) -> ShardEnumerator {
        ShardEnumerator::new(&self.config.corpus_root)
            .with_sub_path(self.config.sub_path.clone())
            .with_pattern(self.config.shard_pattern.clone())
            .with_shuffle_seed(self.config.shuffle_seed)
            .with_limit(self.config.limit)
    }

    fn load_aggregation_inputs(&self) -> Result<AggregationInputs> {
        let mut joins = BTreeMap::new();
        for (scope, join) in &self.config.join {
            let table = ReferenceTable::load(&join.path, &join.key_column)
                .with_context(|| format!("Failed to load join table for scope '{}'", scope))?;
            joins.insert(*scope, table);
        }
        let relevant_authors = match &self.config.author_rollup {
            Some(rollup) => Some(ReferenceIdSet::load(&rollup.relevant_ids.path, &rollup.relevant_ids.id_column)?),
            None => None,
        };
        Ok(AggregationInputs { joins, relevant_authors })
    }

    fn aggregate_with(&self, dir: &Path, inputs: &AggregationInputs) -> AggregateSummary {
        let aggregator = Aggregator::new(&self.config.output_root, dir);
        let mut summary = AggregateSummary::default();

        for &scope in self.config.profile.scopes() {
            let join = inputs.joins.get(&scope).map(|table| (table, AggregationRule::for_scope(scope).key[0]));
            let written = aggregator.aggregate(scope, join).and_then(|result| {
                let path = aggregator.output_path(scope);
                result.write_csv(&path)?;
                info!("Aggregated {} ({} rows) saved to {}", scope, result.rows.len(), path.display());

                if scope == Scope::Citations {
                    if let Some(relevant) = &inputs.relevant_authors {
                        let rolled = citations_per_author(&result, relevant)?;
                        let rollup_path = dir.join(ROLLUP_FILE_NAME);
                        rolled.write_csv(&rollup_path)?;
                        info!("Citations per author ({} rows) saved to {}", rolled.rows.len(), rollup_path.display());
                        summary.rollup = Some(rollup_path);
                    }
                }
                Ok(path)
            });
            match written {
                Ok(path) => {
                    summary.written.insert(scope, path);
                }
                Err(e) => {
                    error!("Aggregation failed for scope '{}': {:#}", scope, e);
                    summary.failed.push((scope, e));
                }
            }
        }
        summary
    }
}
