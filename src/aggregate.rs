//! Consolidation of per-shard artifacts into one dataset per scope.
//!
//! Each artifact is folded into a partial grouped table, partials are merged,
//! and the merged groups are rendered in key order. Every merge is associative
//! and commutative, so the result does not depend on the order artifacts are
//! read in.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use csv::{Reader, Writer};
use glob::{glob, Pattern};
use log::{debug, info, warn};

use crate::reference::{ReferenceIdSet, ReferenceTable};
use crate::scope::Scope;
use crate::sink::{commit, is_staging_path, staging_path};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Measure {
    /// Sum an integer column.
    Sum { column: &'static str, output: &'static str },
    /// Count rows per group.
    Count { output: &'static str },
    /// Concatenate a text column, parts sorted, empty parts dropped.
    Concat { column: &'static str, separator: &'static str, output: &'static str },
    /// Keep one row per key; the smallest remaining-columns tuple wins.
    First,
    /// Keep only the distinct keys.
    Distinct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregationRule {
    pub scope: Scope,
    pub key: &'static [&'static str],
    pub measure: Measure,
}

impl AggregationRule {
    pub fn for_scope(scope: Scope) -> Self {
        let (key, measure): (&'static [&'static str], Measure) = match scope {
            Scope::Works => (&["author_id", "year", "type"], Measure::Sum { column: "count", output: "total_count" }),
            Scope::Coauthors => (
                &["author_id", "year", "type"],
                Measure::Concat { column: "coauthors", separator: ";", output: "all_coauthors" },
            ),
            Scope::AuthorCitations => (
                &["author_id", "year", "citation_year", "type"],
                Measure::Sum { column: "count", output: "total_count" },
            ),
            Scope::Citations => (&["cited_work_id", "citation_year"], Measure::Count { output: "citations" }),
            Scope::WorkSummaries => (&["work_id"], Measure::First),
            Scope::Topics => (&["topic_id"], Measure::First),
            Scope::Authors => (&["author_id"], Measure::Distinct),
        };
        Self { scope, key, measure }
    }

    fn value_columns(&self) -> Vec<&'static str> {
        match self.measure {
            Measure::Sum { column, .. } | Measure::Concat { column, .. } => vec![column],
            Measure::First => self.scope.header().iter().copied().filter(|c| !self.key.contains(c)).collect(),
            Measure::Count { .. } | Measure::Distinct => Vec::new(),
        }
    }

    fn output_header(&self) -> Vec<String> {
        let mut header: Vec<String> = self.key.iter().map(|c| c.to_string()).collect();
        match self.measure {
            Measure::Sum { output, .. } | Measure::Count { output } | Measure::Concat { output, .. } => {
                header.push(output.to_string())
            }
            Measure::First => header.extend(self.value_columns().into_iter().map(str::to_string)),
            Measure::Distinct => {}
        }
        header
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Accumulator {
    Sum(i64),
    Count(u64),
    Concat(Vec<String>),
    First(Vec<String>),
    Present,
}

impl Accumulator {
    fn merge(&mut self, other: Accumulator) {
        match (self, other) {
            (Accumulator::Sum(a), Accumulator::Sum(b)) => *a += b,
            (Accumulator::Count(a), Accumulator::Count(b)) => *a += b,
            (Accumulator::Concat(a), Accumulator::Concat(b)) => a.extend(b),
            (Accumulator::First(a), Accumulator::First(b)) => {
                if b < *a {
                    *a = b;
                }
            }
            (Accumulator::Present, Accumulator::Present) => {}
            (current, other) => warn!("Ignoring mismatched partial aggregate {:?} for {:?}", other, current),
        }
    }

    fn render(self, separator: &str) -> Vec<String> {
        match self {
            Accumulator::Sum(total) => vec![total.to_string()],
            Accumulator::Count(count) => vec![count.to_string()],
            Accumulator::Concat(mut parts) => {
                parts.sort();
                vec![parts.join(separator)]
            }
            Accumulator::First(values) => values,
            Accumulator::Present => Vec::new(),
        }
    }
}

/// Grouped partial result for one scope, built from one or more artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialAggregate {
    rule: AggregationRule,
    groups: BTreeMap<Vec<String>, Accumulator>,
    skipped_rows: u64,
}

impl PartialAggregate {
    pub fn new(scope: Scope) -> Self {
        Self { rule: AggregationRule::for_scope(scope), groups: BTreeMap::new(), skipped_rows: 0 }
    }

    /// Folds one artifact. Its header must be the scope's header.
    pub fn fold_artifact(scope: Scope, path: &Path) -> Result<Self> {
        let mut partial = Self::new(scope);
        let mut reader = Reader::from_path(path).with_context(|| format!("Failed to open artifact {}", path.display()))?;
        let header: Vec<String> = reader
            .headers()
            .with_context(|| format!("Failed to read header of {}", path.display()))?
            .iter()
            .map(str::to_string)
            .collect();
        if header != scope.header() {
            anyhow::bail!(
                "Artifact {} has header {:?}, expected {:?} for scope '{}'",
                path.display(),
                header,
                scope.header(),
                scope
            );
        }
        for (idx, record) in reader.records().enumerate() {
            let record = record.with_context(|| format!("Malformed row {} in {}", idx + 1, path.display()))?;
            let row: Vec<&str> = record.iter().collect();
            if let Err(e) = partial.add_row(&row) {
                partial.skipped_rows += 1;
                warn!("Skipping row {} in {}: {}", idx + 1, path.display(), e);
            }
        }
        Ok(partial)
    }

    /// Adds one artifact row laid out in the scope's header order.
    pub fn add_row(&mut self, row: &[&str]) -> Result<()> {
        let header = self.rule.scope.header();
        let cell = |name: &str| -> Result<String> {
            let idx = header
                .iter()
                .position(|h| *h == name)
                .ok_or_else(|| anyhow::anyhow!("Column '{}' is not part of scope '{}'", name, self.rule.scope))?;
            row.get(idx)
                .map(|c| c.to_string())
                .ok_or_else(|| anyhow::anyhow!("Row is missing column '{}'", name))
        };

        let key = self.rule.key.iter().map(|k| cell(k)).collect::<Result<Vec<_>>>()?;
        let value = match self.rule.measure {
            Measure::Sum { column, .. } => {
                let raw = cell(column)?;
                let n = raw
                    .trim()
                    .parse::<i64>()
                    .with_context(|| format!("'{}' is not an integer {}", raw, column))?;
                Accumulator::Sum(n)
            }
            Measure::Count { .. } => Accumulator::Count(1),
            Measure::Concat { column, .. } => {
                let part = cell(column)?;
                Accumulator::Concat(if part.is_empty() { Vec::new() } else { vec![part] })
            }
            Measure::First => {
                Accumulator::First(self.rule.value_columns().iter().map(|c| cell(c)).collect::<Result<Vec<_>>>()?)
            }
            Measure::Distinct => Accumulator::Present,
        };
        self.insert(key, value);
        Ok(())
    }

    fn insert(&mut self, key: Vec<String>, value: Accumulator) {
        match self.groups.entry(key) {
            Entry::Occupied(mut existing) => existing.get_mut().merge(value),
            Entry::Vacant(slot) => {
                slot.insert(value);
            }
        }
    }

    pub fn merge(&mut self, other: PartialAggregate) {
        self.skipped_rows += other.skipped_rows;
        for (key, value) in other.groups {
            self.insert(key, value);
        }
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn finish(self) -> AggregationResult {
        let separator = match self.rule.measure {
            Measure::Concat { separator, .. } => separator,
            _ => "",
        };
        let rows = self
            .groups
            .into_iter()
            .map(|(mut key, value)| {
                key.extend(value.render(separator));
                key
            })
            .collect();
        AggregationResult { scope: self.rule.scope, header: self.rule.output_header(), rows }
    }
}

/// One consolidated table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationResult {
    pub scope: Scope,
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl AggregationResult {
    pub fn column(&self, name: &str) -> Result<usize> {
        self.header
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| anyhow::anyhow!("Column '{}' not in aggregated {} ({:?})", name, self.scope, self.header))
    }

    /// Left join: appends the reference table's columns, empty where `on` has no match.
    pub fn left_join(&mut self, table: &ReferenceTable, on: &str) -> Result<()> {
        let on_idx = self.column(on)?;
        for name in table.columns() {
            if self.header.contains(name) {
                self.header.push(format!("{}_ref", name));
            } else {
                self.header.push(name.clone());
            }
        }
        let width = table.columns().len();
        let mut unmatched = 0usize;
        for row in &mut self.rows {
            match table.get(&row[on_idx]) {
                Some(values) => row.extend(values.iter().cloned()),
                None => {
                    unmatched += 1;
                    row.extend(std::iter::repeat(String::new()).take(width));
                }
            }
        }
        info!(
            "Joined {} rows of {} against {} on '{}' ({} unmatched)",
            self.rows.len(),
            self.scope,
            table.key_column(),
            on,
            unmatched
        );
        Ok(())
    }

    /// Written via a staging file so a crash never leaves a half-written dataset behind.
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let staging = staging_path(path);
        {
            let file = File::create(&staging).with_context(|| format!("Failed to create {}", staging.display()))?;
            let mut writer = Writer::from_writer(file);
            writer.write_record(&self.header)?;
            for row in &self.rows {
                writer.write_record(row)?;
            }
            let file = writer
                .into_inner()
                .map_err(|e| anyhow::anyhow!("Failed to flush {}: {}", staging.display(), e.error()))?;
            file.sync_all()?;
        }
        commit(&staging, path)
    }
}

/// Reads every artifact of a scope under the extraction output root.
#[derive(Debug, Clone)]
pub struct Aggregator {
    artifact_root: PathBuf,
    output_dir: PathBuf,
}

impl Aggregator {
    pub fn new(artifact_root: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self { artifact_root: artifact_root.into(), output_dir: output_dir.into() }
    }

    pub fn artifacts(&self, scope: Scope) -> Result<Vec<PathBuf>> {
        let scope_dir = self.artifact_root.join(scope.name());
        let pattern = format!("{}/**/*.csv", Pattern::escape(&scope_dir.to_string_lossy()));
        let mut files: Vec<PathBuf> = glob(&pattern)
            .with_context(|| format!("Invalid artifact pattern: {}", pattern))?
            .filter_map(Result::ok)
            .filter(|p| p.is_file() && !is_staging_path(p))
            .collect();
        files.sort();
        Ok(files)
    }

    pub fn output_path(&self, scope: Scope) -> PathBuf {
        self.output_dir.join(format!("aggregated_{}.csv", scope.name()))
    }

    pub fn aggregate(&self, scope: Scope, reference_table: Option<(&ReferenceTable, &str)>) -> Result<AggregationResult> {
        let files = self.artifacts(scope)?;
        if files.is_empty() {
            anyhow::bail!("No artifacts found for scope '{}' in {}", scope, self.artifact_root.join(scope.name()).display());
        }
        info!("Aggregating {} artifacts for scope '{}'", files.len(), scope);

        let mut merged = PartialAggregate::new(scope);
        for (idx, file) in files.iter().enumerate() {
            debug!("Loading artifact {}/{}: {}", idx + 1, files.len(), file.display());
            merged.merge(PartialAggregate::fold_artifact(scope, file)?);
        }
        if merged.skipped_rows > 0 {
            warn!("Skipped {} unusable rows while aggregating {}", merged.skipped_rows, scope);
        }

        let mut result = merged.finish();
        if let Some((table, on)) = reference_table {
            result.left_join(table, on)?;
        }
        Ok(result)
    }

    /// Aggregates and writes `aggregated_<scope>.csv`, returning its path.
    pub fn aggregate_to_file(&self, scope: Scope, reference_table: Option<(&ReferenceTable, &str)>) -> Result<PathBuf> {
        let result = self.aggregate(scope, reference_table)?;
        let path = self.output_path(scope);
        result.write_csv(&path)?;
        info!("Aggregated {} ({} rows) saved to {}", scope, result.rows.len(), path.display());
        Ok(path)
    }
}

/// Citation totals per relevant author, per citation year and publication year.
///
/// Expects consolidated citations joined with work summaries, so that every row
/// carries the cited work's `year` and `|`-separated `author_ids`.
pub fn citations_per_author(citations: &AggregationResult, relevant: &ReferenceIdSet) -> Result<AggregationResult> {
    let authors_idx = citations.column("author_ids")?;
    let citation_year_idx = citations.column("citation_year")?;
    let count_idx = citations.column("citations")?;
    let year_idx = citations.column("year")?;

    let mut totals: BTreeMap<(String, String, String), i64> = BTreeMap::new();
    for row in &citations.rows {
        let count: i64 = row[count_idx]
            .parse()
            .with_context(|| format!("'{}' is not a citation count", row[count_idx]))?;
        for author in row[authors_idx].split('|').map(str::trim).filter(|a| !a.is_empty()) {
            if !relevant.contains(author) {
                continue;
            }
            // Keyed in output sort order: author, publication year, citation year.
            *totals
                .entry((author.to_string(), row[year_idx].clone(), row[citation_year_idx].clone()))
                .or_default() += count;
        }
    }

    let rows = totals
        .into_iter()
        .map(|((author, year, citation_year), total)| vec![author, citation_year, year, total.to_string()])
        .collect();
    Ok(AggregationResult {
        scope: Scope::Citations,
        header: ["author_id", "citation_year", "year", "citations"].iter().map(|s| s.to_string()).collect(),
        rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::ScopeSink;
    use tempfile::TempDir;

    fn strings(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|c| c.to_string()).collect()
    }

    fn citation_partial(cited: &str, year: &str, count: usize) -> PartialAggregate {
        let mut partial = PartialAggregate::new(Scope::Citations);
        for i in 0..count {
            let citing = format!("W_CITING_{}", i);
            partial.add_row(&[cited, citing.as_str(), year]).unwrap();
        }
        partial
    }

    #[test]
    fn partial_citation_counts_sum_in_any_order() {
        let forward = {
            let mut p = citation_partial("W1", "2010", 3);
            p.merge(citation_partial("W1", "2010", 2));
            p.finish()
        };
        let backward = {
            let mut p = citation_partial("W1", "2010", 2);
            p.merge(citation_partial("W1", "2010", 3));
            p.finish()
        };
        assert_eq!(forward, backward);
        assert_eq!(forward.header, strings(&["cited_work_id", "citation_year", "citations"]));
        assert_eq!(forward.rows, vec![strings(&["W1", "2010", "5"])]);
    }

    #[test]
    fn coauthor_concatenation_is_order_independent() {
        let mut a = PartialAggregate::new(Scope::Coauthors);
        a.add_row(&["A1", "2020", "article", "Zed;Amy"]).unwrap();
        a.add_row(&["A1", "2020", "article", ""]).unwrap();
        let mut b = PartialAggregate::new(Scope::Coauthors);
        b.add_row(&["A1", "2020", "article", "Bob"]).unwrap();

        let mut ab = a.clone();
        ab.merge(b.clone());
        let mut ba = b;
        ba.merge(a);
        assert_eq!(ab.clone().finish(), ba.finish());
        assert_eq!(ab.finish().rows, vec![strings(&["A1", "2020", "article", "Bob;Zed;Amy"])]);
    }

    #[test]
    fn non_numeric_counts_are_rejected_per_row() {
        let mut works = PartialAggregate::new(Scope::Works);
        assert!(works.add_row(&["A1", "2020", "article", "one"]).is_err());
        works.add_row(&["A1", "2020", "article", "1"]).unwrap();
        assert_eq!(works.group_count(), 1);
    }

    #[test]
    fn aggregates_artifacts_and_left_joins_reference() {
        let out = TempDir::new().unwrap();
        let agg = TempDir::new().unwrap();
        let citations_dir = out.path().join("citations");
        fs::create_dir_all(citations_dir.join("updated_date=2024-01-01")).unwrap();
        ScopeSink
            .append(
                Scope::Citations,
                &[strings(&["W1", "W7", "2010"]), strings(&["W2", "W7", "2010"])],
                &citations_dir.join("updated_date=2024-01-01/part_000.csv"),
            )
            .unwrap();
        ScopeSink
            .append(Scope::Citations, &[strings(&["W1", "W8", "2010"])], &citations_dir.join("part_009.csv"))
            .unwrap();

        let works = ReferenceTable::from_rows(
            "work_id",
            strings(&["year", "author_ids"]),
            [("W1".to_string(), strings(&["2005", "A1|A2"]))],
        );
        let aggregator = Aggregator::new(out.path(), agg.path());
        let result = aggregator.aggregate(Scope::Citations, Some((&works, "cited_work_id"))).unwrap();

        assert_eq!(result.header, strings(&["cited_work_id", "citation_year", "citations", "year", "author_ids"]));
        assert_eq!(
            result.rows,
            vec![strings(&["W1", "2010", "2", "2005", "A1|A2"]), strings(&["W2", "2010", "1", "", ""])]
        );

        let path = aggregator.aggregate_to_file(Scope::Citations, Some((&works, "cited_work_id"))).unwrap();
        let first = fs::read(&path).unwrap();
        aggregator.aggregate_to_file(Scope::Citations, Some((&works, "cited_work_id"))).unwrap();
        assert_eq!(first, fs::read(&path).unwrap());
    }

    #[test]
    fn missing_scope_artifacts_is_an_error() {
        let out = TempDir::new().unwrap();
        let aggregator = Aggregator::new(out.path(), out.path().join("agg"));
        assert!(aggregator.aggregate(Scope::Topics, None).is_err());
    }

    #[test]
    fn artifacts_with_foreign_headers_are_rejected() {
        let out = TempDir::new().unwrap();
        let path = out.path().join("works.csv");
        fs::write(&path, "cited_work_id,citing_work_id,citation_year\nW1,W2,2010\n").unwrap();
        assert!(PartialAggregate::fold_artifact(Scope::Works, &path).is_err());
    }

    #[test]
    fn first_and_distinct_rules_deduplicate() {
        let mut topics = PartialAggregate::new(Scope::Topics);
        topics.add_row(&["T1", "Optics", "b", "SF", "F", "D"]).unwrap();
        topics.add_row(&["T1", "Optics", "a", "SF", "F", "D"]).unwrap();
        assert_eq!(topics.finish().rows, vec![strings(&["T1", "Optics", "a", "SF", "F", "D"])]);

        let mut authors = PartialAggregate::new(Scope::Authors);
        authors.add_row(&["A2"]).unwrap();
        authors.add_row(&["A1"]).unwrap();
        authors.add_row(&["A2"]).unwrap();
        let result = authors.finish();
        assert_eq!(result.header, strings(&["author_id"]));
        assert_eq!(result.rows, vec![strings(&["A1"]), strings(&["A2"])]);
    }

    #[test]
    fn citations_roll_up_to_relevant_authors() {
        let joined = AggregationResult {
            scope: Scope::Citations,
            header: strings(&["cited_work_id", "citation_year", "citations", "year", "author_ids"]),
            rows: vec![
                strings(&["W1", "2010", "2", "2005", "A1|A2"]),
                strings(&["W3", "2010", "4", "2005", "A1"]),
                strings(&["W4", "2011", "1", "2008", "A2|A9"]),
            ],
        };
        let relevant: ReferenceIdSet = ["A1", "A9"].into_iter().collect();

        let rolled = citations_per_author(&joined, &relevant).unwrap();
        assert_eq!(rolled.header, strings(&["author_id", "citation_year", "year", "citations"]));
        assert_eq!(rolled.rows, vec![strings(&["A1", "2010", "2005", "6"]), strings(&["A9", "2011", "2008", "1"])]);
    }
}
