use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A named category of relation extracted from a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Works,
    Coauthors,
    AuthorCitations,
    Citations,
    WorkSummaries,
    Topics,
    Authors,
}

pub const ALL_SCOPES: [Scope; 7] = [
    Scope::Works,
    Scope::Coauthors,
    Scope::AuthorCitations,
    Scope::Citations,
    Scope::WorkSummaries,
    Scope::Topics,
    Scope::Authors,
];

impl Scope {
    pub fn name(&self) -> &'static str {
        match self {
            Scope::Works => "works",
            Scope::Coauthors => "coauthors",
            Scope::AuthorCitations => "author_citations",
            Scope::Citations => "citations",
            Scope::WorkSummaries => "work_summaries",
            Scope::Topics => "topics",
            Scope::Authors => "authors",
        }
    }

    /// Column header of every per-shard artifact of this scope. Rows must match its arity.
    pub fn header(&self) -> &'static [&'static str] {
        match self {
            Scope::Works => &["author_id", "year", "type", "count"],
            Scope::Coauthors => &["author_id", "year", "type", "coauthors"],
            Scope::AuthorCitations => &["author_id", "year", "citation_year", "type", "count"],
            Scope::Citations => &["cited_work_id", "citing_work_id", "citation_year"],
            Scope::WorkSummaries => &[
                "work_id",
                "year",
                "type",
                "primary_location_source_id",
                "primary_topic_id",
                "author_ids",
            ],
            Scope::Topics => &["topic_id", "display_name", "description", "subfield_id", "field_id", "domain_id"],
            Scope::Authors => &["author_id"],
        }
    }

    pub fn arity(&self) -> usize {
        self.header().len()
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Scope {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL_SCOPES
            .iter()
            .copied()
            .find(|scope| scope.name() == s)
            .ok_or_else(|| anyhow::anyhow!("Unknown scope '{}'", s))
    }
}

/// One fixed-arity tuple of scalar cells.
pub type OutputRow = Vec<String>;

/// Rows emitted for one record or accumulated for one shard, grouped by scope.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ScopeRows {
    rows: BTreeMap<Scope, Vec<OutputRow>>,
}

impl ScopeRows {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, scope: Scope, row: OutputRow) {
        self.rows.entry(scope).or_default().push(row);
    }

    pub fn extend(&mut self, other: ScopeRows) {
        for (scope, rows) in other.rows {
            self.rows.entry(scope).or_default().extend(rows);
        }
    }

    pub fn get(&self, scope: Scope) -> &[OutputRow] {
        self.rows.get(&scope).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.rows.values().all(Vec::is_empty)
    }

    pub fn count_rows(&self) -> usize {
        self.rows.values().map(Vec::len).sum()
    }

    pub fn into_iter_scopes(self) -> impl Iterator<Item = (Scope, Vec<OutputRow>)> {
        self.rows.into_iter().filter(|(_, rows)| !rows.is_empty())
    }
}

/// Renders an optional year the way the artifacts store it: empty when unknown.
pub fn year_cell(year: Option<i32>) -> String {
    year.map(|y| y.to_string()).unwrap_or_default()
}
