//! Reference identifiers that decide which records are in scope.
//!
//! Sources can be a plain newline list (`.txt`, `.lst`), a delimited table
//! (`.csv`, `.tsv`) or a spreadsheet (`.xlsx`, `.xls`, `.xlsm`, `.ods`). All of them are
//! read once, before any shard is dispatched, and never mutated afterwards.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use calamine::{open_workbook_auto, Data, Reader};
use log::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceFormat {
    Lines,
    Delimited(u8),
    Spreadsheet,
}

impl SourceFormat {
    fn detect(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "txt" | "lst" => Ok(SourceFormat::Lines),
            "csv" => Ok(SourceFormat::Delimited(b',')),
            "tsv" => Ok(SourceFormat::Delimited(b'\t')),
            "xlsx" | "xlsm" | "xls" | "ods" => Ok(SourceFormat::Spreadsheet),
            other => Err(anyhow::anyhow!(
                "Unsupported reference source extension '{}' for {}",
                other,
                path.display()
            )),
        }
    }
}

/// A whole reference source held as trimmed strings.
#[derive(Debug, Default)]
struct RawTable {
    path: PathBuf,
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl RawTable {
    fn read(path: &Path, key_column: &str) -> Result<Self> {
        match SourceFormat::detect(path)? {
            SourceFormat::Lines => Self::read_lines(path, key_column),
            SourceFormat::Delimited(delimiter) => Self::read_delimited(path, delimiter),
            SourceFormat::Spreadsheet => Self::read_spreadsheet(path),
        }
    }

    // A newline list has no header; its single column answers to whatever key column was asked for.
    fn read_lines(path: &Path, key_column: &str) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Failed to open reference list: {}", path.display()))?;
        let mut rows = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.with_context(|| format!("Failed to read reference list: {}", path.display()))?;
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                rows.push(vec![trimmed.to_string()]);
            }
        }
        Ok(Self { path: path.to_path_buf(), headers: vec![key_column.to_string()], rows })
    }

    fn read_delimited(path: &Path, delimiter: u8) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .flexible(true)
            .from_path(path)
            .with_context(|| format!("Failed to open reference table: {}", path.display()))?;
        let headers = reader
            .headers()
            .with_context(|| format!("Failed to read header of {}", path.display()))?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.with_context(|| format!("Malformed row in {}", path.display()))?;
            rows.push(record.iter().map(|cell| cell.trim().to_string()).collect());
        }
        Ok(Self { path: path.to_path_buf(), headers, rows })
    }

    fn read_spreadsheet(path: &Path) -> Result<Self> {
        let mut workbook =
            open_workbook_auto(path).with_context(|| format!("Failed to open spreadsheet: {}", path.display()))?;
        let range = match workbook.worksheet_range_at(0) {
            Some(range) => range.with_context(|| format!("Failed to read first worksheet of {}", path.display()))?,
            None => {
                warn!("Spreadsheet {} has no worksheets", path.display());
                return Ok(Self { path: path.to_path_buf(), ..Default::default() });
            }
        };
        let mut rows = range.rows();
        let headers = rows
            .next()
            .map(|header| header.iter().map(|cell| spreadsheet_cell(cell).trim().to_string()).collect())
            .unwrap_or_default();
        let rows = rows
            .map(|row| row.iter().map(|cell| spreadsheet_cell(cell).trim().to_string()).collect())
            .collect();
        Ok(Self { path: path.to_path_buf(), headers, rows })
    }

    fn column_index(&self, name: &str) -> Result<usize> {
        // An empty source has nothing to look up, including its header.
        if self.headers.is_empty() && self.rows.is_empty() {
            return Ok(0);
        }
        self.headers.iter().position(|h| h == name).ok_or_else(|| {
            anyhow::anyhow!(
                "Column '{}' not found in {} (available: {})",
                name,
                self.path.display(),
                self.headers.join(", ")
            )
        })
    }

    fn cell<'a>(row: &'a [String], index: usize) -> Option<&'a str> {
        row.get(index).map(String::as_str).filter(|c| !c.is_empty())
    }
}

// Integral floats come back from spreadsheets as `1234.0`; ids and years should not.
fn spreadsheet_cell(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", *f as i64),
        other => other.to_string(),
    }
}

/// Immutable set of in-scope identifiers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceIdSet {
    ids: HashSet<String>,
}

impl ReferenceIdSet {
    pub fn load(source: &Path, key_column: &str) -> Result<Self> {
        let table = RawTable::read(source, key_column)?;
        let key = table.column_index(key_column)?;
        let ids: HashSet<String> = table
            .rows
            .iter()
            .filter_map(|row| RawTable::cell(row, key))
            .map(str::to_string)
            .collect();
        info!("Loaded {} reference ids from {} (column '{}')", ids.len(), source.display(), key_column);
        Ok(Self { ids })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for ReferenceIdSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self { ids: iter.into_iter().map(Into::into).collect() }
    }
}

/// Year-bucketed eligibility: bucket `Y` holds every id whose year is `<= Y`.
///
/// Buckets grow monotonically, so they are stored as the first year each id
/// becomes eligible rather than as one materialised set per year.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct YearBucketedIds {
    years: RangeInclusive<i32>,
    first_eligible: HashMap<String, i32>,
}

impl YearBucketedIds {
    pub fn load_bucketed(source: &Path, id_column: &str, year_column: &str, years: RangeInclusive<i32>) -> Result<Self> {
        let table = RawTable::read(source, id_column)?;
        let id_idx = table.column_index(id_column)?;
        let year_idx = table.column_index(year_column)?;

        let mut unparsable = 0usize;
        let mut pairs = Vec::with_capacity(table.rows.len());
        for row in &table.rows {
            let Some(id) = RawTable::cell(row, id_idx) else { continue };
            match RawTable::cell(row, year_idx).and_then(|y| y.parse::<f64>().ok()) {
                Some(year) => pairs.push((id.to_string(), year as i32)),
                None => unparsable += 1,
            }
        }
        if unparsable > 0 {
            warn!(
                "{} rows in {} have no usable '{}' value and are never eligible",
                unparsable,
                source.display(),
                year_column
            );
        }
        let bucketed = Self::from_pairs(pairs, years);
        info!(
            "Loaded {} year-bucketed ids from {} for years {}..={}",
            bucketed.first_eligible.len(),
            source.display(),
            bucketed.years.start(),
            bucketed.years.end()
        );
        Ok(bucketed)
    }

    pub fn from_pairs<I, S>(pairs: I, years: RangeInclusive<i32>) -> Self
    where
        I: IntoIterator<Item = (S, i32)>,
        S: Into<String>,
    {
        let mut first_eligible: HashMap<String, i32> = HashMap::new();
        for (id, year) in pairs {
            first_eligible
                .entry(id.into())
                .and_modify(|y| *y = (*y).min(year))
                .or_insert(year);
        }
        Self { years, first_eligible }
    }

    /// Whether `id` is in the bucket for `year`. Years outside the built range have no bucket.
    pub fn contains(&self, year: i32, id: &str) -> bool {
        self.years.contains(&year) && self.first_eligible.get(id).is_some_and(|first| *first <= year)
    }

    pub fn has_bucket(&self, year: i32) -> bool {
        self.years.contains(&year)
    }

    pub fn bucket(&self, year: i32) -> Option<HashSet<&str>> {
        if !self.has_bucket(year) {
            return None;
        }
        Some(
            self.first_eligible
                .iter()
                .filter(|(_, first)| **first <= year)
                .map(|(id, _)| id.as_str())
                .collect(),
        )
    }

    pub fn buckets(&self) -> BTreeMap<i32, usize> {
        self.years.clone().map(|y| (y, self.bucket(y).map_or(0, |b| b.len()))).collect()
    }

    pub fn len(&self) -> usize {
        self.first_eligible.len()
    }

    pub fn is_empty(&self) -> bool {
        self.first_eligible.is_empty()
    }
}

/// A keyed reference table whose non-key columns are attached by the aggregator's left join.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceTable {
    key_column: String,
    columns: Vec<String>,
    rows: HashMap<String, Vec<String>>,
}

impl ReferenceTable {
    pub fn load(source: &Path, key_column: &str) -> Result<Self> {
        let table = RawTable::read(source, key_column)?;
        let key = table.column_index(key_column)?;
        let columns = table
            .headers
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != key)
            .map(|(_, h)| h.clone())
            .collect();
        let mut reference = Self { key_column: key_column.to_string(), columns, rows: HashMap::new() };
        let mut duplicates = 0usize;
        for row in &table.rows {
            let Some(id) = RawTable::cell(row, key) else { continue };
            let values = (0..table.headers.len())
                .filter(|i| *i != key)
                .map(|i| row.get(i).cloned().unwrap_or_default())
                .collect();
            if reference.rows.contains_key(id) {
                duplicates += 1;
                continue;
            }
            reference.rows.insert(id.to_string(), values);
        }
        if duplicates > 0 {
            debug!("Ignored {} duplicate keys in {}", duplicates, source.display());
        }
        info!(
            "Loaded reference table {} ({} rows, joining on '{}')",
            source.display(),
            reference.rows.len(),
            key_column
        );
        Ok(reference)
    }

    pub fn from_rows<I>(key_column: &str, columns: Vec<String>, rows: I) -> Self
    where
        I: IntoIterator<Item = (String, Vec<String>)>,
    {
        let mut table = Self { key_column: key_column.to_string(), columns, rows: HashMap::new() };
        for (key, values) in rows {
            table.rows.entry(key).or_insert(values);
        }
        table
    }

    pub fn key_column(&self) -> &str {
        &self.key_column
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.rows.get(key).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
