use std::collections::HashSet;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::record::{AuthorRecord, TopicRecord, WorkRecord};
use crate::reference::{ReferenceIdSet, YearBucketedIds};
use crate::scope::{year_cell, Scope, ScopeRows};

/// Floor year for citation eligibility used by the snapshot studies.
pub const DEFAULT_CITATION_FLOOR_YEAR: i32 = 2001;

/// Maps one decoded record to rows across the scopes it serves.
///
/// Implementations are pure: the only inputs are the record and the read-only
/// reference data captured when the transform was built.
pub trait RecordTransform: Send + Sync {
    type Record: DeserializeOwned;

    fn scopes(&self) -> &'static [Scope];

    fn transform(&self, record: &Self::Record) -> ScopeRows;
}

/// Per-author works, coauthor lists and yearly citation counts.
#[derive(Debug, Clone)]
pub struct AuthorScopes {
    authors: Arc<ReferenceIdSet>,
}

impl AuthorScopes {
    pub fn new(authors: Arc<ReferenceIdSet>) -> Self {
        Self { authors }
    }
}

impl RecordTransform for AuthorScopes {
    type Record = WorkRecord;

    fn scopes(&self) -> &'static [Scope] {
        &[Scope::Works, Scope::Coauthors, Scope::AuthorCitations]
    }

    fn transform(&self, work: &WorkRecord) -> ScopeRows {
        let mut rows = ScopeRows::new();
        let year = year_cell(work.publication_year);
        let work_type = work.work_type.clone().unwrap_or_default();

        for authorship in &work.authorships {
            let Some(author_id) = authorship.author_id() else { continue };
            if !self.authors.contains(author_id) {
                continue;
            }

            rows.push(
                Scope::Works,
                vec![author_id.to_string(), year.clone(), work_type.clone(), "1".to_string()],
            );

            let coauthors: Vec<&str> = work
                .authorships
                .iter()
                .filter(|other| other.author_id() != Some(author_id))
                .filter_map(|other| other.display_name())
                .collect();
            rows.push(
                Scope::Coauthors,
                vec![author_id.to_string(), year.clone(), work_type.clone(), coauthors.join(";")],
            );

            for counts in &work.counts_by_year {
                let (Some(citation_year), Some(cited_by)) = (counts.year, counts.cited_by_count) else { continue };
                rows.push(
                    Scope::AuthorCitations,
                    vec![
                        author_id.to_string(),
                        year.clone(),
                        citation_year.to_string(),
                        work_type.clone(),
                        cited_by.to_string(),
                    ],
                );
            }
        }
        rows
    }
}

/// Citation links from a citing work to eligible referenced works.
///
/// A reference only counts when the cited work is in the eligibility bucket of
/// the citing work's own publication year, which rules out forward citations.
#[derive(Debug, Clone)]
pub struct CitationLinks {
    eligible: Arc<YearBucketedIds>,
    floor_year: i32,
}

impl CitationLinks {
    pub fn new(eligible: Arc<YearBucketedIds>, floor_year: i32) -> Self {
        Self { eligible, floor_year }
    }
}

impl RecordTransform for CitationLinks {
    type Record = WorkRecord;

    fn scopes(&self) -> &'static [Scope] {
        &[Scope::Citations]
    }

    fn transform(&self, work: &WorkRecord) -> ScopeRows {
        let mut rows = ScopeRows::new();
        let (Some(year), Some(citing_id)) = (work.publication_year, work.id.as_deref()) else {
            return rows;
        };
        if year < self.floor_year || work.referenced_works.is_empty() || !self.eligible.has_bucket(year) {
            return rows;
        }
        let mut emitted: HashSet<&str> = HashSet::with_capacity(work.referenced_works.len());
        for cited in &work.referenced_works {
            if self.eligible.contains(year, cited) && emitted.insert(cited.as_str()) {
                rows.push(Scope::Citations, vec![cited.clone(), citing_id.to_string(), year.to_string()]);
            }
        }
        rows
    }
}

/// One flat summary row per work, optionally restricted to works with a listed author.
#[derive(Debug, Clone, Default)]
pub struct WorkSummaries {
    authors: Option<Arc<ReferenceIdSet>>,
}

impl WorkSummaries {
    pub fn new(authors: Option<Arc<ReferenceIdSet>>) -> Self {
        Self { authors }
    }
}

impl RecordTransform for WorkSummaries {
    type Record = WorkRecord;

    fn scopes(&self) -> &'static [Scope] {
        &[Scope::WorkSummaries]
    }

    fn transform(&self, work: &WorkRecord) -> ScopeRows {
        let mut rows = ScopeRows::new();
        let Some(work_id) = work.id.as_deref() else { return rows };

        let mut author_ids: Vec<&str> = Vec::with_capacity(work.authorships.len());
        for id in work.authorships.iter().filter_map(|a| a.author_id()) {
            if !author_ids.contains(&id) {
                author_ids.push(id);
            }
        }
        if let Some(authors) = &self.authors {
            if !author_ids.iter().any(|id| authors.contains(id)) {
                return rows;
            }
        }

        rows.push(
            Scope::WorkSummaries,
            vec![
                work_id.to_string(),
                year_cell(work.publication_year),
                work.work_type.clone().unwrap_or_default(),
                work.primary_source_id().unwrap_or_default().to_string(),
                work.primary_topic_id().unwrap_or_default().to_string(),
                author_ids.join("|"),
            ],
        );
        rows
    }
}

/// Authors with at least one affiliation to a listed institution.
#[derive(Debug, Clone)]
pub struct AffiliatedAuthors {
    institutions: Arc<ReferenceIdSet>,
}

impl AffiliatedAuthors {
    pub fn new(institutions: Arc<ReferenceIdSet>) -> Self {
        Self { institutions }
    }
}

impl RecordTransform for AffiliatedAuthors {
    type Record = AuthorRecord;

    fn scopes(&self) -> &'static [Scope] {
        &[Scope::Authors]
    }

    fn transform(&self, author: &AuthorRecord) -> ScopeRows {
        let mut rows = ScopeRows::new();
        let Some(author_id) = author.id.as_deref() else { return rows };
        let affiliated = author
            .affiliations
            .iter()
            .filter_map(|aff| aff.institution.as_ref().and_then(|i| i.id.as_deref()))
            .any(|institution| self.institutions.contains(institution));
        if affiliated {
            rows.push(Scope::Authors, vec![author_id.to_string()]);
        }
        rows
    }
}

/// Flattened topic hierarchy.
#[derive(Debug, Clone, Copy, Default)]
pub struct TopicCatalog;

impl RecordTransform for TopicCatalog {
    type Record = TopicRecord;

    fn scopes(&self) -> &'static [Scope] {
        &[Scope::Topics]
    }

    fn transform(&self, topic: &TopicRecord) -> ScopeRows {
        let mut rows = ScopeRows::new();
        let Some(topic_id) = topic.id.as_deref() else { return rows };
        let nested_id = |level: &Option<crate::record::IdRef>| {
            level.as_ref().and_then(|l| l.id.clone()).unwrap_or_default()
        };
        rows.push(
            Scope::Topics,
            vec![
                topic_id.to_string(),
                topic.display_name.clone().unwrap_or_default(),
                topic.description.clone().unwrap_or_default(),
                nested_id(&topic.subfield),
                nested_id(&topic.field),
                nested_id(&topic.domain),
            ],
        );
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::decode_line;

    fn work(line: &str) -> WorkRecord {
        decode_line(line).unwrap()
    }

    fn two_author_work() -> WorkRecord {
        work(
            r#"{"id":"W1","publication_year":2019,"type":"article",
                "authorships":[{"author":{"id":"A","display_name":"Ann"}},{"author":{"id":"B","display_name":"Ben"}}],
                "counts_by_year":[{"year":2021,"cited_by_count":3},{"year":2020,"cited_by_count":1}]}"#,
        )
    }

    fn author_scopes(ids: &[&str]) -> AuthorScopes {
        AuthorScopes::new(Arc::new(ids.iter().copied().collect()))
    }

    #[test]
    fn works_rows_follow_reference_membership() {
        let record = two_author_work();

        let only_a = author_scopes(&["A"]).transform(&record);
        assert_eq!(only_a.get(Scope::Works), &[vec!["A", "2019", "article", "1"]]);

        let both = author_scopes(&["A", "B"]).transform(&record);
        assert_eq!(both.get(Scope::Works).len(), 2);

        let none = author_scopes(&[]).transform(&record);
        assert!(none.is_empty());
    }

    #[test]
    fn coauthors_exclude_the_listed_author() {
        let rows = author_scopes(&["A", "B"]).transform(&two_author_work());
        assert_eq!(
            rows.get(Scope::Coauthors),
            &[vec!["A", "2019", "article", "Ben"], vec!["B", "2019", "article", "Ann"]]
        );
    }

    #[test]
    fn author_citations_emit_one_row_per_year_count() {
        let rows = author_scopes(&["B"]).transform(&two_author_work());
        assert_eq!(
            rows.get(Scope::AuthorCitations),
            &[vec!["B", "2019", "2021", "article", "3"], vec!["B", "2019", "2020", "article", "1"]]
        );
    }

    #[test]
    fn authorships_without_author_id_are_skipped() {
        let record = work(r#"{"id":"W9","authorships":[{"author":null},{"author":{"display_name":"Nobody"}}]}"#);
        assert!(author_scopes(&["A"]).transform(&record).is_empty());
    }

    fn citations(pairs: &[(&str, i32)]) -> CitationLinks {
        let eligible = YearBucketedIds::from_pairs(pairs.iter().map(|(id, y)| (*id, *y)), 2001..=2025);
        CitationLinks::new(Arc::new(eligible), DEFAULT_CITATION_FLOOR_YEAR)
    }

    #[test]
    fn forward_citations_are_not_eligible() {
        let transform = citations(&[("W_OLD", 2005), ("W_NEW", 2012)]);
        let citing = work(r#"{"id":"W_C","publication_year":2010,"referenced_works":["W_OLD","W_NEW","W_UNKNOWN"]}"#);

        let rows = transform.transform(&citing);
        assert_eq!(rows.get(Scope::Citations), &[vec!["W_OLD", "W_C", "2010"]]);
    }

    #[test]
    fn citations_respect_floor_year_and_missing_fields() {
        let transform = citations(&[("W_OLD", 1990)]);
        let before_floor = work(r#"{"id":"W_C","publication_year":1999,"referenced_works":["W_OLD"]}"#);
        let no_year = work(r#"{"id":"W_C","referenced_works":["W_OLD"]}"#);
        let no_refs = work(r#"{"id":"W_C","publication_year":2010}"#);
        let no_id = work(r#"{"publication_year":2010,"referenced_works":["W_OLD"]}"#);

        for record in [before_floor, no_year, no_refs, no_id] {
            assert!(transform.transform(&record).is_empty());
        }
    }

    #[test]
    fn repeated_references_yield_one_citation_row() {
        let transform = citations(&[("W1", 2005)]);
        let record = work(r#"{"id":"W9","publication_year":2010,"referenced_works":["W1","W1"]}"#);

        let rows = transform.transform(&record);
        assert_eq!(rows.get(Scope::Citations), &[vec!["W1", "W9", "2010"]]);
    }

    #[test]
    fn work_summaries_deduplicate_authors_and_filter() {
        let record = work(
            r#"{"id":"W1","publication_year":2020,"type":"book",
                "authorships":[{"author":{"id":"A1"}},{"author":{"id":"A2"}},{"author":{"id":"A1"}}],
                "primary_location":{"source":{"id":"S1"}},"primary_topic":{"id":"T1"}}"#,
        );
        let unfiltered = WorkSummaries::new(None).transform(&record);
        assert_eq!(unfiltered.get(Scope::WorkSummaries), &[vec!["W1", "2020", "book", "S1", "T1", "A1|A2"]]);

        let filtered = WorkSummaries::new(Some(Arc::new(["A9"].into_iter().collect()))).transform(&record);
        assert!(filtered.is_empty());
    }

    #[test]
    fn affiliated_authors_match_any_institution() {
        let transform = AffiliatedAuthors::new(Arc::new(["I2"].into_iter().collect()));
        let author: AuthorRecord =
            decode_line(r#"{"id":"A7","affiliations":[{"institution":{"id":"I1"}},{"institution":{"id":"I2"}}]}"#)
                .unwrap();
        let stranger: AuthorRecord = decode_line(r#"{"id":"A8","affiliations":[]}"#).unwrap();

        assert_eq!(transform.transform(&author).get(Scope::Authors), &[vec!["A7"]]);
        assert!(transform.transform(&stranger).is_empty());
    }

    #[test]
    fn topic_catalog_flattens_hierarchy() {
        let topic: TopicRecord = decode_line(
            r#"{"id":"T1","display_name":"Optics","description":"Light","subfield":{"id":"SF"},"field":{"id":"F"},"domain":{"id":"D"}}"#,
        )
        .unwrap();
        assert_eq!(
            TopicCatalog.transform(&topic).get(Scope::Topics),
            &[vec!["T1", "Optics", "Light", "SF", "F", "D"]]
        );
    }
}
