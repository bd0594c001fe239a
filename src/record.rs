//! Typed views over the JSON records stored in snapshot shards.
//!
//! Every nested field is decoded leniently: a value of the wrong shape becomes
//! `None` (or an empty list) instead of failing the whole line. Only a line that
//! is not a JSON object at all is a decode fault.

use serde::de::{DeserializeOwned, Deserializer};
use serde::Deserialize;
use serde_json::Value;

fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

fn lenient_vec<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    match Value::deserialize(deserializer)? {
        Value::Array(items) => Ok(items
            .into_iter()
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect()),
        _ => Ok(Vec::new()),
    }
}

// Years show up as numbers in the snapshot, but older dumps carry strings.
fn lenient_year<'de, D>(deserializer: D) -> Result<Option<i32>, D::Error>
where
    D: Deserializer<'de>,
{
    let year = match Value::deserialize(deserializer)? {
        Value::Number(n) => n.as_i64().and_then(|y| i32::try_from(y).ok()),
        Value::String(s) => s.trim().parse::<i32>().ok(),
        _ => None,
    };
    Ok(year)
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct IdRef {
    #[serde(default, deserialize_with = "lenient")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AuthorRef {
    #[serde(default, deserialize_with = "lenient")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Authorship {
    #[serde(default, deserialize_with = "lenient")]
    pub author: Option<AuthorRef>,
}

impl Authorship {
    pub fn author_id(&self) -> Option<&str> {
        self.author.as_ref().and_then(|a| a.id.as_deref())
    }

    pub fn display_name(&self) -> Option<&str> {
        self.author.as_ref().and_then(|a| a.display_name.as_deref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct YearCount {
    #[serde(default, deserialize_with = "lenient_year")]
    pub year: Option<i32>,
    #[serde(default, deserialize_with = "lenient")]
    pub cited_by_count: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Location {
    #[serde(default, deserialize_with = "lenient")]
    pub source: Option<IdRef>,
}

/// A work (publication) record.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct WorkRecord {
    #[serde(default, deserialize_with = "lenient")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "lenient_year")]
    pub publication_year: Option<i32>,
    #[serde(rename = "type", default, deserialize_with = "lenient")]
    pub work_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_vec")]
    pub authorships: Vec<Authorship>,
    #[serde(default, deserialize_with = "lenient_vec")]
    pub referenced_works: Vec<String>,
    #[serde(default, deserialize_with = "lenient_vec")]
    pub counts_by_year: Vec<YearCount>,
    #[serde(default, deserialize_with = "lenient")]
    pub primary_location: Option<Location>,
    #[serde(default, deserialize_with = "lenient")]
    pub primary_topic: Option<IdRef>,
}

impl WorkRecord {
    pub fn primary_source_id(&self) -> Option<&str> {
        self.primary_location
            .as_ref()
            .and_then(|l| l.source.as_ref())
            .and_then(|s| s.id.as_deref())
    }

    pub fn primary_topic_id(&self) -> Option<&str> {
        self.primary_topic.as_ref().and_then(|t| t.id.as_deref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Affiliation {
    #[serde(default, deserialize_with = "lenient")]
    pub institution: Option<IdRef>,
}

/// An author record, as found under `data/authors`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AuthorRecord {
    #[serde(default, deserialize_with = "lenient")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "lenient_vec")]
    pub affiliations: Vec<Affiliation>,
}

/// A topic record, as found under `data/topics`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TopicRecord {
    #[serde(default, deserialize_with = "lenient")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub display_name: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub subfield: Option<IdRef>,
    #[serde(default, deserialize_with = "lenient")]
    pub field: Option<IdRef>,
    #[serde(default, deserialize_with = "lenient")]
    pub domain: Option<IdRef>,
}

pub fn decode_line<R: DeserializeOwned>(line: &str) -> serde_json::Result<R> {
    serde_json::from_str(line)
}
