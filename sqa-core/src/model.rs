//! Data model shared across the audit pipeline: queries going in, scored
//! records coming out. Records are serialized line by line into the run
//! checkpoint, so every type here keeps a stable serde shape.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One search to audit. The id is the resumability key: a query whose id is
/// already present in the run checkpoint is never attempted again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default)]
    pub origin: QueryOrigin,
}

impl Query {
    pub fn predefined<I: Into<String>, T: Into<String>>(id: I, text: T) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            language: None,
            origin: QueryOrigin::Predefined,
        }
    }

    pub fn generated<I: Into<String>, T: Into<String>>(id: I, text: T) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            language: None,
            origin: QueryOrigin::Generated,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryOrigin {
    Predefined,
    Generated,
}

impl QueryOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryOrigin::Predefined => "predefined",
            QueryOrigin::Generated => "generated",
        }
    }
}

impl Default for QueryOrigin {
    fn default() -> Self {
        QueryOrigin::Predefined
    }
}

impl fmt::Display for QueryOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single extracted search result, ranked from 1. Extraction fills the
/// fields it can find; enrichment passes may only append attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultItem {
    pub rank: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

impl ResultItem {
    pub fn new(rank: usize, title: Option<String>) -> Self {
        Self {
            rank,
            title,
            url: None,
            snippet: None,
            price: None,
            image: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn append_attribute<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        self.attributes.insert(key.into(), value.into());
    }
}

/// Where the page artifacts for one query landed on disk. Capture is
/// best-effort, so either path may be absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageArtifacts {
    pub url: String,
    pub final_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_path: Option<PathBuf>,
    pub captured_at: DateTime<Utc>,
}

impl PageArtifacts {
    pub fn new<U: Into<String>>(url: U) -> Self {
        let url = url.into();
        Self {
            final_url: url.clone(),
            url,
            html_path: None,
            screenshot_path: None,
            captured_at: Utc::now(),
        }
    }
}

/// Verdict returned by the external relevance judge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeScore {
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Completed audit of one query on one site. One of these per checkpoint
/// line; a record exists only for queries that were judged successfully.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub site: String,
    pub query: Query,
    pub items: Vec<ResultItem>,
    pub page: PageArtifacts,
    pub judge: JudgeScore,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_round_trips_through_json() {
        let query = Query {
            id: "q001".into(),
            text: "wireless headphones".into(),
            language: Some("en".into()),
            origin: QueryOrigin::Generated,
        };
        let json = serde_json::to_string(&query).expect("serialize");
        let back: Query = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, query);
    }

    #[test]
    fn origin_defaults_to_predefined() {
        let query: Query = serde_json::from_str(r#"{"id":"q1","text":"socks"}"#).expect("parse");
        assert_eq!(query.origin, QueryOrigin::Predefined);
    }

    #[test]
    fn attributes_only_grow() {
        let mut item = ResultItem {
            rank: 1,
            title: Some("USB-C cable".into()),
            url: None,
            snippet: None,
            price: None,
            image: None,
            attributes: BTreeMap::new(),
        };
        item.append_attribute("pdp_brand", "Acme");
        item.append_attribute("pdp_rating", "4.5");
        assert_eq!(item.attributes.len(), 2);
        assert_eq!(item.attributes.get("pdp_brand").map(String::as_str), Some("Acme"));
    }
}
