//! Search passthrough backed by the DuckDuckGo Instant Answer API.
//!
//! ## Responsibility
//! Turn a query into a short list of `{title, snippet, url}` results.
//!
//! ## Guarantees
//! - Results are deduplicated by URL and never exceed the requested limit.
//! - Entries without a URL are dropped.
//!
//! ## NOT Responsible For
//! - Deciding when a prompt needs search context (that belongs to `augment`)

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://api.duckduckgo.com/";
const DEFAULT_REGION: &str = "wt-wt";
const TITLE_CHARS: usize = 60;

/// Parameters of one search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    /// Free-text query.
    pub query: String,
    /// Maximum number of results.
    pub limit: usize,
    /// Safe-search filtering.
    pub safe: bool,
    /// Region code; `wt-wt` when unset.
    pub region: Option<String>,
}

impl SearchQuery {
    /// Query with five results, safe search on and no region.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            limit: 5,
            safe: true,
            region: None,
        }
    }

    /// Set the result limit.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

/// One search hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    /// Short title.
    pub title: String,
    /// Longer description.
    pub snippet: String,
    /// Source URL.
    pub url: String,
}

/// Search backend failure.
#[derive(Debug, Error)]
pub enum SearchError {
    /// The request could not be completed.
    #[error("search request failed: {0}")]
    Request(String),

    /// The backend answered with a non-success status.
    #[error("search backend returned HTTP {0}")]
    Status(u16),

    /// The body was not the expected JSON.
    #[error("unexpected search response: {0}")]
    Decode(String),
}

/// A search backend.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Run one search.
    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>, SearchError>;
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstantAnswer {
    #[serde(default)]
    heading: String,
    #[serde(default, rename = "Abstract")]
    abstract_text: String,
    #[serde(default, rename = "AbstractURL")]
    abstract_url: String,
    #[serde(default)]
    related_topics: Vec<serde_json::Value>,
}

/// DuckDuckGo Instant Answer search.
#[derive(Debug, Clone)]
pub struct DuckDuckGoSearch {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl Default for DuckDuckGoSearch {
    fn default() -> Self {
        Self::new()
    }
}

impl DuckDuckGoSearch {
    /// Client against the public API.
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(8),
        }
    }

    /// Override the API URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Set request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

fn topic_title(text: &str) -> String {
    match text.split_once(" - ") {
        Some((head, _)) => head.to_string(),
        None => text.chars().take(TITLE_CHARS).collect(),
    }
}

fn collect_results(answer: InstantAnswer, query: &str, limit: usize) -> Vec<SearchResult> {
    let mut results = Vec::new();

    if !answer.abstract_text.is_empty() {
        let title = if answer.heading.is_empty() {
            query.to_string()
        } else {
            answer.heading
        };
        results.push(SearchResult {
            title,
            snippet: answer.abstract_text,
            url: answer.abstract_url,
        });
    }

    for topic in &answer.related_topics {
        let url = topic.get("FirstURL").and_then(|v| v.as_str());
        let text = topic.get("Text").and_then(|v| v.as_str());
        if let (Some(url), Some(text)) = (url, text) {
            if url.is_empty() || text.is_empty() {
                continue;
            }
            results.push(SearchResult {
                title: topic_title(text),
                snippet: text.to_string(),
                url: url.to_string(),
            });
        }
    }

    let mut seen = HashSet::new();
    results
        .into_iter()
        .filter(|r| !r.url.is_empty() && seen.insert(r.url.clone()))
        .take(limit)
        .collect()
}

#[async_trait]
impl SearchProvider for DuckDuckGoSearch {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>, SearchError> {
        let safe = if query.safe { "on" } else { "off" };
        let region = query.region.as_deref().unwrap_or(DEFAULT_REGION);

        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("q", query.query.as_str()),
                ("format", "json"),
                ("no_html", "1"),
                ("skip_disambig", "1"),
                ("safe", safe),
                ("region", region),
            ])
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| SearchError::Request(e.without_url().to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SearchError::Status(status.as_u16()));
        }

        // The API sometimes labels JSON as application/x-javascript.
        let body = response
            .text()
            .await
            .map_err(|e| SearchError::Request(e.without_url().to_string()))?;
        let answer: InstantAnswer =
            serde_json::from_str(&body).map_err(|e| SearchError::Decode(e.to_string()))?;

        let results = collect_results(answer, &query.query, query.limit);
        debug!(query = %query.query, hits = results.len(), "search complete");
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn answer(value: serde_json::Value) -> InstantAnswer {
        serde_json::from_value(value).expect("test: decode")
    }

    #[test]
    fn test_abstract_comes_first_and_falls_back_to_query_title() {
        let results = collect_results(
            answer(json!({
                "Abstract": "Rust is a language.",
                "AbstractURL": "https://en.wikipedia.org/wiki/Rust",
                "RelatedTopics": [
                    {"FirstURL": "https://ddg.example/a", "Text": "Cargo - the package manager"}
                ]
            })),
            "rust",
            5,
        );
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].title, "rust");
        assert_eq!(results[1].title, "Cargo");
    }

    #[test]
    fn test_related_topics_deduped_and_truncated() {
        let long = "x".repeat(100);
        let results = collect_results(
            answer(json!({
                "RelatedTopics": [
                    {"FirstURL": "https://a", "Text": long},
                    {"FirstURL": "https://a", "Text": "dup"},
                    {"Name": "group", "Topics": []},
                    {"FirstURL": "https://b", "Text": "b"},
                    {"FirstURL": "https://c", "Text": "c"}
                ]
            })),
            "q",
            2,
        );
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].title.len(), TITLE_CHARS);
        assert_eq!(results[1].url, "https://b");
    }

    #[test]
    fn test_abstract_without_url_is_dropped() {
        let results = collect_results(answer(json!({"Abstract": "no link"})), "q", 5);
        assert!(results.is_empty());
    }
}
