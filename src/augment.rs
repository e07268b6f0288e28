//! Search-context augmentation.
//!
//! Prompts that ask to search ("search", "find", "look up", "google",
//! "duckduckgo") get the top search results prepended before they are sent
//! to a provider. Trigger detection works on whole words so "findings" does
//! not trigger a search.

use std::sync::OnceLock;

use regex::{Regex, RegexBuilder};

use crate::provider::SearchResult;

/// Number of results folded into the prompt.
pub const CONTEXT_RESULTS: usize = 3;

/// Number of results fetched for context.
pub const FETCH_RESULTS: usize = 5;

fn trigger_regex() -> Option<&'static Regex> {
    static TRIGGERS: OnceLock<Option<Regex>> = OnceLock::new();
    TRIGGERS
        .get_or_init(|| {
            RegexBuilder::new(r"\b(search|find|look\s+up|google|duckduckgo)\b")
                .case_insensitive(true)
                .build()
                .ok()
        })
        .as_ref()
}

/// `true` if `prompt` contains a search trigger.
pub fn should_search(prompt: &str) -> bool {
    trigger_regex().is_some_and(|re| re.is_match(prompt))
}

/// Strip trigger words and collapse whitespace to form the search query.
pub fn extract_query(prompt: &str) -> String {
    let stripped = match trigger_regex() {
        Some(re) => re.replace_all(prompt, " ").into_owned(),
        None => prompt.to_string(),
    };
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Prepend up to [`CONTEXT_RESULTS`] results to `prompt`.
///
/// Returns `prompt` unchanged when `results` is empty.
pub fn with_search_context(prompt: &str, results: &[SearchResult]) -> String {
    if results.is_empty() {
        return prompt.to_string();
    }
    let context = results
        .iter()
        .take(CONTEXT_RESULTS)
        .map(|r| format!("Title: {}\nSnippet: {}", r.title, r.snippet))
        .collect::<Vec<_>>()
        .join("\n");
    format!("Search context:\n{context}\n\n{prompt}")
}
