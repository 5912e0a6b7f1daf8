//! Lightweight text signals
//!
//! Keyword tokenisation, overlap similarity and token estimates. These stand
//! in for embeddings everywhere the engine needs "is this about the same
//! thing".

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

/// Words too common to carry meaning in overlap scoring
const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "from", "are", "was", "were", "has", "have",
    "had", "but", "not", "you", "your", "our", "its", "into", "onto", "than", "then", "there",
    "their", "they", "them", "will", "would", "should", "could", "about", "been", "being",
    "which", "what", "when", "where", "who", "how", "also", "can", "all", "any", "some", "such",
    "very", "just", "out", "per",
];

/// Minimum shared prefix for two distinct terms to count as related
const PARTIAL_PREFIX_MIN: usize = 4;

/// Tokenize text into lowercase terms
///
/// Splits on anything that is not alphanumeric, drops terms of two
/// characters or fewer and stopwords.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| s.chars().count() > 2)
        .filter(|s| !STOPWORDS.contains(s))
        .map(String::from)
        .collect()
}

/// Distinct terms of a text
pub fn term_set(text: &str) -> HashSet<String> {
    tokenize(text).into_iter().collect()
}

/// Jaccard overlap of two term sets, 0.0 when both are empty
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f32;
    let union = a.union(b).count() as f32;
    intersection / union
}

/// Jaccard overlap of two texts
pub fn similarity(a: &str, b: &str) -> f32 {
    jaccard(&term_set(a), &term_set(b))
}

/// Whether two distinct terms are inflections of one another
///
/// Both terms must be at least five characters and share a prefix of at
/// least four characters covering half of the shorter term
/// ("decided"/"decision", "deploy"/"deployment").
pub fn partial_match(a: &str, b: &str) -> bool {
    if a == b {
        return false;
    }
    let (len_a, len_b) = (a.chars().count(), b.chars().count());
    if len_a < 5 || len_b < 5 {
        return false;
    }
    let shared = a
        .chars()
        .zip(b.chars())
        .take_while(|(x, y)| x == y)
        .count();
    shared >= PARTIAL_PREFIX_MIN && shared * 2 >= len_a.min(len_b)
}

/// Rough token estimate: one token per four characters, rounded up
pub fn estimate_tokens(text: &str) -> usize {
    let chars = text.chars().count();
    (chars + 3) / 4
}

/// Canonical form used to detect an unchanged re-assertion
pub fn normalize_content(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches(|c: char| c == '.' || c == '!' || c == ';')
        .to_lowercase()
}

/// Naive English singular form, good enough for meta-query subjects
pub fn singularize(word: &str) -> String {
    let w = word.to_lowercase();
    if let Some(stem) = w.strip_suffix("ies") {
        if stem.len() >= 2 {
            return format!("{}y", stem);
        }
    }
    for suffix in ["sses", "shes", "ches", "xes"] {
        if w.ends_with(suffix) {
            return w[..w.len() - 2].to_string();
        }
    }
    if w.ends_with('s') && !w.ends_with("ss") && w.len() > 3 {
        return w[..w.len() - 1].to_string();
    }
    w
}

/// Compile a pattern once per call site
///
/// An invalid pattern is logged and then treated as never matching.
pub(crate) fn cached_regex(
    cell: &'static OnceLock<Option<Regex>>,
    pattern: &str,
) -> Option<&'static Regex> {
    cell.get_or_init(|| match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            tracing::warn!(pattern, error = %e, "Invalid pattern");
            None
        }
    })
    .as_ref()
}
