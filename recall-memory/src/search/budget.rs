//! Final shaping of ranked results: ordering, near-duplicate collapse and
//! whole-entry token budgeting

use std::cmp::Ordering;
use std::collections::HashSet;

use super::SearchResult;
use crate::node::MemoryEntry;
use crate::text;

/// Highest score first, ties broken by id so the order never depends on
/// insertion order
pub fn sort_ranked(results: &mut [SearchResult]) {
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then(a.memory.id.cmp(&b.memory.id))
    });
}

/// Keep the first of every group of near-duplicates
///
/// Expects ranked input. Two entries are near-duplicates when the keyword
/// overlap of their title and content reaches `threshold`.
pub fn deduplicate(results: Vec<SearchResult>, threshold: f32) -> Vec<SearchResult> {
    let mut kept: Vec<(SearchResult, HashSet<String>)> = Vec::with_capacity(results.len());
    for result in results {
        let terms = text::term_set(&format!("{} {}", result.memory.title, result.memory.content));
        let duplicate = kept
            .iter()
            .any(|(_, other)| text::jaccard(&terms, other) >= threshold);
        if duplicate {
            tracing::debug!(memory_id = %result.memory.id, "Dropping near-duplicate");
        } else {
            kept.push((result, terms));
        }
    }
    kept.into_iter().map(|(result, _)| result).collect()
}

/// Take entries in order while they fit
///
/// Stops at the first entry that would exceed the budget. Entries are
/// never truncated.
pub fn trim_to_budget(
    results: Vec<SearchResult>,
    max_tokens: usize,
    mut cost_of: impl FnMut(&MemoryEntry) -> usize,
) -> Vec<SearchResult> {
    let mut used = 0;
    let mut out = Vec::new();
    for result in results {
        let cost = cost_of(&result.memory);
        if used + cost > max_tokens {
            break;
        }
        used += cost;
        out.push(result);
    }
    out
}

/// Total estimated tokens of a result list
pub fn total_tokens(results: &[SearchResult]) -> usize {
    results.iter().map(|r| r.memory.token_count()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::MemoryType;
    use crate::search::MatchReason;

    fn result(content: &str, score: f32) -> SearchResult {
        SearchResult {
            memory: MemoryEntry::builder()
                .memory_type(MemoryType::Semantic)
                .content(content)
                .build()
                .unwrap(),
            score,
            match_reasons: vec![MatchReason::Keyword { strength: score }],
        }
    }

    #[test]
    fn test_budget_stops_at_first_misfit() {
        // title and content are both the 8-char content: 2 + 2 tokens each
        let results = vec![result("aaaaaaaa", 3.0), result("bbbbbbbb", 2.0), result("c", 1.0)];
        let trimmed = trim_to_budget(results, 9, MemoryEntry::token_count);
        assert_eq!(trimmed.len(), 2);
        assert_eq!(total_tokens(&trimmed), 8);

        let results = vec![result(&"x".repeat(400), 3.0), result("small", 2.0)];
        assert!(trim_to_budget(results, 50, MemoryEntry::token_count).is_empty());
    }

    #[test]
    fn test_dedup_keeps_higher_ranked() {
        let mut results = vec![
            result("Deploys run every Friday afternoon", 0.4),
            result("Deploys run every Friday afternoon!", 0.9),
            result("Backups are encrypted at rest", 0.5),
        ];
        sort_ranked(&mut results);
        let kept = deduplicate(results, 0.85);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].score, 0.9);
        assert_eq!(kept[1].memory.content, "Backups are encrypted at rest");
    }

    #[test]
    fn test_sort_breaks_ties_by_id() {
        let mut a = vec![result("one", 1.0), result("two", 1.0)];
        let mut b = vec![a[1].clone(), a[0].clone()];
        sort_ranked(&mut a);
        sort_ranked(&mut b);
        assert_eq!(a[0].memory.id, b[0].memory.id);
    }
}
