//! BM25 seed index over title, content and metadata

use std::collections::HashMap;

use crate::node::{MemoryEntry, MemoryId};
use crate::text;

/// Weight of a prefix-related term relative to an exact term
const PARTIAL_WEIGHT: f32 = 0.5;

/// BM25 index for text search
pub struct Bm25Index {
    /// Inverted index: term -> [(memory_id, term frequency)]
    inverted: HashMap<String, Vec<(MemoryId, f32)>>,
    /// Document lengths
    doc_lengths: HashMap<MemoryId, f32>,
    /// Average document length
    avg_doc_length: f32,
    /// Number of documents
    num_docs: usize,
    /// BM25 k1 parameter
    k1: f32,
    /// BM25 b parameter
    b: f32,
}

impl Bm25Index {
    /// Build BM25 index from memories
    pub fn build<'a>(memories: impl IntoIterator<Item = &'a MemoryEntry>) -> Self {
        let mut inverted: HashMap<String, Vec<(MemoryId, f32)>> = HashMap::new();
        let mut doc_lengths: HashMap<MemoryId, f32> = HashMap::new();
        let mut total_length = 0.0;

        for memory in memories {
            let tokens = text::tokenize(&memory.searchable_text());
            let doc_length = tokens.len() as f32;
            doc_lengths.insert(memory.id, doc_length);
            total_length += doc_length;

            let mut term_freqs: HashMap<String, usize> = HashMap::new();
            for token in tokens {
                *term_freqs.entry(token).or_insert(0) += 1;
            }
            for (term, freq) in term_freqs {
                inverted.entry(term).or_default().push((memory.id, freq as f32));
            }
        }

        let num_docs = doc_lengths.len();
        let avg_doc_length = if num_docs > 0 && total_length > 0.0 {
            total_length / num_docs as f32
        } else {
            1.0
        };

        Self {
            inverted,
            doc_lengths,
            avg_doc_length,
            num_docs,
            k1: 1.2,
            b: 0.75,
        }
    }

    pub fn len(&self) -> usize {
        self.num_docs
    }

    pub fn is_empty(&self) -> bool {
        self.num_docs == 0
    }

    /// Score every document matching at least one query term
    ///
    /// Each query term contributes its exact posting or, failing that, the
    /// best prefix-related term at half weight. Results are sorted by score,
    /// ties broken by id.
    pub fn search(&self, query: &str) -> Vec<(MemoryId, f32)> {
        let mut scores: HashMap<MemoryId, f32> = HashMap::new();

        for token in text::term_set(query) {
            let mut per_doc: HashMap<MemoryId, f32> = HashMap::new();
            for (term, postings) in &self.inverted {
                let weight = if *term == token {
                    1.0
                } else if text::partial_match(term, &token) {
                    PARTIAL_WEIGHT
                } else {
                    continue;
                };
                let idf = self.idf(postings.len());
                for (doc_id, tf) in postings {
                    let doc_length = self.doc_lengths.get(doc_id).copied().unwrap_or(1.0);
                    let score = weight * self.bm25_score(*tf, doc_length, idf);
                    let best = per_doc.entry(*doc_id).or_insert(0.0);
                    if score > *best {
                        *best = score;
                    }
                }
            }
            for (doc_id, score) in per_doc {
                *scores.entry(doc_id).or_insert(0.0) += score;
            }
        }

        let mut results: Vec<_> = scores.into_iter().collect();
        results.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        results
    }

    /// Calculate IDF
    fn idf(&self, doc_freq: usize) -> f32 {
        let n = self.num_docs as f32;
        let df = doc_freq as f32;
        ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
    }

    /// Calculate BM25 score for a term
    fn bm25_score(&self, tf: f32, doc_length: f32, idf: f32) -> f32 {
        let numerator = tf * (self.k1 + 1.0);
        let denominator = tf + self.k1 * (1.0 - self.b + self.b * doc_length / self.avg_doc_length);
        idf * numerator / denominator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::MemoryType;

    fn entry(content: &str) -> MemoryEntry {
        MemoryEntry::builder()
            .memory_type(MemoryType::Semantic)
            .content(content)
            .build()
            .unwrap()
    }

    #[test]
    fn test_exact_terms_rank_first() {
        let docs = [
            entry("Rust ownership rules prevent data races"),
            entry("Python uses reference counting"),
            entry("Ownership of the billing service moved to team B"),
        ];
        let index = Bm25Index::build(&docs);
        let results = index.search("rust ownership");
        assert_eq!(results[0].0, docs[0].id);
        assert_eq!(results.len(), 2);
        assert!(index.search("javascript").is_empty());
    }

    #[test]
    fn test_partial_terms_match_at_lower_weight() {
        let docs = [
            entry("Decided to use PostgreSQL over MongoDB for ACID guarantees"),
            entry("The decision log lives in the wiki"),
        ];
        let index = Bm25Index::build(&docs);
        let results = index.search("decision");
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, docs[1].id);
    }

    #[test]
    fn test_metadata_is_searchable() {
        let tagged = MemoryEntry::builder()
            .memory_type(MemoryType::Semantic)
            .content("Quarterly numbers look fine")
            .meta("project", "atlas")
            .build()
            .unwrap();
        let index = Bm25Index::build([&tagged]);
        assert_eq!(index.search("atlas")[0].0, tagged.id);
        assert_eq!(index.len(), 1);
    }
}
