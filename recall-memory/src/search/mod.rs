//! Retrieval engine
//!
//! Seeded keyword search, graph neighbourhood expansion, ranking,
//! deduplication and token budgeting. Meta-queries ("how many X") are routed
//! to corpus-wide aggregates instead.
//!
//! The keyword seed always runs over everything in scope. Expansion only
//! adds candidates; its window grows with the corpus.

pub mod budget;
pub mod keyword;
pub mod meta;

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, Result};
use crate::graph::{Direction, EdgeProps, GraphRead, GraphTxn, NodeTable, Pattern, RelKind, RelType};
use crate::node::{MemoryEntry, MemoryId, MemoryType};
use crate::storage::MemoryRead;
use crate::text;

pub use keyword::Bm25Index;
pub use meta::{Aggregate, AggregateSource, MetaKind, MetaQuery};

/// A superseded entry scores at most this fraction of its superseder
const SUPERSEDED_CAP: f32 = 0.99;

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Retrieval tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Results returned when a request does not say
    pub default_limit: usize,
    /// Dedup threshold when a request does not say
    pub similarity_threshold: f32,
    /// Fraction of the corpus used as expansion roots
    pub window_ratio: f64,
    pub window_min: usize,
    pub window_max: usize,
    /// Maximum traversal depth from a root
    pub expansion_depth: usize,
    /// Strength multiplier for expanded candidates
    pub expansion_discount: f32,
    /// Age at which the recency bonus halves
    pub recency_half_life_days: f64,
    /// SIMILARITY edges created per stored entry
    pub similarity_links: usize,
    /// Minimum overlap for a SIMILARITY edge
    pub similarity_link_floor: f32,
    /// Cached token estimates
    pub token_cache_size: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_limit: 10,
            similarity_threshold: 0.85,
            window_ratio: 0.05,
            window_min: 5,
            window_max: 50,
            expansion_depth: 2,
            expansion_discount: 0.5,
            recency_half_life_days: 30.0,
            similarity_links: 3,
            similarity_link_floor: 0.3,
            token_cache_size: 4096,
        }
    }
}

/// A retrieval call
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalRequest {
    pub query: String,
    /// Empty for every type
    pub memory_types: Vec<MemoryType>,
    pub limit: usize,
    pub max_tokens: Option<usize>,
    /// Only entries created at or after this time
    pub since: Option<DateTime<Utc>>,
    pub deduplicate: bool,
    pub similarity_threshold: f32,
    /// Best-effort time budget
    pub timeout: Option<Duration>,
    /// Ask registered reviewers to re-score candidates
    pub rerank: bool,
}

impl Default for RetrievalRequest {
    fn default() -> Self {
        Self {
            query: String::new(),
            memory_types: Vec::new(),
            limit: 10,
            max_tokens: None,
            since: None,
            deduplicate: false,
            similarity_threshold: 0.85,
            timeout: None,
            rerank: false,
        }
    }
}

impl RetrievalRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn memory_types(mut self, types: impl IntoIterator<Item = MemoryType>) -> Self {
        self.memory_types = types.into_iter().collect();
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn deduplicate(mut self, deduplicate: bool) -> Self {
        self.deduplicate = deduplicate;
        self
    }

    pub fn similarity_threshold(mut self, threshold: f32) -> Self {
        self.similarity_threshold = threshold;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn rerank(mut self, rerank: bool) -> Self {
        self.rerank = rerank;
        self
    }

    /// Reject requests that cannot produce a meaningful result
    pub fn validate(&self) -> Result<()> {
        if self.query.trim().is_empty() {
            return Err(MemoryError::malformed("empty query"));
        }
        if self.limit == 0 {
            return Err(MemoryError::malformed("limit must be positive"));
        }
        if !(self.similarity_threshold > 0.0 && self.similarity_threshold <= 1.0) {
            return Err(MemoryError::malformed(format!(
                "similarity_threshold {} outside (0, 1]",
                self.similarity_threshold
            )));
        }
        Ok(())
    }
}

/// Why a memory matched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchReason {
    /// Seed keyword hit, strength relative to the best seed
    Keyword { strength: f32 },
    /// Reached from a seed over graph edges
    Expansion { depth: usize },
    /// Re-scored by reviewers
    Reviewer { score: f64 },
    /// Part of a meta-query listing
    Aggregate,
}

/// One ranked memory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub memory: MemoryEntry,
    pub score: f32,
    pub match_reasons: Vec<MatchReason>,
}

/// Output of a retrieval
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Retrieval {
    pub results: Vec<SearchResult>,
    /// Set for meta-queries
    pub aggregate: Option<Aggregate>,
    /// The time budget ran out before every phase completed
    pub timed_out: bool,
}

impl Retrieval {
    pub fn entries(&self) -> impl Iterator<Item = &MemoryEntry> {
        self.results.iter().map(|r| &r.memory)
    }

    pub fn ids(&self) -> Vec<MemoryId> {
        self.entries().map(|e| e.id).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty() && self.aggregate.is_none()
    }
}

/// Candidates after ranking, before dedup and budget
#[derive(Debug, Clone, Default)]
pub struct Ranked {
    pub results: Vec<SearchResult>,
    pub aggregate: Option<Aggregate>,
    pub timed_out: bool,
    /// Meta-query listing: every entry counts, the limit does not apply
    pub exhaustive: bool,
}

/// Per-candidate state while searching
struct Candidate {
    strength: f32,
    reasons: Vec<MatchReason>,
}

fn expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

pub struct RetrievalEngine {
    config: RetrievalConfig,
    token_cache: Mutex<LruCache<MemoryId, usize>>,
}

impl RetrievalEngine {
    pub fn new(config: RetrievalConfig) -> Self {
        let capacity = NonZeroUsize::new(config.token_cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            config,
            token_cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Number of seeds used as expansion roots for a corpus of `total`
    pub fn expansion_window(&self, total: usize) -> usize {
        let scaled = (total as f64 * self.config.window_ratio).ceil() as usize;
        scaled.clamp(self.config.window_min, self.config.window_max.max(self.config.window_min))
    }

    /// Recency weight in (0.5, 1]
    pub fn recency(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> f32 {
        let age_days = ((now - created_at).num_seconds().max(0) as f64) / SECONDS_PER_DAY;
        let half_life = self.config.recency_half_life_days.max(f64::EPSILON);
        (0.5 + 0.5 * 2f64.powf(-age_days / half_life)) as f32
    }

    /// Estimated tokens, cached per entry
    pub fn tokens(&self, entry: &MemoryEntry) -> usize {
        let mut cache = self.token_cache.lock();
        if let Some(tokens) = cache.get(&entry.id) {
            return *tokens;
        }
        let tokens = entry.token_count();
        cache.put(entry.id, tokens);
        tokens
    }

    /// Forget a purged entry
    pub fn evict(&self, id: &MemoryId) {
        self.token_cache.lock().pop(id);
    }

    /// Seed, expand and rank
    ///
    /// The deadline is checked between phases. When it passes, the phases
    /// left are skipped and whatever candidates exist are ranked and
    /// returned with `timed_out` set.
    pub fn search<R: GraphRead + ?Sized>(
        &self,
        reader: &R,
        request: &RetrievalRequest,
        deadline: Option<Instant>,
    ) -> Result<Ranked> {
        request.validate()?;

        if let Some(meta) = meta::detect(&request.query) {
            if let Some((aggregate, listed)) =
                meta::resolve(reader, &meta, &request.memory_types)?
            {
                tracing::debug!(
                    subject = %aggregate.subject,
                    count = aggregate.count,
                    "Meta-query answered from aggregate"
                );
                let results = listed
                    .into_iter()
                    .map(|memory| SearchResult {
                        memory,
                        score: 1.0,
                        match_reasons: vec![MatchReason::Aggregate],
                    })
                    .collect();
                return Ok(Ranked {
                    results,
                    aggregate: Some(aggregate),
                    timed_out: false,
                    exhaustive: meta.kind == MetaKind::List,
                });
            }
        }

        let mut ranked = Ranked::default();
        if expired(deadline) {
            ranked.timed_out = true;
            return Ok(ranked);
        }

        let scope: HashMap<MemoryId, MemoryEntry> = reader
            .memories(&request.memory_types)?
            .into_iter()
            .filter(|e| request.since.map_or(true, |since| e.created_at >= since))
            .map(|e| (e.id, e))
            .collect();
        let total = reader.memory_count(&[])?;

        // Seed
        let index = Bm25Index::build(scope.values());
        let seeds = index.search(&request.query);
        let best = seeds.first().map(|(_, s)| *s).unwrap_or(0.0);
        let mut candidates: HashMap<MemoryId, Candidate> = HashMap::new();
        if best > 0.0 {
            for (id, score) in &seeds {
                let strength = score / best;
                candidates.insert(
                    *id,
                    Candidate {
                        strength,
                        reasons: vec![MatchReason::Keyword { strength }],
                    },
                );
            }
        }
        tracing::debug!(seeds = seeds.len(), scope = scope.len(), "Seed search done");

        // Expand
        if expired(deadline) {
            ranked.timed_out = true;
        } else {
            let window = self.expansion_window(total);
            for (root, _) in seeds.iter().take(window) {
                let root_strength = candidates.get(root).map_or(0.0, |c| c.strength);
                self.expand(reader, root, root_strength, &scope, &mut candidates)?;
                if expired(deadline) {
                    ranked.timed_out = true;
                    break;
                }
            }
            tracing::debug!(window, candidates = candidates.len(), "Expansion done");
        }

        // Rank
        let now = Utc::now();
        let mut results: Vec<SearchResult> = candidates
            .into_iter()
            .filter_map(|(id, candidate)| {
                let memory = scope.get(&id)?.clone();
                let score =
                    candidate.strength * memory.confidence * self.recency(memory.created_at, now);
                Some(SearchResult {
                    memory,
                    score,
                    match_reasons: candidate.reasons,
                })
            })
            .collect();
        cap_superseded(&mut results);
        budget::sort_ranked(&mut results);

        ranked.results = results;
        Ok(ranked)
    }

    fn expand<R: GraphRead + ?Sized>(
        &self,
        reader: &R,
        root: &MemoryId,
        root_strength: f32,
        scope: &HashMap<MemoryId, MemoryEntry>,
        candidates: &mut HashMap<MemoryId, Candidate>,
    ) -> Result<()> {
        let rows = reader.query(&Pattern::Traverse {
            start: root.to_string(),
            kinds: vec![RelKind::Similarity, RelKind::FileLink, RelKind::FunctionLink],
            direction: Direction::Both,
            max_depth: self.config.expansion_depth,
        })?;

        for row in rows {
            let is_memory = row
                .get("table")
                .and_then(|t| t.as_str())
                .and_then(NodeTable::parse)
                .is_some_and(|t| t.is_memory());
            if !is_memory {
                continue;
            }
            let Some(id) = row
                .get("id")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse::<MemoryId>().ok())
            else {
                continue;
            };
            if !scope.contains_key(&id) {
                continue;
            }
            let depth = row.get("depth").and_then(|v| v.as_u64()).unwrap_or(1) as usize;
            let weight = row.get("weight").and_then(|v| v.as_f64()).unwrap_or(1.0) as f32;
            let strength = root_strength * weight * self.config.expansion_discount;

            let candidate = candidates.entry(id).or_insert_with(|| Candidate {
                strength: 0.0,
                reasons: Vec::new(),
            });
            if strength > candidate.strength {
                candidate.strength = strength;
            }
            let reason = MatchReason::Expansion { depth };
            if !candidate.reasons.contains(&reason) {
                candidate.reasons.push(reason);
            }
        }
        Ok(())
    }

    /// Dedup, limit and budget a ranked list
    pub fn finish(&self, ranked: Ranked, request: &RetrievalRequest) -> Retrieval {
        let mut results = ranked.results;
        cap_superseded(&mut results);
        budget::sort_ranked(&mut results);

        if ranked.exhaustive {
            results.sort_by(|a, b| {
                a.memory
                    .created_at
                    .cmp(&b.memory.created_at)
                    .then(a.memory.id.cmp(&b.memory.id))
            });
        } else {
            if request.deduplicate {
                results = budget::deduplicate(results, request.similarity_threshold);
            }
            results.truncate(request.limit);
        }

        if let Some(max_tokens) = request.max_tokens {
            results = budget::trim_to_budget(results, max_tokens, |e| self.tokens(e));
        }

        Retrieval {
            results,
            aggregate: ranked.aggregate,
            timed_out: ranked.timed_out,
        }
    }

    /// Entries most similar to `entry`, best first
    ///
    /// Compares against every stored memory, O(n) per call and run once per
    /// admitted entry under the writer lock.
    pub fn similar_entries<R: GraphRead + ?Sized>(
        &self,
        reader: &R,
        entry: &MemoryEntry,
    ) -> Result<Vec<(MemoryId, f32)>> {
        let terms = text::term_set(&format!("{} {}", entry.title, entry.content));
        let mut similar: Vec<(MemoryId, f32)> = reader
            .memories(&[])?
            .into_iter()
            .filter(|other| other.id != entry.id)
            .filter_map(|other| {
                let other_terms = text::term_set(&format!("{} {}", other.title, other.content));
                let overlap = text::jaccard(&terms, &other_terms);
                (overlap >= self.config.similarity_link_floor).then_some((other.id, overlap))
            })
            .collect();
        similar.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        similar.truncate(self.config.similarity_links);
        Ok(similar)
    }

    /// Create SIMILARITY edges from a new entry to its nearest neighbours
    pub fn link_similar(&self, txn: &mut GraphTxn<'_>, entry: &MemoryEntry) -> Result<usize> {
        let from = entry.id.to_string();
        let mut created = 0;
        for (id, overlap) in self.similar_entries(&*txn, entry)? {
            let to = id.to_string();
            if txn.edge_exists(&from, &RelType::Similarity, &to)?
                || txn.edge_exists(&to, &RelType::Similarity, &from)?
            {
                continue;
            }
            txn.create_edge(RelType::Similarity, &from, &to, EdgeProps::weighted(overlap))?;
            created += 1;
        }
        Ok(created)
    }
}

/// Keep every superseded entry strictly below its superseder
///
/// Newest first, so a whole chain cascades downward.
fn cap_superseded(results: &mut [SearchResult]) {
    let mut order: Vec<usize> = (0..results.len()).collect();
    order.sort_by(|&a, &b| {
        results[b]
            .memory
            .created_at
            .cmp(&results[a].memory.created_at)
    });

    let mut scores: HashMap<MemoryId, f32> = HashMap::new();
    for i in order {
        let result = &mut results[i];
        let cap = result
            .memory
            .superseded_by
            .and_then(|s| scores.get(&s).copied());
        if let Some(cap) = cap {
            if result.score >= cap {
                result.score = cap * SUPERSEDED_CAP;
            }
        }
        scores.insert(result.memory.id, result.score);
    }
}
