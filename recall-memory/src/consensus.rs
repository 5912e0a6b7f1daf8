//! Consensus gate: admission control for candidate memories
//!
//! Reviewer scores in [0, 10] are averaged and compared against a
//! threshold. Reviewers are injected as [`ScoreProvider`]s; when fewer than
//! the required number of scores arrive, the pure [`HeuristicScorer`]
//! decides instead.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::node::MemoryType;
use crate::text::cached_regex;

/// Rejection reason for content scoring under the threshold
pub const BELOW_CONSENSUS_THRESHOLD: &str = "below_consensus_threshold";

/// What a reviewer is being asked to judge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScoringContext {
    /// Is this worth keeping? (importance, reusability, long-term value)
    Storage,
    /// Does this stored entry answer the query?
    Retrieval { query: String },
}

/// An external reviewer producing a score in [0, 10]
///
/// Returning `None` means the reviewer abstained or could not be reached.
#[async_trait]
pub trait ScoreProvider: Send + Sync {
    /// Provider name for logging
    fn name(&self) -> &str;

    async fn score(
        &self,
        content: &str,
        memory_type: MemoryType,
        context: &ScoringContext,
    ) -> Option<f64>;
}

/// Consensus gate tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Minimum mean score to admit a memory (default: 6.0)
    pub threshold: f64,
    /// Scores needed before the heuristic fallback is skipped
    pub min_reviewers: usize,
    /// Scores beyond this many are ignored
    pub max_reviewers: usize,
    /// Per-reviewer wait, in milliseconds
    pub reviewer_timeout_ms: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            threshold: 6.0,
            min_reviewers: 2,
            max_reviewers: 3,
            reviewer_timeout_ms: 2_000,
        }
    }
}

impl GateConfig {
    pub fn reviewer_timeout(&self) -> Duration {
        Duration::from_millis(self.reviewer_timeout_ms)
    }
}

/// Outcome of scoring one candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateDecision {
    pub accepted: bool,
    pub score: f64,
    /// True when the heuristic replaced missing reviewer scores
    pub fallback_used: bool,
    /// Reviewer scores that were available, after clamping
    pub reviewer_scores: Vec<f64>,
    pub reason: Option<String>,
}

/// Deterministic content scorer used when reviewers are unavailable
///
/// Starts from a neutral base and rewards concrete content: reasonable
/// length, numbers, technical identifiers, proper nouns and decision
/// language. Messages made only of acknowledgements score 1.0.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicScorer;

const BASE_SCORE: f64 = 3.0;
const ACKNOWLEDGEMENT_SCORE: f64 = 1.0;

static ACK_RE: OnceLock<Option<Regex>> = OnceLock::new();
static DIGIT_RE: OnceLock<Option<Regex>> = OnceLock::new();
static TECHNICAL_RE: OnceLock<Option<Regex>> = OnceLock::new();
static PROPER_NOUN_RE: OnceLock<Option<Regex>> = OnceLock::new();
static DECISION_RE: OnceLock<Option<Regex>> = OnceLock::new();

fn is_match(cell: &'static OnceLock<Option<Regex>>, pattern: &str, text: &str) -> bool {
    cached_regex(cell, pattern).is_some_and(|re| re.is_match(text))
}

impl HeuristicScorer {
    pub fn new() -> Self {
        Self
    }

    /// Score content in [0, 10]. Pure: same input, same score.
    pub fn score(&self, content: &str) -> f64 {
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return 0.0;
        }

        let ack = cached_regex(
            &ACK_RE,
            r"(?i)\b(ok(ay)?|k|thanks|thank you|thx|ty|got it|sounds good|sure|yes|yep|yeah|no|nope|great|cool|nice|done|lgtm|perfect|understood|will do|np|alright|awesome|noted|good|fine)\b",
        );
        let has_ack = ack.is_some_and(|re| re.is_match(trimmed));
        if let Some(re) = ack {
            let rest = re.replace_all(trimmed, "");
            if !rest.chars().any(char::is_alphanumeric) {
                return ACKNOWLEDGEMENT_SCORE;
            }
        }

        let words = trimmed.split_whitespace().count();
        let mut score = BASE_SCORE;
        score += match words {
            0..=3 => 0.0,
            4..=7 => 1.0,
            8..=39 => 2.0,
            _ => 1.5,
        };

        if is_match(&DIGIT_RE, r"\d", trimmed) {
            score += 1.0;
        }
        if is_match(
            &TECHNICAL_RE,
            r"[\w.-]+/[\w.-]+|\b\w+\.(rs|py|ts|tsx|js|go|java|rb|toml|json|ya?ml|md|sql|c|h|cpp|sh)\b|\b[a-z0-9]+_[a-z0-9_]+\b|\b[A-Z][a-z0-9]+[A-Z][A-Za-z0-9]*\b|::|\w\(\)",
            trimmed,
        ) {
            score += 1.5;
        }
        if is_match(
            &PROPER_NOUN_RE,
            r"\b[A-Z]{2,}\b|[a-z,;]\s+[A-Z][a-z]+",
            trimmed,
        ) {
            score += 1.0;
        }
        if is_match(
            &DECISION_RE,
            r"(?i)\b(decided|decision|because|instead|prefer|always|never|must|fix(ed)?|bug|error|requires?|deadline|remember|uses?|chose)\b",
            trimmed,
        ) {
            score += 1.0;
        }
        if has_ack && words < 6 {
            score -= 1.0;
        }

        score.clamp(0.0, 10.0)
    }
}

/// Scores, aggregates and decides
pub struct ConsensusGate {
    config: GateConfig,
    providers: RwLock<Vec<Arc<dyn ScoreProvider>>>,
    heuristic: HeuristicScorer,
}

impl ConsensusGate {
    pub fn new(config: GateConfig) -> Self {
        Self {
            config,
            providers: RwLock::new(Vec::new()),
            heuristic: HeuristicScorer::new(),
        }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Add a reviewer consulted when too few scores are supplied
    pub fn register(&self, provider: Arc<dyn ScoreProvider>) {
        tracing::info!(provider = provider.name(), "Reviewer registered");
        self.providers.write().push(provider);
    }

    pub fn provider_count(&self) -> usize {
        self.providers.read().len()
    }

    /// Drop non-finite scores, clamp to [0, 10], keep at most `max_reviewers`
    pub fn sanitize(&self, scores: &[f64]) -> Vec<f64> {
        scores
            .iter()
            .copied()
            .filter(|s| s.is_finite())
            .map(|s| s.clamp(0.0, 10.0))
            .take(self.config.max_reviewers)
            .collect()
    }

    /// Arithmetic mean, None for no scores
    pub fn aggregate(scores: &[f64]) -> Option<f64> {
        if scores.is_empty() {
            None
        } else {
            Some(scores.iter().sum::<f64>() / scores.len() as f64)
        }
    }

    /// Decide from the scores at hand, falling back to the heuristic
    pub fn evaluate(&self, content: &str, scores: &[f64]) -> GateDecision {
        let reviewer_scores = self.sanitize(scores);
        let (score, fallback_used) = match Self::aggregate(&reviewer_scores) {
            Some(mean) if reviewer_scores.len() >= self.config.min_reviewers => (mean, false),
            _ => {
                let score = self.heuristic.score(content);
                tracing::warn!(
                    reviewers = reviewer_scores.len(),
                    score,
                    fallback = true,
                    "Not enough reviewer scores, using heuristic scorer"
                );
                (score, true)
            }
        };

        let accepted = score >= self.config.threshold;
        GateDecision {
            accepted,
            score,
            fallback_used,
            reviewer_scores,
            reason: (!accepted).then(|| BELOW_CONSENSUS_THRESHOLD.to_string()),
        }
    }

    /// Supplied scores, topped up from registered reviewers when short
    ///
    /// Reviewers run concurrently. Each one gets `reviewer_timeout`; a
    /// reviewer that times out counts as unavailable.
    pub async fn collect(
        &self,
        content: &str,
        memory_type: MemoryType,
        context: &ScoringContext,
        supplied: &[f64],
    ) -> Vec<f64> {
        let mut scores = self.sanitize(supplied);
        if scores.len() >= self.config.min_reviewers {
            return scores;
        }

        let providers: Vec<Arc<dyn ScoreProvider>> = self.providers.read().clone();
        if providers.is_empty() {
            return scores;
        }

        let timeout = self.config.reviewer_timeout();
        let requests = providers.iter().map(|provider| async move {
            match tokio::time::timeout(timeout, provider.score(content, memory_type, context)).await
            {
                Ok(score) => score,
                Err(_) => {
                    tracing::warn!(provider = provider.name(), "Reviewer timed out");
                    None
                }
            }
        });
        let fetched: Vec<f64> = join_all(requests).await.into_iter().flatten().collect();
        tracing::debug!(
            supplied = scores.len(),
            fetched = fetched.len(),
            "Reviewer scores collected"
        );

        scores.extend(fetched);
        self.sanitize(&scores)
    }

    /// Full storage decision: collect, aggregate, decide
    pub async fn decide(
        &self,
        content: &str,
        memory_type: MemoryType,
        supplied: &[f64],
    ) -> GateDecision {
        let scores = self
            .collect(content, memory_type, &ScoringContext::Storage, supplied)
            .await;
        self.evaluate(content, &scores)
    }

    /// Retrieval-time relevance from reviewers, None without enough scores
    pub async fn review(&self, content: &str, memory_type: MemoryType, query: &str) -> Option<f64> {
        let context = ScoringContext::Retrieval {
            query: query.to_string(),
        };
        let scores = self.collect(content, memory_type, &context, &[]).await;
        if scores.len() < self.config.min_reviewers {
            return None;
        }
        Self::aggregate(&scores)
    }
}
