//! Memory coordinator: the public facade
//!
//! Owns the store connection and every component built on it. Components
//! are created by [`MemoryCoordinator::initialize`] and released by
//! [`MemoryCoordinator::shutdown`]; in between, the coordinator serves
//! store and retrieve calls from any number of sessions. Writes serialise
//! on the graph store's single writer, reads use committed snapshots.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::audit::{AuditLog, AuditRecord, Decision};
use crate::config::MemoryConfig;
use crate::consensus::{ConsensusGate, GateDecision, ScoreProvider};
use crate::error::{MemoryError, Result};
use crate::graph::schema;
use crate::graph::{GraphRead, GraphStore, NodeTable, RelKind};
use crate::linker::CodeLinker;
use crate::node::{CodeFile, Function, MemoryEntry, MemoryId, MemoryType, Metadata};
use crate::search::{budget, MatchReason, Ranked, Retrieval, RetrievalEngine, RetrievalRequest};
use crate::storage::{MemoryRead, MemoryWrite, UpsertOutcome};
use crate::temporal::{SupersessionManager, TimelineEntry, REASSERTED_UNCHANGED};

/// Rejection reason for blank content
pub const EMPTY_CONTENT: &str = "empty_content";

/// Provenance and reviewer input for one store call
#[derive(Debug, Clone, PartialEq)]
pub struct StoreContext {
    pub session_id: String,
    pub agent_id: String,
    /// Zero to three scores in [0, 10]
    pub reviewer_scores: Vec<f64>,
}

impl Default for StoreContext {
    fn default() -> Self {
        Self {
            session_id: "default".to_string(),
            agent_id: "agent".to_string(),
            reviewer_scores: Vec::new(),
        }
    }
}

impl StoreContext {
    pub fn session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Self::default()
        }
    }

    pub fn agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = agent_id.into();
        self
    }

    pub fn scores(mut self, scores: impl Into<Vec<f64>>) -> Self {
        self.reviewer_scores = scores.into();
        self
    }
}

/// Outcome of a store call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreResult {
    pub stored: bool,
    /// The new entry, or the existing one for a re-assertion
    pub memory_id: Option<MemoryId>,
    pub score: f64,
    pub reason: Option<String>,
    pub fallback_used: bool,
    /// Entries this one superseded
    pub superseded: Vec<MemoryId>,
    /// Code links created
    pub code_links: usize,
}

impl StoreResult {
    fn rejected(decision: &GateDecision) -> Self {
        Self {
            stored: false,
            memory_id: None,
            score: decision.score,
            reason: decision.reason.clone(),
            fallback_used: decision.fallback_used,
            superseded: Vec::new(),
            code_links: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub total_memories: usize,
    pub by_type: BTreeMap<MemoryType, usize>,
    pub superseded: usize,
    pub code_files: usize,
    pub functions: usize,
    pub database_size_bytes: u64,
}

/// Result of upserting parser output
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertSummary {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
}

impl UpsertSummary {
    fn count(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Created => self.created += 1,
            UpsertOutcome::Updated => self.updated += 1,
            UpsertOutcome::Unchanged => self.unchanged += 1,
        }
    }
}

/// A session seen by the coordinator
#[derive(Debug, Clone)]
pub(crate) struct SessionState {
    pub(crate) started_at: DateTime<Utc>,
}

/// Everything that lives as long as the store connection
pub(crate) struct Engine {
    pub(crate) store: Arc<GraphStore>,
    pub(crate) supersession: SupersessionManager,
    pub(crate) retrieval: RetrievalEngine,
    pub(crate) linker: CodeLinker,
    pub(crate) audit: AuditLog,
}

impl Engine {
    fn open(config: &MemoryConfig) -> Result<Self> {
        let path = config.database_path()?;
        let store = Arc::new(GraphStore::open(&path)?);
        Ok(Self {
            audit: AuditLog::new(store.clone()),
            store,
            supersession: SupersessionManager::new(config.supersession.clone()),
            retrieval: RetrievalEngine::new(config.retrieval.clone()),
            linker: CodeLinker::new(config.linker.clone()),
        })
    }

    /// Persist an accepted entry with its supersessions and links
    ///
    /// One transaction. Similarity and code links run after savepoints and
    /// are rolled back alone if they fail.
    fn admit(&self, entry: MemoryEntry, record: AuditRecord) -> Result<StoreResult> {
        let score = record.score;
        let fallback_used = record.fallback_used;
        let mut txn = self.store.begin();

        if let Some(existing) = self.supersession.find_reassertion(&txn, &entry)? {
            txn.touch_memory(&existing.id, Utc::now())?;
            let record = record
                .with_memory(existing.id)
                .with_decision(Decision::Reasserted, Some(REASSERTED_UNCHANGED));
            AuditLog::record_in(&mut txn, &record)?;
            txn.commit()?;
            tracing::info!(memory_id = %existing.id, "Unchanged fact re-asserted");
            return Ok(StoreResult {
                stored: false,
                memory_id: Some(existing.id),
                score,
                reason: Some(REASSERTED_UNCHANGED.to_string()),
                fallback_used,
                superseded: Vec::new(),
                code_links: 0,
            });
        }

        let old = self.supersession.find_superseded(&txn, &entry)?;
        txn.insert_memory(&entry)?;
        let superseded = self.supersession.apply(&mut txn, &entry, &old)?;

        let savepoint = txn.savepoint();
        if let Err(e) = self.retrieval.link_similar(&mut txn, &entry) {
            tracing::warn!(memory_id = %entry.id, error = %e, "Similarity linking failed");
            txn.rollback_to(savepoint);
        }

        let savepoint = txn.savepoint();
        let code_links = match self.linker.link(&mut txn, &entry) {
            Ok(report) => report.total(),
            Err(e) => {
                tracing::warn!(memory_id = %entry.id, error = %e, "Code linking failed, memory kept");
                txn.rollback_to(savepoint);
                0
            }
        };

        AuditLog::record_in(&mut txn, &record.with_memory(entry.id))?;
        txn.commit()?;

        tracing::info!(
            memory_id = %entry.id,
            memory_type = %entry.memory_type,
            session_id = %entry.session_id,
            score,
            superseded = superseded.len(),
            code_links,
            "Memory stored"
        );

        Ok(StoreResult {
            stored: true,
            memory_id: Some(entry.id),
            score,
            reason: None,
            fallback_used,
            superseded,
            code_links,
        })
    }

    fn rank(&self, request: &RetrievalRequest, deadline: Option<Instant>) -> Result<Ranked> {
        let snapshot = self.store.snapshot();
        self.retrieval.search(&snapshot, request, deadline)
    }

    /// Refresh access times of returned entries
    fn touch(&self, ids: &[MemoryId], at: DateTime<Utc>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut txn = self.store.begin();
        for id in ids {
            match txn.touch_memory(id, at) {
                Ok(()) | Err(MemoryError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        txn.commit()
    }
}

/// Public entry point to the memory engine
pub struct MemoryCoordinator {
    config: MemoryConfig,
    engine: RwLock<Option<Arc<Engine>>>,
    gate: ConsensusGate,
    pub(crate) sessions: DashMap<String, SessionState>,
}

impl MemoryCoordinator {
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            gate: ConsensusGate::new(config.gate.clone()),
            config,
            engine: RwLock::new(None),
            sessions: DashMap::new(),
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Open the store and build every component
    pub async fn initialize(&self) -> Result<()> {
        let mut slot = self.engine.write().await;
        if slot.is_some() {
            tracing::debug!("Memory engine already initialized");
            return Ok(());
        }
        self.config.validate()?;
        let engine = Engine::open(&self.config).map_err(|e| {
            tracing::error!(error = %e, "Memory engine initialization failed");
            e
        })?;
        tracing::info!(path = %engine.store.path().display(), "Memory engine initialized");
        *slot = Some(Arc::new(engine));
        Ok(())
    }

    pub async fn is_initialized(&self) -> bool {
        self.engine.read().await.is_some()
    }

    /// Flush and release the store. Safe to call more than once.
    pub async fn shutdown(&self) -> Result<()> {
        let Some(engine) = self.engine.write().await.take() else {
            return Ok(());
        };
        engine.store.flush()?;
        self.sessions.clear();
        tracing::info!(path = %engine.store.path().display(), "Memory engine shut down");
        Ok(())
    }

    /// Add a reviewer consulted when a store call brings too few scores
    pub fn register_reviewer(&self, provider: Arc<dyn ScoreProvider>) {
        self.gate.register(provider);
    }

    pub(crate) async fn engine(&self) -> Result<Arc<Engine>> {
        self.engine
            .read()
            .await
            .clone()
            .ok_or(MemoryError::NotInitialized)
    }

    /// Score content and, if accepted, persist it
    ///
    /// Returns `stored = false` with a reason for rejected content and for
    /// an unchanged re-assertion of a current fact. Errors mean nothing was
    /// written.
    pub async fn store(
        &self,
        content: &str,
        memory_type: MemoryType,
        metadata: Option<Metadata>,
        context: StoreContext,
    ) -> Result<StoreResult> {
        let engine = self.engine().await?;
        schema::validate_key_part(&context.session_id)?;

        let decision = if content.trim().is_empty() {
            GateDecision {
                accepted: false,
                score: 0.0,
                fallback_used: false,
                reviewer_scores: self.gate.sanitize(&context.reviewer_scores),
                reason: Some(EMPTY_CONTENT.to_string()),
            }
        } else {
            self.gate
                .decide(content, memory_type, &context.reviewer_scores)
                .await
        };
        let record = AuditRecord::new(&context.session_id, memory_type, &decision, content);

        if !decision.accepted {
            engine.audit.append(&record)?;
            tracing::info!(
                session_id = %context.session_id,
                memory_type = %memory_type,
                score = decision.score,
                fallback = decision.fallback_used,
                "Memory rejected"
            );
            return Ok(StoreResult::rejected(&decision));
        }

        let entry = MemoryEntry::builder()
            .memory_type(memory_type)
            .session(&context.session_id)
            .agent(&context.agent_id)
            .content(content)
            .metadata(metadata.unwrap_or_default())
            .confidence((decision.score / 10.0) as f32)
            .build()?;

        engine.admit(entry, record)
    }

    /// Ranked, deduplicated, budgeted retrieval
    ///
    /// An empty or malformed request yields an empty result. Backend
    /// failures, an uninitialised engine and a timeout with nothing ranked
    /// surface as `RetrievalUnavailable`.
    pub async fn retrieve(&self, request: RetrievalRequest) -> Result<Retrieval> {
        let engine = self
            .engine()
            .await
            .map_err(|_| MemoryError::unavailable("memory engine not initialized"))?;
        let deadline = request.timeout.map(|t| Instant::now() + t);

        let ranked = match engine.rank(&request, deadline) {
            Ok(ranked) => ranked,
            Err(MemoryError::MalformedQuery(reason)) => {
                tracing::debug!(reason = %reason, "Malformed query, returning empty result");
                return Ok(Retrieval::default());
            }
            Err(e) if e.is_backend() => {
                tracing::error!(error = %e, "Retrieval failed");
                return Err(MemoryError::unavailable(e.to_string()));
            }
            Err(e) => return Err(e),
        };

        let ranked = self.rerank(ranked, &request, deadline).await;
        let mut retrieval = engine.retrieval.finish(ranked, &request);

        if retrieval.timed_out && retrieval.is_empty() {
            return Err(MemoryError::unavailable(
                "retrieval timed out before any result was ranked",
            ));
        }

        let now = Utc::now();
        match engine.touch(&retrieval.ids(), now) {
            Ok(()) => {
                for result in &mut retrieval.results {
                    result.memory.accessed_at = now;
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to refresh access times"),
        }

        Ok(retrieval)
    }

    /// Multiply candidate scores by reviewer relevance
    async fn rerank(
        &self,
        mut ranked: Ranked,
        request: &RetrievalRequest,
        deadline: Option<Instant>,
    ) -> Ranked {
        if !request.rerank || ranked.exhaustive || ranked.timed_out || self.gate.provider_count() == 0 {
            return ranked;
        }

        let reviewed = ranked.results.len().min(request.limit.saturating_mul(2));
        let reviews = join_all(ranked.results[..reviewed].iter().map(|r| {
            self.gate
                .review(&r.memory.content, r.memory.memory_type, &request.query)
        }));
        let scores = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match tokio::time::timeout(remaining, reviews).await {
                    Ok(scores) => scores,
                    Err(_) => {
                        tracing::warn!("Reviewer re-ranking ran out of time");
                        ranked.timed_out = true;
                        return ranked;
                    }
                }
            }
            None => reviews.await,
        };

        for (result, score) in ranked.results.iter_mut().zip(scores) {
            if let Some(score) = score {
                result.score *= (score / 10.0) as f32;
                result.match_reasons.push(MatchReason::Reviewer { score });
            }
        }
        budget::sort_ranked(&mut ranked.results);
        ranked
    }

    pub async fn stats(&self) -> Result<MemoryStats> {
        let engine = self.engine().await?;
        let snapshot = engine.store.snapshot();

        let mut by_type = BTreeMap::new();
        let mut total_memories = 0;
        for memory_type in MemoryType::ALL {
            let count = snapshot.count_table(memory_type.table())?;
            by_type.insert(memory_type, count);
            total_memories += count;
        }
        let superseded = snapshot
            .memories(&[])?
            .iter()
            .filter(|e| e.is_superseded())
            .count();

        Ok(MemoryStats {
            total_memories,
            by_type,
            superseded,
            code_files: snapshot.count_table(NodeTable::CodeFile)?,
            functions: snapshot.count_table(NodeTable::Function)?,
            database_size_bytes: engine.store.disk_usage()?,
        })
    }

    pub async fn get(&self, id: &MemoryId) -> Result<Option<MemoryEntry>> {
        let engine = self.engine().await?;
        let snapshot = engine.store.snapshot();
        snapshot.memory(id)
    }

    /// Hard delete for explicit purges
    ///
    /// Removes the entry and every edge touching it. Entries it had
    /// superseded become current again.
    pub async fn delete_memory(&self, id: &MemoryId) -> Result<bool> {
        let engine = self.engine().await?;
        let mut txn = engine.store.begin();
        let key = id.to_string();
        if txn.memory(id)?.is_none() {
            return Ok(false);
        }

        for edge in txn.out_edges(&key, Some(RelKind::Supersedes))? {
            let Ok(older) = edge.to.parse::<MemoryId>() else {
                continue;
            };
            if txn.memory(&older)?.is_some_and(|e| e.superseded_by == Some(*id)) {
                txn.clear_superseded(&older)?;
            }
        }
        txn.delete_node(&key)?;
        txn.commit()?;

        engine.retrieval.evict(id);
        tracing::info!(memory_id = %id, "Memory purged");
        Ok(true)
    }

    /// Delete a session's Working memories
    pub async fn clear_working_memory(&self, session_id: &str) -> Result<usize> {
        let engine = self.engine().await?;
        let mut txn = engine.store.begin();
        let mut cleared = 0;
        for entry in txn.memories(&[MemoryType::Working])? {
            if entry.session_id == session_id && txn.delete_node(&entry.id.to_string())? {
                engine.retrieval.evict(&entry.id);
                cleared += 1;
            }
        }
        txn.commit()?;
        tracing::info!(session_id, cleared, "Working memory cleared");
        Ok(cleared)
    }

    /// History of the fact containing `id`, oldest first
    pub async fn timeline(&self, id: &MemoryId) -> Result<Vec<TimelineEntry>> {
        let engine = self.engine().await?;
        let snapshot = engine.store.snapshot();
        engine.supersession.timeline(&snapshot, id)
    }

    /// Timeline of the Semantic fact best matching the query
    pub async fn what_changed(&self, query: &str) -> Result<Vec<TimelineEntry>> {
        let engine = self.engine().await?;
        let request = RetrievalRequest::new(query)
            .memory_types([MemoryType::Semantic])
            .limit(1);
        let snapshot = engine.store.snapshot();
        let ranked = match engine.retrieval.search(&snapshot, &request, None) {
            Ok(ranked) => ranked,
            Err(MemoryError::MalformedQuery(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        match ranked.results.first() {
            Some(best) => engine.supersession.timeline(&snapshot, &best.memory.id),
            None => Ok(Vec::new()),
        }
    }

    /// Explicitly set an entry's confidence
    pub async fn correct_confidence(&self, id: &MemoryId, confidence: f32) -> Result<()> {
        if !confidence.is_finite() {
            return Err(MemoryError::other("confidence must be finite"));
        }
        let engine = self.engine().await?;
        let mut txn = engine.store.begin();
        txn.set_confidence(id, confidence)?;
        txn.commit()?;
        tracing::info!(memory_id = %id, confidence, "Confidence corrected");
        Ok(())
    }

    /// Create or update parser output in one transaction
    pub async fn upsert_code_entities(
        &self,
        files: &[CodeFile],
        functions: &[Function],
    ) -> Result<UpsertSummary> {
        let engine = self.engine().await?;
        let mut txn = engine.store.begin();
        let mut summary = UpsertSummary::default();
        for file in files {
            summary.count(txn.upsert_code_file(file)?);
        }
        for function in functions {
            summary.count(txn.upsert_function(function)?);
        }
        txn.commit()?;
        tracing::debug!(
            created = summary.created,
            updated = summary.updated,
            unchanged = summary.unchanged,
            "Code entities upserted"
        );
        Ok(summary)
    }

    /// A session's consensus decisions, oldest first
    pub async fn audit_trail(&self, session_id: &str) -> Result<Vec<AuditRecord>> {
        let engine = self.engine().await?;
        engine.audit.trail(session_id)
    }
}
