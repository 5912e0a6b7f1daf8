//! Audit trail of consensus decisions, keyed by session
//!
//! Records live in the graph store's keyspace under `a␀<session>␀<nanos>␀<id>`
//! so a session's trail reads back in chronological order with one prefix
//! scan. The log holds the store handle it was built with and goes away
//! with the coordinator that owns it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::consensus::GateDecision;
use crate::error::Result;
use crate::graph::schema::{self, audit_key, audit_prefix};
use crate::graph::{GraphRead, GraphStore, GraphTxn};
use crate::node::{MemoryId, MemoryType};

const PREVIEW_CHARS: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Stored,
    Rejected,
    /// Unchanged fact, existing entry refreshed
    Reasserted,
}

/// One admission decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: String,
    pub session_id: String,
    pub memory_type: MemoryType,
    pub decision: Decision,
    pub score: f64,
    pub fallback_used: bool,
    pub reviewer_scores: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_id: Option<MemoryId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Start of the content, for humans reading the trail
    pub preview: String,
    pub recorded_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(
        session_id: impl Into<String>,
        memory_type: MemoryType,
        gate: &GateDecision,
        content: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            memory_type,
            decision: if gate.accepted {
                Decision::Stored
            } else {
                Decision::Rejected
            },
            score: gate.score,
            fallback_used: gate.fallback_used,
            reviewer_scores: gate.reviewer_scores.clone(),
            memory_id: None,
            reason: gate.reason.clone(),
            preview: content.chars().take(PREVIEW_CHARS).collect(),
            recorded_at: Utc::now(),
        }
    }

    pub fn with_memory(mut self, id: MemoryId) -> Self {
        self.memory_id = Some(id);
        self
    }

    pub fn with_decision(mut self, decision: Decision, reason: Option<&str>) -> Self {
        self.decision = decision;
        self.reason = reason.map(str::to_string);
        self
    }
}

/// Append-only decision log
pub struct AuditLog {
    store: Arc<GraphStore>,
}

impl AuditLog {
    pub fn new(store: Arc<GraphStore>) -> Self {
        Self { store }
    }

    /// Write a record as part of an open transaction
    pub fn record_in(txn: &mut GraphTxn<'_>, record: &AuditRecord) -> Result<()> {
        schema::validate_key_part(&record.session_id)?;
        let key = audit_key(&record.session_id, record.recorded_at, &record.id);
        txn.put_raw(key, serde_json::to_vec(record)?);
        Ok(())
    }

    /// Write a record in its own transaction
    pub fn append(&self, record: &AuditRecord) -> Result<()> {
        let mut txn = self.store.begin();
        Self::record_in(&mut txn, record)?;
        txn.commit()
    }

    /// A session's decisions, oldest first
    pub fn trail(&self, session_id: &str) -> Result<Vec<AuditRecord>> {
        schema::validate_key_part(session_id)?;
        let snapshot = self.store.snapshot();
        let mut records = Vec::new();
        for (_, value) in snapshot.scan_raw(&audit_prefix(session_id))? {
            match serde_json::from_slice::<AuditRecord>(&value) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(session_id, error = %e, "Skipping unreadable audit record"),
            }
        }
        Ok(records)
    }
}
