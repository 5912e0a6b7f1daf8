//! Session lifecycle hooks
//!
//! A session start surfaces pending intentions. A session stop promotes the
//! Working entries marked for keeping to Episodic memory and clears the rest.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::coordinator::{MemoryCoordinator, SessionState, StoreContext};
use crate::error::Result;
use crate::graph::schema;
use crate::node::{MemoryEntry, MemoryType};
use crate::storage::MemoryRead;

/// Metadata key marking a Working entry for promotion
pub const PROMOTE_KEY: &str = "promote";
/// Metadata key holding an intention's status
pub const STATUS_KEY: &str = "status";
/// Status of a fulfilled intention
pub const STATUS_DONE: &str = "done";

/// What a session stop did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsolidationReport {
    /// Working entries stored as Episodic
    pub promoted: usize,
    /// Marked entries the gate turned down
    pub rejected: usize,
    /// Working entries removed
    pub cleared: usize,
}

fn marked_for_promotion(entry: &MemoryEntry) -> bool {
    match entry.metadata.get(PROMOTE_KEY) {
        Some(serde_json::Value::Bool(flag)) => *flag,
        Some(serde_json::Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

fn is_pending(entry: &MemoryEntry) -> bool {
    !entry.is_superseded()
        && !entry
            .metadata_str(STATUS_KEY)
            .is_some_and(|s| s.eq_ignore_ascii_case(STATUS_DONE))
}

impl MemoryCoordinator {
    /// Register a session and return its pending intentions, oldest first
    pub async fn session_start(&self, session_id: &str) -> Result<Vec<MemoryEntry>> {
        schema::validate_key_part(session_id)?;
        let engine = self.engine().await?;

        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionState {
                started_at: Utc::now(),
            });

        let snapshot = engine.store.snapshot();
        let mut pending: Vec<MemoryEntry> = snapshot
            .memories(&[MemoryType::Prospective])?
            .into_iter()
            .filter(is_pending)
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        tracing::info!(session_id, pending = pending.len(), "Session started");
        Ok(pending)
    }

    /// Consolidate and close a session
    ///
    /// Promotions go through the consensus gate like any other store.
    pub async fn session_stop(&self, session_id: &str) -> Result<ConsolidationReport> {
        schema::validate_key_part(session_id)?;
        let engine = self.engine().await?;

        let marked: Vec<MemoryEntry> = {
            let snapshot = engine.store.snapshot();
            snapshot
                .memories(&[MemoryType::Working])?
                .into_iter()
                .filter(|e| e.session_id == session_id && marked_for_promotion(e))
                .collect()
        };

        let mut report = ConsolidationReport::default();
        for entry in marked {
            let mut metadata = entry.metadata.clone();
            metadata.remove(PROMOTE_KEY);
            let context = StoreContext::session(session_id).agent(&entry.agent_id);
            let result = self
                .store(&entry.content, MemoryType::Episodic, Some(metadata), context)
                .await?;
            if result.stored {
                report.promoted += 1;
            } else {
                report.rejected += 1;
            }
        }

        report.cleared = self.clear_working_memory(session_id).await?;
        let started_at = self.sessions.remove(session_id).map(|(_, s)| s.started_at);

        tracing::info!(
            session_id,
            promoted = report.promoted,
            rejected = report.rejected,
            cleared = report.cleared,
            started_at = ?started_at,
            "Session stopped"
        );
        Ok(report)
    }

    /// Sessions started and not yet stopped, with their start times
    pub fn active_sessions(&self) -> Vec<(String, DateTime<Utc>)> {
        let mut sessions: Vec<(String, DateTime<Utc>)> = self
            .sessions
            .iter()
            .map(|s| (s.key().clone(), s.value().started_at))
            .collect();
        sessions.sort();
        sessions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use serde_json::json;
    use tempfile::TempDir;

    fn meta(value: serde_json::Value) -> Option<crate::node::Metadata> {
        Some(serde_json::from_value(value).unwrap())
    }

    #[tokio::test]
    async fn test_session_round_trip() {
        let dir = TempDir::new().unwrap();
        let coordinator = MemoryCoordinator::new(MemoryConfig::with_data_dir(dir.path()));
        coordinator.initialize().await.unwrap();
        let scores = StoreContext::session("s1").scores([8.0, 8.0]);

        coordinator
            .store(
                "Follow up on the flaky payment test next week",
                MemoryType::Prospective,
                None,
                scores.clone(),
            )
            .await
            .unwrap();
        coordinator
            .store(
                "Rotate the staging API keys before release",
                MemoryType::Prospective,
                meta(json!({"status": "done"})),
                scores.clone(),
            )
            .await
            .unwrap();

        let pending = coordinator.session_start("s1").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].content.contains("flaky payment"));
        assert_eq!(coordinator.active_sessions().len(), 1);

        coordinator
            .store(
                "Found that the retry loop in PaymentClient ignores HTTP 429 responses",
                MemoryType::Working,
                meta(json!({"promote": true})),
                scores.clone(),
            )
            .await
            .unwrap();
        coordinator
            .store(
                "Scratch: trying a different mock for the gateway",
                MemoryType::Working,
                None,
                scores,
            )
            .await
            .unwrap();

        let report = coordinator.session_stop("s1").await.unwrap();
        assert_eq!(report.promoted, 1);
        assert_eq!(report.cleared, 2);
        assert!(coordinator.active_sessions().is_empty());

        let stats = coordinator.stats().await.unwrap();
        assert_eq!(stats.by_type[&MemoryType::Working], 0);
        assert_eq!(stats.by_type[&MemoryType::Episodic], 1);
    }

    #[test]
    fn test_promotion_flag_forms() {
        let entry = |value: serde_json::Value| {
            MemoryEntry::builder()
                .memory_type(MemoryType::Working)
                .content("x")
                .meta(PROMOTE_KEY, value)
                .build()
                .unwrap()
        };
        assert!(marked_for_promotion(&entry(json!(true))));
        assert!(marked_for_promotion(&entry(json!("TRUE"))));
        assert!(!marked_for_promotion(&entry(json!(false))));
        assert!(!marked_for_promotion(&entry(json!(1))));
    }
}
