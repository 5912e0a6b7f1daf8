//! Temporal supersession of evolving facts
//!
//! A new Semantic fact about a subject that already has a current fact
//! supersedes it: `SUPERSEDES(new -> old)` is recorded, the old entry points
//! at its successor and its confidence decays. Nothing is deleted, so the
//! full history stays queryable as a timeline.

use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::graph::{EdgeProps, GraphRead, GraphTxn, RelKind, RelType};
use crate::node::{metadata_value_text, MemoryEntry, MemoryId, MemoryType};
use crate::storage::{entry_from_node, MemoryRead, MemoryWrite};
use crate::text;

/// Metadata key naming the subject of a fact explicitly
pub const SUBJECT_KEY: &str = "subject";

/// Reason reported when an unchanged fact is re-asserted
pub const REASSERTED_UNCHANGED: &str = "reasserted_unchanged";

/// Metadata keys that describe a fact rather than scope it
const DESCRIPTIVE_KEYS: &[&str] = &["title"];

fn scope_value(value: &serde_json::Value) -> String {
    metadata_value_text(value).trim().to_lowercase()
}

/// Whether a metadata key present on both entries holds different values
///
/// `{"project": "atlas"}` and `{"project": "borealis"}` scope two facts
/// apart however similar their wording is.
pub fn scope_conflict(a: &MemoryEntry, b: &MemoryEntry) -> bool {
    a.metadata
        .iter()
        .filter(|(key, _)| !DESCRIPTIVE_KEYS.contains(&key.as_str()))
        .any(|(key, value)| {
            b.metadata
                .get(key)
                .is_some_and(|other| scope_value(value) != scope_value(other))
        })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupersessionConfig {
    /// Keyword overlap at which two facts share a subject (default: 0.6)
    pub similarity_floor: f32,
    /// Confidence multiplier applied per supersession (default: 0.5)
    pub decay_factor: f32,
}

impl Default for SupersessionConfig {
    fn default() -> Self {
        Self {
            similarity_floor: 0.6,
            decay_factor: 0.5,
        }
    }
}

/// One entry in a fact's history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub memory: MemoryEntry,
    /// Older entries this one replaced
    pub supersedes: Vec<MemoryId>,
    /// True for the head of the chain
    pub is_current: bool,
}

pub struct SupersessionManager {
    config: SupersessionConfig,
}

impl SupersessionManager {
    pub fn new(config: SupersessionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SupersessionConfig {
        &self.config
    }

    /// Whether two entries describe the same subject
    ///
    /// Explicit `subject` metadata on both sides decides on its own.
    /// Otherwise conflicting values under a shared metadata key keep them
    /// apart, and title and content overlap must reach the floor.
    pub fn same_subject(&self, a: &MemoryEntry, b: &MemoryEntry) -> bool {
        match (a.metadata_str(SUBJECT_KEY), b.metadata_str(SUBJECT_KEY)) {
            (Some(x), Some(y)) => x.trim().eq_ignore_ascii_case(y.trim()),
            _ if scope_conflict(a, b) => false,
            _ => {
                let a_terms = text::term_set(&format!("{} {}", a.title, a.content));
                let b_terms = text::term_set(&format!("{} {}", b.title, b.content));
                text::jaccard(&a_terms, &b_terms) >= self.config.similarity_floor
            }
        }
    }

    /// Every current Semantic fact other than the candidate
    ///
    /// Linear in the number of Semantic entries: a subject match may rest on
    /// `subject` metadata alone, so no keyword index can narrow the set.
    fn current_facts<R: GraphRead + ?Sized>(
        reader: &R,
        candidate: &MemoryEntry,
    ) -> Result<Vec<MemoryEntry>> {
        if candidate.memory_type != MemoryType::Semantic {
            return Ok(Vec::new());
        }
        Ok(reader
            .memories(&[MemoryType::Semantic])?
            .into_iter()
            .filter(|e| e.id != candidate.id && !e.is_superseded())
            .collect())
    }

    /// A current fact whose content equals the candidate's
    ///
    /// Scans every current Semantic fact, O(n) per store.
    pub fn find_reassertion<R: GraphRead + ?Sized>(
        &self,
        reader: &R,
        candidate: &MemoryEntry,
    ) -> Result<Option<MemoryEntry>> {
        let normalized = text::normalize_content(&candidate.content);
        Ok(Self::current_facts(reader, candidate)?
            .into_iter()
            .filter(|e| text::normalize_content(&e.content) == normalized)
            .filter(|e| !scope_conflict(e, candidate))
            .min_by_key(|e| e.created_at))
    }

    /// Current facts the candidate would supersede
    ///
    /// Scans every current Semantic fact, O(n) per store.
    pub fn find_superseded<R: GraphRead + ?Sized>(
        &self,
        reader: &R,
        candidate: &MemoryEntry,
    ) -> Result<Vec<MemoryEntry>> {
        let mut matches: Vec<MemoryEntry> = Self::current_facts(reader, candidate)?
            .into_iter()
            .filter(|e| self.same_subject(candidate, e))
            .collect();
        matches.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(matches)
    }

    /// Record that `new` supersedes each of `old`
    ///
    /// Each old entry and everything further down its chain decays once, so
    /// an entry k supersessions behind the head carries `decay^k`.
    pub fn apply(
        &self,
        txn: &mut GraphTxn<'_>,
        new: &MemoryEntry,
        old: &[MemoryEntry],
    ) -> Result<Vec<MemoryId>> {
        let new_key = new.id.to_string();
        let mut decayed = HashSet::new();
        let mut superseded = Vec::with_capacity(old.len());

        for entry in old {
            let old_key = entry.id.to_string();
            if txn.edge_exists(&new_key, &RelType::Supersedes, &old_key)? {
                continue;
            }
            txn.create_edge(RelType::Supersedes, &new_key, &old_key, EdgeProps::now())?;
            txn.mark_superseded(&entry.id, &new.id)?;

            for id in Self::chain_from(&*txn, entry.id)? {
                if !decayed.insert(id) {
                    continue;
                }
                if let Some(current) = txn.memory(&id)? {
                    let confidence = current.confidence * self.config.decay_factor;
                    txn.set_confidence(&id, confidence)?;
                }
            }

            tracing::debug!(
                memory_id = %new.id,
                superseded = %entry.id,
                "Fact superseded"
            );
            superseded.push(entry.id);
        }

        Ok(superseded)
    }

    /// The entry and every entry it transitively supersedes
    fn chain_from<R: GraphRead + ?Sized>(reader: &R, start: MemoryId) -> Result<Vec<MemoryId>> {
        let mut seen = HashSet::from([start]);
        let mut order = vec![start];
        let mut queue = VecDeque::from([start]);
        while let Some(id) = queue.pop_front() {
            for edge in reader.out_edges(&id.to_string(), Some(RelKind::Supersedes))? {
                let Ok(older) = edge.to.parse::<MemoryId>() else {
                    continue;
                };
                if seen.insert(older) {
                    order.push(older);
                    queue.push_back(older);
                }
            }
        }
        Ok(order)
    }

    /// Full history containing `id`, oldest first
    ///
    /// Walks SUPERSEDES edges in both directions. Empty if `id` is unknown.
    pub fn timeline<R: GraphRead + ?Sized>(
        &self,
        reader: &R,
        id: &MemoryId,
    ) -> Result<Vec<TimelineEntry>> {
        let Some(start) = reader.memory(id)? else {
            return Ok(Vec::new());
        };

        let mut seen = HashSet::from([start.id]);
        let mut queue = VecDeque::from([start.id]);
        let mut entries = Vec::new();
        while let Some(current) = queue.pop_front() {
            let key = current.to_string();
            let outgoing = reader.out_edges(&key, Some(RelKind::Supersedes))?;
            let incoming = reader.in_edges(&key, Some(RelKind::Supersedes))?;

            let supersedes: Vec<MemoryId> = outgoing
                .iter()
                .filter_map(|e| e.to.parse().ok())
                .collect();
            let neighbours = supersedes
                .iter()
                .copied()
                .chain(incoming.iter().filter_map(|e| e.from.parse().ok()));
            for next in neighbours {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }

            let Some(node) = reader.get_node(&key)? else {
                continue;
            };
            if !node.table.is_memory() {
                continue;
            }
            let memory = entry_from_node(node)?;
            entries.push(TimelineEntry {
                is_current: memory.superseded_by.is_none(),
                supersedes,
                memory,
            });
        }

        entries.sort_by(|a, b| {
            a.memory
                .created_at
                .cmp(&b.memory.created_at)
                .then(a.memory.id.cmp(&b.memory.id))
        });
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphStore;
    use chrono::{Duration, Utc};
    use tempfile::TempDir;

    fn fact(content: &str, subject: Option<&str>, offset_secs: i64) -> MemoryEntry {
        let mut builder = MemoryEntry::builder()
            .memory_type(MemoryType::Semantic)
            .content(content)
            .confidence(0.9)
            .created_at(Utc::now() + Duration::seconds(offset_secs));
        if let Some(subject) = subject {
            builder = builder.meta(SUBJECT_KEY, subject);
        }
        builder.build().unwrap()
    }

    fn manager() -> SupersessionManager {
        SupersessionManager::new(SupersessionConfig::default())
    }

    /// Store each fact in turn the way the coordinator does
    fn store_all(store: &GraphStore, facts: &[MemoryEntry]) {
        let manager = manager();
        for f in facts {
            let mut txn = store.begin();
            let old = manager.find_superseded(&txn, f).unwrap();
            txn.insert_memory(f).unwrap();
            manager.apply(&mut txn, f, &old).unwrap();
            txn.commit().unwrap();
        }
    }

    #[test]
    fn test_same_subject_by_metadata_or_overlap() {
        let m = manager();
        let a = fact("The API rate limit is 100 requests per minute", None, 0);
        let b = fact("The API rate limit is 200 requests per minute", None, 1);
        let c = fact("Release notes go in CHANGELOG.md", None, 2);
        assert!(m.same_subject(&a, &b));
        assert!(!m.same_subject(&a, &c));

        let x = fact("Staging runs on port 8080", Some("staging port"), 0);
        let y = fact("Moved it to 9090", Some("Staging Port"), 1);
        let z = fact("Staging runs on port 8080", Some("prod port"), 2);
        assert!(m.same_subject(&x, &y));
        assert!(!m.same_subject(&x, &z));
    }

    #[test]
    fn test_conflicting_metadata_keeps_subjects_apart() {
        let m = manager();
        let scoped = |content: &str, project: &str| {
            MemoryEntry::builder()
                .memory_type(MemoryType::Semantic)
                .content(content)
                .meta("project", project)
                .build()
                .unwrap()
        };
        let atlas = scoped("atlas ships its release notes on the first Monday", "atlas");
        let borealis = scoped("borealis ships its release notes on the first Monday", "borealis");
        assert!(!m.same_subject(&atlas, &borealis));

        let atlas_update = scoped("atlas ships its release notes on the first Tuesday", "Atlas");
        assert!(m.same_subject(&atlas, &atlas_update));

        let mut titled = atlas_update.clone();
        titled.metadata.insert("title".into(), "Release day".into());
        let mut retitled = atlas.clone();
        retitled.metadata.insert("title".into(), "Release schedule".into());
        assert!(m.same_subject(&retitled, &titled));
    }

    #[test]
    fn test_same_wording_in_other_scope_is_not_reassertion() {
        let dir = TempDir::new().unwrap();
        let store = GraphStore::open(dir.path()).unwrap();
        let original = MemoryEntry::builder()
            .memory_type(MemoryType::Semantic)
            .content("Releases ship on Mondays")
            .meta("project", "atlas")
            .build()
            .unwrap();
        store_all(&store, std::slice::from_ref(&original));

        let other = MemoryEntry::builder()
            .memory_type(MemoryType::Semantic)
            .content("Releases ship on Mondays")
            .meta("project", "borealis")
            .build()
            .unwrap();
        let snap = store.snapshot();
        assert!(manager().find_reassertion(&snap, &other).unwrap().is_none());
        assert!(manager().find_superseded(&snap, &other).unwrap().is_empty());
    }

    #[test]
    fn test_chain_decays_geometrically() {
        let dir = TempDir::new().unwrap();
        let store = GraphStore::open(dir.path()).unwrap();
        let facts: Vec<MemoryEntry> = (0..4)
            .map(|i| fact(&format!("Primary region is r{}", i), Some("region"), i))
            .collect();
        store_all(&store, &facts);

        let snap = store.snapshot();
        assert_eq!(snap.count_edges(Some(RelKind::Supersedes)).unwrap(), 3);
        let oldest = snap.memory(&facts[0].id).unwrap().unwrap();
        assert!((oldest.confidence - 0.9 * 0.5f32.powi(3)).abs() < 1e-6);
        let head = snap.memory(&facts[3].id).unwrap().unwrap();
        assert_eq!(head.confidence, 0.9);
        assert!(!head.is_superseded());
        assert_eq!(oldest.superseded_by, Some(facts[1].id));
    }

    #[test]
    fn test_timeline_is_chronological() {
        let dir = TempDir::new().unwrap();
        let store = GraphStore::open(dir.path()).unwrap();
        let facts: Vec<MemoryEntry> = (0..3)
            .map(|i| fact(&format!("Team lead is person {}", i), Some("lead"), i))
            .collect();
        store_all(&store, &facts);

        let snap = store.snapshot();
        let timeline = manager().timeline(&snap, &facts[1].id).unwrap();
        let ids: Vec<MemoryId> = timeline.iter().map(|t| t.memory.id).collect();
        assert_eq!(ids, facts.iter().map(|f| f.id).collect::<Vec<_>>());
        assert!(timeline[2].is_current);
        assert!(!timeline[0].is_current);
        assert_eq!(timeline[1].supersedes, vec![facts[0].id]);
        assert!(manager().timeline(&snap, &MemoryId::new()).unwrap().is_empty());
    }

    #[test]
    fn test_reassertion_detected() {
        let dir = TempDir::new().unwrap();
        let store = GraphStore::open(dir.path()).unwrap();
        let original = fact("CI runs on GitHub Actions.", Some("ci"), 0);
        store_all(&store, std::slice::from_ref(&original));

        let again = fact("CI  runs on GitHub Actions", Some("ci"), 5);
        let snap = store.snapshot();
        let found = manager().find_reassertion(&snap, &again).unwrap();
        assert_eq!(found.map(|e| e.id), Some(original.id));

        let changed = fact("CI runs on Buildkite", Some("ci"), 5);
        assert!(manager().find_reassertion(&snap, &changed).unwrap().is_none());
    }

    #[test]
    fn test_non_semantic_never_supersedes() {
        let dir = TempDir::new().unwrap();
        let store = GraphStore::open(dir.path()).unwrap();
        let original = fact("Primary region is r1", Some("region"), 0);
        store_all(&store, std::slice::from_ref(&original));

        let episode = MemoryEntry::builder()
            .memory_type(MemoryType::Episodic)
            .content("Primary region is r2")
            .meta(SUBJECT_KEY, "region")
            .build()
            .unwrap();
        let snap = store.snapshot();
        assert!(manager().find_superseded(&snap, &episode).unwrap().is_empty());
    }
}
