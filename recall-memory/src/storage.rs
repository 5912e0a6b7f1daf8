//! Typed memory persistence on top of the graph store
//!
//! [`MemoryRead`] decodes memory and code-entity nodes for any graph
//! reader. [`MemoryWrite`] is the only write path for memory nodes and only
//! exposes the mutations a stored entry allows: access time, confidence and
//! supersession.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};

use crate::error::{MemoryError, Result};
use crate::graph::{GraphRead, GraphTxn, NodeRecord, NodeTable, Properties};
use crate::node::{CodeFile, Function, MemoryEntry, MemoryId, MemoryType};

/// Result of a check-then-branch upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    Unchanged,
}

fn to_properties<T: Serialize>(value: &T) -> Result<Properties> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(MemoryError::other(format!(
            "Expected an object, got {}",
            other
        ))),
    }
}

/// Decode a memory node
pub fn entry_from_node(node: NodeRecord) -> Result<MemoryEntry> {
    Ok(serde_json::from_value(Value::Object(node.properties))?)
}

fn tables_for(types: &[MemoryType]) -> Vec<NodeTable> {
    if types.is_empty() {
        NodeTable::memory_tables().collect()
    } else {
        types.iter().map(MemoryType::table).collect()
    }
}

/// Typed reads for memories and code entities
pub trait MemoryRead: GraphRead {
    /// Load a memory by id. Returns None for unknown ids and for ids that
    /// belong to code entities.
    fn memory(&self, id: &MemoryId) -> Result<Option<MemoryEntry>> {
        match self.get_node(&id.to_string())? {
            Some(node) if node.table.is_memory() => Ok(Some(entry_from_node(node)?)),
            _ => Ok(None),
        }
    }

    /// All memories of the given types (every type if empty)
    fn memories(&self, types: &[MemoryType]) -> Result<Vec<MemoryEntry>> {
        let mut entries = Vec::new();
        for table in tables_for(types) {
            for node in self.scan_table(table)? {
                let id = node.id.clone();
                match entry_from_node(node) {
                    Ok(entry) => entries.push(entry),
                    Err(e) => {
                        tracing::warn!(id = %id, error = %e, "Failed to decode memory. Skipping.");
                    }
                }
            }
        }
        Ok(entries)
    }

    /// Number of memories of the given types (every type if empty)
    fn memory_count(&self, types: &[MemoryType]) -> Result<usize> {
        let mut total = 0;
        for table in tables_for(types) {
            total += self.count_table(table)?;
        }
        Ok(total)
    }

    fn code_files(&self) -> Result<Vec<CodeFile>> {
        self.scan_table(NodeTable::CodeFile)?
            .into_iter()
            .map(|node| Ok(serde_json::from_value(Value::Object(node.properties))?))
            .collect()
    }

    fn functions(&self) -> Result<Vec<Function>> {
        self.scan_table(NodeTable::Function)?
            .into_iter()
            .map(|node| Ok(serde_json::from_value(Value::Object(node.properties))?))
            .collect()
    }
}

impl<T: GraphRead + ?Sized> MemoryRead for T {}

/// Typed writes. Implemented for the write transaction only.
pub trait MemoryWrite {
    /// Persist a new entry
    fn insert_memory(&mut self, entry: &MemoryEntry) -> Result<()>;

    /// Refresh the access time
    fn touch_memory(&mut self, id: &MemoryId, at: DateTime<Utc>) -> Result<()>;

    /// Overwrite the confidence (decay or explicit correction)
    fn set_confidence(&mut self, id: &MemoryId, confidence: f32) -> Result<()>;

    /// Record the newer entry that supersedes this one
    fn mark_superseded(&mut self, id: &MemoryId, by: &MemoryId) -> Result<()>;

    /// Forget a superseding entry (used when that entry is purged)
    fn clear_superseded(&mut self, id: &MemoryId) -> Result<()>;

    fn upsert_code_file(&mut self, file: &CodeFile) -> Result<UpsertOutcome>;

    fn upsert_function(&mut self, function: &Function) -> Result<UpsertOutcome>;
}

impl GraphTxn<'_> {
    fn patch_memory(&mut self, id: &MemoryId, patch: Value) -> Result<()> {
        let key = id.to_string();
        match self.table_of(&key)? {
            Some(table) if table.is_memory() => {}
            _ => return Err(MemoryError::not_found(key)),
        }
        let Value::Object(patch) = patch else {
            return Err(MemoryError::other("Patch must be an object"));
        };
        self.update_node(&key, patch)?;
        Ok(())
    }

    /// Look up the deterministic id, then create or replace
    fn upsert_entity<T: Serialize>(
        &mut self,
        table: NodeTable,
        id: &str,
        entity: &T,
    ) -> Result<UpsertOutcome> {
        let properties = to_properties(entity)?;
        match self.get_node(id)? {
            None => {
                self.create_node(table, id, properties)?;
                Ok(UpsertOutcome::Created)
            }
            Some(existing) if existing.table != table => Err(MemoryError::DuplicateKey(format!(
                "{} already used by {}",
                id, existing.table
            ))),
            Some(existing) if existing.properties == properties => Ok(UpsertOutcome::Unchanged),
            Some(_) => {
                self.replace_node(id, properties)?;
                Ok(UpsertOutcome::Updated)
            }
        }
    }
}

impl MemoryWrite for GraphTxn<'_> {
    fn insert_memory(&mut self, entry: &MemoryEntry) -> Result<()> {
        let properties = to_properties(entry)?;
        self.create_node(entry.memory_type.table(), &entry.id.to_string(), properties)
    }

    fn touch_memory(&mut self, id: &MemoryId, at: DateTime<Utc>) -> Result<()> {
        self.patch_memory(id, json!({ "accessed_at": at }))
    }

    fn set_confidence(&mut self, id: &MemoryId, confidence: f32) -> Result<()> {
        self.patch_memory(id, json!({ "confidence": confidence.clamp(0.0, 1.0) }))
    }

    fn mark_superseded(&mut self, id: &MemoryId, by: &MemoryId) -> Result<()> {
        self.patch_memory(id, json!({ "superseded_by": by }))
    }

    fn clear_superseded(&mut self, id: &MemoryId) -> Result<()> {
        self.patch_memory(id, json!({ "superseded_by": null }))
    }

    fn upsert_code_file(&mut self, file: &CodeFile) -> Result<UpsertOutcome> {
        self.upsert_entity(NodeTable::CodeFile, &file.id, file)
    }

    fn upsert_function(&mut self, function: &Function) -> Result<UpsertOutcome> {
        self.upsert_entity(NodeTable::Function, &function.id, function)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphStore;
    use tempfile::TempDir;

    fn open() -> (GraphStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = GraphStore::open(dir.path()).unwrap();
        (store, dir)
    }

    fn entry(memory_type: MemoryType, content: &str) -> MemoryEntry {
        MemoryEntry::builder()
            .memory_type(memory_type)
            .content(content)
            .confidence(0.8)
            .build()
            .unwrap()
    }

    #[test]
    fn test_insert_and_load_memory() {
        let (store, _dir) = open();
        let e = entry(MemoryType::Procedural, "Run cargo fmt before committing");
        let mut txn = store.begin();
        txn.insert_memory(&e).unwrap();
        txn.commit().unwrap();

        let snap = store.snapshot();
        assert_eq!(snap.memory(&e.id).unwrap(), Some(e.clone()));
        assert_eq!(snap.memories(&[MemoryType::Procedural]).unwrap().len(), 1);
        assert!(snap.memories(&[MemoryType::Semantic]).unwrap().is_empty());
        assert_eq!(snap.memory_count(&[]).unwrap(), 1);
    }

    #[test]
    fn test_allowed_mutations() {
        let (store, _dir) = open();
        let old = entry(MemoryType::Semantic, "Deploys happen on Tuesdays");
        let new = entry(MemoryType::Semantic, "Deploys happen on Thursdays");
        let mut txn = store.begin();
        txn.insert_memory(&old).unwrap();
        txn.insert_memory(&new).unwrap();
        txn.set_confidence(&old.id, 0.4).unwrap();
        txn.mark_superseded(&old.id, &new.id).unwrap();
        let later = Utc::now() + chrono::Duration::seconds(5);
        txn.touch_memory(&old.id, later).unwrap();
        txn.commit().unwrap();

        let loaded = store.snapshot().memory(&old.id).unwrap().unwrap();
        assert_eq!(loaded.confidence, 0.4);
        assert_eq!(loaded.superseded_by, Some(new.id));
        assert_eq!(loaded.accessed_at, later);
        assert_eq!(loaded.content, old.content);

        let mut txn = store.begin();
        txn.clear_superseded(&old.id).unwrap();
        txn.commit().unwrap();
        let loaded = store.snapshot().memory(&old.id).unwrap().unwrap();
        assert_eq!(loaded.superseded_by, None);
    }

    #[test]
    fn test_patch_unknown_memory_fails() {
        let (store, _dir) = open();
        let mut txn = store.begin();
        assert!(matches!(
            txn.set_confidence(&MemoryId::new(), 0.1),
            Err(MemoryError::NotFound(_))
        ));
    }

    #[test]
    fn test_code_entity_upsert_branches() {
        let (store, _dir) = open();
        let file = CodeFile::new("src/auth.py");
        let mut txn = store.begin();
        assert_eq!(txn.upsert_code_file(&file).unwrap(), UpsertOutcome::Created);
        assert_eq!(txn.upsert_code_file(&file).unwrap(), UpsertOutcome::Unchanged);
        let typed = file.clone().with_language("python");
        assert_eq!(txn.upsert_code_file(&typed).unwrap(), UpsertOutcome::Updated);

        let func = Function::new("login_user").in_file("src/auth.py");
        assert_eq!(txn.upsert_function(&func).unwrap(), UpsertOutcome::Created);
        txn.commit().unwrap();

        let snap = store.snapshot();
        let files = snap.code_files().unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].language.as_deref(), Some("python"));
        assert_eq!(snap.functions().unwrap()[0].name, "login_user");
    }

    #[test]
    fn test_upsert_removes_dropped_fields() {
        let (store, _dir) = open();
        let mut txn = store.begin();
        let typed = CodeFile::new("src/a.py").with_language("python");
        let plain = CodeFile::new("src/a.py");
        assert_eq!(txn.upsert_code_file(&typed).unwrap(), UpsertOutcome::Created);
        assert_eq!(txn.upsert_code_file(&plain).unwrap(), UpsertOutcome::Updated);
        assert_eq!(txn.upsert_code_file(&plain).unwrap(), UpsertOutcome::Unchanged);

        let func = Function::new("parse").in_file("src/a.py").at_line(12);
        assert_eq!(txn.upsert_function(&func).unwrap(), UpsertOutcome::Created);
        let moved = Function::new("parse").in_file("src/a.py");
        assert_eq!(txn.upsert_function(&moved).unwrap(), UpsertOutcome::Updated);
        assert_eq!(txn.upsert_function(&moved).unwrap(), UpsertOutcome::Unchanged);
        txn.commit().unwrap();

        let snap = store.snapshot();
        assert_eq!(snap.code_files().unwrap()[0].language, None);
        assert_eq!(snap.functions().unwrap()[0].line, None);
    }
}
