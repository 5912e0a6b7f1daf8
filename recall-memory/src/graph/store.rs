//! RocksDB-backed graph store
//!
//! Nodes and edges live in one RocksDB database (see [`super::schema`] for
//! the key layout). Readers take a committed snapshot; there is exactly one
//! writer at a time, and its transaction commits as a single `WriteBatch`,
//! so a half-written memory is never visible.
//!
//! RocksDB has no notion of an upsert over our keys: creating an existing
//! node or edge fails with `DuplicateKey`, and callers that need
//! create-or-update must look first and branch inside one transaction.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use rocksdb::{Direction as ScanDirection, IteratorMode, Options, Snapshot, WriteBatch, DB};

use super::query::{self, Pattern, Row};
use super::schema::{self, EdgeProps, NodeTable, RelKind, RelType};
use crate::error::{MemoryError, Result};

/// Schemaless node properties
pub type Properties = serde_json::Map<String, serde_json::Value>;

/// A stored node
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRecord {
    pub table: NodeTable,
    pub id: String,
    pub properties: Properties,
}

/// A stored edge
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeRecord {
    pub rel: RelType,
    pub from: String,
    pub to: String,
    pub props: EdgeProps,
}

/// Read access shared by committed snapshots and open transactions
pub trait GraphRead {
    /// Raw value for a key
    fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// All key/value pairs under a prefix, in key order
    fn scan_raw(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Table holding the node with this primary key
    fn table_of(&self, id: &str) -> Result<Option<NodeTable>> {
        match self.get_raw(&schema::index_key(id))? {
            Some(bytes) => {
                let name = String::from_utf8_lossy(&bytes);
                NodeTable::parse(&name)
                    .map(Some)
                    .ok_or_else(|| MemoryError::schema(format!("Unknown table {} for {}", name, id)))
            }
            None => Ok(None),
        }
    }

    fn node_exists(&self, id: &str) -> Result<bool> {
        Ok(self.table_of(id)?.is_some())
    }

    fn get_node(&self, id: &str) -> Result<Option<NodeRecord>> {
        let Some(table) = self.table_of(id)? else {
            return Ok(None);
        };
        match self.get_raw(&schema::node_key(table, id))? {
            Some(bytes) => Ok(Some(NodeRecord {
                table,
                id: id.to_string(),
                properties: serde_json::from_slice(&bytes)?,
            })),
            None => Ok(None),
        }
    }

    /// Every node in a table. Undecodable records are skipped with a warning.
    fn scan_table(&self, table: NodeTable) -> Result<Vec<NodeRecord>> {
        let mut nodes = Vec::new();
        for (key, value) in self.scan_raw(&schema::table_prefix(table))? {
            let Some(id) = schema::node_id_from_key(&key) else {
                tracing::warn!(table = %table, "Skipping node with unreadable key");
                continue;
            };
            match serde_json::from_slice::<Properties>(&value) {
                Ok(properties) => nodes.push(NodeRecord {
                    table,
                    id,
                    properties,
                }),
                Err(e) => {
                    tracing::warn!(table = %table, id = %id, error = %e, "Failed to decode node. Skipping.");
                }
            }
        }
        Ok(nodes)
    }

    fn count_table(&self, table: NodeTable) -> Result<usize> {
        Ok(self.scan_raw(&schema::table_prefix(table))?.len())
    }

    /// Edges leaving a node, optionally restricted to one relationship family
    fn out_edges(&self, from: &str, kind: Option<RelKind>) -> Result<Vec<EdgeRecord>> {
        let mut edges = Vec::new();
        for (key, value) in self.scan_raw(&schema::out_edges_prefix(from))? {
            let Some((from, rel, to)) = schema::split_edge_key(&key) else {
                continue;
            };
            if kind.is_some_and(|k| k != rel.kind()) {
                continue;
            }
            let props: EdgeProps = bincode::deserialize(&value)?;
            edges.push(EdgeRecord {
                rel,
                from,
                to,
                props,
            });
        }
        Ok(edges)
    }

    /// Edges arriving at a node, optionally restricted to one relationship family
    fn in_edges(&self, to: &str, kind: Option<RelKind>) -> Result<Vec<EdgeRecord>> {
        let mut edges = Vec::new();
        for (key, _) in self.scan_raw(&schema::in_edges_prefix(to))? {
            let Some((to, rel, from)) = schema::split_edge_key(&key) else {
                continue;
            };
            if kind.is_some_and(|k| k != rel.kind()) {
                continue;
            }
            let Some(value) = self.get_raw(&schema::edge_key(&from, &rel, &to))? else {
                tracing::warn!(rel = %rel, from = %from, to = %to, "Reverse index without edge");
                continue;
            };
            let props: EdgeProps = bincode::deserialize(&value)?;
            edges.push(EdgeRecord {
                rel,
                from,
                to,
                props,
            });
        }
        Ok(edges)
    }

    fn edge_exists(&self, from: &str, rel: &RelType, to: &str) -> Result<bool> {
        Ok(self.get_raw(&schema::edge_key(from, rel, to))?.is_some())
    }

    /// Number of edges, optionally of one relationship family
    fn count_edges(&self, kind: Option<RelKind>) -> Result<usize> {
        let keys = self.scan_raw(&schema::all_edges_prefix())?;
        Ok(keys
            .iter()
            .filter_map(|(key, _)| schema::split_edge_key(key))
            .filter(|(_, rel, _)| kind.map_or(true, |k| k == rel.kind()))
            .count())
    }

    /// Run a pattern query. Read-only.
    fn query(&self, pattern: &Pattern) -> Result<Vec<Row>> {
        query::execute(self, pattern)
    }
}

/// Embedded graph database
pub struct GraphStore {
    db: Arc<DB>,
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl GraphStore {
    /// Open (or create) a store at the given directory
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_max_background_jobs(2);
        opts.set_bytes_per_sync(1048576); // 1MB
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let db = DB::open(&opts, path)?;
        schema::ensure_version(&db)?;

        tracing::info!(path = %path.display(), "GraphStore opened");

        Ok(Self {
            db: Arc::new(db),
            path: path.to_path_buf(),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Committed-snapshot reader. Never blocks on the writer.
    pub fn snapshot(&self) -> GraphSnapshot<'_> {
        GraphSnapshot {
            snapshot: self.db.snapshot(),
        }
    }

    /// Begin the write transaction, waiting for any other writer to finish
    pub fn begin(&self) -> GraphTxn<'_> {
        GraphTxn {
            store: self,
            _guard: self.write_lock.lock(),
            overlay: BTreeMap::new(),
            committed: false,
        }
    }

    /// Flush memtables to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Bytes on disk under the database directory
    pub fn disk_usage(&self) -> Result<u64> {
        let mut total = 0;
        for entry in std::fs::read_dir(&self.path)? {
            let metadata = entry?.metadata()?;
            if metadata.is_file() {
                total += metadata.len();
            }
        }
        Ok(total)
    }
}

/// Point-in-time view of committed data
pub struct GraphSnapshot<'a> {
    snapshot: Snapshot<'a>,
}

impl GraphRead for GraphSnapshot<'_> {
    fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.snapshot.get(key)?)
    }

    fn scan_raw(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        let iter = self
            .snapshot
            .iterator(IteratorMode::From(prefix, ScanDirection::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key.to_vec(), value.to_vec()));
        }
        Ok(out)
    }
}

/// Overlay state captured by [`GraphTxn::savepoint`]
#[derive(Debug, Clone)]
pub struct Savepoint {
    overlay: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

/// The single write transaction
///
/// Writes are buffered and visible to this transaction's own reads. Nothing
/// reaches the database until [`GraphTxn::commit`]; dropping the
/// transaction discards everything.
pub struct GraphTxn<'a> {
    store: &'a GraphStore,
    _guard: MutexGuard<'a, ()>,
    /// key -> Some(value) for puts, None for deletes
    overlay: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    committed: bool,
}

impl GraphTxn<'_> {
    fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.overlay.insert(key, Some(value));
    }

    fn del(&mut self, key: Vec<u8>) {
        self.overlay.insert(key, None);
    }

    /// Create a node. Fails if the primary key exists in any table.
    pub fn create_node(&mut self, table: NodeTable, id: &str, properties: Properties) -> Result<()> {
        schema::validate_key_part(id)?;
        if self.node_exists(id)? {
            return Err(MemoryError::DuplicateKey(id.to_string()));
        }
        self.put(schema::index_key(id), table.as_str().as_bytes().to_vec());
        self.put(schema::node_key(table, id), serde_json::to_vec(&properties)?);
        Ok(())
    }

    /// Merge a property patch into an existing node
    pub fn update_node(&mut self, id: &str, patch: Properties) -> Result<NodeRecord> {
        let mut node = self
            .get_node(id)?
            .ok_or_else(|| MemoryError::not_found(id))?;
        for (key, value) in patch {
            node.properties.insert(key, value);
        }
        self.put(
            schema::node_key(node.table, id),
            serde_json::to_vec(&node.properties)?,
        );
        Ok(node)
    }

    /// Overwrite every property of an existing node. Keys absent from
    /// `properties` are removed.
    pub fn replace_node(&mut self, id: &str, properties: Properties) -> Result<NodeRecord> {
        let table = self
            .table_of(id)?
            .ok_or_else(|| MemoryError::not_found(id))?;
        self.put(schema::node_key(table, id), serde_json::to_vec(&properties)?);
        Ok(NodeRecord {
            id: id.to_string(),
            table,
            properties,
        })
    }

    /// Delete a node and every edge touching it
    pub fn delete_node(&mut self, id: &str) -> Result<bool> {
        let Some(table) = self.table_of(id)? else {
            return Ok(false);
        };

        let mut incident = self.out_edges(id, None)?;
        incident.extend(self.in_edges(id, None)?);
        for edge in &incident {
            self.del(schema::edge_key(&edge.from, &edge.rel, &edge.to));
            self.del(schema::reverse_key(&edge.to, &edge.rel, &edge.from));
        }

        self.del(schema::node_key(table, id));
        self.del(schema::index_key(id));
        tracing::debug!(id, table = %table, edges = incident.len(), "Node deleted");
        Ok(true)
    }

    /// Create an edge between two existing nodes
    pub fn create_edge(&mut self, rel: RelType, from: &str, to: &str, props: EdgeProps) -> Result<()> {
        if !self.node_exists(from)? || !self.node_exists(to)? {
            return Err(MemoryError::DanglingReference {
                rel: rel.name(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        if self.edge_exists(from, &rel, to)? {
            return Err(MemoryError::DuplicateKey(format!("{} {} -> {}", rel, from, to)));
        }
        self.put(schema::edge_key(from, &rel, to), bincode::serialize(&props)?);
        self.put(schema::reverse_key(to, &rel, from), Vec::new());
        Ok(())
    }

    /// Write an arbitrary record (audit trail) as part of this transaction
    pub(crate) fn put_raw(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.put(key, value);
    }

    /// Capture the current buffered state
    pub fn savepoint(&self) -> Savepoint {
        Savepoint {
            overlay: self.overlay.clone(),
        }
    }

    /// Discard every write made after the savepoint
    pub fn rollback_to(&mut self, savepoint: Savepoint) {
        self.overlay = savepoint.overlay;
    }

    /// Number of buffered key writes
    pub fn pending_writes(&self) -> usize {
        self.overlay.len()
    }

    /// Apply all buffered writes atomically
    pub fn commit(mut self) -> Result<()> {
        let overlay = std::mem::take(&mut self.overlay);
        if !overlay.is_empty() {
            let mut batch = WriteBatch::default();
            for (key, value) in overlay {
                match value {
                    Some(value) => batch.put(key, value),
                    None => batch.delete(key),
                }
            }
            self.store.db.write(batch).map_err(|e| {
                tracing::error!(error = %e, "Transaction commit failed");
                MemoryError::Storage(e)
            })?;
        }
        self.committed = true;
        Ok(())
    }

    /// Discard all buffered writes
    pub fn rollback(self) {}
}

impl Drop for GraphTxn<'_> {
    fn drop(&mut self) {
        if !self.committed && !self.overlay.is_empty() {
            tracing::debug!(writes = self.overlay.len(), "Rolling back uncommitted transaction");
        }
    }
}

impl GraphRead for GraphTxn<'_> {
    fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.overlay.get(key) {
            Some(value) => Ok(value.clone()),
            None => Ok(self.store.db.get(key)?),
        }
    }

    fn scan_raw(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        let iter = self
            .store
            .db
            .iterator(IteratorMode::From(prefix, ScanDirection::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            merged.insert(key.to_vec(), value.to_vec());
        }

        for (key, value) in self.overlay.range(prefix.to_vec()..) {
            if !key.starts_with(prefix) {
                break;
            }
            match value {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }

        Ok(merged.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn open() -> (GraphStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = GraphStore::open(dir.path()).unwrap();
        (store, dir)
    }

    fn props(value: serde_json::Value) -> Properties {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_create_node_rejects_duplicate_key() {
        let (store, _dir) = open();
        let mut txn = store.begin();
        txn.create_node(NodeTable::SemanticMemory, "a", props(json!({"x": 1})))
            .unwrap();
        let err = txn
            .create_node(NodeTable::EpisodicMemory, "a", Properties::new())
            .unwrap_err();
        assert!(matches!(err, MemoryError::DuplicateKey(ref id) if id == "a"));
        txn.commit().unwrap();

        let snap = store.snapshot();
        let node = snap.get_node("a").unwrap().unwrap();
        assert_eq!(node.table, NodeTable::SemanticMemory);
        assert_eq!(node.properties["x"], json!(1));
    }

    #[test]
    fn test_create_edge_requires_endpoints() {
        let (store, _dir) = open();
        let mut txn = store.begin();
        txn.create_node(NodeTable::SemanticMemory, "a", Properties::new())
            .unwrap();
        let err = txn
            .create_edge(RelType::Supersedes, "a", "missing", EdgeProps::now())
            .unwrap_err();
        assert!(matches!(err, MemoryError::DanglingReference { .. }));
    }

    #[test]
    fn test_edge_not_recreated() {
        let (store, _dir) = open();
        let mut txn = store.begin();
        txn.create_node(NodeTable::SemanticMemory, "a", Properties::new())
            .unwrap();
        txn.create_node(NodeTable::SemanticMemory, "b", Properties::new())
            .unwrap();
        txn.create_edge(RelType::Similarity, "a", "b", EdgeProps::weighted(0.4))
            .unwrap();
        assert!(matches!(
            txn.create_edge(RelType::Similarity, "a", "b", EdgeProps::weighted(0.9)),
            Err(MemoryError::DuplicateKey(_))
        ));
    }

    #[test]
    fn test_dropped_transaction_rolls_back() {
        let (store, _dir) = open();
        {
            let mut txn = store.begin();
            txn.create_node(NodeTable::WorkingMemory, "w", Properties::new())
                .unwrap();
            assert!(txn.node_exists("w").unwrap());
        }
        assert!(!store.snapshot().node_exists("w").unwrap());
    }

    #[test]
    fn test_savepoint_discards_later_writes() {
        let (store, _dir) = open();
        let mut txn = store.begin();
        txn.create_node(NodeTable::EpisodicMemory, "m", Properties::new())
            .unwrap();
        let sp = txn.savepoint();
        txn.create_node(NodeTable::CodeFile, "file:a.rs", Properties::new())
            .unwrap();
        txn.rollback_to(sp);
        txn.commit().unwrap();

        let snap = store.snapshot();
        assert!(snap.node_exists("m").unwrap());
        assert!(!snap.node_exists("file:a.rs").unwrap());
    }

    #[test]
    fn test_snapshot_does_not_see_later_commits() {
        let (store, _dir) = open();
        let before = store.snapshot();
        let mut txn = store.begin();
        txn.create_node(NodeTable::SemanticMemory, "late", Properties::new())
            .unwrap();
        txn.commit().unwrap();

        assert!(!before.node_exists("late").unwrap());
        assert!(store.snapshot().node_exists("late").unwrap());
    }

    #[test]
    fn test_delete_node_removes_incident_edges() {
        let (store, _dir) = open();
        let mut txn = store.begin();
        for id in ["a", "b", "c"] {
            txn.create_node(NodeTable::SemanticMemory, id, Properties::new())
                .unwrap();
        }
        txn.create_edge(RelType::Supersedes, "b", "a", EdgeProps::now())
            .unwrap();
        txn.create_edge(RelType::Supersedes, "c", "b", EdgeProps::now())
            .unwrap();
        txn.commit().unwrap();

        let mut txn = store.begin();
        assert!(txn.delete_node("b").unwrap());
        assert!(!txn.delete_node("b").unwrap());
        txn.commit().unwrap();

        let snap = store.snapshot();
        assert_eq!(snap.count_edges(None).unwrap(), 0);
        assert!(snap.in_edges("a", None).unwrap().is_empty());
        assert!(snap.out_edges("c", None).unwrap().is_empty());
    }

    #[test]
    fn test_in_and_out_edges_filter_by_kind() {
        let (store, _dir) = open();
        let mut txn = store.begin();
        txn.create_node(NodeTable::SemanticMemory, "m", Properties::new())
            .unwrap();
        txn.create_node(NodeTable::CodeFile, "file:src/a.rs", Properties::new())
            .unwrap();
        txn.create_node(NodeTable::SemanticMemory, "n", Properties::new())
            .unwrap();
        txn.create_edge(
            RelType::RelatesToFile(crate::node::MemoryType::Semantic),
            "m",
            "file:src/a.rs",
            EdgeProps::code_link(1.0, schema::LinkContext::MetadataFileMatch),
        )
        .unwrap();
        txn.create_edge(RelType::Similarity, "m", "n", EdgeProps::weighted(0.5))
            .unwrap();
        txn.commit().unwrap();

        let snap = store.snapshot();
        assert_eq!(snap.out_edges("m", None).unwrap().len(), 2);
        let links = snap.out_edges("m", Some(RelKind::FileLink)).unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].props.relevance_score, Some(1.0));

        let incoming = snap.in_edges("n", Some(RelKind::Similarity)).unwrap();
        assert_eq!(incoming.len(), 1);
        assert_eq!(incoming[0].from, "m");
        assert_eq!(incoming[0].props.weight, Some(0.5));
    }

    #[test]
    fn test_update_node_patches_properties() {
        let (store, _dir) = open();
        let mut txn = store.begin();
        txn.create_node(
            NodeTable::SemanticMemory,
            "a",
            props(json!({"content": "x", "confidence": 1.0})),
        )
        .unwrap();
        txn.update_node("a", props(json!({"confidence": 0.5})))
            .unwrap();
        assert!(matches!(
            txn.update_node("zzz", Properties::new()),
            Err(MemoryError::NotFound(_))
        ));
        txn.commit().unwrap();

        let node = store.snapshot().get_node("a").unwrap().unwrap();
        assert_eq!(node.properties["content"], json!("x"));
        assert_eq!(node.properties["confidence"], json!(0.5));
    }

    #[test]
    fn test_replace_node_drops_missing_keys() {
        let (store, _dir) = open();
        let mut txn = store.begin();
        txn.create_node(
            NodeTable::CodeFile,
            "file:src/a.py",
            props(json!({"path": "src/a.py", "language": "python"})),
        )
        .unwrap();
        txn.replace_node("file:src/a.py", props(json!({"path": "src/a.py"})))
            .unwrap();
        assert!(matches!(
            txn.replace_node("zzz", Properties::new()),
            Err(MemoryError::NotFound(_))
        ));
        txn.commit().unwrap();

        let node = store.snapshot().get_node("file:src/a.py").unwrap().unwrap();
        assert_eq!(node.table, NodeTable::CodeFile);
        assert_eq!(node.properties, props(json!({"path": "src/a.py"})));
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = TempDir::new().unwrap();
        {
            let store = GraphStore::open(dir.path()).unwrap();
            let mut txn = store.begin();
            txn.create_node(NodeTable::Function, "fn:#main", Properties::new())
                .unwrap();
            txn.commit().unwrap();
            store.flush().unwrap();
        }
        let store = GraphStore::open(dir.path()).unwrap();
        assert!(store.snapshot().node_exists("fn:#main").unwrap());
        assert!(store.disk_usage().unwrap() > 0);
    }
}
