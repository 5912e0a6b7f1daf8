//! On-disk schema: node tables, relationship types and key layout
//!
//! Everything lives in one RocksDB keyspace. Key families are separated by
//! a NUL byte, which is why identifiers may never contain one:
//!
//! | prefix | layout                      | value                |
//! |--------|-----------------------------|----------------------|
//! | `n`    | `n␀<table>␀<id>`            | node properties JSON |
//! | `i`    | `i␀<id>`                    | table name           |
//! | `e`    | `e␀<from>␀<REL>␀<to>`       | edge props (bincode) |
//! | `r`    | `r␀<to>␀<REL>␀<from>`       | empty                |
//! | `a`    | `a␀<session>␀<nanos>␀<id>`  | audit record JSON    |

use chrono::{DateTime, Utc};
use rocksdb::DB;
use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, Result};
use crate::node::MemoryType;

/// Database version stored in metadata
pub const DB_VERSION_KEY: &[u8] = b"_db_version";
pub const CURRENT_VERSION: u32 = 1;

const SEP: u8 = 0;

/// Node tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeTable {
    EpisodicMemory,
    SemanticMemory,
    ProceduralMemory,
    ProspectiveMemory,
    WorkingMemory,
    CodeFile,
    Function,
}

impl NodeTable {
    pub const ALL: [NodeTable; 7] = [
        NodeTable::EpisodicMemory,
        NodeTable::SemanticMemory,
        NodeTable::ProceduralMemory,
        NodeTable::ProspectiveMemory,
        NodeTable::WorkingMemory,
        NodeTable::CodeFile,
        NodeTable::Function,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EpisodicMemory => "EpisodicMemory",
            Self::SemanticMemory => "SemanticMemory",
            Self::ProceduralMemory => "ProceduralMemory",
            Self::ProspectiveMemory => "ProspectiveMemory",
            Self::WorkingMemory => "WorkingMemory",
            Self::CodeFile => "CodeFile",
            Self::Function => "Function",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }

    /// Memory type stored in this table, None for code entity tables
    pub fn memory_type(&self) -> Option<MemoryType> {
        match self {
            Self::EpisodicMemory => Some(MemoryType::Episodic),
            Self::SemanticMemory => Some(MemoryType::Semantic),
            Self::ProceduralMemory => Some(MemoryType::Procedural),
            Self::ProspectiveMemory => Some(MemoryType::Prospective),
            Self::WorkingMemory => Some(MemoryType::Working),
            Self::CodeFile | Self::Function => None,
        }
    }

    pub fn is_memory(&self) -> bool {
        self.memory_type().is_some()
    }

    pub fn memory_tables() -> impl Iterator<Item = NodeTable> {
        Self::ALL.into_iter().filter(|t| t.is_memory())
    }
}

impl std::fmt::Display for NodeTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Directed, typed relationship
///
/// Code links carry the memory type in their name so type-specific relevance
/// can be queried directly (`RELATES_TO_FILE_SEMANTIC`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelType {
    /// newer -> older
    Supersedes,
    /// weighted, traversed in both directions
    Similarity,
    RelatesToFile(MemoryType),
    RelatesToFunction(MemoryType),
}

/// Relationship family, ignoring the memory-type suffix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelKind {
    Supersedes,
    Similarity,
    FileLink,
    FunctionLink,
}

impl RelType {
    pub fn kind(&self) -> RelKind {
        match self {
            Self::Supersedes => RelKind::Supersedes,
            Self::Similarity => RelKind::Similarity,
            Self::RelatesToFile(_) => RelKind::FileLink,
            Self::RelatesToFunction(_) => RelKind::FunctionLink,
        }
    }

    pub fn name(&self) -> String {
        match self {
            Self::Supersedes => "SUPERSEDES".to_string(),
            Self::Similarity => "SIMILARITY".to_string(),
            Self::RelatesToFile(t) => format!("RELATES_TO_FILE_{}", t.rel_suffix()),
            Self::RelatesToFunction(t) => format!("RELATES_TO_FUNCTION_{}", t.rel_suffix()),
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "SUPERSEDES" => Some(Self::Supersedes),
            "SIMILARITY" => Some(Self::Similarity),
            _ => {
                if let Some(suffix) = name.strip_prefix("RELATES_TO_FILE_") {
                    MemoryType::from_rel_suffix(suffix).map(Self::RelatesToFile)
                } else if let Some(suffix) = name.strip_prefix("RELATES_TO_FUNCTION_") {
                    MemoryType::from_rel_suffix(suffix).map(Self::RelatesToFunction)
                } else {
                    None
                }
            }
        }
    }
}

impl std::fmt::Display for RelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name())
    }
}

/// How a code link was established
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkContext {
    MetadataFileMatch,
    ContentNameMatch,
}

/// Properties stored on an edge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeProps {
    /// Similarity weight (SIMILARITY edges)
    pub weight: Option<f32>,
    /// Relevance in [0, 1] (code links)
    pub relevance_score: Option<f32>,
    pub context: Option<LinkContext>,
    pub timestamp: DateTime<Utc>,
}

impl EdgeProps {
    pub fn now() -> Self {
        Self {
            weight: None,
            relevance_score: None,
            context: None,
            timestamp: Utc::now(),
        }
    }

    pub fn weighted(weight: f32) -> Self {
        Self {
            weight: Some(weight.clamp(0.0, 1.0)),
            ..Self::now()
        }
    }

    pub fn code_link(relevance: f32, context: LinkContext) -> Self {
        Self {
            relevance_score: Some(relevance.clamp(0.0, 1.0)),
            context: Some(context),
            ..Self::now()
        }
    }

    /// Traversal weight: similarity weight, else relevance, else 1.0
    pub fn traversal_weight(&self) -> f32 {
        self.weight.or(self.relevance_score).unwrap_or(1.0)
    }
}

/// Reject identifiers that cannot be embedded in a key
pub fn validate_key_part(part: &str) -> Result<()> {
    if part.is_empty() || part.as_bytes().contains(&SEP) {
        return Err(MemoryError::InvalidKey(part.to_string()));
    }
    Ok(())
}

fn join(parts: &[&[u8]]) -> Vec<u8> {
    let len = parts.iter().map(|p| p.len() + 1).sum();
    let mut key = Vec::with_capacity(len);
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            key.push(SEP);
        }
        key.extend_from_slice(part);
    }
    key
}

/// Prefix with a trailing separator, for scans
fn prefix(parts: &[&[u8]]) -> Vec<u8> {
    let mut key = join(parts);
    key.push(SEP);
    key
}

pub fn node_key(table: NodeTable, id: &str) -> Vec<u8> {
    join(&[b"n", table.as_str().as_bytes(), id.as_bytes()])
}

pub fn table_prefix(table: NodeTable) -> Vec<u8> {
    prefix(&[b"n", table.as_str().as_bytes()])
}

pub fn index_key(id: &str) -> Vec<u8> {
    join(&[b"i", id.as_bytes()])
}

pub fn edge_key(from: &str, rel: &RelType, to: &str) -> Vec<u8> {
    join(&[b"e", from.as_bytes(), rel.name().as_bytes(), to.as_bytes()])
}

pub fn reverse_key(to: &str, rel: &RelType, from: &str) -> Vec<u8> {
    join(&[b"r", to.as_bytes(), rel.name().as_bytes(), from.as_bytes()])
}

pub fn out_edges_prefix(from: &str) -> Vec<u8> {
    prefix(&[b"e", from.as_bytes()])
}

pub fn in_edges_prefix(to: &str) -> Vec<u8> {
    prefix(&[b"r", to.as_bytes()])
}

pub fn all_edges_prefix() -> Vec<u8> {
    vec![b'e', SEP]
}

pub fn audit_key(session_id: &str, at: DateTime<Utc>, record_id: &str) -> Vec<u8> {
    let nanos = at.timestamp_nanos_opt().unwrap_or(i64::MAX).max(0);
    let stamp = format!("{:020}", nanos);
    join(&[b"a", session_id.as_bytes(), stamp.as_bytes(), record_id.as_bytes()])
}

pub fn audit_prefix(session_id: &str) -> Vec<u8> {
    prefix(&[b"a", session_id.as_bytes()])
}

/// Split an edge or reverse key into its three id/rel parts
pub fn split_edge_key(key: &[u8]) -> Option<(String, RelType, String)> {
    let mut parts = key.split(|b| *b == SEP);
    let family = parts.next()?;
    if family != b"e" && family != b"r" {
        return None;
    }
    let first = String::from_utf8(parts.next()?.to_vec()).ok()?;
    let rel = RelType::parse(std::str::from_utf8(parts.next()?).ok()?)?;
    let second = String::from_utf8(parts.next()?.to_vec()).ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((first, rel, second))
}

/// Extract the id from a node key
pub fn node_id_from_key(key: &[u8]) -> Option<String> {
    let id = key.split(|b| *b == SEP).nth(2)?;
    String::from_utf8(id.to_vec()).ok()
}

/// Check the on-disk version, stamping fresh databases
///
/// A database written by a newer release is refused rather than read with
/// the wrong layout.
pub fn ensure_version(db: &DB) -> Result<u32> {
    match db.get(DB_VERSION_KEY)? {
        Some(bytes) => {
            let bytes_slice: &[u8] = bytes.as_ref();
            let version_bytes: [u8; 4] = bytes_slice
                .try_into()
                .map_err(|_| MemoryError::schema("Invalid version format"))?;
            let version = u32::from_le_bytes(version_bytes);
            if version > CURRENT_VERSION {
                return Err(MemoryError::schema(format!(
                    "Database version {} is newer than supported version {}",
                    version, CURRENT_VERSION
                )));
            }
            tracing::debug!(version, "Database version checked");
            Ok(version)
        }
        None => {
            db.put(DB_VERSION_KEY, CURRENT_VERSION.to_le_bytes())?;
            tracing::info!(version = CURRENT_VERSION, "Initialized new database");
            Ok(CURRENT_VERSION)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rocksdb::Options;
    use tempfile::TempDir;

    #[test]
    fn test_rel_type_names_roundtrip() {
        let rels = [
            RelType::Supersedes,
            RelType::Similarity,
            RelType::RelatesToFile(MemoryType::Semantic),
            RelType::RelatesToFunction(MemoryType::Procedural),
        ];
        for rel in rels {
            assert_eq!(RelType::parse(&rel.name()), Some(rel));
        }
        assert_eq!(
            RelType::RelatesToFile(MemoryType::Episodic).name(),
            "RELATES_TO_FILE_EPISODIC"
        );
        assert_eq!(RelType::parse("RELATES_TO_FILE_DREAM"), None);
    }

    #[test]
    fn test_edge_key_split() {
        let rel = RelType::RelatesToFunction(MemoryType::Working);
        let key = edge_key("mem-1", &rel, "fn:src/a.rs#run");
        let (from, parsed, to) = split_edge_key(&key).unwrap();
        assert_eq!(from, "mem-1");
        assert_eq!(parsed, rel);
        assert_eq!(to, "fn:src/a.rs#run");
        assert!(key.starts_with(&out_edges_prefix("mem-1")));
        assert!(!key.starts_with(&out_edges_prefix("mem")));
    }

    #[test]
    fn test_node_key_id() {
        let key = node_key(NodeTable::CodeFile, "file:src/lib.rs");
        assert!(key.starts_with(&table_prefix(NodeTable::CodeFile)));
        assert_eq!(node_id_from_key(&key).as_deref(), Some("file:src/lib.rs"));
    }

    #[test]
    fn test_validate_key_part() {
        assert!(validate_key_part("abc").is_ok());
        assert!(validate_key_part("").is_err());
        assert!(validate_key_part("a\0b").is_err());
    }

    #[test]
    fn test_audit_keys_sort_chronologically() {
        let early = Utc::now();
        let late = early + chrono::Duration::milliseconds(5);
        assert!(audit_key("s", early, "x") < audit_key("s", late, "a"));
        assert!(audit_key("s", early, "x").starts_with(&audit_prefix("s")));
    }

    #[test]
    fn test_version_stamp_and_refuse_newer() {
        let temp_dir = TempDir::new().unwrap();
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, temp_dir.path()).unwrap();

        assert_eq!(ensure_version(&db).unwrap(), CURRENT_VERSION);
        assert_eq!(ensure_version(&db).unwrap(), CURRENT_VERSION);

        db.put(DB_VERSION_KEY, (CURRENT_VERSION + 1).to_le_bytes())
            .unwrap();
        assert!(matches!(ensure_version(&db), Err(MemoryError::Schema(_))));
    }
}
