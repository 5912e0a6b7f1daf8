//! Meta-queries: exhaustive counts and listings
//!
//! "how many projects" cannot be answered by ranking, so these queries skip
//! the keyword path and aggregate over the whole corpus instead.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::graph::{GraphRead, NodeTable, Pattern};
use crate::node::{MemoryEntry, MemoryType};
use crate::storage::MemoryRead;
use crate::text::{self, cached_regex};

static META_RE: OnceLock<Option<Regex>> = OnceLock::new();

/// Words skipped when picking the subject of a meta-query
const FILLER: &[&str] = &[
    "the", "all", "of", "my", "our", "your", "distinct", "different", "unique", "known", "stored",
];

/// Subjects that mean "every memory"
const ALL_MEMORIES: &[&str] = &["memory", "entry", "item", "fact", "thing"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaKind {
    Count,
    List,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaQuery {
    pub kind: MetaKind,
    /// Subject as written ("projects")
    pub subject: String,
}

/// What an aggregate counted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum AggregateSource {
    /// Distinct values of a metadata key
    MetadataKey(String),
    /// Entries of one memory type
    MemoryType(MemoryType),
    /// Every entry in scope
    AllMemories,
}

/// Answer to a meta-query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub subject: String,
    pub source: AggregateSource,
    pub count: usize,
    /// Distinct values, for metadata aggregates
    pub values: Vec<String>,
}

/// Recognise "how many X", "count X", "list all X", "list every X" and
/// "what are all X"
pub fn detect(query: &str) -> Option<MetaQuery> {
    let re = cached_regex(
        &META_RE,
        r"(?i)^\s*(?:(how\s+many|count(?:\s+of)?|number\s+of)|(list\s+all|list\s+every|what\s+are\s+all|show\s+all))\s+(.+?)\s*\??\s*$",
    )?;
    let caps = re.captures(query)?;
    let kind = if caps.get(1).is_some() {
        MetaKind::Count
    } else {
        MetaKind::List
    };
    let subject = caps
        .get(3)?
        .as_str()
        .split(|c: char| !(c.is_alphanumeric() || c == '_' || c == '-'))
        .map(str::to_lowercase)
        .find(|w| !w.is_empty() && !FILLER.contains(&w.as_str()))?;
    Some(MetaQuery { kind, subject })
}

fn tables_for(types: &[MemoryType]) -> Vec<NodeTable> {
    if types.is_empty() {
        NodeTable::memory_tables().collect()
    } else {
        types.iter().map(MemoryType::table).collect()
    }
}

fn subject_matches(candidate: &str, subject: &str, singular: &str) -> bool {
    let candidate = candidate.to_lowercase();
    candidate == subject || candidate == singular || text::singularize(&candidate) == singular
}

/// Resolve a meta-query against the corpus
///
/// Metadata keys are tried first, then memory type names. Returns the
/// aggregate and, for listings, the entries it covers (oldest first). None
/// when the subject names nothing known.
pub fn resolve<R: GraphRead + ?Sized>(
    reader: &R,
    meta: &MetaQuery,
    types: &[MemoryType],
) -> Result<Option<(Aggregate, Vec<MemoryEntry>)>> {
    let singular = text::singularize(&meta.subject);
    let tables = tables_for(types);
    let entries = reader.memories(types)?;

    let key = entries
        .iter()
        .flat_map(|e| e.metadata.keys())
        .filter(|k| !k.contains('.'))
        .find(|k| subject_matches(k, &meta.subject, &singular))
        .cloned();

    if let Some(key) = key {
        let rows = reader.query(&Pattern::DistinctValues {
            tables,
            property: format!("metadata.{}", key),
        })?;
        let values: Vec<String> = rows
            .iter()
            .filter_map(|row| row.get("value").and_then(|v| v.as_str()))
            .map(str::to_string)
            .collect();
        let aggregate = Aggregate {
            subject: meta.subject.clone(),
            source: AggregateSource::MetadataKey(key.clone()),
            count: values.len(),
            values,
        };
        let listed = match meta.kind {
            MetaKind::List => entries
                .into_iter()
                .filter(|e| e.metadata.contains_key(&key))
                .collect(),
            MetaKind::Count => Vec::new(),
        };
        return Ok(Some((aggregate, sorted(listed))));
    }

    let source = if ALL_MEMORIES.contains(&singular.as_str()) {
        AggregateSource::AllMemories
    } else {
        match MemoryType::ALL.into_iter().find(|t| {
            let name = t.as_str().to_lowercase();
            subject_matches(&name, &meta.subject, &singular) || text::partial_match(&name, &singular)
        }) {
            Some(t) if tables.contains(&t.table()) => AggregateSource::MemoryType(t),
            _ => return Ok(None),
        }
    };

    let counted = match &source {
        AggregateSource::MemoryType(t) => vec![t.table()],
        _ => tables,
    };
    let rows = reader.query(&Pattern::Count {
        tables: counted,
        group_by: None,
    })?;
    let count = rows
        .first()
        .and_then(|row| row.get("count"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0) as usize;

    let listed = match meta.kind {
        MetaKind::List => entries
            .into_iter()
            .filter(|e| match &source {
                AggregateSource::MemoryType(t) => e.memory_type == *t,
                _ => true,
            })
            .collect(),
        MetaKind::Count => Vec::new(),
    };

    Ok(Some((
        Aggregate {
            subject: meta.subject.clone(),
            source,
            count,
            values: Vec::new(),
        },
        sorted(listed),
    )))
}

fn sorted(mut entries: Vec<MemoryEntry>) -> Vec<MemoryEntry> {
    entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphStore;
    use crate::storage::MemoryWrite;
    use tempfile::TempDir;

    #[test]
    fn test_detect_meta_queries() {
        let q = detect("How many projects?").unwrap();
        assert_eq!(q.kind, MetaKind::Count);
        assert_eq!(q.subject, "projects");

        let q = detect("list all the procedural memories").unwrap();
        assert_eq!(q.kind, MetaKind::List);
        assert_eq!(q.subject, "procedural");

        assert_eq!(detect("what are all our services").unwrap().subject, "services");
        assert_eq!(detect("count of distinct owners").unwrap().subject, "owners");
        assert!(detect("how do I deploy").is_none());
        assert!(detect("database decision").is_none());
    }

    fn store_with(entries: &[MemoryEntry]) -> (GraphStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = GraphStore::open(dir.path()).unwrap();
        let mut txn = store.begin();
        for e in entries {
            txn.insert_memory(e).unwrap();
        }
        txn.commit().unwrap();
        (store, dir)
    }

    fn tagged(project: &str, memory_type: MemoryType) -> MemoryEntry {
        MemoryEntry::builder()
            .memory_type(memory_type)
            .content(format!("Status update for {}", project))
            .meta("project", project)
            .build()
            .unwrap()
    }

    #[test]
    fn test_counts_distinct_metadata_values() {
        let entries = vec![
            tagged("atlas", MemoryType::Semantic),
            tagged("borealis", MemoryType::Semantic),
            tagged("atlas", MemoryType::Episodic),
            tagged("comet", MemoryType::Semantic),
        ];
        let (store, _dir) = store_with(&entries);
        let snap = store.snapshot();

        let meta = detect("how many projects").unwrap();
        let (agg, listed) = resolve(&snap, &meta, &[]).unwrap().unwrap();
        assert_eq!(agg.count, 3);
        assert_eq!(agg.values, vec!["atlas", "borealis", "comet"]);
        assert_eq!(agg.source, AggregateSource::MetadataKey("project".into()));
        assert!(listed.is_empty());

        let meta = detect("list all projects").unwrap();
        let (_, listed) = resolve(&snap, &meta, &[]).unwrap().unwrap();
        assert_eq!(listed.len(), 4);
    }

    #[test]
    fn test_counts_memory_types() {
        let entries = vec![
            tagged("atlas", MemoryType::Procedural),
            tagged("atlas", MemoryType::Procedural),
            tagged("atlas", MemoryType::Episodic),
        ];
        let (store, _dir) = store_with(&entries);
        let snap = store.snapshot();

        let meta = detect("how many procedural memories").unwrap();
        let (agg, _) = resolve(&snap, &meta, &[]).unwrap().unwrap();
        assert_eq!(agg.source, AggregateSource::MemoryType(MemoryType::Procedural));
        assert_eq!(agg.count, 2);

        let meta = detect("how many episodes").unwrap();
        let (agg, _) = resolve(&snap, &meta, &[]).unwrap().unwrap();
        assert_eq!(agg.count, 1);

        let meta = detect("how many memories").unwrap();
        let (agg, _) = resolve(&snap, &meta, &[]).unwrap().unwrap();
        assert_eq!(agg.count, 3);

        let meta = detect("how many unicorns").unwrap();
        assert!(resolve(&snap, &meta, &[]).unwrap().is_none());
    }
}
