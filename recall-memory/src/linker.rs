//! Code linker: attaches memories to source files and functions
//!
//! Two rules. A path-like metadata value links to every known `CodeFile`
//! whose path contains it or is contained by it. A known `Function` name
//! appearing in the content on identifier boundaries links to that
//! function. Existing edges are never recreated.
//!
//! Linking is additive. Callers run it after a savepoint and roll back to
//! that savepoint on error, so a linker failure never costs the memory.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, Result};
use crate::graph::{EdgeProps, GraphRead, GraphTxn, LinkContext, RelType};
use crate::node::{normalize_path, MemoryEntry, Metadata};
use crate::storage::MemoryRead;
use crate::text::cached_regex;

/// Metadata keys whose values are always treated as paths
const PATH_KEYS: &[&str] = &["file", "files", "path", "file_path", "filepath", "source_file"];

static PATH_LIKE_RE: OnceLock<Option<Regex>> = OnceLock::new();

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkerConfig {
    /// Shorter function names are never matched in content
    pub min_function_name_len: usize,
    /// Relevance of a metadata file match
    pub file_relevance: f32,
    /// Relevance of a content name match
    pub function_relevance: f32,
}

impl Default for LinkerConfig {
    fn default() -> Self {
        Self {
            min_function_name_len: 4,
            file_relevance: 1.0,
            function_relevance: 0.8,
        }
    }
}

/// Edges created for one memory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkReport {
    pub file_links: usize,
    pub function_links: usize,
    pub skipped_existing: usize,
}

impl LinkReport {
    pub fn total(&self) -> usize {
        self.file_links + self.function_links
    }
}

fn validate_path(raw: &str) -> Result<String> {
    if raw.trim().is_empty() || raw.chars().any(char::is_control) {
        return Err(MemoryError::invalid_path(raw.escape_debug().to_string()));
    }
    Ok(normalize_path(raw))
}

fn looks_like_path(value: &str) -> bool {
    cached_regex(&PATH_LIKE_RE, r"^[^\s]*/[^\s/]+\.[A-Za-z0-9]{1,8}$")
        .is_some_and(|re| re.is_match(value.trim()))
}

/// Path-like values in the metadata, normalised and deduplicated
///
/// Fails with `InvalidPath` on a blank path or one containing control
/// characters.
pub fn extract_paths(metadata: &Metadata) -> Result<Vec<String>> {
    let mut paths = BTreeSet::new();
    for (key, value) in metadata {
        let explicit = PATH_KEYS.contains(&key.to_ascii_lowercase().as_str());
        let values: Vec<&str> = match value {
            serde_json::Value::String(s) => vec![s.as_str()],
            serde_json::Value::Array(items) if explicit => {
                items.iter().filter_map(|v| v.as_str()).collect()
            }
            _ => continue,
        };
        for raw in values {
            if explicit || looks_like_path(raw) {
                paths.insert(validate_path(raw)?);
            }
        }
    }
    Ok(paths.into_iter().collect())
}

/// Whether `name` occurs in `haystack` as a whole identifier
pub fn contains_identifier(haystack: &str, name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    let is_ident = |c: char| c.is_alphanumeric() || c == '_';
    haystack.match_indices(name).any(|(start, _)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + name.len()..].chars().next();
        !before.is_some_and(is_ident) && !after.is_some_and(is_ident)
    })
}

pub struct CodeLinker {
    config: LinkerConfig,
}

impl CodeLinker {
    pub fn new(config: LinkerConfig) -> Self {
        Self { config }
    }

    /// Create file and function links for a stored memory
    pub fn link(&self, txn: &mut GraphTxn<'_>, entry: &MemoryEntry) -> Result<LinkReport> {
        let mut report = LinkReport::default();
        let memory_key = entry.id.to_string();

        let paths = extract_paths(&entry.metadata)?;
        if !paths.is_empty() {
            let rel = RelType::RelatesToFile(entry.memory_type);
            for file in txn.code_files()? {
                if file.path.is_empty() {
                    continue;
                }
                let matched = paths
                    .iter()
                    .any(|p| file.path.contains(p.as_str()) || p.contains(file.path.as_str()));
                if !matched {
                    continue;
                }
                let props = EdgeProps::code_link(
                    self.config.file_relevance,
                    LinkContext::MetadataFileMatch,
                );
                if Self::create_link(txn, rel, &memory_key, &file.id, props, &mut report)? {
                    report.file_links += 1;
                }
            }
        }

        let rel = RelType::RelatesToFunction(entry.memory_type);
        for function in txn.functions()? {
            if function.name.chars().count() < self.config.min_function_name_len {
                continue;
            }
            if !contains_identifier(&entry.content, &function.name) {
                continue;
            }
            let props = EdgeProps::code_link(
                self.config.function_relevance,
                LinkContext::ContentNameMatch,
            );
            if Self::create_link(txn, rel, &memory_key, &function.id, props, &mut report)? {
                report.function_links += 1;
            }
        }

        if report.total() > 0 {
            tracing::debug!(
                memory_id = %entry.id,
                files = report.file_links,
                functions = report.function_links,
                "Code links created"
            );
        }
        Ok(report)
    }

    /// Returns whether a new edge was written
    fn create_link(
        txn: &mut GraphTxn<'_>,
        rel: RelType,
        from: &str,
        to: &str,
        props: EdgeProps,
        report: &mut LinkReport,
    ) -> Result<bool> {
        if txn.edge_exists(from, &rel, to)? {
            report.skipped_existing += 1;
            return Ok(false);
        }
        match txn.create_edge(rel, from, to, props) {
            Ok(()) => Ok(true),
            Err(MemoryError::DanglingReference { rel, from, to }) => {
                tracing::warn!(rel = %rel, from = %from, to = %to, "Skipping link to missing node");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}
