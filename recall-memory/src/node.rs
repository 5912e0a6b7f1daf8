//! Memory entry types and builders
//!
//! Core types for representing an agent's memories and the code entities
//! they can be linked to.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::graph::NodeTable;
use crate::text;

/// Open key-value metadata attached to a memory
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Maximum length of a derived title
const TITLE_MAX_CHARS: usize = 72;

/// Unique identifier for memory entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MemoryId(pub Uuid);

impl MemoryId {
    /// Create a new random MemoryId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from existing UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for MemoryId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MemoryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for MemoryId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Cognitive role of a memory. Mutually exclusive per entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MemoryType {
    /// Things that happened: decisions, sessions, events
    Episodic,
    /// Facts about the world or project that may evolve
    Semantic,
    /// How to do things
    Procedural,
    /// Things to do later
    Prospective,
    /// Transient per-session context
    Working,
}

impl MemoryType {
    pub const ALL: [MemoryType; 5] = [
        MemoryType::Episodic,
        MemoryType::Semantic,
        MemoryType::Procedural,
        MemoryType::Prospective,
        MemoryType::Working,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Episodic => "Episodic",
            Self::Semantic => "Semantic",
            Self::Procedural => "Procedural",
            Self::Prospective => "Prospective",
            Self::Working => "Working",
        }
    }

    /// Node table holding entries of this type
    pub fn table(&self) -> NodeTable {
        match self {
            Self::Episodic => NodeTable::EpisodicMemory,
            Self::Semantic => NodeTable::SemanticMemory,
            Self::Procedural => NodeTable::ProceduralMemory,
            Self::Prospective => NodeTable::ProspectiveMemory,
            Self::Working => NodeTable::WorkingMemory,
        }
    }

    /// Upper-case suffix used in per-type relationship names
    pub fn rel_suffix(&self) -> &'static str {
        match self {
            Self::Episodic => "EPISODIC",
            Self::Semantic => "SEMANTIC",
            Self::Procedural => "PROCEDURAL",
            Self::Prospective => "PROSPECTIVE",
            Self::Working => "WORKING",
        }
    }

    pub fn from_rel_suffix(suffix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.rel_suffix() == suffix)
    }
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MemoryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_lowercase();
        let name = lowered.strip_suffix("memory").unwrap_or(&lowered).trim();
        match name {
            "episodic" => Ok(Self::Episodic),
            "semantic" => Ok(Self::Semantic),
            "procedural" => Ok(Self::Procedural),
            "prospective" => Ok(Self::Prospective),
            "working" => Ok(Self::Working),
            _ => Err(format!("Unknown memory type: {}", s)),
        }
    }
}

/// The atomic unit of stored knowledge
///
/// Once stored, only `accessed_at`, `confidence` and `superseded_by` ever
/// change. Corrections are new entries that supersede the old one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: MemoryId,
    pub memory_type: MemoryType,
    pub session_id: String,
    pub agent_id: String,
    /// Short label used in indexing
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub metadata: Metadata,
    /// Confidence in [0, 1]
    pub confidence: f32,
    pub created_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<MemoryId>,
}

impl MemoryEntry {
    /// Create a new builder for MemoryEntry
    pub fn builder() -> MemoryEntryBuilder {
        MemoryEntryBuilder::new()
    }

    pub fn is_superseded(&self) -> bool {
        self.superseded_by.is_some()
    }

    /// String value of a metadata key, if it holds a string
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    /// Text searched by keyword retrieval: title, content and metadata
    pub fn searchable_text(&self) -> String {
        let mut text = format!("{} {}", self.title, self.content);
        for (key, value) in &self.metadata {
            text.push(' ');
            text.push_str(key);
            text.push(' ');
            text.push_str(&metadata_value_text(value));
        }
        text
    }

    /// Estimated token cost of returning this entry
    pub fn token_count(&self) -> usize {
        text::estimate_tokens(&self.title) + text::estimate_tokens(&self.content)
    }
}

/// Flatten a metadata value into plain text
pub fn metadata_value_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(items) => items
            .iter()
            .map(metadata_value_text)
            .collect::<Vec<_>>()
            .join(" "),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Derive a short title: explicit `title` metadata, else the first line of
/// the content cut at a word boundary.
pub fn derive_title(content: &str, metadata: &Metadata) -> String {
    if let Some(title) = metadata.get("title").and_then(|v| v.as_str()) {
        if !title.trim().is_empty() {
            return title.trim().to_string();
        }
    }

    let first_line = content.lines().map(str::trim).find(|l| !l.is_empty());
    let first_line = first_line.unwrap_or("");
    if first_line.chars().count() <= TITLE_MAX_CHARS {
        return first_line.to_string();
    }

    let mut title = String::new();
    for word in first_line.split_whitespace() {
        if title.chars().count() + word.chars().count() + 1 > TITLE_MAX_CHARS {
            break;
        }
        if !title.is_empty() {
            title.push(' ');
        }
        title.push_str(word);
    }
    if title.is_empty() {
        title = first_line.chars().take(TITLE_MAX_CHARS).collect();
    }
    title
}

/// Builder for MemoryEntry with fluent API
#[derive(Debug, Default)]
pub struct MemoryEntryBuilder {
    id: Option<MemoryId>,
    memory_type: Option<MemoryType>,
    session_id: Option<String>,
    agent_id: Option<String>,
    title: Option<String>,
    content: Option<String>,
    metadata: Metadata,
    confidence: f32,
    created_at: Option<DateTime<Utc>>,
}

impl MemoryEntryBuilder {
    pub fn new() -> Self {
        Self {
            confidence: 1.0,
            ..Default::default()
        }
    }

    /// Set the memory ID (auto-generated if not set)
    pub fn id(mut self, id: MemoryId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn memory_type(mut self, memory_type: MemoryType) -> Self {
        self.memory_type = Some(memory_type);
        self
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Set the title (derived from content if not set)
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    /// Add a metadata entry
    pub fn meta(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Replace all metadata
    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Set confidence score
    pub fn confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    /// Backdate the entry (mostly useful for imports and tests)
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    /// Build the MemoryEntry
    pub fn build(self) -> Result<MemoryEntry, MemoryEntryBuilderError> {
        let memory_type = self
            .memory_type
            .ok_or(MemoryEntryBuilderError::MissingType)?;
        let content = self.content.ok_or(MemoryEntryBuilderError::MissingContent)?;
        if content.trim().is_empty() {
            return Err(MemoryEntryBuilderError::EmptyContent);
        }

        let title = match self.title {
            Some(t) if !t.trim().is_empty() => t,
            _ => derive_title(&content, &self.metadata),
        };
        let created_at = self.created_at.unwrap_or_else(Utc::now);

        Ok(MemoryEntry {
            id: self.id.unwrap_or_default(),
            memory_type,
            session_id: self.session_id.unwrap_or_else(|| "default".to_string()),
            agent_id: self.agent_id.unwrap_or_else(|| "agent".to_string()),
            title,
            content,
            metadata: self.metadata,
            confidence: self.confidence,
            created_at,
            accessed_at: created_at,
            superseded_by: None,
        })
    }
}

/// Errors that can occur when building a MemoryEntry
#[derive(Debug, thiserror::Error)]
pub enum MemoryEntryBuilderError {
    #[error("Missing required field: memory_type")]
    MissingType,
    #[error("Missing required field: content")]
    MissingContent,
    #[error("Content is empty")]
    EmptyContent,
}

/// A source file known to the code graph. Produced by an external parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeFile {
    pub id: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl CodeFile {
    pub fn new(path: impl Into<String>) -> Self {
        let path = normalize_path(&path.into());
        Self {
            id: format!("file:{}", path),
            path,
            language: None,
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }
}

/// A function known to the code graph. Produced by an external parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

impl Function {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: format!("fn:#{}", name),
            name,
            file_path: None,
            line: None,
        }
    }

    pub fn in_file(mut self, path: impl Into<String>) -> Self {
        let path = normalize_path(&path.into());
        self.id = format!("fn:{}#{}", path, self.name);
        self.file_path = Some(path);
        self
    }

    pub fn at_line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }
}

/// Normalise a source path for comparison: forward slashes, no leading `./`
pub fn normalize_path(path: &str) -> String {
    let unified = path.trim().replace('\\', "/");
    let mut rest = unified.as_str();
    while let Some(stripped) = rest.strip_prefix("./") {
        rest = stripped;
    }
    rest.to_string()
}
