//! Recall Memory
//!
//! Embedded memory engine for AI agents. Memories of five kinds (working,
//! episodic, semantic, procedural, prospective) live in a small property
//! graph on RocksDB next to the code files and functions they mention.
//!
//! ## Features
//!
//! - **Consensus gate** - Only content reviewers agree is worth keeping is stored
//! - **Supersession** - Newer facts replace older ones about the same subject, with history kept
//! - **Retrieval** - BM25 seeding, graph expansion, near-duplicate removal and token budgets
//! - **Meta-queries** - "how many projects" is answered by counting, not ranking
//! - **Code links** - Memories are tied to the files and functions they reference
//!
//! ## Example
//!
//! ```ignore
//! use recall_memory::{MemoryConfig, MemoryCoordinator, MemoryType, RetrievalRequest, StoreContext};
//!
//! let memory = MemoryCoordinator::new(MemoryConfig::default());
//! memory.initialize().await?;
//!
//! let result = memory
//!     .store(
//!         "We chose PostgreSQL over MySQL for JSONB support",
//!         MemoryType::Episodic,
//!         None,
//!         StoreContext::session("s1").scores([8.0, 9.0]),
//!     )
//!     .await?;
//!
//! let found = memory
//!     .retrieve(RetrievalRequest::new("database decision").max_tokens(500))
//!     .await?;
//! ```

pub mod audit;
pub mod config;
pub mod consensus;
pub mod coordinator;
pub mod error;
pub mod graph;
pub mod linker;
pub mod node;
pub mod search;
pub mod session;
pub mod storage;
pub mod temporal;
pub mod text;

// Re-exports for convenience
pub use audit::{AuditRecord, Decision};
pub use config::MemoryConfig;
pub use consensus::{ConsensusGate, GateConfig, GateDecision, HeuristicScorer, ScoreProvider, ScoringContext};
pub use coordinator::{MemoryCoordinator, MemoryStats, StoreContext, StoreResult, UpsertSummary};
pub use error::{MemoryError, Result};
pub use graph::{GraphRead, GraphStore};
pub use linker::{CodeLinker, LinkReport, LinkerConfig};
pub use node::{CodeFile, Function, MemoryEntry, MemoryEntryBuilder, MemoryId, MemoryType, Metadata};
pub use search::{
    Aggregate, AggregateSource, MatchReason, Retrieval, RetrievalConfig, RetrievalEngine,
    RetrievalRequest, SearchResult,
};
pub use session::ConsolidationReport;
pub use temporal::{SupersessionConfig, SupersessionManager, TimelineEntry};
