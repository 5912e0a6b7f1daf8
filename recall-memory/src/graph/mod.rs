//! Embedded graph store
//!
//! Typed node tables and relationships persisted in RocksDB, with
//! transactional writes and pattern queries.

pub mod query;
pub mod schema;
mod store;

pub use query::{Direction, Pattern, Row};
pub use schema::{EdgeProps, LinkContext, NodeTable, RelKind, RelType};
pub use store::{
    EdgeRecord, GraphRead, GraphSnapshot, GraphStore, GraphTxn, NodeRecord, Properties, Savepoint,
};
