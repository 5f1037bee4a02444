//! In-process reference engine for the `vq` client.
//!
//! Architecture role:
//! - implements [`vq_execution::Transport`] without any external service
//! - keeps tables as Arrow batches keyed by database URI
//! - evaluates filters, flat vector search, BM25 full-text search and merge-insert
//!
//! Key modules:
//! - [`catalog`]
//! - [`engine`]
//! - [`filter`]
//! - [`search`]

pub mod catalog;
pub mod engine;
pub mod explain;
pub mod filter;
pub mod merge;
pub mod search;
pub mod stats;

pub use catalog::{Database, StoredTable};
pub use engine::MemoryEngine;
pub use filter::Predicate;
pub use stats::TableStats;
