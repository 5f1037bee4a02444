//! Typed identifiers handed out by the engine.
//!
//! Handles are opaque capability tokens: the client never interprets the
//! number, it only echoes it back on later calls.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Engine-issued connection handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionHandle(
    /// Raw handle value.
    pub i64,
);

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Engine-issued handle for one open table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableHandle(
    /// Raw handle value.
    pub i64,
);

impl fmt::Display for TableHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "table#{}", self.0)
    }
}

/// Row identifier column attached when a query asks for row ids.
pub const ROW_ID_COLUMN: &str = "_rowid";
/// Distance column attached to vector search results.
pub const DISTANCE_COLUMN: &str = "_distance";
/// Score column attached to full-text search results.
pub const SCORE_COLUMN: &str = "_score";
/// Fused score column attached by rerankers.
pub const RELEVANCE_SCORE_COLUMN: &str = "_relevance_score";
/// Source vector index for concatenated multi-vector results.
pub const QUERY_INDEX_COLUMN: &str = "query_index";
