use serde::{Deserialize, Serialize};

use crate::catalog::StoredTable;

/// Size of a stored table, reported by verbose plans.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStats {
    pub rows: u64,
    pub bytes: u64,
}

impl TableStats {
    pub fn of(table: &StoredTable) -> Self {
        Self {
            rows: table.num_rows() as u64,
            bytes: table.data.get_array_memory_size() as u64,
        }
    }
}
