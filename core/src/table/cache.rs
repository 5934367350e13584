//! Shared cache of decoded cells

use crate::table::value::Value;
use crate::types::{RowId, TableId};
use dashmap::DashMap;

type CellKey = (TableId, RowId, usize);

/// Decoded cell values keyed by table, row and column.
///
/// Entries are only ever inserted for rows in a committed or uncommitted
/// state, whose records never change in place; a recycled slot must be
/// invalidated before it is reused.
pub struct CellCache {
    cells: DashMap<CellKey, Value>,
    capacity: usize,
}

impl CellCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            cells: DashMap::with_capacity(capacity.min(4096)),
            capacity,
        }
    }

    pub fn get(&self, table: TableId, row: RowId, column: usize) -> Option<Value> {
        self.cells.get(&(table, row, column)).map(|v| v.clone())
    }

    pub fn put(&self, table: TableId, row: RowId, column: usize, value: Value) {
        if self.capacity == 0 {
            return;
        }
        if self.cells.len() >= self.capacity {
            self.evict(self.capacity / 8 + 1);
        }
        self.cells.insert((table, row, column), value);
    }

    /// Forget every cell of one row
    pub fn invalidate_row(&self, table: TableId, row: RowId, columns: usize) {
        for column in 0..columns {
            self.cells.remove(&(table, row, column));
        }
    }

    /// Forget every cell of one table
    pub fn invalidate_table(&self, table: TableId) {
        self.cells.retain(|key, _| key.0 != table);
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    fn evict(&self, count: usize) {
        let victims: Vec<CellKey> = self
            .cells
            .iter()
            .take(count)
            .map(|entry| *entry.key())
            .collect();
        for key in victims {
            self.cells.remove(&key);
        }
    }
}
