//! Versioned index snapshots
//!
//! Every table source keeps a chain of immutable [`IndexSnapshot`]s ordered
//! by commit id. A transaction checks out the latest one as an [`IndexSet`]
//! and mutates a private copy; committing folds the transaction's row
//! changes into a new snapshot derived from whatever is latest at that time.

use crate::error::{MonoError, MonoResult};
use crate::table::info::TableInfo;
use crate::table::registry::RowEvent;
use crate::table::value::Value;
use crate::types::{CommitId, RowId, TableId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::RangeBounds;
use std::sync::Arc;

const SNAPSHOT_MAGIC: u32 = 0x4D4E4958; // "MNIX"

/// Cell lookup used to maintain column indexes
pub trait CellSource {
	fn cell(&self, row: RowId, column: usize) -> MonoResult<Value>;
}

/// Index over a single column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ColumnIndex {
	/// No structure; lookups scan the master rows
	Blind,
	/// Ordered key to rows map
	InsertSearch(BTreeMap<Value, BTreeSet<RowId>>),
}

impl ColumnIndex {
	fn for_table(info: &TableInfo) -> Vec<ColumnIndex> {
		info.columns
			.iter()
			.map(|c| {
				if c.is_indexed() {
					ColumnIndex::InsertSearch(BTreeMap::new())
				} else {
					ColumnIndex::Blind
				}
			})
			.collect()
	}

	fn insert(&mut self, value: Value, row: RowId) {
		if let ColumnIndex::InsertSearch(map) = self {
			map.entry(value).or_default().insert(row);
		}
	}

	fn remove(&mut self, value: &Value, row: RowId) {
		if let ColumnIndex::InsertSearch(map) = self {
			if let Some(rows) = map.get_mut(value) {
				rows.remove(&row);
				if rows.is_empty() {
					map.remove(value);
				}
			}
		}
	}
}

/// Immutable point-in-time view of a table's indexes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSnapshot {
	commit_id: CommitId,
	master: BTreeSet<RowId>,
	columns: Vec<ColumnIndex>,
}

impl IndexSnapshot {
	/// Snapshot of an empty table
	pub fn empty(info: &TableInfo, commit_id: CommitId) -> Self {
		Self {
			commit_id,
			master: BTreeSet::new(),
			columns: ColumnIndex::for_table(info),
		}
	}

	/// Build from scratch over `rows`, scanning them once per column index
	pub fn build(
		info: &TableInfo,
		commit_id: CommitId,
		rows: impl IntoIterator<Item = RowId>,
		source: &dyn CellSource,
	) -> MonoResult<Self> {
		let mut snapshot = Self::empty(info, commit_id);
		snapshot.master = rows.into_iter().collect();
		snapshot.rebuild_columns(source)?;
		Ok(snapshot)
	}

	pub fn commit_id(&self) -> CommitId {
		self.commit_id
	}

	pub fn contains(&self, row: RowId) -> bool {
		self.master.contains(&row)
	}

	pub fn rows(&self) -> impl Iterator<Item = RowId> + '_ {
		self.master.iter().copied()
	}

	pub fn len(&self) -> usize {
		self.master.len()
	}

	pub fn is_empty(&self) -> bool {
		self.master.is_empty()
	}

	pub fn column_count(&self) -> usize {
		self.columns.len()
	}

	/// Rows keyed by `key` in an insert-search column index
	pub fn lookup(&self, column: usize, key: &Value) -> Option<&BTreeSet<RowId>> {
		match self.columns.get(column) {
			Some(ColumnIndex::InsertSearch(map)) => map.get(key),
			_ => None,
		}
	}

	/// Derive the snapshot that results from committing a set of changes
	pub fn fold(
		&self,
		commit_id: CommitId,
		added: &[RowId],
		removed: &[RowId],
		source: &dyn CellSource,
	) -> MonoResult<IndexSnapshot> {
		let mut next = self.clone();
		next.commit_id = commit_id;
		for row in removed {
			next.remove(*row, source)?;
		}
		for row in added {
			next.insert(*row, source)?;
		}
		Ok(next)
	}

	/// Serialize for storage in the table's index area
	pub fn encode(&self) -> MonoResult<Vec<u8>> {
		let payload = bincode::serialize(self)?;
		let mut bytes = Vec::with_capacity(payload.len() + 8);
		bytes.extend_from_slice(&SNAPSHOT_MAGIC.to_le_bytes());
		bytes.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
		bytes.extend_from_slice(&payload);
		Ok(bytes)
	}

	pub fn decode(bytes: &[u8]) -> MonoResult<Self> {
		if bytes.len() < 8 {
			return Err(MonoError::Serialization("Index snapshot is truncated".into()));
		}
		let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
		if magic != SNAPSHOT_MAGIC {
			return Err(MonoError::Serialization(
				"Invalid index snapshot magic number".into(),
			));
		}
		let checksum = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
		let payload = &bytes[8..];
		if crc32fast::hash(payload) != checksum {
			return Err(MonoError::Serialization(
				"Index snapshot checksum mismatch".into(),
			));
		}
		Ok(bincode::deserialize(payload)?)
	}

	fn insert(&mut self, row: RowId, source: &dyn CellSource) -> MonoResult<()> {
		self.master.insert(row);
		for (column, index) in self.columns.iter_mut().enumerate() {
			if matches!(index, ColumnIndex::InsertSearch(_)) {
				index.insert(source.cell(row, column)?, row);
			}
		}
		Ok(())
	}

	fn remove(&mut self, row: RowId, source: &dyn CellSource) -> MonoResult<()> {
		self.master.remove(&row);
		for (column, index) in self.columns.iter_mut().enumerate() {
			if matches!(index, ColumnIndex::InsertSearch(_)) {
				index.remove(&source.cell(row, column)?, row);
			}
		}
		Ok(())
	}

	fn rebuild_columns(&mut self, source: &dyn CellSource) -> MonoResult<()> {
		for (column, index) in self.columns.iter_mut().enumerate() {
			if let ColumnIndex::InsertSearch(map) = index {
				map.clear();
				for row in &self.master {
					map.entry(source.cell(*row, column)?)
						.or_default()
						.insert(*row);
				}
			}
		}
		Ok(())
	}
}

/// A transaction's private, copy-on-write view of a table's indexes.
///
/// The master set follows every change immediately. Column indexes are
/// brought up to date lazily by [`IndexSet::flush`], which every lookup
/// runs first.
#[derive(Debug, Clone)]
pub struct IndexSet {
	table_id: TableId,
	snapshot: Arc<IndexSnapshot>,
	pending: Vec<RowEvent>,
}

impl IndexSet {
	pub fn new(table_id: TableId, snapshot: Arc<IndexSnapshot>) -> Self {
		Self {
			table_id,
			snapshot,
			pending: Vec::new(),
		}
	}

	pub fn table_id(&self) -> TableId {
		self.table_id
	}

	/// Commit id of the snapshot this set was checked out from
	pub fn base_commit(&self) -> CommitId {
		self.snapshot.commit_id
	}

	pub fn snapshot(&self) -> &Arc<IndexSnapshot> {
		&self.snapshot
	}

	pub fn contains(&self, row: RowId) -> bool {
		self.snapshot.contains(row)
	}

	pub fn rows(&self) -> Vec<RowId> {
		self.snapshot.rows().collect()
	}

	pub fn row_count(&self) -> usize {
		self.snapshot.len()
	}

	/// Changes not yet applied to the column indexes
	pub fn pending_len(&self) -> usize {
		self.pending.len()
	}

	pub fn insert_row(&mut self, row: RowId) {
		Arc::make_mut(&mut self.snapshot).master.insert(row);
		self.pending.push(RowEvent::Add(row));
	}

	pub fn remove_row(&mut self, row: RowId) {
		Arc::make_mut(&mut self.snapshot).master.remove(&row);
		self.pending.push(RowEvent::Remove(row));
	}

	/// Apply pending changes to the column indexes
	pub fn flush(&mut self, source: &dyn CellSource) -> MonoResult<()> {
		if self.pending.is_empty() {
			return Ok(());
		}
		let pending = std::mem::take(&mut self.pending);
		let snapshot = Arc::make_mut(&mut self.snapshot);
		for event in pending {
			let row = event.row();
			for (column, index) in snapshot.columns.iter_mut().enumerate() {
				if !matches!(index, ColumnIndex::InsertSearch(_)) {
					continue;
				}
				let value = source.cell(row, column)?;
				if event.is_add() {
					index.insert(value, row);
				} else {
					index.remove(&value, row);
				}
			}
		}
		Ok(())
	}

	/// Rebuild the column indexes from the master rows
	pub fn rebuild(&mut self, source: &dyn CellSource) -> MonoResult<()> {
		self.pending.clear();
		Arc::make_mut(&mut self.snapshot).rebuild_columns(source)
	}

	/// Rows whose `column` equals `key`
	pub fn find(
		&mut self,
		column: usize,
		key: &Value,
		source: &dyn CellSource,
	) -> MonoResult<Vec<RowId>> {
		self.find_range(column, (key.clone())..=(key.clone()), source)
	}

	/// Rows whose `column` falls in `range`, in key order
	pub fn find_range<R: RangeBounds<Value>>(
		&mut self,
		column: usize,
		range: R,
		source: &dyn CellSource,
	) -> MonoResult<Vec<RowId>> {
		self.flush(source)?;
		match self.snapshot.columns.get(column) {
			Some(ColumnIndex::InsertSearch(map)) => Ok(map
				.range(range)
				.flat_map(|(_, rows)| rows.iter().copied())
				.collect()),
			Some(ColumnIndex::Blind) => {
				let mut hits = Vec::new();
				for row in self.snapshot.rows() {
					let value = source.cell(row, column)?;
					if range.contains(&value) {
						hits.push((value, row));
					}
				}
				hits.sort();
				Ok(hits.into_iter().map(|(_, row)| row).collect())
			}
			None => Err(MonoError::NotFound(format!(
				"Column {} of table {}",
				column, self.table_id
			))),
		}
	}
}
