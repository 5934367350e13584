//! Table source: the durable row store of one table
//!
//! Layout inside the table's area store:
//!
//! ```text
//! fixed area  [magic:i32][headerPointer:i64]
//! header      [version:i32][tableId:i32][sequenceId:i64][tableInfoPointer:i64]
//!             [indexSetInfoPointer:i64][indexHeaderPointer:i64][listHeaderPointer:i64]
//! ```
//!
//! The header area is 80 bytes, zero padded. The table info and the index
//! set description are bincode images, the index header area holds the
//! latest committed index snapshot and the list header anchors the record
//! slot list.

use crate::error::{MonoError, MonoResult};
use crate::storage::{AreaId, AreaStore, BlobId, BlobStore, StoreSystem};
use crate::table::cache::CellCache;
use crate::table::index::{CellSource, IndexSet, IndexSnapshot};
use crate::table::info::TableInfo;
use crate::table::record::{
	self, StoredCell, decode_cell, decode_cell_table, encode_record, record_blob_refs,
	value_from_object,
};
use crate::table::record_list::{RecordList, RecordState};
use crate::table::registry::TableEventRegistry;
use crate::table::value::{Row, Value};
use crate::types::{CommitId, RowId, TableId, TxnId};
use bytes::{Buf, BufMut, BytesMut};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

const SOURCE_MAGIC: i32 = 0x4D4E5453; // "MNTS"
const SOURCE_VERSION: i32 = 1;
const HEADER_SIZE: usize = 80;

/// Resources shared by every table source of a database
#[derive(Clone)]
pub struct SourceContext {
	pub blobs: Arc<BlobStore>,
	pub cache: Option<Arc<CellCache>>,
	pub large_object_threshold: usize,
}

#[derive(Debug, Clone, Copy)]
struct SourceHeader {
	sequence: i64,
	table_info: AreaId,
	index_info: Option<AreaId>,
	index_snapshot: Option<AreaId>,
	list_header: AreaId,
}

/// Committed snapshots and change history
struct IndexChain {
	/// Ascending by commit id; never empty
	snapshots: Vec<Arc<IndexSnapshot>>,
	history: Vec<Arc<TableEventRegistry>>,
}

impl IndexChain {
	fn new(snapshot: IndexSnapshot) -> Self {
		Self {
			snapshots: vec![Arc::new(snapshot)],
			history: Vec::new(),
		}
	}

	fn latest(&self) -> &Arc<IndexSnapshot> {
		&self.snapshots[self.snapshots.len() - 1]
	}
}

/// A transaction's changes to one table between folding and publishing
#[derive(Debug)]
pub struct PreparedCommit {
	commit_id: CommitId,
	added: Vec<RowId>,
	removed: Vec<RowId>,
	transient: Vec<RowId>,
	snapshot: IndexSnapshot,
	/// Record states overwritten by `write_commit`, oldest first
	applied: Vec<(RowId, RecordState)>,
	/// New snapshot area and the one it replaced
	staged: Option<(AreaId, Option<AreaId>)>,
}

impl PreparedCommit {
	pub fn commit_id(&self) -> CommitId {
		self.commit_id
	}
}

/// Slot usage of a source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceStats {
	pub slots: usize,
	pub committed: usize,
	pub uncommitted: usize,
	pub removed: usize,
	pub free: usize,
}

/// Physical row store of one table
pub struct TableSource {
	table_id: TableId,
	info: TableInfo,
	store: Arc<AreaStore>,
	context: SourceContext,
	header_area: AreaId,
	header: Mutex<SourceHeader>,
	records: Mutex<RecordList>,
	indexes: RwLock<IndexChain>,
	root_locks: AtomicUsize,
	pending_reclaim: Mutex<Vec<(CommitId, RowId)>>,
	/// Reclaimable rows held back by a root lock
	deferred_reclaim: Mutex<Vec<RowId>>,
}

impl TableSource {
	/// Create an empty source in a fresh store
	pub fn create(
		table_id: TableId,
		info: TableInfo,
		store: Arc<AreaStore>,
		context: SourceContext,
		commit_id: CommitId,
	) -> MonoResult<Self> {
		info.validate()?;
		let _guard = store.lock();

		let table_info = store.create_area_with(bincode::serialize(&info)?)?;
		let index_info = store.create_area_with(encode_index_info(&info)?)?;
		let snapshot = IndexSnapshot::empty(&info, commit_id);
		let index_snapshot = store.create_area_with(snapshot.encode()?)?;
		let records = RecordList::create(Arc::clone(&store))?;
		let header_area = store.create_area(HEADER_SIZE)?;

		let header = SourceHeader {
			sequence: 0,
			table_info,
			index_info: Some(index_info),
			index_snapshot: Some(index_snapshot),
			list_header: records.header_area(),
		};

		let mut anchor = BytesMut::with_capacity(12);
		anchor.put_i32_le(SOURCE_MAGIC);
		anchor.put_i64_le(AreaId::to_pointer(Some(header_area)));
		store.write(AreaId::FIXED, 0, &anchor)?;

		let source = Self::assemble(
			table_id,
			info,
			Arc::clone(&store),
			context,
			header_area,
			header,
			records,
			snapshot,
		);
		source.write_header(&header)?;
		source.store.checkpoint()?;

		tracing::info!(
			"Created table source {} ('{}') in store '{}'",
			table_id,
			source.info.name,
			source.store.name()
		);
		Ok(source)
	}

	/// Open an existing source, reconciling record states against the
	/// persisted master index and freeing leaked areas.
	pub fn open(
		table_id: TableId,
		store: Arc<AreaStore>,
		context: SourceContext,
		commit_id: CommitId,
	) -> MonoResult<Self> {
		let anchor = store.read(AreaId::FIXED, 0, 12)?;
		let mut buf = anchor.as_slice();
		if buf.get_i32_le() != SOURCE_MAGIC {
			return Err(MonoError::Consistency(format!(
				"Store '{}' does not hold a table source",
				store.name()
			)));
		}
		let header_area = AreaId::from_pointer(buf.get_i64_le()).ok_or_else(|| {
			MonoError::Consistency(format!("Store '{}' has no source header", store.name()))
		})?;

		let header_bytes = store.read(header_area, 0, HEADER_SIZE)?;
		let mut buf = header_bytes.as_slice();
		let version = buf.get_i32_le();
		if version != SOURCE_VERSION {
			return Err(MonoError::Consistency(format!(
				"Unsupported table source version {}",
				version
			)));
		}
		let stored_id = buf.get_i32_le();
		if stored_id as u32 != table_id.0 {
			return Err(MonoError::Consistency(format!(
				"Store '{}' holds table {} but was opened as table {}",
				store.name(),
				stored_id,
				table_id
			)));
		}
		let sequence = buf.get_i64_le();
		let table_info = AreaId::from_pointer(buf.get_i64_le())
			.ok_or_else(|| MonoError::Consistency("Table info pointer is null".into()))?;
		let index_info = AreaId::from_pointer(buf.get_i64_le());
		let index_snapshot = AreaId::from_pointer(buf.get_i64_le());
		let list_header = AreaId::from_pointer(buf.get_i64_le())
			.ok_or_else(|| MonoError::Consistency("Record list pointer is null".into()))?;

		let info: TableInfo = bincode::deserialize(&store.read_all(table_info)?)?;
		let records = RecordList::open(Arc::clone(&store), list_header)?;
		let header = SourceHeader {
			sequence,
			table_info,
			index_info,
			index_snapshot,
			list_header,
		};

		let persisted = Self::read_snapshot(&store, &info, &header);
		let placeholder = IndexSnapshot::empty(&info, commit_id);
		let source = Self::assemble(
			table_id,
			info,
			Arc::clone(&store),
			context,
			header_area,
			header,
			records,
			placeholder,
		);
		source.reconcile(persisted, commit_id)?;
		source.free_leaked_areas();
		source.store.checkpoint()?;

		tracing::info!(
			"Opened table source {} ('{}') with {} rows",
			table_id,
			source.info.name,
			source.latest_snapshot().len()
		);
		Ok(source)
	}

	#[allow(clippy::too_many_arguments)]
	fn assemble(
		table_id: TableId,
		info: TableInfo,
		store: Arc<AreaStore>,
		context: SourceContext,
		header_area: AreaId,
		header: SourceHeader,
		records: RecordList,
		snapshot: IndexSnapshot,
	) -> Self {
		Self {
			table_id,
			info,
			store,
			context,
			header_area,
			header: Mutex::new(header),
			records: Mutex::new(records),
			indexes: RwLock::new(IndexChain::new(snapshot)),
			root_locks: AtomicUsize::new(0),
			pending_reclaim: Mutex::new(Vec::new()),
			deferred_reclaim: Mutex::new(Vec::new()),
		}
	}

	fn read_snapshot(store: &AreaStore, info: &TableInfo, header: &SourceHeader) -> Option<IndexSnapshot> {
		let (index_info, snapshot_area) = match (header.index_info, header.index_snapshot) {
			(Some(i), Some(s)) => (i, s),
			_ => return None,
		};
		let described = match store.read_all(index_info) {
			Ok(bytes) => bytes,
			Err(e) => {
				tracing::warn!("Index description of '{}' unreadable: {}", store.name(), e);
				return None;
			}
		};
		match encode_index_info(info) {
			Ok(expected) if expected == described => {}
			_ => {
				tracing::warn!("Index description of '{}' does not match its table", store.name());
				return None;
			}
		}
		match store.read_all(snapshot_area).and_then(|b| IndexSnapshot::decode(&b)) {
			Ok(snapshot) if snapshot.column_count() == info.column_count() => Some(snapshot),
			Ok(_) => {
				tracing::warn!("Index snapshot of '{}' has the wrong shape", store.name());
				None
			}
			Err(e) => {
				tracing::warn!("Discarding index snapshot of '{}': {}", store.name(), e);
				None
			}
		}
	}

	/// Repair record states so that exactly the rows of the master index are
	/// committed, then install the resulting snapshot.
	fn reconcile(&self, persisted: Option<IndexSnapshot>, commit_id: CommitId) -> MonoResult<()> {
		let rebuild = persisted.is_none() || !self.store.last_close_clean();
		let mut master: HashSet<RowId> = match &persisted {
			Some(snapshot) => snapshot.rows().collect(),
			None => {
				let records = self.records.lock();
				records
					.live_rows()
					.filter(|(_, state, _)| *state == RecordState::CommittedAdded)
					.map(|(row, _, _)| row)
					.collect()
			}
		};

		let live: Vec<(RowId, RecordState)> = self
			.records
			.lock()
			.live_rows()
			.map(|(row, state, _)| (row, state))
			.collect();
		let live_set: HashSet<RowId> = live.iter().map(|(row, _)| *row).collect();
		let mut repaired = 0usize;

		for (row, state) in live {
			let indexed = master.contains(&row);
			match (indexed, state) {
				(true, RecordState::CommittedAdded) => {}
				(true, RecordState::CommittedRemoved) => {
					self.records
						.lock()
						.repair_state(row, RecordState::CommittedAdded)?;
					repaired += 1;
				}
				(true, _) => {
					master.remove(&row);
					self.hard_delete(row);
					repaired += 1;
				}
				(false, _) => {
					self.hard_delete(row);
					repaired += 1;
				}
			}
		}

		let dangling = master.iter().filter(|row| !live_set.contains(row)).count();
		if dangling > 0 {
			tracing::warn!(
				"Table {} index referenced {} rows with no record",
				self.table_id,
				dangling
			);
			master.retain(|row| live_set.contains(row));
			repaired += dangling;
		}

		let snapshot = match persisted {
			Some(snapshot) if !rebuild && repaired == 0 => snapshot,
			_ => {
				if repaired > 0 {
					tracing::warn!("Repaired {} rows of table {}", repaired, self.table_id);
				}
				let mut rows: Vec<RowId> = master.into_iter().collect();
				rows.sort();
				IndexSnapshot::build(&self.info, commit_id, rows, self)?
			}
		};

		let rebuilt = rebuild || repaired > 0;
		self.install_snapshot(snapshot, rebuilt)
	}

	fn install_snapshot(&self, snapshot: IndexSnapshot, persist: bool) -> MonoResult<()> {
		if persist {
			self.persist_snapshot(&snapshot)?;
		}
		*self.indexes.write() = IndexChain::new(snapshot);
		Ok(())
	}

	/// Free areas no structure refers to. Failures are logged and skipped.
	fn free_leaked_areas(&self) {
		let mut referenced: HashSet<AreaId> = HashSet::new();
		referenced.insert(self.header_area);
		{
			let header = self.header.lock();
			referenced.insert(header.table_info);
			referenced.extend(header.index_info);
			referenced.extend(header.index_snapshot);
		}
		{
			let records = self.records.lock();
			referenced.extend(records.structure_areas());
			referenced.extend(records.live_rows().map(|(_, _, area)| area));
		}

		let mut freed = 0usize;
		for area in self.store.all_areas() {
			if referenced.contains(&area) {
				continue;
			}
			match self.store.delete_area(area) {
				Ok(()) => freed += 1,
				Err(e) => tracing::warn!("Failed to free leaked area {}: {}", area.0, e),
			}
		}
		if freed > 0 {
			tracing::info!("Freed {} leaked areas in '{}'", freed, self.store.name());
		}
	}

	pub fn table_id(&self) -> TableId {
		self.table_id
	}

	pub fn info(&self) -> &TableInfo {
		&self.info
	}

	pub fn store(&self) -> &Arc<AreaStore> {
		&self.store
	}

	/// Write a row into a new record as an uncommitted slot. Indexes are not
	/// touched.
	pub fn add_row(&self, row: &[Value]) -> MonoResult<RowId> {
		let encoded = encode_record(
			&self.info,
			row,
			&self.context.blobs,
			self.context.large_object_threshold,
		)?;
		let area = match self.store.create_area_with(encoded.bytes) {
			Ok(area) => area,
			Err(e) => {
				self.release_objects(&encoded.blobs);
				return Err(e);
			}
		};

		let allocated = self.records.lock().allocate(area);
		match allocated {
			Ok(row_id) => {
				if let Some(cache) = &self.context.cache {
					cache.invalidate_row(self.table_id, row_id, self.info.column_count());
				}
				Ok(row_id)
			}
			Err(e) => {
				if let Err(delete_err) = self.store.delete_area(area) {
					tracing::warn!("Failed to free record area {}: {}", area.0, delete_err);
				}
				self.release_objects(&encoded.blobs);
				Err(e)
			}
		}
	}

	pub fn read_record_state(&self, row: RowId) -> MonoResult<RecordState> {
		self.records.lock().state(row)
	}

	/// Move a row to `state`, rejecting transitions outside the lifecycle.
	/// Returns the previous state.
	pub fn write_record_state(&self, row: RowId, state: RecordState) -> MonoResult<RecordState> {
		self.records.lock().set_state(row, state)
	}

	/// Read one cell
	pub fn get_value(&self, row: RowId, column: usize) -> MonoResult<Value> {
		if let Some(cache) = &self.context.cache {
			if let Some(value) = cache.get(self.table_id, row, column) {
				return Ok(value);
			}
		}

		let data_type = &self.info.column(column)?.data_type;
		let area = self.records.lock().area(row)?;
		let columns = self.info.column_count();
		let table = self.store.read(area, 0, record::header_size(columns))?;
		let entries = decode_cell_table(&table, columns)?;
		let record_len = self.store.area_size(area)?;
		let (cell_type, start, end) = record::cell_range(&entries, column, record_len)?;
		let payload = self.store.read(area, start, end - start)?;
		let value = self.resolve(decode_cell(cell_type, data_type, &payload)?, column)?;

		if let Some(cache) = &self.context.cache {
			cache.put(self.table_id, row, column, value.clone());
		}
		Ok(value)
	}

	/// Read a whole row
	pub fn get_row(&self, row: RowId) -> MonoResult<Row> {
		let area = self.records.lock().area(row)?;
		let bytes = self.store.read_all(area)?;
		let columns = self.info.column_count();
		let entries = decode_cell_table(&bytes, columns)?;
		let mut values = Vec::with_capacity(columns);
		for column in 0..columns {
			let (cell_type, start, end) = record::cell_range(&entries, column, bytes.len())?;
			let cell = decode_cell(cell_type, &self.info.columns[column].data_type, &bytes[start..end])?;
			values.push(self.resolve(cell, column)?);
		}
		Ok(values)
	}

	fn resolve(&self, cell: StoredCell, column: usize) -> MonoResult<Value> {
		match cell {
			StoredCell::Inline(value) => Ok(value),
			StoredCell::LargeObject(None) => Ok(Value::Null),
			StoredCell::LargeObject(Some(id)) => value_from_object(
				&self.info.columns[column].data_type,
				self.context.blobs.get_object(id)?,
			),
		}
	}

	/// Latest committed index snapshot
	pub fn latest_snapshot(&self) -> Arc<IndexSnapshot> {
		Arc::clone(self.indexes.read().latest())
	}

	/// Check out the latest committed snapshot for a transaction
	pub fn create_index_set(&self) -> IndexSet {
		IndexSet::new(self.table_id, self.latest_snapshot())
	}

	/// Rebuild the committed indexes by scanning every committed row
	pub fn build_indexes(&self) -> MonoResult<()> {
		let commit_id = self.latest_snapshot().commit_id();
		let rows: Vec<RowId> = self
			.records
			.lock()
			.live_rows()
			.filter(|(_, state, _)| *state == RecordState::CommittedAdded)
			.map(|(row, _, _)| row)
			.collect();
		let snapshot = IndexSnapshot::build(&self.info, commit_id, rows, self)?;
		self.persist_snapshot(&snapshot)?;

		let mut chain = self.indexes.write();
		chain.snapshots.clear();
		chain.snapshots.push(Arc::new(snapshot));
		tracing::debug!("Rebuilt indexes of table {}", self.table_id);
		Ok(())
	}

	/// Rebuild a transaction's column indexes from its master rows
	pub fn rebuild_index_set(&self, index_set: &mut IndexSet) -> MonoResult<()> {
		index_set.rebuild(self)
	}

	/// Fresh event registry for a transaction touching this table
	pub fn new_registry(&self, txn_id: TxnId) -> TableEventRegistry {
		TableEventRegistry::new(self.table_id, txn_id)
	}

	/// Advance the sequence and return the new value
	pub fn next_unique_id(&self) -> MonoResult<i64> {
		let mut header = self.header.lock();
		header.sequence += 1;
		self.write_header(&header)?;
		Ok(header.sequence)
	}

	/// Last value handed out by the sequence
	pub fn current_unique_id(&self) -> i64 {
		self.header.lock().sequence
	}

	pub fn set_unique_id(&self, value: i64) -> MonoResult<()> {
		let mut header = self.header.lock();
		header.sequence = value;
		self.write_header(&header)
	}

	/// Fail if a change committed after `since` removed a row `registry` removes
	pub fn test_commit_clash(&self, registry: &TableEventRegistry, since: CommitId) -> MonoResult<()> {
		let chain = self.indexes.read();
		for committed in chain
			.history
			.iter()
			.filter(|r| r.commit_id().is_some_and(|c| c > since))
		{
			registry.test_commit_clash(committed)?;
		}
		Ok(())
	}

	/// Fail if a row added by `registry` repeats a unique key that is now
	/// committed by another transaction
	pub fn test_unique_clash(&self, registry: &TableEventRegistry) -> MonoResult<()> {
		let unique: Vec<usize> = (0..self.info.column_count())
			.filter(|c| self.info.columns[*c].is_unique())
			.collect();
		let added = registry.added_rows();
		if unique.is_empty() || added.is_empty() {
			return Ok(());
		}

		let removed: HashSet<RowId> = registry.removed_rows().into_iter().collect();
		let latest = self.latest_snapshot();
		for row in &added {
			for column in &unique {
				let value = self.get_value(*row, *column)?;
				if value.is_null() {
					continue;
				}
				let taken = latest
					.lookup(*column, &value)
					.is_some_and(|rows| rows.iter().any(|r| !removed.contains(r)));
				if taken {
					return Err(MonoError::Constraint(format!(
						"Duplicate value {} in unique column '{}' of table '{}'",
						value, self.info.columns[*column].name, self.info.name
					)));
				}
			}
		}
		Ok(())
	}

	/// Whether any change was committed to this table after `since`
	pub fn changed_since(&self, since: CommitId) -> bool {
		let chain = self.indexes.read();
		chain
			.history
			.iter()
			.any(|r| r.commit_id().is_some_and(|c| c > since) && !r.is_empty())
	}

	/// Make a transaction's changes durable and visible in one step
	pub fn commit_transaction_change(
		&self,
		commit_id: CommitId,
		registry: TableEventRegistry,
	) -> MonoResult<()> {
		let mut change = self.prepare_commit(commit_id, &registry)?;
		self.write_commit(&mut change)?;
		self.publish_commit(change, registry);
		Ok(())
	}

	/// Fold a registry into the next committed snapshot without touching
	/// the store
	pub fn prepare_commit(
		&self,
		commit_id: CommitId,
		registry: &TableEventRegistry,
	) -> MonoResult<PreparedCommit> {
		let added = registry.added_rows();
		let removed = registry.removed_rows();
		let transient = registry.transient_rows();
		let snapshot = self.latest_snapshot().fold(commit_id, &added, &removed, self)?;
		Ok(PreparedCommit {
			commit_id,
			added,
			removed,
			transient,
			snapshot,
			applied: Vec::new(),
			staged: None,
		})
	}

	/// Write the record states and the new master index of a prepared
	/// change. Nothing is visible to other transactions until
	/// [`Self::publish_commit`]. On failure the store is left as it was.
	pub fn write_commit(&self, change: &mut PreparedCommit) -> MonoResult<()> {
		let targets: Vec<(RowId, RecordState)> = change
			.added
			.iter()
			.map(|row| (*row, RecordState::CommittedAdded))
			.chain(
				change
					.removed
					.iter()
					.chain(change.transient.iter())
					.map(|row| (*row, RecordState::CommittedRemoved)),
			)
			.collect();

		{
			let mut records = self.records.lock();
			for (row, next) in targets {
				match records.set_state(row, next) {
					Ok(previous) => change.applied.push((row, previous)),
					Err(e) => {
						self.restore_states(&mut records, std::mem::take(&mut change.applied));
						return Err(e);
					}
				}
			}
		}

		match self.stage_snapshot(&change.snapshot) {
			Ok(staged) => {
				change.staged = Some(staged);
				Ok(())
			}
			Err(e) => {
				self.revert_commit(change);
				Err(e)
			}
		}
	}

	/// Undo [`Self::write_commit`]. Failures are logged and skipped.
	pub fn revert_commit(&self, change: &mut PreparedCommit) {
		if let Some((area, previous)) = change.staged.take() {
			self.unstage_snapshot(area, previous);
		}
		let applied = std::mem::take(&mut change.applied);
		if !applied.is_empty() {
			self.restore_states(&mut self.records.lock(), applied);
			tracing::debug!(
				"Table {} reverted commit {}",
				self.table_id,
				change.commit_id
			);
		}
	}

	/// Make a written change visible. Cannot fail.
	pub fn publish_commit(&self, change: PreparedCommit, mut registry: TableEventRegistry) {
		let PreparedCommit {
			commit_id,
			added,
			removed,
			transient,
			snapshot,
			staged,
			..
		} = change;

		if let Some((_, Some(previous))) = staged {
			if let Err(e) = self.store.delete_area(previous) {
				tracing::warn!("Failed to free old index snapshot {}: {}", previous.0, e);
			}
		}

		registry.stamp(commit_id);
		{
			let mut chain = self.indexes.write();
			chain.snapshots.push(Arc::new(snapshot));
			chain.history.push(Arc::new(registry));
		}
		{
			let mut pending = self.pending_reclaim.lock();
			pending.extend(removed.iter().map(|row| (commit_id, *row)));
			pending.extend(transient.iter().map(|row| (commit_id, *row)));
		}

		tracing::debug!(
			"Table {} commit {}: {} added, {} removed, {} transient",
			self.table_id,
			commit_id,
			added.len(),
			removed.len(),
			transient.len()
		);
	}

	fn restore_states(&self, records: &mut RecordList, applied: Vec<(RowId, RecordState)>) {
		for (row, previous) in applied.into_iter().rev() {
			if let Err(e) = records.repair_state(row, previous) {
				tracing::warn!(
					"Failed to restore row {} of table {} to {:?}: {}",
					row,
					self.table_id,
					previous,
					e
				);
			}
		}
	}

	/// Undo a transaction's changes: every row it added is marked removed
	/// and scheduled for reclamation
	pub fn rollback_transaction_change(&self, registry: &TableEventRegistry) -> MonoResult<()> {
		let mut rows = registry.added_rows();
		rows.extend(registry.transient_rows());

		{
			let mut records = self.records.lock();
			for row in &rows {
				records.set_state(*row, RecordState::CommittedRemoved)?;
			}
		}
		// Never visible to anyone, so reclaimable at any horizon
		self.pending_reclaim
			.lock()
			.extend(rows.iter().map(|row| (CommitId(0), *row)));
		tracing::debug!("Table {} rolled back {} rows", self.table_id, rows.len());
		Ok(())
	}

	/// Drop history no open transaction can observe and reclaim rows whose
	/// removal is visible to everyone. `min_open` is the oldest start commit
	/// of any open transaction. Returns the number of rows reclaimed.
	pub fn merge_history(&self, min_open: Option<CommitId>) -> MonoResult<usize> {
		{
			let mut chain = self.indexes.write();
			match min_open {
				Some(min) => {
					chain.history.retain(|r| r.commit_id().is_some_and(|c| c > min));
					// Keep the snapshot a transaction started at `min` reads
					let base = chain
						.snapshots
						.iter()
						.rposition(|s| s.commit_id() <= min)
						.unwrap_or(0);
					chain.snapshots.drain(..base);
				}
				None => {
					chain.history.clear();
					let latest = chain.snapshots.len() - 1;
					chain.snapshots.drain(..latest);
				}
			}
		}

		self.reclaim(min_open)
	}

	fn reclaim(&self, min_open: Option<CommitId>) -> MonoResult<usize> {
		let mut ready = std::mem::take(&mut *self.deferred_reclaim.lock());
		{
			let mut pending = self.pending_reclaim.lock();
			let (now, later): (Vec<(CommitId, RowId)>, Vec<(CommitId, RowId)>) = pending
				.drain(..)
				.partition(|(commit, _)| min_open.is_none_or(|min| *commit <= min));
			*pending = later;
			ready.extend(now.into_iter().map(|(_, row)| row));
		}
		self.reclaim_rows(ready)
	}

	fn reclaim_rows(&self, rows: Vec<RowId>) -> MonoResult<usize> {
		if rows.is_empty() {
			return Ok(0);
		}
		if self.root_locks.load(Ordering::SeqCst) > 0 {
			self.deferred_reclaim.lock().extend(rows);
			return Ok(0);
		}

		for (i, row) in rows.iter().enumerate() {
			if let Err(e) = self.reclaim_row(*row) {
				self.deferred_reclaim
					.lock()
					.extend(rows[i + 1..].iter().copied());
				return Err(e);
			}
		}
		tracing::debug!("Reclaimed {} rows of table {}", rows.len(), self.table_id);
		Ok(rows.len())
	}

	fn reclaim_row(&self, row: RowId) -> MonoResult<()> {
		let area = self.records.lock().free(row)?;
		self.discard_record(row, area)
	}

	/// Rows awaiting reclamation
	pub fn pending_reclaim(&self) -> usize {
		self.pending_reclaim.lock().len() + self.deferred_reclaim.lock().len()
	}

	fn discard_record(&self, row: RowId, area: AreaId) -> MonoResult<()> {
		let bytes = self.store.read_all(area)?;
		let blobs = record_blob_refs(&self.info, &bytes)?;
		self.store.delete_area(area)?;
		self.release_objects(&blobs);
		if let Some(cache) = &self.context.cache {
			cache.invalidate_row(self.table_id, row, self.info.column_count());
		}
		Ok(())
	}

	/// Free a row regardless of its state. Used by repair paths, where
	/// failures are logged and skipped.
	fn hard_delete(&self, row: RowId) {
		let freed = self.records.lock().hard_free(row);
		match freed.and_then(|area| self.discard_record(row, area)) {
			Ok(()) => tracing::debug!("Hard deleted row {} of table {}", row, self.table_id),
			Err(e) => tracing::warn!(
				"Failed to hard delete row {} of table {}: {}",
				row,
				self.table_id,
				e
			),
		}
	}

	fn release_objects(&self, blobs: &[BlobId]) {
		for id in blobs {
			if let Err(e) = self.context.blobs.release_object(*id) {
				tracing::warn!("Failed to release large object {}: {}", id.0, e);
			}
		}
	}

	pub fn add_lock(&self) {
		self.root_locks.fetch_add(1, Ordering::SeqCst);
	}

	/// Release a root lock; reclamation deferred by it runs once the last one
	/// is gone
	pub fn remove_lock(&self) -> MonoResult<()> {
		let previous = self
			.root_locks
			.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
			.map_err(|_| {
				MonoError::Consistency(format!(
					"Root lock of table {} released while not held",
					self.table_id
				))
			})?;
		if previous == 1 {
			let deferred = std::mem::take(&mut *self.deferred_reclaim.lock());
			self.reclaim_rows(deferred)?;
		}
		Ok(())
	}

	pub fn root_lock_count(&self) -> usize {
		self.root_locks.load(Ordering::SeqCst)
	}

	/// Scoped root lock
	pub fn root_lock(&self) -> RootLock<'_> {
		self.add_lock();
		RootLock { source: self }
	}

	pub fn stats(&self) -> SourceStats {
		let records = self.records.lock();
		let mut stats = SourceStats {
			slots: records.len(),
			..SourceStats::default()
		};
		for (_, state, _) in records.live_rows() {
			match state {
				RecordState::Uncommitted => stats.uncommitted += 1,
				RecordState::CommittedAdded => stats.committed += 1,
				RecordState::CommittedRemoved => stats.removed += 1,
				RecordState::Deleted => {}
			}
		}
		stats.free = stats.slots - stats.committed - stats.uncommitted - stats.removed;
		stats
	}

	/// Free-list chain, for integrity checks
	pub fn free_rows(&self) -> MonoResult<Vec<RowId>> {
		self.records.lock().free_list()
	}

	pub fn checkpoint(&self) -> MonoResult<()> {
		self.store.checkpoint()
	}

	/// Flush and close the store. With `evict_orphans`, live rows outside the
	/// committed master index are freed first.
	pub fn close(&self, system: &StoreSystem, evict_orphans: bool) -> MonoResult<()> {
		if evict_orphans {
			let latest = self.latest_snapshot();
			let orphans: Vec<RowId> = self
				.records
				.lock()
				.live_rows()
				.filter(|(row, _, _)| !latest.contains(*row))
				.map(|(row, _, _)| row)
				.collect();
			for row in &orphans {
				self.hard_delete(*row);
			}
			self.pending_reclaim.lock().clear();
			self.deferred_reclaim.lock().clear();
			if !orphans.is_empty() {
				tracing::debug!("Evicted {} orphaned rows of table {}", orphans.len(), self.table_id);
			}
		}
		system.close_store(&self.store)?;
		tracing::debug!("Closed table source {}", self.table_id);
		Ok(())
	}

	/// Large objects referenced by live records, once per reference
	pub fn object_references(&self) -> MonoResult<Vec<BlobId>> {
		let areas: Vec<AreaId> = self
			.records
			.lock()
			.live_rows()
			.map(|(_, _, area)| area)
			.collect();
		let mut blobs = Vec::new();
		for area in areas {
			let bytes = self.store.read_all(area)?;
			blobs.extend(record_blob_refs(&self.info, &bytes)?);
		}
		Ok(blobs)
	}

	/// Release every large object the table references and delete its store
	pub fn drop_store(&self, system: &StoreSystem) -> MonoResult<()> {
		let areas: Vec<AreaId> = self
			.records
			.lock()
			.live_rows()
			.map(|(_, _, area)| area)
			.collect();
		for area in areas {
			match self
				.store
				.read_all(area)
				.and_then(|bytes| record_blob_refs(&self.info, &bytes))
			{
				Ok(blobs) => self.release_objects(&blobs),
				Err(e) => tracing::warn!("Failed to read record area {}: {}", area.0, e),
			}
		}
		if let Some(cache) = &self.context.cache {
			cache.invalidate_table(self.table_id);
		}
		system.delete_store(&self.store)?;
		tracing::info!("Dropped table source {} ('{}')", self.table_id, self.info.name);
		Ok(())
	}

	fn persist_snapshot(&self, snapshot: &IndexSnapshot) -> MonoResult<()> {
		let (_, previous) = self.stage_snapshot(snapshot)?;
		if let Some(previous) = previous {
			self.store.delete_area(previous)?;
		}
		Ok(())
	}

	/// Write `snapshot` to a new area and point the header at it. Returns
	/// the new area and the one it replaced, which is kept.
	fn stage_snapshot(&self, snapshot: &IndexSnapshot) -> MonoResult<(AreaId, Option<AreaId>)> {
		let _guard = self.store.lock();
		let area = self.store.create_area_with(snapshot.encode()?)?;
		let mut header = self.header.lock();
		let previous = header.index_snapshot.replace(area);
		if let Err(e) = self.write_header(&header) {
			header.index_snapshot = previous;
			if let Err(delete_err) = self.store.delete_area(area) {
				tracing::warn!("Failed to free index snapshot {}: {}", area.0, delete_err);
			}
			return Err(e);
		}
		Ok((area, previous))
	}

	fn unstage_snapshot(&self, area: AreaId, previous: Option<AreaId>) {
		let _guard = self.store.lock();
		let mut header = self.header.lock();
		header.index_snapshot = previous;
		if let Err(e) = self.write_header(&header) {
			tracing::warn!("Failed to restore index header of table {}: {}", self.table_id, e);
		}
		if let Err(e) = self.store.delete_area(area) {
			tracing::warn!("Failed to free index snapshot {}: {}", area.0, e);
		}
	}

	fn write_header(&self, header: &SourceHeader) -> MonoResult<()> {
		let mut bytes = BytesMut::with_capacity(HEADER_SIZE);
		bytes.put_i32_le(SOURCE_VERSION);
		bytes.put_i32_le(self.table_id.0 as i32);
		bytes.put_i64_le(header.sequence);
		bytes.put_i64_le(AreaId::to_pointer(Some(header.table_info)));
		bytes.put_i64_le(AreaId::to_pointer(header.index_info));
		bytes.put_i64_le(AreaId::to_pointer(header.index_snapshot));
		bytes.put_i64_le(AreaId::to_pointer(Some(header.list_header)));
		bytes.resize(HEADER_SIZE, 0);
		self.store.write(self.header_area, 0, &bytes)
	}
}

impl CellSource for TableSource {
	fn cell(&self, row: RowId, column: usize) -> MonoResult<Value> {
		self.get_value(row, column)
	}
}

/// Holds a root lock on a source until dropped
pub struct RootLock<'a> {
	source: &'a TableSource,
}

impl Drop for RootLock<'_> {
	fn drop(&mut self) {
		if let Err(e) = self.source.remove_lock() {
			tracing::error!("Failed to release root lock: {}", e);
		}
	}
}

/// Index description stored alongside the snapshot: the indexed column names
fn encode_index_info(info: &TableInfo) -> MonoResult<Vec<u8>> {
	let indexed: Vec<(&str, bool)> = info
		.columns
		.iter()
		.map(|c| (c.name.as_str(), c.is_indexed()))
		.collect();
	Ok(bincode::serialize(&indexed)?)
}
