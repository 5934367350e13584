//! Persistent catalog of visible and pending-delete tables
//!
//! The header lives in the fixed area of the state store:
//!
//! ```text
//! [magic:i32][version:i32][nextTableId:i32][visiblePointer:i64][deletePointer:i64]
//! ```
//!
//! Each list area is `[version:i32][count:i64]` followed by `count` entries
//! of `[tableId:i64][nameLength:i32][name:utf16]`. Temporary tables are kept
//! in the in-memory lists only.

use crate::error::{MonoError, MonoResult};
use crate::storage::{AreaId, AreaStore};
use crate::types::TableId;
use bytes::{Buf, BufMut, BytesMut};
use std::sync::Arc;

const STATE_MAGIC: i32 = 0x0BAC8001;
const STATE_VERSION: i32 = 1;
const LIST_VERSION: i32 = 1;
const HEADER_SIZE: usize = 4 + 4 + 4 + 8 + 8;

/// A catalog entry: table id and the physical name of its store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableState {
	pub id: TableId,
	pub name: String,
	pub temporary: bool,
}

impl TableState {
	pub fn new(id: TableId, name: &str) -> Self {
		Self {
			id,
			name: name.to_string(),
			temporary: false,
		}
	}

	/// Entry for a table backed by a non-durable store
	pub fn temporary(id: TableId, name: &str) -> Self {
		Self {
			temporary: true,
			..Self::new(id, name)
		}
	}
}

pub struct TableStateStore {
	store: Arc<AreaStore>,
	next_table_id: u32,
	visible: Vec<TableState>,
	deleted: Vec<TableState>,
	visible_area: Option<AreaId>,
	delete_area: Option<AreaId>,
}

impl TableStateStore {
	/// Initialise an empty catalog in a fresh store
	pub fn create(store: Arc<AreaStore>) -> MonoResult<Self> {
		let mut state = Self {
			store,
			next_table_id: 1,
			visible: Vec::new(),
			deleted: Vec::new(),
			visible_area: None,
			delete_area: None,
		};
		state.flush()?;
		Ok(state)
	}

	/// Load the catalog from an existing store
	pub fn open(store: Arc<AreaStore>) -> MonoResult<Self> {
		let header = store.read(AreaId::FIXED, 0, HEADER_SIZE)?;
		let mut buf = header.as_slice();
		if buf.get_i32_le() != STATE_MAGIC {
			return Err(MonoError::Consistency(format!(
				"Invalid table state magic number in '{}'",
				store.name()
			)));
		}
		let version = buf.get_i32_le();
		if version != STATE_VERSION {
			return Err(MonoError::Consistency(format!(
				"Unsupported table state version {}",
				version
			)));
		}
		let next_table_id = buf.get_i32_le();
		let visible_area = AreaId::from_pointer(buf.get_i64_le());
		let delete_area = AreaId::from_pointer(buf.get_i64_le());

		let visible = match visible_area {
			Some(area) => decode_list(&store.read_all(area)?)?,
			None => Vec::new(),
		};
		let deleted = match delete_area {
			Some(area) => decode_list(&store.read_all(area)?)?,
			None => Vec::new(),
		};

		Ok(Self {
			store,
			next_table_id: next_table_id as u32,
			visible,
			deleted,
			visible_area,
			delete_area,
		})
	}

	pub fn store(&self) -> &Arc<AreaStore> {
		&self.store
	}

	/// Allocate a table id. Ids are never reused.
	pub fn next_table_id(&mut self) -> TableId {
		let id = TableId(self.next_table_id);
		self.next_table_id += 1;
		id
	}

	pub fn visible(&self) -> &[TableState] {
		&self.visible
	}

	pub fn deleted(&self) -> &[TableState] {
		&self.deleted
	}

	pub fn is_visible(&self, id: TableId) -> bool {
		self.visible.iter().any(|t| t.id == id)
	}

	pub fn is_deleted(&self, id: TableId) -> bool {
		self.deleted.iter().any(|t| t.id == id)
	}

	pub fn is_temporary(&self, id: TableId) -> bool {
		self.visible
			.iter()
			.chain(self.deleted.iter())
			.any(|t| t.id == id && t.temporary)
	}

	pub fn add_visible(&mut self, table: TableState) -> MonoResult<()> {
		if self.is_visible(table.id) {
			return Err(MonoError::AlreadyExists(format!(
				"Table {} is already visible",
				table.id
			)));
		}
		self.visible.push(table);
		Ok(())
	}

	pub fn remove_visible(&mut self, id: TableId) -> MonoResult<TableState> {
		take(&mut self.visible, id)
	}

	pub fn add_deleted(&mut self, table: TableState) -> MonoResult<()> {
		if self.is_deleted(table.id) {
			return Err(MonoError::AlreadyExists(format!(
				"Table {} is already pending delete",
				table.id
			)));
		}
		self.deleted.push(table);
		Ok(())
	}

	pub fn remove_deleted(&mut self, id: TableId) -> MonoResult<TableState> {
		take(&mut self.deleted, id)
	}

	/// Replace both in-memory lists, undoing moves that were never flushed
	pub fn restore(&mut self, visible: Vec<TableState>, deleted: Vec<TableState>) {
		self.visible = visible;
		self.deleted = deleted;
	}

	/// Write both lists to new areas, repoint the header and free the old
	/// lists, then checkpoint the store
	pub fn flush(&mut self) -> MonoResult<()> {
		let _guard = self.store.lock();
		let visible_area = self.store.create_area_with(encode_list(&self.visible))?;
		let delete_area = self.store.create_area_with(encode_list(&self.deleted))?;

		let mut header = BytesMut::with_capacity(HEADER_SIZE);
		header.put_i32_le(STATE_MAGIC);
		header.put_i32_le(STATE_VERSION);
		header.put_i32_le(self.next_table_id as i32);
		header.put_i64_le(AreaId::to_pointer(Some(visible_area)));
		header.put_i64_le(AreaId::to_pointer(Some(delete_area)));
		self.store.write(AreaId::FIXED, 0, &header)?;

		let old = [
			self.visible_area.replace(visible_area),
			self.delete_area.replace(delete_area),
		];
		for area in old.into_iter().flatten() {
			self.store.delete_area(area)?;
		}
		self.store.checkpoint()
	}
}

fn take(list: &mut Vec<TableState>, id: TableId) -> MonoResult<TableState> {
	match list.iter().position(|t| t.id == id) {
		Some(position) => Ok(list.remove(position)),
		None => Err(MonoError::NotFound(format!("Table {} in catalog", id))),
	}
}

fn encode_list(tables: &[TableState]) -> Vec<u8> {
	let durable: Vec<&TableState> = tables.iter().filter(|t| !t.temporary).collect();
	let mut buf = BytesMut::new();
	buf.put_i32_le(LIST_VERSION);
	buf.put_i64_le(durable.len() as i64);
	for table in durable {
		buf.put_i64_le(table.id.0 as i64);
		let units: Vec<u16> = table.name.encode_utf16().collect();
		buf.put_i32_le(units.len() as i32);
		for unit in units {
			buf.put_u16_le(unit);
		}
	}
	buf.to_vec()
}

fn decode_list(bytes: &[u8]) -> MonoResult<Vec<TableState>> {
	let corrupt = || MonoError::Consistency("Table state list is truncated".into());
	let mut buf = bytes;
	if buf.remaining() < 12 {
		return Err(corrupt());
	}
	let version = buf.get_i32_le();
	if version != LIST_VERSION {
		return Err(MonoError::Consistency(format!(
			"Unsupported table state list version {}",
			version
		)));
	}
	let count = buf.get_i64_le();
	if count < 0 {
		return Err(corrupt());
	}

	let mut tables = Vec::with_capacity(count as usize);
	for _ in 0..count {
		if buf.remaining() < 12 {
			return Err(corrupt());
		}
		let id = buf.get_i64_le();
		let len = buf.get_i32_le();
		if len < 0 || buf.remaining() < len as usize * 2 {
			return Err(corrupt());
		}
		let units: Vec<u16> = (0..len).map(|_| buf.get_u16_le()).collect();
		let name = String::from_utf16(&units)
			.map_err(|e| MonoError::Consistency(format!("Invalid table name: {}", e)))?;
		tables.push(TableState {
			id: TableId(id as u32),
			name,
			temporary: false,
		});
	}
	Ok(tables)
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;
	use tempfile::tempdir;

	#[test]
	fn test_list_encoding() {
		let tables = vec![
			TableState::new(TableId(1), "orders_1"),
			TableState::new(TableId(12), "café_12"),
		];
		assert_eq!(decode_list(&encode_list(&tables)).unwrap(), tables);
		assert!(decode_list(&encode_list(&tables)[..20]).is_err());

		let mut with_temp = tables.clone();
		with_temp.push(TableState::temporary(TableId(13), "scratch_13"));
		assert_eq!(decode_list(&encode_list(&with_temp)).unwrap(), tables);
	}

	#[test]
	fn test_flush_and_reopen() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("mono_state.mds");
		let store = Arc::new(AreaStore::create_file("mono_state", &path).unwrap());
		let mut state = TableStateStore::create(Arc::clone(&store)).unwrap();

		let a = state.next_table_id();
		let b = state.next_table_id();
		state.add_deleted(TableState::new(a, "a_1")).unwrap();
		state.add_deleted(TableState::new(b, "b_2")).unwrap();
		state.flush().unwrap();

		let confirmed = state.remove_deleted(a).unwrap();
		state.add_visible(confirmed).unwrap();
		assert!(state.add_visible(TableState::new(a, "a_1")).is_err());
		state.flush().unwrap();
		// Only the current pair of list areas remains
		assert_eq!(store.all_areas().len(), 2);
		store.close().unwrap();
		drop(state);

		let store = Arc::new(AreaStore::open_file("mono_state", &path).unwrap());
		let mut state = TableStateStore::open(store).unwrap();
		assert_eq!(state.visible(), &[TableState::new(a, "a_1")]);
		assert_eq!(state.deleted(), &[TableState::new(b, "b_2")]);
		assert_eq!(state.next_table_id(), TableId(3));
		assert!(state.remove_visible(b).is_err());
	}
}
