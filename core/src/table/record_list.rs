//! Record slot list
//!
//! One slot per row number, stored in blocks whose sizes double (64, 128,
//! 256, ...). Each slot is `[state:i32][pointer-or-next-free:i64]`. Slots of
//! deleted rows form a singly linked free list anchored in the list header:
//!
//! ```text
//! [version:i32][firstDeleted:i64][highWater:i64][blockCount:i32][block:i64]*
//! ```

use crate::error::{MonoError, MonoResult};
use crate::storage::{AreaId, AreaStore};
use crate::types::RowId;
use bytes::{Buf, BufMut, BytesMut};
use std::collections::HashSet;
use std::sync::Arc;

const LIST_VERSION: i32 = 1;
const SLOT_SIZE: usize = 12;
const BLOCK_BASE: u64 = 64;
const MAX_BLOCKS: usize = 48;
const HEADER_SIZE: usize = 4 + 8 + 8 + 4 + MAX_BLOCKS * 8;

/// Per-row commit visibility tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordState {
	/// Written by an open transaction
	Uncommitted,
	/// Durably visible
	CommittedAdded,
	/// Logically deleted, awaiting reclamation
	CommittedRemoved,
	/// Slot reclaimed and on the free list
	Deleted,
}

impl RecordState {
	pub fn code(self) -> i32 {
		match self {
			RecordState::Uncommitted => 0x000,
			RecordState::CommittedAdded => 0x010,
			RecordState::CommittedRemoved => 0x020,
			RecordState::Deleted => 0x20000,
		}
	}

	pub fn from_code(code: i32) -> MonoResult<Self> {
		match code {
			0x000 => Ok(RecordState::Uncommitted),
			0x010 => Ok(RecordState::CommittedAdded),
			0x020 => Ok(RecordState::CommittedRemoved),
			0x20000 => Ok(RecordState::Deleted),
			other => Err(MonoError::Consistency(format!(
				"Unknown record state 0x{:x}",
				other
			))),
		}
	}

	/// Legal lifecycle transitions
	pub fn can_transition_to(self, next: RecordState) -> bool {
		use RecordState::*;
		matches!(
			(self, next),
			(Uncommitted, CommittedAdded)
				| (Uncommitted, CommittedRemoved)
				| (CommittedAdded, CommittedRemoved)
				| (CommittedRemoved, Deleted)
				| (Deleted, Uncommitted)
		)
	}
}

/// A record slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
	Live { state: RecordState, area: AreaId },
	Free { next: Option<RowId> },
}

impl Slot {
	pub fn state(&self) -> RecordState {
		match self {
			Slot::Live { state, .. } => *state,
			Slot::Free { .. } => RecordState::Deleted,
		}
	}
}

/// Slot arena indexed by row number
pub struct RecordList {
	store: Arc<AreaStore>,
	header_area: AreaId,
	blocks: Vec<AreaId>,
	slots: Vec<Slot>,
	first_free: Option<RowId>,
}

impl RecordList {
	/// Create an empty list in `store`
	pub fn create(store: Arc<AreaStore>) -> MonoResult<Self> {
		let header_area = store.create_area(HEADER_SIZE)?;
		let list = Self {
			store,
			header_area,
			blocks: Vec::new(),
			slots: Vec::new(),
			first_free: None,
		};
		list.write_header()?;
		Ok(list)
	}

	/// Load a list from its header area
	pub fn open(store: Arc<AreaStore>, header_area: AreaId) -> MonoResult<Self> {
		let header = store.read(header_area, 0, HEADER_SIZE)?;
		let mut buf = header.as_slice();
		let version = buf.get_i32_le();
		if version != LIST_VERSION {
			return Err(MonoError::Consistency(format!(
				"Unsupported record list version {}",
				version
			)));
		}
		let first_free = buf.get_i64_le();
		let high_water = buf.get_i64_le();
		let block_count = buf.get_i32_le();
		if block_count < 0 || block_count as usize > MAX_BLOCKS || high_water < 0 {
			return Err(MonoError::Consistency("Corrupt record list header".into()));
		}

		let mut blocks = Vec::with_capacity(block_count as usize);
		for _ in 0..block_count {
			let pointer = buf.get_i64_le();
			blocks.push(AreaId::from_pointer(pointer).ok_or_else(|| {
				MonoError::Consistency("Record list block pointer is null".into())
			})?);
		}

		let mut list = Self {
			store,
			header_area,
			blocks,
			slots: Vec::with_capacity(high_water as usize),
			first_free: to_row(first_free),
		};
		if high_water as u64 > list.capacity() {
			return Err(MonoError::Consistency(
				"Record list high water mark exceeds its blocks".into(),
			));
		}

		for row in 0..high_water as u64 {
			let (block, offset) = locate(row);
			let bytes = list
				.store
				.read(list.blocks[block], offset * SLOT_SIZE, SLOT_SIZE)?;
			let mut buf = bytes.as_slice();
			let state = RecordState::from_code(buf.get_i32_le())?;
			let pointer = buf.get_i64_le();
			let slot = match state {
				RecordState::Deleted => Slot::Free {
					next: to_row(pointer),
				},
				state => Slot::Live {
					state,
					area: AreaId::from_pointer(pointer).ok_or_else(|| {
						MonoError::Consistency(format!("Row {} has no record area", row))
					})?,
				},
			};
			list.slots.push(slot);
		}
		Ok(list)
	}

	pub fn header_area(&self) -> AreaId {
		self.header_area
	}

	/// Number of slots ever handed out
	pub fn len(&self) -> usize {
		self.slots.len()
	}

	pub fn is_empty(&self) -> bool {
		self.slots.is_empty()
	}

	pub fn get(&self, row: RowId) -> MonoResult<Slot> {
		self.slots
			.get(row.0 as usize)
			.copied()
			.ok_or_else(|| MonoError::NotFound(format!("Row {}", row)))
	}

	pub fn state(&self, row: RowId) -> MonoResult<RecordState> {
		Ok(self.get(row)?.state())
	}

	/// Record area of a live row
	pub fn area(&self, row: RowId) -> MonoResult<AreaId> {
		match self.get(row)? {
			Slot::Live { area, .. } => Ok(area),
			Slot::Free { .. } => Err(MonoError::NotFound(format!("Row {} is deleted", row))),
		}
	}

	/// Take a slot for a new uncommitted row, recycling the free list first
	pub fn allocate(&mut self, area: AreaId) -> MonoResult<RowId> {
		let store = Arc::clone(&self.store);
		let _guard = store.lock();
		let row = match self.first_free {
			Some(row) => {
				let next = match self.get(row)? {
					Slot::Free { next } => next,
					Slot::Live { state, .. } => {
						return Err(MonoError::Consistency(format!(
							"Free list head {} is in state {:?}",
							row, state
						)));
					}
				};
				self.first_free = next;
				row
			}
			None => {
				let row = RowId(self.slots.len() as u64);
				if row.0 >= self.capacity() {
					self.grow()?;
				}
				self.slots.push(Slot::Free { next: None });
				row
			}
		};

		self.put(
			row,
			Slot::Live {
				state: RecordState::Uncommitted,
				area,
			},
		)?;
		self.write_header()?;
		Ok(row)
	}

	/// Change a live row's state, enforcing the lifecycle
	pub fn set_state(&mut self, row: RowId, next: RecordState) -> MonoResult<RecordState> {
		let (state, area) = self.live(row)?;
		if next == RecordState::Deleted || !state.can_transition_to(next) {
			return Err(MonoError::Consistency(format!(
				"Illegal record state transition {:?} -> {:?} for row {}",
				state, next, row
			)));
		}
		self.put(row, Slot::Live { state: next, area })?;
		Ok(state)
	}

	/// Overwrite a live row's state without checking the lifecycle. Only
	/// used by the open-time repair.
	pub fn repair_state(&mut self, row: RowId, next: RecordState) -> MonoResult<()> {
		let (_, area) = self.live(row)?;
		self.put(row, Slot::Live { state: next, area })
	}

	/// Reclaim a committed-removed row; returns the record area to free
	pub fn free(&mut self, row: RowId) -> MonoResult<AreaId> {
		let (state, _) = self.live(row)?;
		if !state.can_transition_to(RecordState::Deleted) {
			return Err(MonoError::Consistency(format!(
				"Illegal record state transition {:?} -> Deleted for row {}",
				state, row
			)));
		}
		self.hard_free(row)
	}

	/// Reclaim any live row regardless of state. Only used by the open-time
	/// repair.
	pub fn hard_free(&mut self, row: RowId) -> MonoResult<AreaId> {
		let store = Arc::clone(&self.store);
		let _guard = store.lock();
		let (_, area) = self.live(row)?;
		self.put(
			row,
			Slot::Free {
				next: self.first_free,
			},
		)?;
		self.first_free = Some(row);
		self.write_header()?;
		Ok(area)
	}

	/// Live rows in row order
	pub fn live_rows(&self) -> impl Iterator<Item = (RowId, RecordState, AreaId)> + '_ {
		self.slots
			.iter()
			.enumerate()
			.filter_map(|(i, slot)| match slot {
				Slot::Live { state, area } => Some((RowId(i as u64), *state, *area)),
				Slot::Free { .. } => None,
			})
	}

	/// Walk the free-list chain, failing on cycles or live members
	pub fn free_list(&self) -> MonoResult<Vec<RowId>> {
		let mut seen = HashSet::new();
		let mut chain = Vec::new();
		let mut cursor = self.first_free;
		while let Some(row) = cursor {
			if !seen.insert(row) {
				return Err(MonoError::Consistency(format!(
					"Free list revisits row {}",
					row
				)));
			}
			match self.get(row)? {
				Slot::Free { next } => cursor = next,
				Slot::Live { state, .. } => {
					return Err(MonoError::Consistency(format!(
						"Free list contains row {} in state {:?}",
						row, state
					)));
				}
			}
			chain.push(row);
		}
		Ok(chain)
	}

	/// Areas owned by the list structure itself
	pub fn structure_areas(&self) -> Vec<AreaId> {
		let mut areas = Vec::with_capacity(self.blocks.len() + 1);
		areas.push(self.header_area);
		areas.extend(self.blocks.iter().copied());
		areas
	}

	fn live(&self, row: RowId) -> MonoResult<(RecordState, AreaId)> {
		match self.get(row)? {
			Slot::Live { state, area } => Ok((state, area)),
			Slot::Free { .. } => Err(MonoError::Consistency(format!(
				"Row {} is deleted",
				row
			))),
		}
	}

	fn capacity(&self) -> u64 {
		BLOCK_BASE * ((1u64 << self.blocks.len()) - 1)
	}

	fn grow(&mut self) -> MonoResult<()> {
		if self.blocks.len() >= MAX_BLOCKS {
			return Err(MonoError::Storage("Record list is full".into()));
		}
		let slots = (BLOCK_BASE << self.blocks.len()) as usize;
		let block = self.store.create_area(slots * SLOT_SIZE)?;
		self.blocks.push(block);
		self.write_header()
	}

	fn put(&mut self, row: RowId, slot: Slot) -> MonoResult<()> {
		let (block, offset) = locate(row.0);
		let mut bytes = BytesMut::with_capacity(SLOT_SIZE);
		match slot {
			Slot::Live { state, area } => {
				bytes.put_i32_le(state.code());
				bytes.put_i64_le(AreaId::to_pointer(Some(area)));
			}
			Slot::Free { next } => {
				bytes.put_i32_le(RecordState::Deleted.code());
				bytes.put_i64_le(from_row(next));
			}
		}
		self.store
			.write(self.blocks[block], offset * SLOT_SIZE, &bytes)?;
		self.slots[row.0 as usize] = slot;
		Ok(())
	}

	fn write_header(&self) -> MonoResult<()> {
		let mut bytes = BytesMut::with_capacity(HEADER_SIZE);
		bytes.put_i32_le(LIST_VERSION);
		bytes.put_i64_le(from_row(self.first_free));
		bytes.put_i64_le(self.slots.len() as i64);
		bytes.put_i32_le(self.blocks.len() as i32);
		for block in &self.blocks {
			bytes.put_i64_le(AreaId::to_pointer(Some(*block)));
		}
		self.store.write(self.header_area, 0, &bytes)
	}
}

/// Block and slot offset of a row number
fn locate(row: u64) -> (usize, usize) {
	let block = 63 - (row / BLOCK_BASE + 1).leading_zeros() as usize;
	let start = BLOCK_BASE * ((1u64 << block) - 1);
	(block, (row - start) as usize)
}

fn to_row(pointer: i64) -> Option<RowId> {
	if pointer < 0 {
		None
	} else {
		Some(RowId(pointer as u64))
	}
}

fn from_row(row: Option<RowId>) -> i64 {
	row.map(|r| r.0 as i64).unwrap_or(-1)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_locate() {
		assert_eq!(locate(0), (0, 0));
		assert_eq!(locate(63), (0, 63));
		assert_eq!(locate(64), (1, 0));
		assert_eq!(locate(191), (1, 127));
		assert_eq!(locate(192), (2, 0));
	}

	#[test]
	fn test_transitions() {
		use RecordState::*;
		assert!(Uncommitted.can_transition_to(CommittedAdded));
		assert!(Uncommitted.can_transition_to(CommittedRemoved));
		assert!(CommittedAdded.can_transition_to(CommittedRemoved));
		assert!(CommittedRemoved.can_transition_to(Deleted));
		assert!(Deleted.can_transition_to(Uncommitted));

		assert!(!CommittedAdded.can_transition_to(Uncommitted));
		assert!(!CommittedRemoved.can_transition_to(CommittedAdded));
		assert!(!Uncommitted.can_transition_to(Deleted));
		assert!(!Deleted.can_transition_to(CommittedAdded));
	}

	#[test]
	fn test_allocate_grow_and_recycle() {
		let store = Arc::new(AreaStore::heap("list"));
		let mut list = RecordList::create(Arc::clone(&store)).unwrap();

		let rows: Vec<RowId> = (0..100)
			.map(|i| list.allocate(AreaId(1000 + i)).unwrap())
			.collect();
		assert_eq!(rows[99], RowId(99));
		assert_eq!(list.state(RowId(70)).unwrap(), RecordState::Uncommitted);

		for row in [RowId(10), RowId(70)] {
			list.set_state(row, RecordState::CommittedAdded).unwrap();
			list.set_state(row, RecordState::CommittedRemoved).unwrap();
			list.free(row).unwrap();
		}
		assert_eq!(list.free_list().unwrap(), vec![RowId(70), RowId(10)]);

		// Freed slots are reused most-recent first
		assert_eq!(list.allocate(AreaId(5000)).unwrap(), RowId(70));
		assert_eq!(list.allocate(AreaId(5001)).unwrap(), RowId(10));
		assert_eq!(list.allocate(AreaId(5002)).unwrap(), RowId(100));
	}

	#[test]
	fn test_illegal_transition_rejected() {
		let store = Arc::new(AreaStore::heap("list"));
		let mut list = RecordList::create(store).unwrap();
		let row = list.allocate(AreaId(9)).unwrap();

		assert!(list.free(row).unwrap_err().is_fatal());
		list.set_state(row, RecordState::CommittedAdded).unwrap();
		assert!(list.set_state(row, RecordState::Uncommitted).is_err());
		assert!(list.set_state(row, RecordState::Deleted).is_err());
	}

	#[test]
	fn test_reopen() {
		let store = Arc::new(AreaStore::heap("list"));
		let mut list = RecordList::create(Arc::clone(&store)).unwrap();
		for i in 0..70 {
			let row = list.allocate(AreaId(100 + i)).unwrap();
			list.set_state(row, RecordState::CommittedAdded).unwrap();
		}
		list.set_state(RowId(3), RecordState::CommittedRemoved).unwrap();
		list.free(RowId(3)).unwrap();
		let header = list.header_area();

		let reopened = RecordList::open(store, header).unwrap();
		assert_eq!(reopened.len(), 70);
		assert_eq!(reopened.free_list().unwrap(), vec![RowId(3)]);
		assert_eq!(reopened.area(RowId(65)).unwrap(), AreaId(165));
		assert_eq!(reopened.live_rows().count(), 69);
	}
}
