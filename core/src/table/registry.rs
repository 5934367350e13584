//! Per-transaction journal of row changes against one table

use crate::error::{MonoError, MonoResult};
use crate::types::{CommitId, RowId, TableId, TxnId};
use parking_lot::Mutex;
use std::collections::HashSet;

/// A row change recorded by a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RowEvent {
	Add(RowId),
	Remove(RowId),
	/// New version of an updated row
	UpdateAdd(RowId),
	/// Old version of an updated row
	UpdateRemove(RowId),
}

impl RowEvent {
	pub fn row(&self) -> RowId {
		match self {
			RowEvent::Add(row)
			| RowEvent::Remove(row)
			| RowEvent::UpdateAdd(row)
			| RowEvent::UpdateRemove(row) => *row,
		}
	}

	pub fn is_add(&self) -> bool {
		matches!(self, RowEvent::Add(_) | RowEvent::UpdateAdd(_))
	}

	pub fn is_remove(&self) -> bool {
		matches!(self, RowEvent::Remove(_) | RowEvent::UpdateRemove(_))
	}
}

/// Ordered, append-only event log of one transaction against one table.
///
/// Adds are always to fresh row numbers, so a row is added at most once per
/// registry. A row added and later removed in the same registry is
/// transient: it never becomes visible to anyone else.
#[derive(Debug)]
pub struct TableEventRegistry {
	table_id: TableId,
	txn_id: TxnId,
	events: Mutex<Vec<RowEvent>>,
	commit_id: Option<CommitId>,
}

impl TableEventRegistry {
	pub fn new(table_id: TableId, txn_id: TxnId) -> Self {
		Self {
			table_id,
			txn_id,
			events: Mutex::new(Vec::new()),
			commit_id: None,
		}
	}

	pub fn table_id(&self) -> TableId {
		self.table_id
	}

	pub fn txn_id(&self) -> TxnId {
		self.txn_id
	}

	/// Commit id, once the owning transaction has committed
	pub fn commit_id(&self) -> Option<CommitId> {
		self.commit_id
	}

	pub fn stamp(&mut self, commit_id: CommitId) {
		self.commit_id = Some(commit_id);
	}

	pub fn register(&self, event: RowEvent) {
		self.events.lock().push(event);
	}

	pub fn len(&self) -> usize {
		self.events.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.events.lock().is_empty()
	}

	pub fn events(&self) -> Vec<RowEvent> {
		self.events.lock().clone()
	}

	/// Rows added and still present at the end of the log
	pub fn added_rows(&self) -> Vec<RowId> {
		let events = self.events.lock();
		let removed: HashSet<RowId> = events
			.iter()
			.filter(|e| e.is_remove())
			.map(|e| e.row())
			.collect();
		events
			.iter()
			.filter(|e| e.is_add() && !removed.contains(&e.row()))
			.map(|e| e.row())
			.collect()
	}

	/// Pre-existing rows removed by this log
	pub fn removed_rows(&self) -> Vec<RowId> {
		let events = self.events.lock();
		let added: HashSet<RowId> = events
			.iter()
			.filter(|e| e.is_add())
			.map(|e| e.row())
			.collect();
		let mut seen = HashSet::new();
		events
			.iter()
			.filter(|e| e.is_remove() && !added.contains(&e.row()) && seen.insert(e.row()))
			.map(|e| e.row())
			.collect()
	}

	/// Rows both added and removed by this log
	pub fn transient_rows(&self) -> Vec<RowId> {
		let events = self.events.lock();
		let removed: HashSet<RowId> = events
			.iter()
			.filter(|e| e.is_remove())
			.map(|e| e.row())
			.collect();
		events
			.iter()
			.filter(|e| e.is_add() && removed.contains(&e.row()))
			.map(|e| e.row())
			.collect()
	}

	/// Whether this log removes `row`
	pub fn removes(&self, row: RowId) -> bool {
		self.events
			.lock()
			.iter()
			.any(|e| e.is_remove() && e.row() == row)
	}

	/// Undo the first `count` events.
	///
	/// A row added in the undone prefix cannot simply disappear from the log
	/// because its slot is already allocated, so it is re-appended as an
	/// `Add` followed by a `Remove`. Removes in the prefix of rows added
	/// earlier are dropped, which leaves those rows live. Returns the undone
	/// events, oldest first.
	pub fn rollback(&self, count: usize) -> MonoResult<Vec<RowEvent>> {
		let mut events = self.events.lock();
		self.check_count(count, events.len())?;
		let undone: Vec<RowEvent> = events.drain(..count).collect();
		Self::mark_removed(&mut events, &undone);
		tracing::debug!(
			"Rolled back first {} events on table {} for transaction {}",
			count,
			self.table_id,
			self.txn_id
		);
		Ok(undone)
	}

	/// Undo the last `count` events, the changes of the most recent
	/// statement. Added rows are re-appended as in [`Self::rollback`].
	pub fn rollback_last(&self, count: usize) -> MonoResult<Vec<RowEvent>> {
		let mut events = self.events.lock();
		self.check_count(count, events.len())?;
		let keep = events.len() - count;
		let undone = events.split_off(keep);
		Self::mark_removed(&mut events, &undone);
		tracing::debug!(
			"Rolled back last {} events on table {} for transaction {}",
			count,
			self.table_id,
			self.txn_id
		);
		Ok(undone)
	}

	fn check_count(&self, count: usize, len: usize) -> MonoResult<()> {
		if count > len {
			return Err(MonoError::InvalidInput(format!(
				"Cannot roll back {} of {} events on table {}",
				count, len, self.table_id
			)));
		}
		Ok(())
	}

	fn mark_removed(events: &mut Vec<RowEvent>, undone: &[RowEvent]) {
		for event in undone.iter().filter(|e| e.is_add()) {
			events.push(RowEvent::Add(event.row()));
			events.push(RowEvent::Remove(event.row()));
		}
	}

	/// Fail when both logs remove the same row
	pub fn test_commit_clash(&self, other: &TableEventRegistry) -> MonoResult<()> {
		let mine: HashSet<RowId> = self
			.events
			.lock()
			.iter()
			.filter(|e| e.is_remove())
			.map(|e| e.row())
			.collect();
		if mine.is_empty() {
			return Ok(());
		}

		let theirs = other.events.lock();
		if let Some(event) = theirs
			.iter()
			.find(|e| e.is_remove() && mine.contains(&e.row()))
		{
			return Err(MonoError::CommitConflict(format!(
				"Row {} of table {} was removed by a concurrent transaction",
				event.row(),
				self.table_id
			)));
		}
		Ok(())
	}
}
