//! Transaction handle

use crate::error::MonoResult;
use crate::transaction::TableManager;
use crate::types::{CommitId, TxnId};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// An open transaction. Table access goes through the wrapped
/// [`TableManager`]; dropping the handle without committing rolls back.
pub struct Transaction {
	manager: TableManager,
	finished: bool,
}

impl Transaction {
	pub(crate) fn new(manager: TableManager) -> Self {
		Self {
			manager,
			finished: false,
		}
	}

	pub fn id(&self) -> TxnId {
		self.manager.txn_id()
	}

	/// Commit id this transaction reads from
	pub fn start_commit(&self) -> CommitId {
		self.manager.start_commit()
	}

	/// Publish the transaction's changes. A failed commit is rolled back
	/// before the error is returned.
	pub fn commit(mut self) -> MonoResult<CommitId> {
		self.finished = true;
		let conglomerate = Arc::clone(self.manager.conglomerate());
		match conglomerate.commit(&mut self.manager) {
			Ok(commit_id) => Ok(commit_id),
			Err(e) => {
				tracing::warn!("Commit of transaction {} failed: {}", self.id(), e);
				if let Err(rollback) = conglomerate.rollback(&mut self.manager) {
					tracing::error!(
						"Rollback after failed commit of transaction {} failed: {}",
						self.id(),
						rollback
					);
				}
				Err(e)
			}
		}
	}

	pub fn rollback(mut self) -> MonoResult<()> {
		self.finished = true;
		let conglomerate = Arc::clone(self.manager.conglomerate());
		conglomerate.rollback(&mut self.manager)
	}
}

impl Deref for Transaction {
	type Target = TableManager;

	fn deref(&self) -> &TableManager {
		&self.manager
	}
}

impl DerefMut for Transaction {
	fn deref_mut(&mut self) -> &mut TableManager {
		&mut self.manager
	}
}

impl Drop for Transaction {
	fn drop(&mut self) {
		if self.finished {
			return;
		}
		self.finished = true;
		let conglomerate = Arc::clone(self.manager.conglomerate());
		if let Err(e) = conglomerate.rollback(&mut self.manager) {
			tracing::error!("Rollback of dropped transaction {} failed: {}", self.id(), e);
		}
	}
}
