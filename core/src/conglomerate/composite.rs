//! The conglomerate: the set of table sources of one database and the
//! serialized commit path over them

use crate::config::{Config, StoreKind};
use crate::conglomerate::state::{TableState, TableStateStore};
use crate::conglomerate::transaction::Transaction;
use crate::error::{MonoError, MonoResult};
use crate::storage::{AreaStore, BlobId, BlobStore, StoreSystem};
use crate::table::{
	CellCache, IndexSet, PreparedCommit, RecordState, SourceContext, TableInfo, TableSource,
};
use crate::transaction::{TableManager, VisibleTable};
use crate::types::{CommitId, TableId, TxnId};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// State guarded by the commit lock
struct CommitState {
	catalog: TableStateStore,
	sources: HashMap<TableId, Arc<TableSource>>,
	/// Open transactions and the commit id each one started from
	open_transactions: Vec<(TxnId, CommitId)>,
	commit_id: CommitId,
	next_txn_id: u64,
}

impl CommitState {
	fn min_open(&self) -> Option<CommitId> {
		self.open_transactions.iter().map(|(_, start)| *start).min()
	}

	fn source(&self, id: TableId) -> MonoResult<Arc<TableSource>> {
		self.sources
			.get(&id)
			.cloned()
			.ok_or_else(|| MonoError::NotFound(format!("Table source {}", id)))
	}
}

pub struct Conglomerate {
	config: Config,
	system: StoreSystem,
	context: SourceContext,
	state: Mutex<CommitState>,
	closed: AtomicBool,
}

impl Conglomerate {
	fn state_store_name(config: &Config) -> String {
		format!("{}_state", config.database_name)
	}

	fn blob_store_name(config: &Config) -> String {
		format!("{}_blobs", config.database_name)
	}

	fn source_context(config: &Config, blob_store: Arc<AreaStore>) -> SourceContext {
		let cache = match config.cell_cache_entries {
			0 => None,
			entries => Some(Arc::new(CellCache::new(entries))),
		};
		SourceContext {
			blobs: Arc::new(BlobStore::new(blob_store)),
			cache,
			large_object_threshold: config.large_object_threshold,
		}
	}

	/// Whether a database with this configuration exists on disk
	pub fn exists(config: &Config) -> MonoResult<bool> {
		if config.store_kind == StoreKind::Heap {
			return Ok(false);
		}
		let system = StoreSystem::new(config.store_kind, &config.data_dir)?;
		Ok(system.store_exists(&Self::state_store_name(config)))
	}

	/// Create a new, empty database
	pub fn create(config: Config) -> MonoResult<Arc<Self>> {
		let system = StoreSystem::new(config.store_kind, &config.data_dir)?;
		let state_name = Self::state_store_name(&config);
		if system.store_exists(&state_name) {
			return Err(MonoError::AlreadyExists(format!(
				"Database '{}'",
				config.database_name
			)));
		}

		let catalog = TableStateStore::create(system.create_store(&state_name, false)?)?;
		let blob_store = system.create_store(&Self::blob_store_name(&config), false)?;
		let context = Self::source_context(&config, blob_store);

		tracing::info!(
			"Created database '{}' ({:?} store in {:?})",
			config.database_name,
			config.store_kind,
			config.data_dir
		);
		Ok(Arc::new(Self {
			config,
			system,
			context,
			state: Mutex::new(CommitState {
				catalog,
				sources: HashMap::new(),
				open_transactions: Vec::new(),
				commit_id: CommitId::default(),
				next_txn_id: 1,
			}),
			closed: AtomicBool::new(false),
		}))
	}

	/// Open an existing database, reconciling the catalog with the stores
	/// that actually exist
	pub fn open(config: Config) -> MonoResult<Arc<Self>> {
		let system = StoreSystem::new(config.store_kind, &config.data_dir)?;
		let state_name = Self::state_store_name(&config);
		if !system.store_exists(&state_name) {
			return Err(MonoError::NotFound(format!(
				"Database '{}'",
				config.database_name
			)));
		}

		let mut catalog = TableStateStore::open(system.open_store(&state_name)?)?;
		let blob_store = system.open_store(&Self::blob_store_name(&config))?;
		let context = Self::source_context(&config, blob_store);

		let mut sources = HashMap::new();
		let mut commit_id = CommitId::default();
		for table in catalog.visible().to_vec() {
			if !system.store_exists(&table.name) {
				return Err(MonoError::NotFound(format!(
					"Store '{}' of visible table {}",
					table.name, table.id
				)));
			}
			let store = system.open_store(&table.name)?;
			let source = TableSource::open(table.id, store, context.clone(), CommitId::default())?;
			commit_id = commit_id.max(source.latest_snapshot().commit_id());
			sources.insert(table.id, Arc::new(source));
		}

		let mut reconciled = false;
		for table in catalog.deleted().to_vec() {
			if !system.store_exists(&table.name) {
				tracing::info!(
					"Pending-delete table {} has no store, treating it as deleted",
					table.id
				);
				catalog.remove_deleted(table.id)?;
				reconciled = true;
				continue;
			}
			match system
				.open_store(&table.name)
				.and_then(|store| TableSource::open(table.id, store, context.clone(), commit_id))
			{
				Ok(source) => {
					sources.insert(table.id, Arc::new(source));
				}
				Err(e) => {
					tracing::warn!(
						"Pending-delete table {} could not be opened ({}), removing its store",
						table.id,
						e
					);
					system.delete_named_store(&table.name)?;
					catalog.remove_deleted(table.id)?;
					reconciled = true;
				}
			}
		}
		if reconciled {
			catalog.flush()?;
		}
		Self::free_leaked_objects(&context, &sources);

		let conglomerate = Self {
			config,
			system,
			context,
			state: Mutex::new(CommitState {
				catalog,
				sources,
				open_transactions: Vec::new(),
				commit_id,
				next_txn_id: 1,
			}),
			closed: AtomicBool::new(false),
		};
		{
			let mut state = conglomerate.state.lock();
			conglomerate.cleanup(&mut state)?;
			tracing::info!(
				"Opened database '{}': {} tables at commit {}",
				conglomerate.config.database_name,
				state.catalog.visible().len(),
				state.commit_id
			);
		}
		Ok(Arc::new(conglomerate))
	}

	/// Close every source and the shared stores. Fails while transactions
	/// are still open.
	pub fn close(&self) -> MonoResult<()> {
		let mut state = self.state.lock();
		if self.closed.load(Ordering::SeqCst) {
			return Ok(());
		}
		if !state.open_transactions.is_empty() {
			return Err(MonoError::Transaction(format!(
				"Cannot close database with {} open transactions",
				state.open_transactions.len()
			)));
		}

		self.cleanup(&mut state)?;
		for source in state.sources.values() {
			source.merge_history(None)?;
			source.close(&self.system, true)?;
		}
		self.system.close_store(self.context.blobs.store())?;
		self.system.close_store(state.catalog.store())?;
		self.closed.store(true, Ordering::SeqCst);
		tracing::info!("Closed database '{}'", self.config.database_name);
		Ok(())
	}

	/// Free large objects no open source refers to, left behind when the
	/// blob store was checkpointed after a table store that was not. Failures
	/// are logged and skipped.
	fn free_leaked_objects(context: &SourceContext, sources: &HashMap<TableId, Arc<TableSource>>) {
		let mut references: HashMap<BlobId, i64> = HashMap::new();
		for source in sources.values() {
			match source.object_references() {
				Ok(blobs) => {
					for id in blobs {
						*references.entry(id).or_default() += 1;
					}
				}
				Err(e) => {
					tracing::warn!(
						"Skipping large object scan, table {} is unreadable: {}",
						source.table_id(),
						e
					);
					return;
				}
			}
		}
		if context.blobs.reconcile(&references) > 0 {
			if let Err(e) = context.blobs.store().checkpoint() {
				tracing::warn!("Checkpoint of the large object store failed: {}", e);
			}
		}
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}

	fn check_open(&self) -> MonoResult<()> {
		if self.is_closed() {
			return Err(MonoError::Storage(format!(
				"Database '{}' is closed",
				self.config.database_name
			)));
		}
		Ok(())
	}

	pub fn config(&self) -> &Config {
		&self.config
	}

	pub fn blob_store(&self) -> &Arc<BlobStore> {
		&self.context.blobs
	}

	/// Id of the most recent commit
	pub fn commit_id(&self) -> CommitId {
		self.state.lock().commit_id
	}

	pub fn open_transaction_count(&self) -> usize {
		self.state.lock().open_transactions.len()
	}

	pub fn visible_tables(&self) -> Vec<TableState> {
		self.state.lock().catalog.visible().to_vec()
	}

	pub fn pending_delete_tables(&self) -> Vec<TableState> {
		self.state.lock().catalog.deleted().to_vec()
	}

	pub fn table_source(&self, id: TableId) -> Option<Arc<TableSource>> {
		self.state.lock().sources.get(&id).cloned()
	}

	pub fn is_temporary(&self, id: TableId) -> bool {
		self.state.lock().catalog.is_temporary(id)
	}

	/// Start a transaction over the currently committed tables
	pub fn begin_transaction(self: &Arc<Self>) -> MonoResult<Transaction> {
		self.check_open()?;
		let mut state = self.state.lock();

		let mut tables = Vec::with_capacity(state.catalog.visible().len());
		for table in state.catalog.visible() {
			let source = state.source(table.id)?;
			let index_set = source.create_index_set();
			tables.push(VisibleTable::new(source, index_set));
		}

		let txn_id = TxnId(state.next_txn_id);
		state.next_txn_id += 1;
		let start = state.commit_id;
		state.open_transactions.push((txn_id, start));
		tracing::debug!("Began transaction {} at commit {}", txn_id, start);

		Ok(Transaction::new(TableManager::new(
			Arc::clone(self),
			txn_id,
			start,
			tables,
		)))
	}

	/// Create a new table source. It is recorded in the delete list until the
	/// transaction that created it commits.
	pub fn create_table_source(&self, info: TableInfo, temporary: bool) -> MonoResult<Arc<TableSource>> {
		self.check_open()?;
		info.validate()?;
		let mut state = self.state.lock();

		let id = state.catalog.next_table_id();
		let physical = info.physical_name(id);
		let table = if temporary {
			let name = format!("{}_tmp_{}", physical, uuid::Uuid::new_v4().simple());
			TableState::temporary(id, &name)
		} else {
			TableState::new(id, &physical)
		};
		let name = table.name.clone();
		state.catalog.add_deleted(table)?;
		state.catalog.flush()?;

		let store = self.system.create_store(&name, temporary)?;
		let source = match TableSource::create(id, info, Arc::clone(&store), self.context.clone(), state.commit_id) {
			Ok(source) => Arc::new(source),
			Err(e) => {
				if let Err(cleanup) = self.system.delete_store(&store) {
					tracing::warn!("Failed to remove store '{}': {}", name, cleanup);
				}
				return Err(e);
			}
		};
		state.sources.insert(id, Arc::clone(&source));
		tracing::info!(
			"Created table source {} ('{}') in store '{}'",
			id,
			source.info().name,
			name
		);
		Ok(source)
	}

	/// Create a new source holding a compact copy of the rows visible
	/// through `index_set`
	pub fn copy_source_table(&self, source: &TableSource, index_set: &IndexSet) -> MonoResult<Arc<TableSource>> {
		let temporary = self.is_temporary(source.table_id());
		let target = self.create_table_source(source.info().clone(), temporary)?;

		let rows = index_set.rows();
		for row in &rows {
			let values = source.get_row(*row)?;
			let copy = target.add_row(&values)?;
			target.write_record_state(copy, RecordState::CommittedAdded)?;
		}
		target.set_unique_id(source.current_unique_id())?;
		target.build_indexes()?;
		target.checkpoint()?;

		tracing::info!(
			"Copied {} rows of table {} into {}",
			rows.len(),
			source.table_id(),
			target.table_id()
		);
		Ok(target)
	}

	/// Commit the changes recorded by `manager`. On error nothing has been
	/// published to other transactions and the caller must roll back.
	pub(crate) fn commit(&self, manager: &mut TableManager) -> MonoResult<CommitId> {
		let mut state = self.state.lock();
		let txn_id = manager.txn_id();
		let start = manager.start_commit();

		let created_order = manager.created().to_vec();
		let created: HashSet<TableId> = created_order.iter().copied().collect();
		let visible: HashSet<TableId> = manager.visible_ids().collect();
		let dropped: Vec<TableId> = manager
			.dropped()
			.iter()
			.copied()
			.filter(|id| !created.contains(id))
			.collect();

		// A table created here must not clash by name with one committed meanwhile
		for id in created.iter().filter(|id| visible.contains(*id)) {
			let source = state.source(*id)?;
			let name = &source.info().name;
			for table in state.catalog.visible() {
				if dropped.contains(&table.id) {
					continue;
				}
				if let Some(other) = state.sources.get(&table.id) {
					if other.info().name.eq_ignore_ascii_case(name) {
						return Err(MonoError::CommitConflict(format!(
							"Table '{}' was created by a concurrent transaction",
							name
						)));
					}
				}
			}
		}

		for id in &dropped {
			if !state.catalog.is_visible(*id) {
				return Err(MonoError::CommitConflict(format!(
					"Table {} was dropped by a concurrent transaction",
					id
				)));
			}
			if state.source(*id)?.changed_since(start) {
				return Err(MonoError::CommitConflict(format!(
					"Table {} was modified by a concurrent transaction",
					id
				)));
			}
		}

		for registry in manager.registries() {
			let id = registry.table_id();
			if !created.contains(&id) && !state.catalog.is_visible(id) {
				return Err(MonoError::CommitConflict(format!(
					"Table {} was dropped by a concurrent transaction",
					id
				)));
			}
			let source = state.source(id)?;
			source.test_commit_clash(registry, start)?;
			source.test_unique_clash(registry)?;
		}

		let has_changes = !created.is_empty()
			|| !dropped.is_empty()
			|| manager.registries().any(|registry| !registry.is_empty());
		if !has_changes {
			let commit_id = state.commit_id;
			manager.dispose();
			self.close_transaction(&mut state, txn_id);
			tracing::debug!("Transaction {} committed without changes", txn_id);
			return Ok(commit_id);
		}

		let commit_id = state.commit_id.next();
		let moved: Vec<TableId> = created_order
			.iter()
			.copied()
			.filter(|id| visible.contains(id))
			.collect();

		// Fold every change before touching any store
		let registries = manager.take_registries();
		let prepared: MonoResult<Vec<(Arc<TableSource>, PreparedCommit)>> = registries
			.iter()
			.map(|registry| {
				let source = state.source(registry.table_id())?;
				let change = source.prepare_commit(commit_id, registry)?;
				Ok((source, change))
			})
			.collect();
		let mut changes = match prepared {
			Ok(changes) => changes,
			Err(e) => {
				manager.restore_registries(registries);
				return Err(e);
			}
		};

		if let Err(e) = self.write_commit(&mut state, &mut changes, &moved, &dropped) {
			tracing::error!("Commit {} of transaction {} failed: {}", commit_id, txn_id, e);
			manager.restore_registries(registries);
			return Err(e);
		}

		// Every store and the catalog are written; nothing below can fail
		state.commit_id = commit_id;
		for ((source, change), registry) in changes.into_iter().zip(registries) {
			source.publish_commit(change, registry);
		}
		// Changes to tables dropped in this transaction die with the table
		drop(manager.take_retired());

		manager.dispose();
		self.close_transaction(&mut state, txn_id);
		tracing::info!("Transaction {} committed as {}", txn_id, commit_id);
		Ok(commit_id)
	}

	/// Write prepared changes and catalog moves through to the stores. On
	/// failure every source and the catalog are put back as they were.
	fn write_commit(
		&self,
		state: &mut CommitState,
		changes: &mut [(Arc<TableSource>, PreparedCommit)],
		moved: &[TableId],
		dropped: &[TableId],
	) -> MonoResult<()> {
		let visible = state.catalog.visible().to_vec();
		let deleted = state.catalog.deleted().to_vec();

		let result = self.try_write_commit(state, changes, moved, dropped);
		if result.is_ok() {
			return result;
		}

		for (source, change) in changes.iter_mut().rev() {
			source.revert_commit(change);
			if self.config.checkpoint_on_commit {
				if let Err(e) = source.checkpoint() {
					tracing::warn!("Checkpoint of reverted table {} failed: {}", source.table_id(), e);
				}
			}
		}
		if state.catalog.visible() != visible.as_slice() || state.catalog.deleted() != deleted.as_slice() {
			state.catalog.restore(visible, deleted);
			if let Err(e) = state.catalog.flush() {
				tracing::warn!("Flush of restored catalog failed: {}", e);
			}
		}
		result
	}

	fn try_write_commit(
		&self,
		state: &mut CommitState,
		changes: &mut [(Arc<TableSource>, PreparedCommit)],
		moved: &[TableId],
		dropped: &[TableId],
	) -> MonoResult<()> {
		for (source, change) in changes.iter_mut() {
			source.write_commit(change)?;
		}

		for id in moved {
			let table = state.catalog.remove_deleted(*id)?;
			state.catalog.add_visible(table)?;
		}
		for id in dropped {
			let table = state.catalog.remove_visible(*id)?;
			state.catalog.add_deleted(table)?;
		}

		if self.config.checkpoint_on_commit {
			self.context.blobs.store().checkpoint()?;
			for (source, _) in changes.iter() {
				source.checkpoint()?;
			}
			for id in moved {
				state.source(*id)?.checkpoint()?;
			}
		}
		if !moved.is_empty() || !dropped.is_empty() {
			state.catalog.flush()?;
		}
		Ok(())
	}

	/// Undo every change recorded by `manager` and close the transaction
	pub(crate) fn rollback(&self, manager: &mut TableManager) -> MonoResult<()> {
		let mut state = self.state.lock();
		let txn_id = manager.txn_id();

		let mut first_error = None;
		let registries = manager
			.take_registries()
			.into_iter()
			.chain(manager.take_retired());
		for registry in registries {
			let result = state
				.source(registry.table_id())
				.and_then(|source| source.rollback_transaction_change(&registry));
			if let Err(e) = result {
				tracing::error!(
					"Rollback of table {} in transaction {} failed: {}",
					registry.table_id(),
					txn_id,
					e
				);
				first_error.get_or_insert(e);
			}
		}

		manager.dispose();
		self.close_transaction(&mut state, txn_id);
		tracing::debug!("Transaction {} rolled back", txn_id);
		first_error.map_or(Ok(()), Err)
	}

	/// Forget an open transaction, trim history no transaction can still
	/// observe and, when nothing is open, remove pending-delete tables
	fn close_transaction(&self, state: &mut CommitState, txn_id: TxnId) {
		state.open_transactions.retain(|(id, _)| *id != txn_id);
		let min_open = state.min_open();
		for source in state.sources.values() {
			if let Err(e) = source.merge_history(min_open) {
				tracing::warn!("History merge of table {} failed: {}", source.table_id(), e);
			}
		}
		if let Err(e) = self.cleanup(state) {
			tracing::error!("Cleanup of pending-delete tables failed: {}", e);
		}
	}

	fn cleanup(&self, state: &mut CommitState) -> MonoResult<()> {
		if !state.open_transactions.is_empty() {
			return Ok(());
		}

		let mut removed = 0;
		for table in state.catalog.deleted().to_vec() {
			match state.sources.get(&table.id) {
				Some(source) if source.root_lock_count() > 0 => {
					tracing::debug!(
						"Table {} still has {} root locks, deferring removal",
						table.id,
						source.root_lock_count()
					);
					continue;
				}
				Some(source) => source.drop_store(&self.system)?,
				None if self.system.store_exists(&table.name) => {
					self.system.delete_named_store(&table.name)?
				}
				None => {}
			}
			state.sources.remove(&table.id);
			state.catalog.remove_deleted(table.id)?;
			removed += 1;
		}

		if removed > 0 {
			state.catalog.flush()?;
			tracing::info!("Removed {} pending-delete tables", removed);
		}
		Ok(())
	}
}
