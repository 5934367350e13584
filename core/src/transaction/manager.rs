//! Per-transaction table manager

use crate::conglomerate::Conglomerate;
use crate::error::{MonoError, MonoResult};
use crate::table::mutable::evaluate_default;
use crate::table::{
	IndexSet, MutableTable, Row, TableEventRegistry, TableInfo, TableSource, TableView,
};
use crate::transaction::dynamic::{DynamicTable, TableRef};
use crate::types::{CommitId, TableId, TxnId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// A table visible to a transaction: the shared source and the
/// transaction's private index set over it
pub struct VisibleTable {
	pub source: Arc<TableSource>,
	pub index_set: IndexSet,
}

impl VisibleTable {
	pub fn new(source: Arc<TableSource>, index_set: IndexSet) -> Self {
		Self { source, index_set }
	}
}

/// The tables one transaction sees, and every structural and row change it
/// has made to them
pub struct TableManager {
	conglomerate: Arc<Conglomerate>,
	txn_id: TxnId,
	start_commit: CommitId,
	tables: Vec<VisibleTable>,
	/// Lower-cased table name to position in `tables`
	positions: HashMap<String, usize>,
	registries: HashMap<TableId, TableEventRegistry>,
	/// Registries of tables dropped or replaced in this transaction
	retired: Vec<TableEventRegistry>,
	selected: HashSet<TableId>,
	created: Vec<TableId>,
	dropped: Vec<TableId>,
	/// Dropped tables, released when the transaction ends
	cleanup: Vec<VisibleTable>,
}

impl TableManager {
	pub(crate) fn new(
		conglomerate: Arc<Conglomerate>,
		txn_id: TxnId,
		start_commit: CommitId,
		tables: Vec<VisibleTable>,
	) -> Self {
		let mut manager = Self {
			conglomerate,
			txn_id,
			start_commit,
			tables,
			positions: HashMap::new(),
			registries: HashMap::new(),
			retired: Vec::new(),
			selected: HashSet::new(),
			created: Vec::new(),
			dropped: Vec::new(),
			cleanup: Vec::new(),
		};
		manager.reindex();
		manager
	}

	pub fn txn_id(&self) -> TxnId {
		self.txn_id
	}

	pub fn start_commit(&self) -> CommitId {
		self.start_commit
	}

	pub(crate) fn conglomerate(&self) -> &Arc<Conglomerate> {
		&self.conglomerate
	}

	fn reindex(&mut self) {
		self.positions = self
			.tables
			.iter()
			.enumerate()
			.map(|(position, table)| (table.source.info().name.to_ascii_lowercase(), position))
			.collect();
	}

	/// Resolve a table name against this transaction's view
	pub fn resolve(&self, name: &str) -> Option<TableRef> {
		if let Some(position) = self.positions.get(&name.to_ascii_lowercase()) {
			return Some(TableRef::Physical(*position));
		}
		DynamicTable::from_name(name).map(TableRef::Dynamic)
	}

	fn physical(&self, name: &str) -> MonoResult<usize> {
		match self.resolve(name) {
			Some(TableRef::Physical(position)) => Ok(position),
			Some(TableRef::Dynamic(table)) => Err(MonoError::UnsupportedOperation(format!(
				"System table '{}' cannot be modified",
				table.name()
			))),
			None => Err(MonoError::NotFound(format!("Table '{}'", name))),
		}
	}

	/// Names of the stored tables visible to this transaction
	pub fn table_names(&self) -> Vec<String> {
		self.tables
			.iter()
			.map(|table| table.source.info().name.clone())
			.collect()
	}

	pub fn dynamic_table_names(&self) -> Vec<&'static str> {
		DynamicTable::ALL.iter().map(|table| table.name()).collect()
	}

	pub fn table_exists(&self, name: &str) -> bool {
		self.resolve(name).is_some()
	}

	pub fn table_info(&self, name: &str) -> MonoResult<TableInfo> {
		match self.resolve(name) {
			Some(TableRef::Physical(position)) => Ok(self.tables[position].source.info().clone()),
			Some(TableRef::Dynamic(table)) => Ok(table.info()),
			None => Err(MonoError::NotFound(format!("Table '{}'", name))),
		}
	}

	/// Rows of a system table as of this transaction
	pub fn dynamic_rows(&self, name: &str) -> MonoResult<Vec<Row>> {
		match self.resolve(name) {
			Some(TableRef::Dynamic(table)) => table.rows(&self.tables),
			Some(TableRef::Physical(_)) => Err(MonoError::InvalidInput(format!(
				"'{}' is not a system table",
				name
			))),
			None => Err(MonoError::NotFound(format!("Table '{}'", name))),
		}
	}

	pub fn create_table(&mut self, info: TableInfo, temporary: bool) -> MonoResult<TableId> {
		match self.resolve(&info.name) {
			Some(TableRef::Dynamic(table)) => {
				return Err(MonoError::InvalidInput(format!(
					"'{}' is a system table name",
					table.name()
				)));
			}
			Some(TableRef::Physical(_)) => {
				return Err(MonoError::AlreadyExists(format!("Table '{}'", info.name)));
			}
			None => {}
		}

		let source = self.conglomerate.create_table_source(info, temporary)?;
		let index_set = source.create_index_set();
		let id = source.table_id();
		tracing::debug!(
			"Transaction {} created table '{}' ({})",
			self.txn_id,
			source.info().name,
			id
		);
		self.tables.push(VisibleTable::new(source, index_set));
		self.created.push(id);
		self.reindex();
		Ok(id)
	}

	pub fn drop_table(&mut self, name: &str) -> MonoResult<()> {
		let position = self.physical(name)?;
		let table = self.tables.remove(position);
		let id = table.source.table_id();
		self.retire(id);
		self.dropped.push(id);
		self.cleanup.push(table);
		self.reindex();
		tracing::debug!("Transaction {} dropped table '{}' ({})", self.txn_id, name, id);
		Ok(())
	}

	/// Replace a table's definition. Rows are copied into a new source with
	/// columns matched by name; new columns take their default.
	pub fn alter_table(&mut self, info: TableInfo) -> MonoResult<TableId> {
		let position = self.physical(&info.name)?;
		info.validate()?;
		let name = info.name.clone();

		let old = &self.tables[position];
		let temporary = self.conglomerate.is_temporary(old.source.table_id());
		let source = self.conglomerate.create_table_source(info, temporary)?;
		let mut index_set = source.create_index_set();
		let registry = source.new_registry(self.txn_id);
		source.set_unique_id(old.source.current_unique_id())?;

		let old_info = old.source.info();
		let mapping: Vec<Option<usize>> = source
			.info()
			.columns
			.iter()
			.map(|column| old_info.column_index(&column.name))
			.collect();
		{
			let mut table = MutableTable::new(&source, &mut index_set, &registry);
			for row in old.index_set.rows() {
				let mut values = Vec::with_capacity(mapping.len());
				for (column, from) in source.info().columns.iter().zip(&mapping) {
					values.push(match from {
						Some(from) => old.source.get_value(row, *from)?,
						None => evaluate_default(&source, column)?,
					});
				}
				table.add_row(values)?;
			}
		}
		source.rebuild_index_set(&mut index_set)?;

		let old_id = old.source.table_id();
		let new_id = source.table_id();
		let old = std::mem::replace(
			&mut self.tables[position],
			VisibleTable::new(source, index_set),
		);
		self.retire(old_id);
		self.registries.insert(new_id, registry);
		self.dropped.push(old_id);
		self.created.push(new_id);
		self.cleanup.push(old);
		self.reindex();

		self.assert_constraints(&name)?;
		tracing::info!("Altered table '{}' ({} -> {})", name, old_id, new_id);
		Ok(new_id)
	}

	/// Rewrite a table into a fresh source without free slots. Returns
	/// whether the table was compacted.
	pub fn compact_table(&mut self, name: &str, force: bool) -> MonoResult<bool> {
		let position = self.physical(name)?;
		let table = &self.tables[position];
		let id = table.source.table_id();
		if self.registries.get(&id).is_some_and(|registry| !registry.is_empty()) {
			return Err(MonoError::Transaction(format!(
				"Table '{}' has uncommitted changes and cannot be compacted",
				name
			)));
		}

		let stats = table.source.stats();
		let wasted = stats.free + stats.removed;
		if !force && (stats.slots == 0 || wasted * 2 < stats.slots) {
			tracing::debug!(
				"Table '{}' not compacted: {} of {} slots unused",
				name,
				wasted,
				stats.slots
			);
			return Ok(false);
		}

		let source = self
			.conglomerate
			.copy_source_table(&table.source, &table.index_set)?;
		let index_set = source.create_index_set();
		let new_id = source.table_id();
		let old = std::mem::replace(
			&mut self.tables[position],
			VisibleTable::new(source, index_set),
		);
		self.retire(id);
		self.dropped.push(id);
		self.created.push(new_id);
		self.cleanup.push(old);
		tracing::info!("Compacted table '{}' ({} -> {})", name, id, new_id);
		Ok(true)
	}

	/// Read-write access to a table
	pub fn get_table(&mut self, name: &str) -> MonoResult<MutableTable<'_>> {
		let position = self.physical(name)?;
		let txn_id = self.txn_id;
		let table = &mut self.tables[position];
		let registry = self
			.registries
			.entry(table.source.table_id())
			.or_insert_with(|| table.source.new_registry(txn_id));
		Ok(MutableTable::new(&table.source, &mut table.index_set, registry))
	}

	/// Read access to a table; the table is recorded as read
	pub fn select_table(&mut self, name: &str) -> MonoResult<TableView<'_>> {
		let position = self.physical(name)?;
		let table = &mut self.tables[position];
		self.selected.insert(table.source.table_id());
		Ok(TableView::new(&table.source, &mut table.index_set))
	}

	pub fn assert_constraints(&mut self, name: &str) -> MonoResult<()> {
		self.get_table(name)?.assert_constraints()
	}

	pub fn selected_tables(&self) -> Vec<TableId> {
		self.selected.iter().copied().collect()
	}

	/// Ids of tables created by this transaction
	pub fn created(&self) -> &[TableId] {
		&self.created
	}

	/// Ids of tables dropped by this transaction
	pub fn dropped(&self) -> &[TableId] {
		&self.dropped
	}

	pub fn pending_cleanup(&self) -> usize {
		self.cleanup.len()
	}

	pub(crate) fn visible_ids(&self) -> impl Iterator<Item = TableId> + '_ {
		self.tables.iter().map(|table| table.source.table_id())
	}

	pub(crate) fn registries(&self) -> impl Iterator<Item = &TableEventRegistry> {
		self.registries.values().filter(|registry| !registry.is_empty())
	}

	pub(crate) fn take_registries(&mut self) -> Vec<TableEventRegistry> {
		self.registries
			.drain()
			.map(|(_, registry)| registry)
			.filter(|registry| !registry.is_empty())
			.collect()
	}

	pub(crate) fn restore_registries(&mut self, registries: Vec<TableEventRegistry>) {
		for registry in registries {
			self.registries.insert(registry.table_id(), registry);
		}
	}

	pub(crate) fn take_retired(&mut self) -> Vec<TableEventRegistry> {
		std::mem::take(&mut self.retired)
	}

	/// Release the tables dropped by this transaction
	pub(crate) fn dispose(&mut self) {
		self.cleanup.clear();
		self.selected.clear();
	}

	fn retire(&mut self, id: TableId) {
		self.selected.remove(&id);
		if let Some(registry) = self.registries.remove(&id) {
			if !registry.is_empty() {
				self.retired.push(registry);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::Config;
	use crate::table::{ColumnInfo, DataType, DefaultExpr, Value};
	use pretty_assertions::assert_eq;

	fn people() -> TableInfo {
		TableInfo::new(
			"people",
			vec![
				ColumnInfo::new("id", DataType::BigInt).primary_key(),
				ColumnInfo::new("name", DataType::Text),
			],
		)
	}

	#[test]
	fn test_create_and_resolve() {
		let db = Conglomerate::create(Config::in_memory()).unwrap();
		let mut txn = db.begin_transaction().unwrap();
		let id = txn.create_table(people(), false).unwrap();

		assert_eq!(txn.resolve("PEOPLE"), Some(TableRef::Physical(0)));
		assert_eq!(
			txn.resolve("sys_tables"),
			Some(TableRef::Dynamic(DynamicTable::Tables))
		);
		assert_eq!(txn.created(), &[id]);
		assert!(matches!(
			txn.create_table(people(), false),
			Err(MonoError::AlreadyExists(_))
		));
		assert!(matches!(
			txn.create_table(TableInfo::new("sys_columns", people().columns), false),
			Err(MonoError::InvalidInput(_))
		));
		assert!(matches!(
			txn.get_table("sys_tables"),
			Err(MonoError::UnsupportedOperation(_))
		));
		assert!(matches!(txn.drop_table("missing"), Err(MonoError::NotFound(_))));
		txn.commit().unwrap();
	}

	#[test]
	fn test_drop_queues_cleanup() {
		let db = Conglomerate::create(Config::in_memory()).unwrap();
		let mut txn = db.begin_transaction().unwrap();
		txn.create_table(people(), false).unwrap();
		txn.commit().unwrap();

		let mut txn = db.begin_transaction().unwrap();
		txn.get_table("people")
			.unwrap()
			.add_row(vec![Value::Integer(1), Value::from("ada")])
			.unwrap();
		txn.drop_table("people").unwrap();
		assert!(!txn.table_exists("people"));
		assert_eq!(txn.pending_cleanup(), 1);
		txn.rollback().unwrap();

		// The rollback restores the table without the row added before the drop
		let mut txn = db.begin_transaction().unwrap();
		assert_eq!(txn.select_table("people").unwrap().row_count(), 0);
	}

	#[test]
	fn test_alter_remaps_columns() {
		let db = Conglomerate::create(Config::in_memory()).unwrap();
		let mut txn = db.begin_transaction().unwrap();
		txn.create_table(people(), false).unwrap();
		{
			let mut table = txn.get_table("people").unwrap();
			table.add_row(vec![Value::Integer(1), Value::from("ada")]).unwrap();
			table.add_row(vec![Value::Integer(2), Value::from("brian")]).unwrap();
		}
		txn.commit().unwrap();

		let mut txn = db.begin_transaction().unwrap();
		let altered = TableInfo::new(
			"people",
			vec![
				ColumnInfo::new("name", DataType::Text),
				ColumnInfo::new("id", DataType::BigInt).primary_key(),
				ColumnInfo::new("active", DataType::Boolean)
					.not_null()
					.default_value(DefaultExpr::Literal(Value::Boolean(true))),
			],
		);
		txn.alter_table(altered).unwrap();
		let mut rows: Vec<Row> = txn
			.select_table("people")
			.unwrap()
			.rows()
			.unwrap()
			.into_iter()
			.map(|(_, row)| row)
			.collect();
		rows.sort();
		assert_eq!(
			rows,
			vec![
				vec![Value::from("ada"), Value::Integer(1), Value::Boolean(true)],
				vec![Value::from("brian"), Value::Integer(2), Value::Boolean(true)],
			]
		);
		txn.commit().unwrap();
		assert_eq!(db.visible_tables().len(), 1);
		assert!(db.pending_delete_tables().is_empty());
	}

	#[test]
	fn test_alter_rejects_not_null_without_default() {
		let db = Conglomerate::create(Config::in_memory()).unwrap();
		let mut txn = db.begin_transaction().unwrap();
		txn.create_table(people(), false).unwrap();
		txn.get_table("people")
			.unwrap()
			.add_row(vec![Value::Integer(1), Value::Null])
			.unwrap();
		txn.commit().unwrap();

		let mut txn = db.begin_transaction().unwrap();
		let mut altered = people();
		altered
			.columns
			.push(ColumnInfo::new("email", DataType::Text).not_null());
		assert!(matches!(
			txn.alter_table(altered),
			Err(MonoError::Constraint(_))
		));
		// The original table is untouched
		assert_eq!(txn.table_info("people").unwrap(), people());
		txn.rollback().unwrap();
		assert!(db.pending_delete_tables().is_empty());
	}

	#[test]
	fn test_compact_threshold() {
		let db = Conglomerate::create(Config::in_memory()).unwrap();
		let mut txn = db.begin_transaction().unwrap();
		txn.create_table(people(), false).unwrap();
		{
			let mut table = txn.get_table("people").unwrap();
			for id in 0..8 {
				table.add_row(vec![Value::Integer(id), Value::Null]).unwrap();
			}
		}
		txn.commit().unwrap();

		let mut txn = db.begin_transaction().unwrap();
		assert!(!txn.compact_table("people", false).unwrap());
		{
			let mut table = txn.get_table("people").unwrap();
			let rows = table.row_ids();
			for row in &rows[..6] {
				table.remove_row(*row).unwrap();
			}
		}
		assert!(matches!(
			txn.compact_table("people", false),
			Err(MonoError::Transaction(_))
		));
		txn.commit().unwrap();

		let mut txn = db.begin_transaction().unwrap();
		assert!(txn.compact_table("people", false).unwrap());
		assert_eq!(txn.dropped().len(), 1);
		assert_eq!(txn.select_table("people").unwrap().row_count(), 2);
		txn.commit().unwrap();

		let table = &db.visible_tables()[0];
		let source = db.table_source(table.id).unwrap();
		let stats = source.stats();
		assert_eq!(stats.slots, 2);
		assert_eq!(stats.committed, 2);
	}

	#[test]
	fn test_dynamic_tables() {
		let db = Conglomerate::create(Config::in_memory()).unwrap();
		let mut txn = db.begin_transaction().unwrap();
		let id = txn.create_table(people(), false).unwrap();
		txn.get_table("people")
			.unwrap()
			.add_row(vec![Value::Integer(1), Value::from("ada")])
			.unwrap();

		assert_eq!(
			txn.dynamic_rows("sys_tables").unwrap(),
			vec![vec![
				Value::from("people"),
				Value::Integer(id.0 as i64),
				Value::Integer(1),
			]]
		);
		let columns = txn.dynamic_rows("SYS_COLUMNS").unwrap();
		assert_eq!(columns.len(), 2);
		assert_eq!(columns[1][1], Value::from("name"));
		assert_eq!(columns[1][3], Value::from("TEXT"));
		assert!(txn.dynamic_rows("people").is_err());
		assert_eq!(txn.table_info("sys_tables").unwrap().column_count(), 3);
	}
}
