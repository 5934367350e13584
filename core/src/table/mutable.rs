//! Transaction-scoped table views

use crate::error::{MonoError, MonoResult};
use crate::table::index::IndexSet;
use crate::table::info::{ColumnInfo, DataType, DefaultExpr, TableInfo};
use crate::table::registry::{RowEvent, TableEventRegistry};
use crate::table::source::{RootLock, TableSource};
use crate::table::value::{Row, Value};
use crate::types::RowId;
use std::collections::BTreeSet;
use std::ops::{Deref, DerefMut, RangeBounds};

/// Evaluate a column's default expression, NULL when it has none
pub fn evaluate_default(source: &TableSource, column: &ColumnInfo) -> MonoResult<Value> {
	let value = match column.default_expr() {
		None => return Ok(Value::Null),
		Some(DefaultExpr::Literal(value)) => value.clone(),
		Some(DefaultExpr::NextSequence) => Value::Integer(source.next_unique_id()?),
		Some(DefaultExpr::CurrentTimestamp) => {
			let now = chrono::Utc::now().naive_utc();
			match column.data_type {
				DataType::Date => Value::Date(now.date()),
				_ => Value::Timestamp(now),
			}
		}
	};
	value.coerce(&column.data_type)
}

/// Read access to one table as a transaction sees it
pub struct TableView<'a> {
	source: &'a TableSource,
	index_set: &'a mut IndexSet,
}

impl<'a> TableView<'a> {
	pub fn new(source: &'a TableSource, index_set: &'a mut IndexSet) -> Self {
		Self { source, index_set }
	}

	pub fn info(&self) -> &TableInfo {
		self.source.info()
	}

	pub fn source(&self) -> &TableSource {
		self.source
	}

	/// Visible rows in row order
	pub fn row_ids(&self) -> Vec<RowId> {
		self.index_set.rows()
	}

	pub fn row_count(&self) -> usize {
		self.index_set.row_count()
	}

	pub fn contains(&self, row: RowId) -> bool {
		self.index_set.contains(row)
	}

	pub fn get_value(&self, row: RowId, column: usize) -> MonoResult<Value> {
		self.check_visible(row)?;
		self.source.get_value(row, column)
	}

	pub fn row(&self, row: RowId) -> MonoResult<Row> {
		self.check_visible(row)?;
		self.source.get_row(row)
	}

	/// Every visible row, in row order
	pub fn rows(&self) -> MonoResult<Vec<(RowId, Row)>> {
		self.row_ids()
			.into_iter()
			.map(|id| -> MonoResult<(RowId, Row)> { Ok((id, self.source.get_row(id)?)) })
			.collect()
	}

	/// Rows whose column `name` equals `key`
	pub fn find(&mut self, name: &str, key: &Value) -> MonoResult<Vec<RowId>> {
		let column = self.column_position(name)?;
		self.index_set.find(column, key, self.source)
	}

	pub fn find_range<R: RangeBounds<Value>>(&mut self, name: &str, range: R) -> MonoResult<Vec<RowId>> {
		let column = self.column_position(name)?;
		self.index_set.find_range(column, range, self.source)
	}

	/// Keep reclamation away from rows held outside the transaction
	pub fn root_lock(&self) -> RootLock<'a> {
		self.source.root_lock()
	}

	fn column_position(&self, name: &str) -> MonoResult<usize> {
		self.info().column_index(name).ok_or_else(|| {
			MonoError::NotFound(format!("Column '{}' in table '{}'", name, self.info().name))
		})
	}

	fn check_visible(&self, row: RowId) -> MonoResult<()> {
		if !self.index_set.contains(row) {
			return Err(MonoError::NotFound(format!(
				"Row {} in table '{}'",
				row,
				self.info().name
			)));
		}
		Ok(())
	}
}

/// Read-write access to one table inside a transaction. Every change is
/// journaled in the table's event registry and applied to the private
/// index set.
pub struct MutableTable<'a> {
	view: TableView<'a>,
	registry: &'a TableEventRegistry,
}

impl<'a> MutableTable<'a> {
	pub fn new(
		source: &'a TableSource,
		index_set: &'a mut IndexSet,
		registry: &'a TableEventRegistry,
	) -> Self {
		Self {
			view: TableView::new(source, index_set),
			registry,
		}
	}

	pub fn event_registry(&self) -> &TableEventRegistry {
		self.registry
	}

	/// Insert a complete row
	pub fn add_row(&mut self, row: Row) -> MonoResult<RowId> {
		let row = self.prepare(row, None)?;
		let id = self.view.source.add_row(&row)?;
		self.registry.register(RowEvent::Add(id));
		self.view.index_set.insert_row(id);
		Ok(id)
	}

	/// Insert a row given by column name; omitted columns take their default
	pub fn add_named_row(&mut self, values: &[(&str, Value)]) -> MonoResult<RowId> {
		let info = self.view.info();
		for (name, _) in values {
			if info.column_index(name).is_none() {
				return Err(MonoError::NotFound(format!(
					"Column '{}' in table '{}'",
					name, info.name
				)));
			}
		}

		let mut row = Vec::with_capacity(info.column_count());
		for column in &info.columns {
			let given = values
				.iter()
				.find(|(name, _)| column.name.eq_ignore_ascii_case(name));
			row.push(match given {
				Some((_, value)) => value.clone(),
				None => evaluate_default(self.view.source, column)?,
			});
		}
		self.add_row(row)
	}

	/// Replace a row; the new version gets a new row id
	pub fn update_row(&mut self, old: RowId, row: Row) -> MonoResult<RowId> {
		self.view.check_visible(old)?;
		let row = self.prepare(row, Some(old))?;
		let id = self.view.source.add_row(&row)?;
		self.registry.register(RowEvent::UpdateRemove(old));
		self.registry.register(RowEvent::UpdateAdd(id));
		self.view.index_set.remove_row(old);
		self.view.index_set.insert_row(id);
		Ok(id)
	}

	pub fn remove_row(&mut self, row: RowId) -> MonoResult<()> {
		self.view.check_visible(row)?;
		self.registry.register(RowEvent::Remove(row));
		self.view.index_set.remove_row(row);
		Ok(())
	}

	/// Bring the column indexes up to date with every change so far
	pub fn flush_indexes(&mut self) -> MonoResult<()> {
		self.view.index_set.flush(self.view.source)
	}

	/// Undo the most recent `count` changes of this table
	pub fn rollback_events(&mut self, count: usize) -> MonoResult<()> {
		let undone = self.registry.rollback_last(count)?;
		for event in undone.iter().rev() {
			if event.is_add() {
				self.view.index_set.remove_row(event.row());
			} else {
				self.view.index_set.insert_row(event.row());
			}
		}
		Ok(())
	}

	/// Check NOT NULL and UNIQUE over every visible row
	pub fn assert_constraints(&mut self) -> MonoResult<()> {
		let info = self.view.info().clone();
		let rows = self.view.row_ids();
		for (position, column) in info.columns.iter().enumerate() {
			if !column.is_not_null() && !column.is_unique() {
				continue;
			}
			let mut seen = BTreeSet::new();
			for row in &rows {
				let value = self.view.source.get_value(*row, position)?;
				if value.is_null() {
					if column.is_not_null() {
						return Err(MonoError::Constraint(format!(
							"Column '{}' of table '{}' is NOT NULL but row {} is NULL",
							column.name, info.name, row
						)));
					}
					continue;
				}
				if column.is_unique() && !seen.insert(value.clone()) {
					return Err(MonoError::Constraint(format!(
						"Duplicate value {} in unique column '{}' of table '{}'",
						value, column.name, info.name
					)));
				}
			}
		}
		Ok(())
	}

	/// Coerce values and check immediate constraints. `replacing` is a row
	/// that is about to be removed and may hold the same unique keys.
	fn prepare(&mut self, row: Row, replacing: Option<RowId>) -> MonoResult<Row> {
		let info = self.view.info().clone();
		if row.len() != info.column_count() {
			return Err(MonoError::InvalidInput(format!(
				"Row has {} values but table '{}' has {} columns",
				row.len(),
				info.name,
				info.column_count()
			)));
		}

		let mut prepared = Vec::with_capacity(row.len());
		for (position, (column, value)) in info.columns.iter().zip(row).enumerate() {
			let value = value.coerce(&column.data_type)?;
			if value.is_null() {
				if column.is_not_null() {
					return Err(MonoError::Constraint(format!(
						"Column '{}' of table '{}' cannot be NULL",
						column.name, info.name
					)));
				}
			} else if column.is_unique() {
				let clash = self
					.view
					.index_set
					.find(position, &value, self.view.source)?
					.into_iter()
					.any(|existing| Some(existing) != replacing);
				if clash {
					return Err(MonoError::Constraint(format!(
						"Duplicate value {} in unique column '{}' of table '{}'",
						value, column.name, info.name
					)));
				}
			}
			prepared.push(value);
		}
		Ok(prepared)
	}
}

impl<'a> Deref for MutableTable<'a> {
	type Target = TableView<'a>;

	fn deref(&self) -> &Self::Target {
		&self.view
	}
}

impl DerefMut for MutableTable<'_> {
	fn deref_mut(&mut self) -> &mut Self::Target {
		&mut self.view
	}
}
