//! Computed system tables

use crate::error::MonoResult;
use crate::table::{ColumnInfo, DataType, Row, TableInfo, Value};
use crate::transaction::manager::VisibleTable;

/// A table whose rows are computed from the transaction's view of the
/// catalog rather than stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DynamicTable {
	/// One row per visible table
	Tables,
	/// One row per column of every visible table
	Columns,
}

/// A table name resolved against one transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableRef {
	/// Position in the transaction's visible-table list
	Physical(usize),
	Dynamic(DynamicTable),
}

impl DynamicTable {
	pub const ALL: [DynamicTable; 2] = [DynamicTable::Tables, DynamicTable::Columns];

	pub fn name(&self) -> &'static str {
		match self {
			DynamicTable::Tables => "sys_tables",
			DynamicTable::Columns => "sys_columns",
		}
	}

	pub fn from_name(name: &str) -> Option<Self> {
		Self::ALL
			.into_iter()
			.find(|table| table.name().eq_ignore_ascii_case(name))
	}

	pub fn info(&self) -> TableInfo {
		let columns = match self {
			DynamicTable::Tables => vec![
				ColumnInfo::new("name", DataType::Text).not_null(),
				ColumnInfo::new("table_id", DataType::BigInt).not_null(),
				ColumnInfo::new("row_count", DataType::BigInt).not_null(),
			],
			DynamicTable::Columns => vec![
				ColumnInfo::new("table_name", DataType::Text).not_null(),
				ColumnInfo::new("column_name", DataType::Text).not_null(),
				ColumnInfo::new("position", DataType::Integer).not_null(),
				ColumnInfo::new("data_type", DataType::Text).not_null(),
				ColumnInfo::new("not_null", DataType::Boolean).not_null(),
				ColumnInfo::new("is_unique", DataType::Boolean).not_null(),
			],
		};
		TableInfo::new(self.name(), columns)
	}

	pub fn rows(&self, tables: &[VisibleTable]) -> MonoResult<Vec<Row>> {
		let rows = match self {
			DynamicTable::Tables => tables
				.iter()
				.map(|table| {
					vec![
						Value::Text(table.source.info().name.clone()),
						Value::Integer(table.source.table_id().0 as i64),
						Value::Integer(table.index_set.row_count() as i64),
					]
				})
				.collect(),
			DynamicTable::Columns => tables
				.iter()
				.flat_map(|table| {
					let info = table.source.info();
					info.columns.iter().enumerate().map(move |(position, column)| {
						vec![
							Value::Text(info.name.clone()),
							Value::Text(column.name.clone()),
							Value::Integer(position as i64),
							Value::Text(type_name(&column.data_type)),
							Value::Boolean(column.is_not_null()),
							Value::Boolean(column.is_unique()),
						]
					})
				})
				.collect(),
		};
		Ok(rows)
	}
}

fn type_name(data_type: &DataType) -> String {
	match data_type {
		DataType::Boolean => "BOOLEAN".into(),
		DataType::SmallInt => "SMALLINT".into(),
		DataType::Integer => "INTEGER".into(),
		DataType::BigInt => "BIGINT".into(),
		DataType::Double => "DOUBLE".into(),
		DataType::Varchar(len) => format!("VARCHAR({})", len),
		DataType::Text => "TEXT".into(),
		DataType::Varbinary(len) => format!("VARBINARY({})", len),
		DataType::Blob => "BLOB".into(),
		DataType::Date => "DATE".into(),
		DataType::Timestamp => "TIMESTAMP".into(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_resolve_names() {
		assert_eq!(DynamicTable::from_name("SYS_TABLES"), Some(DynamicTable::Tables));
		assert_eq!(DynamicTable::from_name("sys_columns"), Some(DynamicTable::Columns));
		assert_eq!(DynamicTable::from_name("orders"), None);
	}

	#[test]
	fn test_definitions_are_valid() {
		for table in DynamicTable::ALL {
			let info = table.info();
			info.validate().unwrap();
			assert_eq!(info.name, table.name());
		}
		assert_eq!(type_name(&DataType::Varchar(32)), "VARCHAR(32)");
	}
}
