//! Table and column definitions

use crate::error::{MonoError, MonoResult};
use crate::table::value::Value;
use crate::types::TableId;
use serde::{Deserialize, Serialize};

/// Column data types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DataType {
	Boolean,
	SmallInt,
	Integer,
	BigInt,
	Double,
	Varchar(u16),
	Text,
	Varbinary(u16),
	Blob,
	Date,
	Timestamp,
}

impl DataType {
	/// Types whose values may be moved out of line into the large-object store
	pub fn is_large_object_capable(&self) -> bool {
		matches!(
			self,
			DataType::Text | DataType::Blob | DataType::Varchar(_) | DataType::Varbinary(_)
		)
	}
}

/// Default value expression evaluated when a row omits a column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DefaultExpr {
	Literal(Value),
	/// Next value of the table's unique-id sequence
	NextSequence,
	CurrentTimestamp,
}

/// Column constraints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ColumnConstraint {
	NotNull,
	PrimaryKey,
	Unique,
	/// Maintain an ordered index without a uniqueness check
	Indexed,
	Default(DefaultExpr),
}

/// Column definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
	pub name: String,
	pub data_type: DataType,
	pub constraints: Vec<ColumnConstraint>,
}

impl ColumnInfo {
	/// Create a new column
	pub fn new(name: &str, data_type: DataType) -> Self {
		Self {
			name: name.to_string(),
			data_type,
			constraints: Vec::new(),
		}
	}

	/// Add NOT NULL constraint
	pub fn not_null(mut self) -> Self {
		self.constraints.push(ColumnConstraint::NotNull);
		self
	}

	/// Add PRIMARY KEY constraint
	pub fn primary_key(mut self) -> Self {
		self.constraints.push(ColumnConstraint::PrimaryKey);
		self.constraints.push(ColumnConstraint::NotNull);
		self
	}

	/// Add UNIQUE constraint
	pub fn unique(mut self) -> Self {
		self.constraints.push(ColumnConstraint::Unique);
		self
	}

	pub fn indexed(mut self) -> Self {
		self.constraints.push(ColumnConstraint::Indexed);
		self
	}

	pub fn default_value(mut self, expr: DefaultExpr) -> Self {
		self.constraints.push(ColumnConstraint::Default(expr));
		self
	}

	pub fn is_not_null(&self) -> bool {
		self.constraints
			.iter()
			.any(|c| matches!(c, ColumnConstraint::NotNull | ColumnConstraint::PrimaryKey))
	}

	pub fn is_unique(&self) -> bool {
		self.constraints
			.iter()
			.any(|c| matches!(c, ColumnConstraint::Unique | ColumnConstraint::PrimaryKey))
	}

	/// Whether the column gets an insert-search index rather than a blind one
	pub fn is_indexed(&self) -> bool {
		self.is_unique()
			|| self
				.constraints
				.iter()
				.any(|c| matches!(c, ColumnConstraint::Indexed))
	}

	pub fn default_expr(&self) -> Option<&DefaultExpr> {
		self.constraints.iter().find_map(|c| match c {
			ColumnConstraint::Default(expr) => Some(expr),
			_ => None,
		})
	}
}

/// Logical table definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
	pub name: String,
	pub columns: Vec<ColumnInfo>,
}

impl TableInfo {
	pub fn new(name: &str, columns: Vec<ColumnInfo>) -> Self {
		Self {
			name: name.to_string(),
			columns,
		}
	}

	pub fn column_count(&self) -> usize {
		self.columns.len()
	}

	/// Position of a column by case-insensitive name
	pub fn column_index(&self, name: &str) -> Option<usize> {
		self.columns
			.iter()
			.position(|c| c.name.eq_ignore_ascii_case(name))
	}

	pub fn column(&self, index: usize) -> MonoResult<&ColumnInfo> {
		self.columns.get(index).ok_or_else(|| {
			MonoError::NotFound(format!("Column {} in table '{}'", index, self.name))
		})
	}

	/// Physical store name derived from the table name and id
	pub fn physical_name(&self, id: TableId) -> String {
		let mut name: String = self
			.name
			.chars()
			.map(|c| {
				if c.is_ascii_alphanumeric() {
					c.to_ascii_lowercase()
				} else {
					'_'
				}
			})
			.collect();
		name.push('_');
		name.push_str(&id.0.to_string());
		name
	}

	/// Check the definition itself is usable
	pub fn validate(&self) -> MonoResult<()> {
		if self.name.is_empty() {
			return Err(MonoError::InvalidInput("Table name is empty".into()));
		}
		if self.columns.is_empty() {
			return Err(MonoError::InvalidInput(format!(
				"Table '{}' has no columns",
				self.name
			)));
		}
		for (i, column) in self.columns.iter().enumerate() {
			if self.columns[..i]
				.iter()
				.any(|c| c.name.eq_ignore_ascii_case(&column.name))
			{
				return Err(MonoError::InvalidInput(format!(
					"Duplicate column '{}' in table '{}'",
					column.name, self.name
				)));
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_column_constraints() {
		let id = ColumnInfo::new("id", DataType::BigInt).primary_key();
		assert!(id.is_not_null());
		assert!(id.is_unique());
		assert!(id.is_indexed());

		let city = ColumnInfo::new("city", DataType::Varchar(64))
			.indexed()
			.default_value(DefaultExpr::Literal(Value::Text("Paris".into())));
		assert!(!city.is_unique());
		assert!(city.is_indexed());
		assert_eq!(
			city.default_expr(),
			Some(&DefaultExpr::Literal(Value::Text("Paris".into())))
		);
	}

	#[test]
	fn test_physical_name_and_validation() {
		let info = TableInfo::new(
			"Order Lines",
			vec![
				ColumnInfo::new("id", DataType::Integer),
				ColumnInfo::new("ID", DataType::Integer),
			],
		);
		assert_eq!(info.physical_name(TableId(7)), "order_lines_7");
		assert_eq!(info.column_index("Id"), Some(0));
		assert!(info.validate().is_err());
	}
}
