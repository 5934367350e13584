//! MonoDB - table storage and transaction engine

pub mod config;
pub mod conglomerate;
pub mod error;
pub mod storage;
pub mod table;
pub mod transaction;
pub mod types;

pub use config::{Config, StoreKind};
pub use conglomerate::{Conglomerate, Transaction};
pub use error::{MonoError, MonoResult};
pub use table::{
	ColumnConstraint, ColumnInfo, DataType, DefaultExpr, MutableTable, RecordState, Row, TableInfo,
	TableView, Value,
};
pub use transaction::{DynamicTable, TableManager, TableRef};
pub use types::{CommitId, RowId, TableId, TxnId};
