//! Per-table storage: definitions, values, records and the table source

pub mod cache;
pub mod index;
pub mod info;
pub mod mutable;
pub mod record;
pub mod record_list;
pub mod registry;
pub mod source;
pub mod value;

pub use cache::CellCache;
pub use index::{ColumnIndex, IndexSet, IndexSnapshot};
pub use info::{ColumnConstraint, ColumnInfo, DataType, DefaultExpr, TableInfo};
pub use mutable::{MutableTable, TableView};
pub use record_list::RecordState;
pub use registry::{RowEvent, TableEventRegistry};
pub use source::{PreparedCommit, RootLock, SourceContext, SourceStats, TableSource};
pub use value::{Row, Value};
