//! Transaction-private view of the database's tables

pub mod dynamic;
pub mod manager;

pub use dynamic::{DynamicTable, TableRef};
pub use manager::{TableManager, VisibleTable};
