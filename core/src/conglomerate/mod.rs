//! Table source composite: catalog, commit path and transaction handles

pub mod composite;
pub mod state;
pub mod transaction;

#[cfg(test)]
mod tests;

pub use composite::Conglomerate;
pub use state::{TableState, TableStateStore};
pub use transaction::Transaction;
