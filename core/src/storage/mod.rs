//! Backing stores consumed by the table layer

pub mod area;
pub mod blob;

pub use area::{AreaId, AreaStore, FIXED_AREA_SIZE, StoreSystem};
pub use blob::{BlobId, BlobStore};
