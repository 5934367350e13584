//! Large-object sub-store for out-of-line cell values

use crate::error::{MonoError, MonoResult};
use crate::storage::area::{AreaId, AreaStore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

const BLOB_HEADER_SIZE: usize = 16;

/// Identifier of a large object, embedded in row cells
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobId(pub i64);

/// Reference-counted large objects stored one per area as
/// `[refCount:i64][length:i64][bytes]`.
pub struct BlobStore {
    store: Arc<AreaStore>,
}

impl BlobStore {
    pub fn new(store: Arc<AreaStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<AreaStore> {
        &self.store
    }

    /// Store a new object holding one reference
    pub fn create_object(&self, data: &[u8]) -> MonoResult<BlobId> {
        let mut area = Vec::with_capacity(BLOB_HEADER_SIZE + data.len());
        area.extend_from_slice(&1i64.to_le_bytes());
        area.extend_from_slice(&(data.len() as i64).to_le_bytes());
        area.extend_from_slice(data);
        let id = self.store.create_area_with(area)?;
        Ok(BlobId(id.0 as i64))
    }

    /// Read an object's bytes
    pub fn get_object(&self, id: BlobId) -> MonoResult<Vec<u8>> {
        let area = self.area(id)?;
        let header = self.store.read(area, 0, BLOB_HEADER_SIZE)?;
        let len = read_i64(&header[8..16]);
        if len < 0 {
            return Err(MonoError::Consistency(format!(
                "Large object {} has negative length",
                id.0
            )));
        }
        self.store.read(area, BLOB_HEADER_SIZE, len as usize)
    }

    /// Add a reference to an object
    pub fn establish_object(&self, id: BlobId) -> MonoResult<()> {
        let _guard = self.store.lock();
        let count = self.ref_count(id)?;
        self.write_ref_count(id, count + 1)
    }

    /// Drop a reference; the object is freed when none remain
    pub fn release_object(&self, id: BlobId) -> MonoResult<()> {
        let _guard = self.store.lock();
        let count = self.ref_count(id)?;
        if count <= 0 {
            return Err(MonoError::Consistency(format!(
                "Large object {} released with no references",
                id.0
            )));
        }
        if count == 1 {
            tracing::debug!("Freeing large object {}", id.0);
            self.store.delete_area(self.area(id)?)
        } else {
            self.write_ref_count(id, count - 1)
        }
    }

    /// Match every object's count to the references actually held and free
    /// objects nobody refers to. Failures are logged and skipped. Returns
    /// the number of objects freed.
    pub fn reconcile(&self, references: &HashMap<BlobId, i64>) -> usize {
        let _guard = self.store.lock();
        let mut freed = 0;
        for area in self.store.all_areas() {
            let id = BlobId(area.0 as i64);
            let Some(held) = references.get(&id) else {
                match self.store.delete_area(area) {
                    Ok(()) => freed += 1,
                    Err(e) => tracing::warn!("Failed to free leaked large object {}: {}", id.0, e),
                }
                continue;
            };
            match self.ref_count(id) {
                Ok(count) if count == *held => {}
                Ok(count) => {
                    tracing::warn!(
                        "Large object {} counts {} references but {} are held",
                        id.0,
                        count,
                        held
                    );
                    if let Err(e) = self.write_ref_count(id, *held) {
                        tracing::warn!("Failed to repair large object {}: {}", id.0, e);
                    }
                }
                Err(e) => tracing::warn!("Failed to read large object {}: {}", id.0, e),
            }
        }
        if freed > 0 {
            tracing::info!("Freed {} leaked large objects in '{}'", freed, self.store.name());
        }
        freed
    }

    pub fn ref_count(&self, id: BlobId) -> MonoResult<i64> {
        let bytes = self.store.read(self.area(id)?, 0, 8)?;
        Ok(read_i64(&bytes))
    }

    pub fn contains(&self, id: BlobId) -> bool {
        id.0 > 0 && self.store.contains_area(AreaId(id.0 as u64))
    }

    fn write_ref_count(&self, id: BlobId, count: i64) -> MonoResult<()> {
        self.store.write(self.area(id)?, 0, &count.to_le_bytes())
    }

    fn area(&self, id: BlobId) -> MonoResult<AreaId> {
        if id.0 <= 0 {
            return Err(MonoError::InvalidInput(format!(
                "Invalid large object id {}",
                id.0
            )));
        }
        Ok(AreaId(id.0 as u64))
    }
}

fn read_i64(bytes: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    i64::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_counting() {
        let blobs = BlobStore::new(Arc::new(AreaStore::heap("blobs")));
        let id = blobs.create_object(b"a rather large value").unwrap();
        assert_eq!(blobs.get_object(id).unwrap(), b"a rather large value");
        assert_eq!(blobs.ref_count(id).unwrap(), 1);

        blobs.establish_object(id).unwrap();
        blobs.release_object(id).unwrap();
        assert!(blobs.contains(id));

        blobs.release_object(id).unwrap();
        assert!(!blobs.contains(id));
        assert!(blobs.get_object(id).is_err());
    }

    #[test]
    fn test_reconcile_repairs_counts_and_frees_leaks() {
        let blobs = BlobStore::new(Arc::new(AreaStore::heap("blobs")));
        let kept = blobs.create_object(b"kept").unwrap();
        let shared = blobs.create_object(b"shared").unwrap();
        blobs.establish_object(shared).unwrap();
        let leaked = blobs.create_object(b"leaked").unwrap();

        let held = HashMap::from([(kept, 1), (shared, 1)]);
        assert_eq!(blobs.reconcile(&held), 1);
        assert!(!blobs.contains(leaked));
        assert_eq!(blobs.ref_count(kept).unwrap(), 1);
        assert_eq!(blobs.ref_count(shared).unwrap(), 1);
    }
}
