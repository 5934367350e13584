//! Area store: the byte-addressable backing store consumed by table sources

use crate::config::StoreKind;
use crate::error::{MonoError, MonoResult};
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Magic number at the start of a store image file
const IMAGE_MAGIC: u32 = 0x4D4E4153; // "MNAS"

/// Size of the fixed area every store is created with
pub const FIXED_AREA_SIZE: usize = 64;

/// Identifier of an allocated area inside a store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AreaId(pub u64);

impl AreaId {
    /// The fixed area allocated with the store, used to anchor headers.
    pub const FIXED: AreaId = AreaId(0);

    /// Encode an optional area as an on-disk pointer (-1 for none).
    pub fn to_pointer(area: Option<AreaId>) -> i64 {
        match area {
            Some(id) => id.0 as i64,
            None => -1,
        }
    }

    /// Decode an on-disk pointer.
    pub fn from_pointer(pointer: i64) -> Option<AreaId> {
        if pointer < 0 {
            None
        } else {
            Some(AreaId(pointer as u64))
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AreaImage {
    next_area: u64,
    areas: BTreeMap<u64, Vec<u8>>,
}

/// A named container of areas.
///
/// Writes land in memory immediately; `checkpoint` is the durability barrier
/// that writes a consistent image of every area to the backing file. A store
/// whose marker file is still present at open time was not closed cleanly.
pub struct AreaStore {
    name: String,
    kind: StoreKind,
    path: Option<PathBuf>,
    image: RwLock<AreaImage>,
    write_lock: ReentrantMutex<()>,
    closed_cleanly: bool,
    closed: AtomicBool,
}

impl AreaStore {
    /// Create a store that lives only in memory
    pub fn heap(name: &str) -> Self {
        Self::with_image(name, StoreKind::Heap, None, Self::fresh_image(), true)
    }

    /// Create a new file-backed store, replacing any previous image
    pub fn create_file<P: AsRef<Path>>(name: &str, path: P) -> MonoResult<Self> {
        let path = path.as_ref().to_path_buf();
        let store = Self::with_image(name, StoreKind::File, Some(path), Self::fresh_image(), true);
        store.write_marker()?;
        store.checkpoint()?;
        Ok(store)
    }

    /// Open an existing file-backed store
    pub fn open_file<P: AsRef<Path>>(name: &str, path: P) -> MonoResult<Self> {
        let path = path.as_ref().to_path_buf();
        let image = Self::read_image(&path)?;
        let closed_cleanly = !Self::marker_path(&path).exists();
        if !closed_cleanly {
            tracing::warn!("Store '{}' was not closed cleanly", name);
        }

        let store = Self::with_image(name, StoreKind::File, Some(path), image, closed_cleanly);
        store.write_marker()?;
        Ok(store)
    }

    fn with_image(
        name: &str,
        kind: StoreKind,
        path: Option<PathBuf>,
        image: AreaImage,
        closed_cleanly: bool,
    ) -> Self {
        Self {
            name: name.to_string(),
            kind,
            path,
            image: RwLock::new(image),
            write_lock: ReentrantMutex::new(()),
            closed_cleanly,
            closed: AtomicBool::new(false),
        }
    }

    fn fresh_image() -> AreaImage {
        let mut image = AreaImage {
            next_area: 1,
            areas: BTreeMap::new(),
        };
        image.areas.insert(AreaId::FIXED.0, vec![0; FIXED_AREA_SIZE]);
        image
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> StoreKind {
        self.kind
    }

    /// Whether the previous session closed this store cleanly
    pub fn last_close_clean(&self) -> bool {
        self.closed_cleanly
    }

    /// Exclusive lock grouping several writes. Re-entrant on the same thread.
    pub fn lock(&self) -> ReentrantMutexGuard<'_, ()> {
        self.write_lock.lock()
    }

    /// Allocate a zeroed area
    pub fn create_area(&self, size: usize) -> MonoResult<AreaId> {
        self.create_area_with(vec![0; size])
    }

    /// Allocate an area holding `data`
    pub fn create_area_with(&self, data: Vec<u8>) -> MonoResult<AreaId> {
        self.check_open()?;
        let mut image = self.image.write();
        let id = AreaId(image.next_area);
        image.next_area += 1;
        image.areas.insert(id.0, data);
        Ok(id)
    }

    /// Read `len` bytes at `offset` within an area
    pub fn read(&self, id: AreaId, offset: usize, len: usize) -> MonoResult<Vec<u8>> {
        let image = self.image.read();
        let area = Self::area(&image, id, &self.name)?;
        if offset + len > area.len() {
            return Err(MonoError::Storage(format!(
                "Read past end of area {} in '{}' ({}+{} > {})",
                id.0,
                self.name,
                offset,
                len,
                area.len()
            )));
        }
        Ok(area[offset..offset + len].to_vec())
    }

    /// Read the whole area
    pub fn read_all(&self, id: AreaId) -> MonoResult<Vec<u8>> {
        let image = self.image.read();
        Ok(Self::area(&image, id, &self.name)?.clone())
    }

    /// Overwrite bytes at `offset` within an area. Areas never grow.
    pub fn write(&self, id: AreaId, offset: usize, data: &[u8]) -> MonoResult<()> {
        self.check_open()?;
        let mut image = self.image.write();
        let name = &self.name;
        let area = image
            .areas
            .get_mut(&id.0)
            .ok_or_else(|| MonoError::NotFound(format!("Area {} in store '{}'", id.0, name)))?;
        if offset + data.len() > area.len() {
            return Err(MonoError::Storage(format!(
                "Write past end of area {} in '{}'",
                id.0, name
            )));
        }
        area[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Size in bytes of an area
    pub fn area_size(&self, id: AreaId) -> MonoResult<usize> {
        let image = self.image.read();
        Ok(Self::area(&image, id, &self.name)?.len())
    }

    pub fn contains_area(&self, id: AreaId) -> bool {
        self.image.read().areas.contains_key(&id.0)
    }

    /// Free an area
    pub fn delete_area(&self, id: AreaId) -> MonoResult<()> {
        self.check_open()?;
        if id == AreaId::FIXED {
            return Err(MonoError::InvalidInput(
                "The fixed area cannot be deleted".into(),
            ));
        }
        match self.image.write().areas.remove(&id.0) {
            Some(_) => Ok(()),
            None => Err(MonoError::NotFound(format!(
                "Area {} in store '{}'",
                id.0, self.name
            ))),
        }
    }

    /// Every allocated area except the fixed one, for leak scans
    pub fn all_areas(&self) -> Vec<AreaId> {
        self.image
            .read()
            .areas
            .keys()
            .filter(|id| **id != AreaId::FIXED.0)
            .map(|id| AreaId(*id))
            .collect()
    }

    /// Durability barrier: persist a consistent image of every area
    pub fn checkpoint(&self) -> MonoResult<()> {
        let path = match &self.path {
            Some(path) => path,
            None => return Ok(()),
        };

        let _guard = self.lock();
        let payload = {
            let image = self.image.read();
            bincode::serialize(&*image)?
        };

        let mut bytes = Vec::with_capacity(payload.len() + 16);
        bytes.extend_from_slice(&IMAGE_MAGIC.to_le_bytes());
        bytes.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        bytes.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        bytes.extend_from_slice(&payload);

        let tmp_path = path.with_extension("tmp");
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Checkpoint and mark the store as cleanly closed
    pub fn close(&self) -> MonoResult<()> {
        if self.is_closed() {
            return Ok(());
        }
        self.checkpoint()?;
        self.closed.store(true, Ordering::SeqCst);
        if let Some(path) = &self.path {
            let marker = Self::marker_path(path);
            if marker.exists() {
                std::fs::remove_file(marker)?;
            }
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> MonoResult<()> {
        if self.is_closed() {
            return Err(MonoError::Storage(format!("Store '{}' is closed", self.name)));
        }
        Ok(())
    }

    fn area<'a>(image: &'a AreaImage, id: AreaId, name: &str) -> MonoResult<&'a Vec<u8>> {
        image
            .areas
            .get(&id.0)
            .ok_or_else(|| MonoError::NotFound(format!("Area {} in store '{}'", id.0, name)))
    }

    fn marker_path(path: &Path) -> PathBuf {
        let mut marker = path.as_os_str().to_owned();
        marker.push(".open");
        PathBuf::from(marker)
    }

    fn write_marker(&self) -> MonoResult<()> {
        if let Some(path) = &self.path {
            File::create(Self::marker_path(path))?;
        }
        Ok(())
    }

    fn read_image(path: &Path) -> MonoResult<AreaImage> {
        let mut file = File::open(path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        if bytes.len() < 16 {
            return Err(MonoError::Storage(format!(
                "Store image {:?} is truncated",
                path
            )));
        }
        let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if magic != IMAGE_MAGIC {
            return Err(MonoError::Storage(format!(
                "Invalid store magic number in {:?}",
                path
            )));
        }
        let checksum = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&bytes[8..16]);
        let len = u64::from_le_bytes(len_bytes) as usize;
        if bytes.len() < 16 + len {
            return Err(MonoError::Storage(format!(
                "Store image {:?} is truncated",
                path
            )));
        }

        let payload = &bytes[16..16 + len];
        if crc32fast::hash(payload) != checksum {
            return Err(MonoError::Storage(format!(
                "Store image checksum mismatch in {:?}",
                path
            )));
        }
        Ok(bincode::deserialize(payload)?)
    }

    fn remove_files(&self) -> MonoResult<()> {
        if let Some(path) = &self.path {
            for file in [path.clone(), Self::marker_path(path), path.with_extension("tmp")] {
                if file.exists() {
                    std::fs::remove_file(file)?;
                }
            }
        }
        Ok(())
    }
}

/// Creates, opens and deletes named stores.
pub struct StoreSystem {
    kind: StoreKind,
    data_dir: PathBuf,
    heap_stores: Mutex<HashMap<String, Arc<AreaStore>>>,
}

impl StoreSystem {
    pub fn new<P: AsRef<Path>>(kind: StoreKind, data_dir: P) -> MonoResult<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        if kind == StoreKind::File {
            std::fs::create_dir_all(&data_dir)?;
        }

        Ok(Self {
            kind,
            data_dir,
            heap_stores: Mutex::new(HashMap::new()),
        })
    }

    pub fn kind(&self) -> StoreKind {
        self.kind
    }

    fn store_path(&self, name: &str) -> PathBuf {
        self.data_dir.join(format!("{}.mds", name))
    }

    /// Whether a store with this name exists
    pub fn store_exists(&self, name: &str) -> bool {
        match self.kind {
            StoreKind::Heap => self.heap_stores.lock().contains_key(name),
            StoreKind::File => self.store_path(name).exists(),
        }
    }

    /// Create a store. Temporary stores are always heap stores and are never reopened.
    pub fn create_store(&self, name: &str, temporary: bool) -> MonoResult<Arc<AreaStore>> {
        if temporary {
            return Ok(Arc::new(AreaStore::heap(name)));
        }

        match self.kind {
            StoreKind::Heap => {
                let store = Arc::new(AreaStore::heap(name));
                self.heap_stores
                    .lock()
                    .insert(name.to_string(), Arc::clone(&store));
                Ok(store)
            }
            StoreKind::File => Ok(Arc::new(AreaStore::create_file(
                name,
                self.store_path(name),
            )?)),
        }
    }

    /// Open an existing store
    pub fn open_store(&self, name: &str) -> MonoResult<Arc<AreaStore>> {
        match self.kind {
            StoreKind::Heap => self
                .heap_stores
                .lock()
                .get(name)
                .cloned()
                .ok_or_else(|| MonoError::NotFound(format!("Store '{}'", name))),
            StoreKind::File => {
                let path = self.store_path(name);
                if !path.exists() {
                    return Err(MonoError::NotFound(format!("Store '{}'", name)));
                }
                Ok(Arc::new(AreaStore::open_file(name, path)?))
            }
        }
    }

    /// Close a store cleanly
    pub fn close_store(&self, store: &AreaStore) -> MonoResult<()> {
        match store.kind() {
            // Heap stores stay addressable for the lifetime of the system.
            StoreKind::Heap => Ok(()),
            StoreKind::File => store.close(),
        }
    }

    /// Physically remove a store
    pub fn delete_store(&self, store: &AreaStore) -> MonoResult<()> {
        self.heap_stores.lock().remove(store.name());
        store.closed.store(true, Ordering::SeqCst);
        store.remove_files()
    }

    /// Remove a store that cannot be opened
    pub fn delete_named_store(&self, name: &str) -> MonoResult<()> {
        self.heap_stores.lock().remove(name);
        if self.kind == StoreKind::File {
            let path = self.store_path(name);
            for file in [
                path.clone(),
                AreaStore::marker_path(&path),
                path.with_extension("tmp"),
            ] {
                if file.exists() {
                    std::fs::remove_file(file)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_area_lifecycle() {
        let store = AreaStore::heap("areas");
        let id = store.create_area(16).unwrap();
        store.write(id, 4, b"data").unwrap();
        assert_eq!(store.read(id, 4, 4).unwrap(), b"data");
        assert!(store.write(id, 14, b"overflow").is_err());

        assert_eq!(store.all_areas(), vec![id]);
        store.delete_area(id).unwrap();
        assert!(store.read_all(id).is_err());
        assert!(store.delete_area(AreaId::FIXED).is_err());
    }

    #[test]
    fn test_checkpoint_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.mds");

        let store = AreaStore::create_file("t", &path).unwrap();
        let kept = store.create_area_with(b"durable".to_vec()).unwrap();
        store.checkpoint().unwrap();
        // Not covered by a checkpoint, so lost on "crash"
        store.create_area_with(b"volatile".to_vec()).unwrap();
        drop(store);

        let reopened = AreaStore::open_file("t", &path).unwrap();
        assert!(!reopened.last_close_clean());
        assert_eq!(reopened.read_all(kept).unwrap(), b"durable");
        assert_eq!(reopened.all_areas(), vec![kept]);
        reopened.close().unwrap();

        let again = AreaStore::open_file("t", &path).unwrap();
        assert!(again.last_close_clean());
    }

    #[test]
    fn test_corrupt_image_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c.mds");
        let store = AreaStore::create_file("c", &path).unwrap();
        store.create_area_with(vec![7; 32]).unwrap();
        store.close().unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        assert!(AreaStore::open_file("c", &path).is_err());
    }

    #[test]
    fn test_store_system() {
        let dir = tempdir().unwrap();
        let system = StoreSystem::new(StoreKind::File, dir.path()).unwrap();
        assert!(!system.store_exists("orders_1"));

        let store = system.create_store("orders_1", false).unwrap();
        assert!(system.store_exists("orders_1"));
        system.close_store(&store).unwrap();

        let store = system.open_store("orders_1").unwrap();
        assert!(store.last_close_clean());
        system.delete_store(&store).unwrap();
        assert!(!system.store_exists("orders_1"));
        assert!(system.open_store("orders_1").is_err());
    }
}
