use std::{
    env, fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

/// Backing store flavour used for durable tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreKind {
    /// Areas live in memory only. Temporary tables always use this.
    Heap,
    /// Areas are persisted to a file image under `data_dir` at each checkpoint.
    File,
}

/// Storage engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the catalog, table stores and the large-object store
    pub data_dir: PathBuf,
    /// Name of the database; prefixes the catalog and blob store files
    pub database_name: String,
    /// Store flavour for durable tables
    pub store_kind: StoreKind,
    /// Text/binary cells whose encoded size exceeds this many bytes are
    /// written to the large-object store
    pub large_object_threshold: usize,
    /// Maximum number of decoded cells kept in the shared cell cache (0 disables it)
    #[serde(default)]
    pub cell_cache_entries: usize,
    /// Checkpoint every touched store when a transaction commits
    pub checkpoint_on_commit: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            database_name: "mono".to_string(),
            store_kind: StoreKind::File,
            large_object_threshold: 4 * 1024, // 4KB
            cell_cache_entries: 16 * 1024,
            checkpoint_on_commit: true,
        }
    }
}

impl Config {
    /// Configuration rooted at `data_dir` with every other setting defaulted.
    pub fn with_data_dir<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// In-memory configuration; nothing touches the filesystem.
    pub fn in_memory() -> Self {
        Self {
            store_kind: StoreKind::Heap,
            ..Self::default()
        }
    }

    /// Load config from a JSON file, with environment variable overrides.
    /// Falls back to defaults if the file is not found. MONODB_CONFIG overrides the path.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let mut cfg_path = path.as_ref().to_path_buf();
        if let Ok(env_path) = env::var("MONODB_CONFIG") {
            cfg_path = PathBuf::from(env_path);
        }

        let mut cfg = match fs::read_to_string(&cfg_path) {
            Ok(s) => serde_json::from_str(&s)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
            Err(e) => return Err(e.into()),
        };
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    /// Apply MONODB_* environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("MONODB_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }

        if let Ok(v) = env::var("MONODB_STORE") {
            match v.to_ascii_lowercase().as_str() {
                "heap" | "memory" => self.store_kind = StoreKind::Heap,
                "file" | "disk" => self.store_kind = StoreKind::File,
                other => tracing::warn!("Ignoring unknown MONODB_STORE value '{}'", other),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let cfg = Config::load_from_path(dir.path().join("absent.json")).unwrap();
        assert_eq!(cfg.database_name, "mono");
        assert_eq!(cfg.large_object_threshold, 4 * 1024);
    }

    #[test]
    fn test_load_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mono.json");
        fs::write(
            &path,
            r#"{
                "data_dir": "/tmp/mono-test",
                "database_name": "accounts",
                "store_kind": "Heap",
                "large_object_threshold": 128,
                "checkpoint_on_commit": false
            }"#,
        )
        .unwrap();

        let cfg = Config::load_from_path(&path).unwrap();
        assert_eq!(cfg.database_name, "accounts");
        assert_eq!(cfg.large_object_threshold, 128);
        assert_eq!(cfg.cell_cache_entries, 0);
        assert!(!cfg.checkpoint_on_commit);
    }
}
