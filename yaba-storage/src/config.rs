use std::path::PathBuf;

/// Where a replica keeps its data.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root of the authoritative entity tree.
    pub root: PathBuf,
    /// SQLite file holding the cache and the replication tables.
    pub database_path: PathBuf,
    /// How many times the same document may fail to parse during rebuilds
    /// before the failure is surfaced instead of skipped.
    pub max_parse_retries: u32,
}

impl StoreConfig {
    /// Lays the database out next to the entity tree, under `dir`.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            root: dir.join("entities"),
            database_path: dir.join("cache.db"),
            ..Self::default()
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("yaba"),
            database_path: PathBuf::from("yaba-cache.db"),
            max_parse_retries: 3,
        }
    }
}
