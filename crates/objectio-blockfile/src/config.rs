//! Store configuration, shaped after
//! `objectio_storage::metadata::store::MetadataStoreConfig`.

use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_PART_SIZE: usize = 64 * 1024;
pub const DEFAULT_MAX_FLUSH_ERRORS: u32 = 3;

#[derive(Debug, Clone)]
pub struct BlockFileStoreConfig {
    /// Path to the redb database file backing this store.
    pub db_path: PathBuf,
    /// Size of a data part in bytes. Tests shrink this to exercise
    /// part-boundary logic cheaply; production deployments use the default.
    pub part_size: usize,
    /// If set, a background thread calls `flush_cache()` on this cadence.
    /// `None` leaves flushing entirely caller-driven.
    pub flush_interval: Option<Duration>,
    /// Number of consecutive flush failures before a cache entry is
    /// dropped rather than retried.
    pub max_flush_errors: u32,
}

impl Default for BlockFileStoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("blockfile.redb"),
            part_size: DEFAULT_PART_SIZE,
            flush_interval: None,
            max_flush_errors: DEFAULT_MAX_FLUSH_ERRORS,
        }
    }
}

impl BlockFileStoreConfig {
    pub fn with_data_dir(dir: impl AsRef<Path>) -> Self {
        Self {
            db_path: dir.as_ref().join("blockfile.redb"),
            ..Default::default()
        }
    }

    pub fn part_size_u64(&self) -> u64 {
        self.part_size as u64
    }
}
