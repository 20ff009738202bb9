use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use derive_more::{Display, From};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BlockFileError, Result};

/// Opaque identifier grouping a set of files. Files in the same block are
/// deleted together by [`crate::BlockFileStore::delete_block`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Display, From, Serialize, Deserialize)]
pub struct BlockId(pub String);

impl BlockId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for BlockId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Opaque file name, unique within a block.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Display, From, Serialize, Deserialize)]
pub struct Name(pub String);

impl Name {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Name {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Key under which an entry is registered in the cache and the backing store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileKey {
    pub block_id: BlockId,
    pub name: Name,
}

impl FileKey {
    pub fn new(block_id: BlockId, name: Name) -> Self {
        Self { block_id, name }
    }

    /// Composite key as persisted by the redb backing store: `block_id\0name`.
    pub fn db_key(&self) -> String {
        format!("{}\0{}", self.block_id.as_str(), self.name.as_str())
    }
}

/// Per-file options, validated by [`Opts::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Opts {
    /// `0` means unbounded. For circular files this is rounded up to a
    /// multiple of the part size and must be positive.
    pub max_size: u64,
    pub circular: bool,
    pub ijson: bool,
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            max_size: 0,
            circular: false,
            ijson: false,
        }
    }
}

impl Opts {
    /// Validates the combination of fields and rounds `max_size` up to a
    /// multiple of `part_size` when `circular` is set.
    pub fn validate(mut self, part_size: u64) -> Result<Self> {
        if self.circular && self.ijson {
            return Err(BlockFileError::InvalidArgument(
                "circular and ijson are mutually exclusive".into(),
            ));
        }
        if self.circular && self.max_size == 0 {
            return Err(BlockFileError::InvalidArgument(
                "circular files require a positive max_size".into(),
            ));
        }
        if self.circular {
            let rem = self.max_size % part_size;
            if rem != 0 {
                self.max_size += part_size - rem;
            }
        }
        Ok(self)
    }

    /// Number of part slots a circular file cycles through. Panics if called
    /// on a non-circular file; callers must check `circular` first.
    pub fn circular_slots(&self, part_size: u64) -> u64 {
        debug_assert!(self.circular);
        self.max_size / part_size
    }
}

/// String-keyed map of arbitrary JSON-compatible values.
pub type FileMeta = BTreeMap<String, Value>;

/// The mutable/immutable file descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct File {
    pub block_id: BlockId,
    pub name: Name,
    pub opts: Opts,
    pub created_ts: i64,
    pub mod_ts: i64,
    pub size: u64,
    pub meta: FileMeta,
}

impl File {
    pub fn new(block_id: BlockId, name: Name, opts: Opts, meta: FileMeta) -> Self {
        let now = now_millis();
        Self {
            block_id,
            name,
            opts,
            created_ts: now,
            mod_ts: now,
            size: 0,
            meta,
        }
    }

    pub fn key(&self) -> FileKey {
        FileKey::new(self.block_id.clone(), self.name.clone())
    }

    pub fn touch(&mut self) {
        self.mod_ts = now_millis();
    }
}

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
