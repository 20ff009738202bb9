pub mod redb_store;

pub use redb_store::RedbBackingStore;

use std::collections::HashMap;

use bytes::Bytes;

use crate::error::Result;
use crate::types::{BlockId, File, Name};

/// The relational backing store contract. Every method runs in an
/// implicit transaction; the cache registry never holds its own lock across
/// a call into this trait.
pub trait BackingStore: Send + Sync {
    fn insert_file(&self, file: &File) -> Result<()>;

    fn delete_file(&self, block_id: &BlockId, name: &Name) -> Result<()>;

    fn get_file(&self, block_id: &BlockId, name: &Name) -> Result<Option<File>>;

    fn get_file_names(&self, block_id: &BlockId) -> Result<Vec<Name>>;

    fn get_all_block_ids(&self) -> Result<Vec<BlockId>>;

    fn get_files(&self, block_id: &BlockId) -> Result<Vec<File>>;

    fn get_file_parts(
        &self,
        block_id: &BlockId,
        name: &Name,
        part_indices: &[u64],
    ) -> Result<HashMap<u64, Bytes>>;

    /// Atomically updates the file descriptor's mutable fields and writes
    /// each dirty part. `full_replace` indicates a `write_file`: all
    /// existing part rows are deleted before the new ones are inserted.
    fn write_cache_entry(
        &self,
        file: &File,
        dirty_parts: &[(u64, Bytes)],
        full_replace: bool,
    ) -> Result<()>;
}
