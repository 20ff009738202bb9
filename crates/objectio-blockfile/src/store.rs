//! Operations layer plus the public `BlockFileStore`
//! facade: `make`, `delete`, `delete_block`, `stat`, `list_files`,
//! `write_meta`, `write_file`, `write_at`, `append_data`, `read_at`,
//! `read_file`, `flush_cache`, and the optional background flusher thread.
//!
//! The periodic flusher follows the same shape as the rest of this codebase's
//! background workers: `thread::spawn` plus an `Arc<AtomicBool>` shutdown
//! flag, a `Mutex<Option<JoinHandle>>` held by the struct, and a `Drop` impl
//! that flips the flag and joins the thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::backend::{BackingStore, RedbBackingStore};
use crate::cache::file_entry::WriteIntention;
use crate::cache::registry::CacheRegistry;
use crate::config::BlockFileStoreConfig;
use crate::deadline::Deadline;
use crate::error::{BlockFileError, Result};
use crate::flusher;
use crate::part::{self, PartWrite};
use crate::types::{BlockId, File, FileKey, FileMeta, Name, Opts};

/// Releases a pin acquired via [`BlockFileStore::pin_guard`] when dropped,
/// regardless of which `?` exit the operation takes.
struct PinGuard {
    registry: Arc<CacheRegistry>,
    key: FileKey,
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        self.registry.unpin(&self.key);
    }
}

/// Clears a write intention installed via [`BlockFileStore::intent_guard`]
/// when dropped, so the flusher's clean pass stops treating the intention's
/// parts as pinned as soon as the call returns (successfully or not).
struct IntentGuard {
    registry: Arc<CacheRegistry>,
    key: FileKey,
    id: u64,
}

impl Drop for IntentGuard {
    fn drop(&mut self) {
        self.registry.clear_intention(&self.key, self.id);
    }
}

/// The embedded block file store: a flat namespace of named files
/// grouped under block ids, mediated by a write-back cache over a relational
/// backing store.
pub struct BlockFileStore {
    backend: Arc<dyn BackingStore>,
    registry: Arc<CacheRegistry>,
    config: BlockFileStoreConfig,
    is_flushing: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    flush_handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl BlockFileStore {
    /// Opens (or creates) the `redb`-backed store at `config.db_path`,
    /// running migrations up to the latest schema version, and spawns
    /// the periodic flusher if `config.flush_interval` is set.
    pub fn open(config: BlockFileStoreConfig) -> Result<Self> {
        let backend = Arc::new(RedbBackingStore::open(&config.db_path)?);
        Self::with_backend(backend, config)
    }

    /// Builds a store over a caller-supplied backing store. Exists mainly so
    /// tests can swap in a fake [`BackingStore`] without touching `redb`.
    pub fn with_backend(backend: Arc<dyn BackingStore>, config: BlockFileStoreConfig) -> Result<Self> {
        let store = Self {
            backend,
            registry: Arc::new(CacheRegistry::new()),
            is_flushing: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(AtomicBool::new(false)),
            flush_handle: Mutex::new(None),
            config: config.clone(),
        };
        if let Some(interval) = config.flush_interval {
            store.start_background_flush(interval);
        }
        Ok(store)
    }

    fn start_background_flush(&self, interval: Duration) {
        let backend = Arc::clone(&self.backend);
        let registry = Arc::clone(&self.registry);
        let is_flushing = Arc::clone(&self.is_flushing);
        let shutdown = Arc::clone(&self.shutdown);
        let part_size = self.config.part_size_u64();
        let max_flush_errors = self.config.max_flush_errors;

        let handle = thread::spawn(move || {
            info!("background blockfile flusher started");
            while !shutdown.load(Ordering::Relaxed) {
                thread::sleep(interval);
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                match flusher::flush_cache(backend.as_ref(), &registry, part_size, max_flush_errors, &is_flushing) {
                    Ok(()) => {}
                    Err(BlockFileError::Busy) => {
                        debug!("periodic flush skipped: a flush is already in progress");
                    }
                    Err(e) => {
                        warn!(error = %e, "periodic flush failed");
                    }
                }
            }
            info!("background blockfile flusher stopped");
        });
        *self.flush_handle.lock() = Some(handle);
    }

    fn pin_guard(&self, key: &FileKey) -> Result<PinGuard> {
        self.registry.try_pin(key)?;
        Ok(PinGuard {
            registry: Arc::clone(&self.registry),
            key: key.clone(),
        })
    }

    fn intent_guard(&self, key: &FileKey, intent: WriteIntention) -> Result<IntentGuard> {
        let id = self.registry.install_intention(key, intent)?;
        Ok(IntentGuard {
            registry: Arc::clone(&self.registry),
            key: key.clone(),
            id,
        })
    }

    /// Returns the cached descriptor, hydrating it from the backing store on
    /// first access. `NotFound` if the file doesn't exist anywhere.
    fn load_desc(&self, key: &FileKey, deadline: &Deadline) -> Result<File> {
        if let Some(d) = self.registry.get_desc(key) {
            return Ok(d.file.clone());
        }
        deadline.check()?;
        match self.backend.get_file(&key.block_id, &key.name)? {
            Some(file) => Ok(self.registry.set_desc_if_absent(key, file).file.clone()),
            None => Err(BlockFileError::NotFound),
        }
    }

    /// **make**: validates `opts`, fails `Exists` if the file is
    /// already cached (and not deleted) or already present in the backing
    /// store, otherwise inserts a fresh descriptor row with `size=0`. Never
    /// touches the cache on success.
    pub fn make(&self, block_id: BlockId, name: Name, meta: FileMeta, opts: Opts, deadline: &Deadline) -> Result<()> {
        validate_key(&block_id, &name)?;
        let opts = opts.validate(self.config.part_size_u64())?;
        let key = FileKey::new(block_id.clone(), name.clone());
        if self.registry.is_deleted(&key) {
            return Err(BlockFileError::Deleted);
        }
        if self.registry.get_desc(&key).is_some() {
            return Err(BlockFileError::Exists);
        }
        deadline.check()?;
        let file = File::new(block_id, name, opts, meta);
        self.backend.insert_file(&file)
    }

    /// **delete**: unconditionally removes the backing-store rows,
    /// then tombstones or drops the cache entry depending on whether it is
    /// still referenced.
    pub fn delete(&self, block_id: &BlockId, name: &Name, deadline: &Deadline) -> Result<()> {
        validate_key(block_id, name)?;
        let key = FileKey::new(block_id.clone(), name.clone());
        deadline.check()?;
        self.backend.delete_file(block_id, name)?;
        self.registry.delete_entry(&key);
        Ok(())
    }

    /// **delete_block**: enumerates file names for the block from the
    /// backing store and deletes each.
    pub fn delete_block(&self, block_id: &BlockId, deadline: &Deadline) -> Result<()> {
        if block_id.as_str().is_empty() {
            return Err(BlockFileError::NotFound);
        }
        deadline.check()?;
        let names = self.backend.get_file_names(block_id)?;
        for name in names {
            deadline.check()?;
            self.delete(block_id, &name, deadline)?;
        }
        Ok(())
    }

    /// **stat**: a deep copy of the file descriptor, preferring the
    /// cache and falling back to the backing store. Never mutates the cache.
    pub fn stat(&self, block_id: &BlockId, name: &Name) -> Result<File> {
        validate_key(block_id, name)?;
        let key = FileKey::new(block_id.clone(), name.clone());
        if self.registry.is_deleted(&key) {
            return Err(BlockFileError::Deleted);
        }
        if let Some(d) = self.registry.get_desc(&key) {
            return Ok(d.file.clone());
        }
        self.backend.get_file(block_id, name)?.ok_or(BlockFileError::NotFound)
    }

    /// **list_files**: every file in the block, washed through the
    /// cache — a cached descriptor replaces the backing-store row, and a
    /// tombstoned entry elides it entirely.
    pub fn list_files(&self, block_id: &BlockId) -> Result<Vec<File>> {
        if block_id.as_str().is_empty() {
            return Err(BlockFileError::NotFound);
        }
        let rows = self.backend.get_files(block_id)?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let key = FileKey::new(block_id.clone(), row.name.clone());
            if self.registry.is_deleted(&key) {
                continue;
            }
            match self.registry.get_desc(&key) {
                Some(d) => out.push(d.file.clone()),
                None => out.push(row),
            }
        }
        Ok(out)
    }

    /// **write_meta**: replaces or merges `meta` under the lock. A
    /// `null` value in a merge deletes the corresponding key.
    pub fn write_meta(
        &self,
        block_id: &BlockId,
        name: &Name,
        meta: FileMeta,
        merge: bool,
        deadline: &Deadline,
    ) -> Result<()> {
        validate_key(block_id, name)?;
        let key = FileKey::new(block_id.clone(), name.clone());
        let _pin = self.pin_guard(&key)?;
        self.load_desc(&key, deadline)?;
        self.registry.mutate_desc(&key, move |file| {
            if merge {
                for (k, v) in meta {
                    if v.is_null() {
                        file.meta.remove(&k);
                    } else {
                        file.meta.insert(k, v);
                    }
                }
            } else {
                file.meta = meta;
            }
            file.touch();
        })?;
        Ok(())
    }

    /// **write_file**: an unconditional replace at offset 0. Installs
    /// a `{replace}` intention — exclusive against any other intention on the
    /// same entry, so a concurrent `write_at`/`append_data`/`write_file` call
    /// fails fast with `WriteConflict` instead of racing it — discards every
    /// cached data part, and rewrites `size` exactly.
    pub fn write_file(&self, block_id: &BlockId, name: &Name, data: Bytes, deadline: &Deadline) -> Result<()> {
        validate_key(block_id, name)?;
        let key = FileKey::new(block_id.clone(), name.clone());
        let _pin = self.pin_guard(&key)?;
        let _intent = self.intent_guard(&key, WriteIntention::Replace)?;
        self.load_desc(&key, deadline)?;

        self.registry.clear_parts(&key);
        self.registry.mark_replace_pending(&key);
        let part_size = self.config.part_size_u64();
        let len = data.len() as u64;
        for pw in part::split_write(0, len, part_size) {
            let slice = data.slice(pw.data_range.start as usize..pw.data_range.end as usize);
            self.registry.write_part(&key, pw.part_idx, slice);
        }
        self.registry.mutate_desc(&key, move |file| {
            file.size = len;
            file.touch();
        })?;
        Ok(())
    }

    /// **write_at**: validates `offset`, computes the part map,
    /// installs a `{parts}` intention covering every part index touched,
    /// hydrates only the parts that receive a partial (incomplete) write,
    /// then performs the writes and grows `size` to `max(size, offset+len)`.
    /// Circular files silently drop writes that land entirely before the
    /// addressable window.
    pub fn write_at(&self, block_id: &BlockId, name: &Name, offset: u64, data: Bytes, deadline: &Deadline) -> Result<()> {
        validate_key(block_id, name)?;
        let key = FileKey::new(block_id.clone(), name.clone());
        let _pin = self.pin_guard(&key)?;
        let file = self.load_desc(&key, deadline)?;

        if offset > file.size {
            return Err(BlockFileError::InvalidArgument("write offset past end of file".into()));
        }

        let part_size = self.config.part_size_u64();
        let len = data.len() as u64;
        let opts = file.opts;

        let (adj_offset, data, len) = if opts.circular && opts.max_size > 0 {
            match part::circular_write_adjust(offset, len, file.size, opts.max_size) {
                None => return Ok(()),
                Some((o, skip, l)) => (o, data.slice(skip as usize..), l),
            }
        } else {
            (offset, data, len)
        };
        if len == 0 {
            return Ok(());
        }

        let slots = if opts.circular { Some(opts.circular_slots(part_size)) } else { None };
        let mapped = map_physical_parts(part::split_write(adj_offset, len, part_size), slots);

        let touched: Vec<u64> = mapped.iter().map(|(idx, _)| *idx).collect();
        let _intent = self.intent_guard(&key, WriteIntention::Parts(touched))?;

        self.hydrate_incomplete(&key, block_id, name, &mapped, deadline)?;
        self.apply_part_writes(&key, &mapped, &data, part_size);

        let new_size = file.size.max(adj_offset + len);
        self.registry.mutate_desc(&key, move |file| {
            file.size = new_size;
            file.touch();
        })?;
        Ok(())
    }

    /// **append_data**: writes at offset `size`, loading the
    /// trailing incomplete part first if the file doesn't currently end on a
    /// part boundary. Subject to the same circular wrap rules as `write_at`,
    /// though an append's offset (always `>= size - max_size`) never
    /// triggers the leading-drop case.
    pub fn append_data(&self, block_id: &BlockId, name: &Name, data: Bytes, deadline: &Deadline) -> Result<()> {
        validate_key(block_id, name)?;
        let key = FileKey::new(block_id.clone(), name.clone());
        let _pin = self.pin_guard(&key)?;
        let file = self.load_desc(&key, deadline)?;

        let part_size = self.config.part_size_u64();
        let offset = file.size;
        let len = data.len() as u64;
        let opts = file.opts;

        let (adj_offset, data, len) = if opts.circular && opts.max_size > 0 {
            match part::circular_write_adjust(offset, len, file.size, opts.max_size) {
                None => return Ok(()),
                Some((o, skip, l)) => (o, data.slice(skip as usize..), l),
            }
        } else {
            (offset, data, len)
        };
        if len == 0 {
            return Ok(());
        }

        let slots = if opts.circular { Some(opts.circular_slots(part_size)) } else { None };
        let mapped = map_physical_parts(part::split_write(adj_offset, len, part_size), slots);

        let _intent = self.intent_guard(&key, WriteIntention::Append)?;

        if file.size % part_size != 0 {
            let last_linear = file.size / part_size;
            let physical = match slots {
                Some(n) if n > 0 => last_linear % n,
                _ => last_linear,
            };
            if self.registry.get_part(&key, physical).is_none() {
                deadline.check()?;
                let fetched = self.backend.get_file_parts(block_id, name, &[physical])?;
                for (idx, bytes) in fetched {
                    self.registry.set_part_if_absent(&key, idx, bytes);
                }
            }
        }

        self.apply_part_writes(&key, &mapped, &data, part_size);

        let new_size = adj_offset + len;
        self.registry.mutate_desc(&key, move |file| {
            file.size = new_size;
            file.touch();
        })?;
        Ok(())
    }

    fn hydrate_incomplete(
        &self,
        key: &FileKey,
        block_id: &BlockId,
        name: &Name,
        mapped: &[(u64, PartWrite)],
        deadline: &Deadline,
    ) -> Result<()> {
        let incomplete: Vec<u64> = mapped
            .iter()
            .filter(|(_, w)| !w.complete)
            .map(|(idx, _)| *idx)
            .filter(|idx| self.registry.get_part(key, *idx).is_none())
            .collect();
        if incomplete.is_empty() {
            return Ok(());
        }
        deadline.check()?;
        let fetched = self.backend.get_file_parts(block_id, name, &incomplete)?;
        for (idx, bytes) in fetched {
            self.registry.set_part_if_absent(key, idx, bytes);
        }
        Ok(())
    }

    fn apply_part_writes(&self, key: &FileKey, mapped: &[(u64, PartWrite)], data: &Bytes, part_size: u64) {
        for (physical_idx, pw) in mapped {
            let existing = self.registry.get_part(key, *physical_idx).map(|p| p.data.clone());
            let merged = merge_part(existing, pw, data, part_size);
            self.registry.write_part(key, *physical_idx, merged);
        }
    }

    /// **read_at**: stats the file, applies the circular read clamp,
    /// fetches every spanned part in one backing-store call, prefers the
    /// cached version of each fetched part, and concatenates the requested
    /// byte range. Missing parts are treated as zero-filled. Returns the
    /// (possibly clamp-adjusted) offset alongside the bytes, and never
    /// returns more than `min(requested_size, file.size - adjusted_offset)`
    /// bytes.
    pub fn read_at(&self, block_id: &BlockId, name: &Name, offset: u64, size: u64, deadline: &Deadline) -> Result<(u64, Bytes)> {
        validate_key(block_id, name)?;
        let key = FileKey::new(block_id.clone(), name.clone());
        let _pin = self.pin_guard(&key)?;
        let file = self.load_desc(&key, deadline)?;

        let part_size = self.config.part_size_u64();
        let opts = file.opts;
        let max_size = if opts.circular { Some(opts.max_size) } else { None };
        let (adj_offset, ret_len) = part::read_adjust(offset, size, file.size, max_size);
        if ret_len == 0 {
            return Ok((adj_offset, Bytes::new()));
        }

        let slots = if opts.circular { Some(opts.circular_slots(part_size)) } else { None };
        let writes = part::split_write(adj_offset, ret_len, part_size);
        let physical: Vec<u64> = writes
            .iter()
            .map(|w| match slots {
                Some(n) if n > 0 => w.part_idx % n,
                _ => w.part_idx,
            })
            .collect();

        let to_fetch: Vec<u64> = {
            let mut set: Vec<u64> = physical.clone();
            set.sort_unstable();
            set.dedup();
            set
        };
        deadline.check()?;
        let mut fetched = self.backend.get_file_parts(block_id, name, &to_fetch)?;
        for idx in &to_fetch {
            if let Some(cached) = self.registry.get_part(&key, *idx) {
                fetched.insert(*idx, cached.data.clone());
            }
        }

        let mut out = vec![0u8; ret_len as usize];
        for (pw, idx) in writes.iter().zip(physical.iter()) {
            let Some(part_bytes) = fetched.get(idx) else {
                continue; // missing part: leave the slice zero-filled
            };
            let start = pw.part_offset as usize;
            let want_end = start + (pw.data_range.end - pw.data_range.start) as usize;
            let avail_end = want_end.min(part_bytes.len());
            if avail_end > start {
                let n = avail_end - start;
                let dst_start = pw.data_range.start as usize;
                out[dst_start..dst_start + n].copy_from_slice(&part_bytes[start..avail_end]);
            }
        }
        Ok((adj_offset, Bytes::from(out)))
    }

    /// **read_file**: `read_at(.., 0, file.size)`.
    pub fn read_file(&self, block_id: &BlockId, name: &Name, deadline: &Deadline) -> Result<Bytes> {
        let file = self.stat(block_id, name)?;
        let (_, bytes) = self.read_at(block_id, name, 0, file.size, deadline)?;
        Ok(bytes)
    }

    /// **flush_cache**: runs one flush pass. See [`flusher::flush_cache`].
    pub fn flush_cache(&self) -> Result<()> {
        flusher::flush_cache(
            self.backend.as_ref(),
            &self.registry,
            self.config.part_size_u64(),
            self.config.max_flush_errors,
            &self.is_flushing,
        )
    }

    pub fn config(&self) -> &BlockFileStoreConfig {
        &self.config
    }
}

impl Drop for BlockFileStore {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.flush_handle.lock().take() {
            let _ = handle.join();
        }
    }
}

fn validate_key(block_id: &BlockId, name: &Name) -> Result<()> {
    if block_id.as_str().is_empty() || name.as_str().is_empty() {
        return Err(BlockFileError::NotFound);
    }
    Ok(())
}

/// Reduces each [`PartWrite`]'s linear index modulo the circular slot count
/// (when circular), pairing it with the physical part index the cache and
/// backing store actually key on.
fn map_physical_parts(writes: Vec<PartWrite>, slots: Option<u64>) -> Vec<(u64, PartWrite)> {
    writes
        .into_iter()
        .map(|w| {
            let physical = match slots {
                Some(n) if n > 0 => w.part_idx % n,
                _ => w.part_idx,
            };
            (physical, w)
        })
        .collect()
}

/// Produces the new bytes for one physical part given its (possibly absent)
/// existing cached content. A `complete` write fully replaces the part; an
/// incomplete one splices the new slice into the existing content (zero-
/// filled where nothing existed yet), preserving the untouched prefix/suffix
/// keeping the untouched prefix/suffix of a partial write intact.
fn merge_part(existing: Option<Bytes>, pw: &PartWrite, data: &Bytes, part_size: u64) -> Bytes {
    let new_slice = &data[pw.data_range.start as usize..pw.data_range.end as usize];
    if pw.complete {
        return Bytes::copy_from_slice(new_slice);
    }
    let existing = existing.unwrap_or_default();
    let start = pw.part_offset as usize;
    let end = start + new_slice.len();
    let keep_len = existing.len().max(end).min(part_size as usize);
    let mut buf = vec![0u8; keep_len];
    let copy_len = existing.len().min(keep_len);
    buf[..copy_len].copy_from_slice(&existing[..copy_len]);
    buf[start..end].copy_from_slice(new_slice);
    Bytes::from(buf)
}

#[cfg(test)]
mod testutil {
    use super::*;

    /// Builds a store over a fresh temp-dir `redb` database with a 64-byte
    /// part size, mirroring
    /// `objectio_storage::metadata::store::tests::test_config`.
    pub fn test_store() -> (BlockFileStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = BlockFileStoreConfig {
            part_size: 64,
            ..BlockFileStoreConfig::with_data_dir(dir.path())
        };
        (BlockFileStore::open(config).unwrap(), dir)
    }
}
