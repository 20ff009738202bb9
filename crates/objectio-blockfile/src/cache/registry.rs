//! Cache registry: the single mutex guarding every `(block_id,
//! name) -> FileCacheEntry` mapping. The mutex is taken only long enough to
//! mutate bookkeeping or to read out pointers; it is never held across
//! backing-store I/O.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::cache::data_part::DataPartEntry;
use crate::cache::file_entry::{FileCacheEntry, FileDescState, WriteIntention};
use crate::error::{BlockFileError, Result};
use crate::types::{File, FileKey};

#[derive(Default)]
pub struct CacheRegistry {
    inner: Mutex<HashMap<FileKey, FileCacheEntry>>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pins the entry for `key`, creating an empty entry if necessary.
    pub fn pin(&self, key: &FileKey) {
        let mut guard = self.inner.lock();
        guard.entry(key.clone()).or_default().pin();
    }

    /// Pins the entry, but fails with `Deleted` instead if the tombstone is
    /// already set (a deleted entry accepts no new readers
    /// or writers). The deleted check and the pin happen under one lock
    /// acquisition so a racing `delete` can never slip in between them.
    pub fn try_pin(&self, key: &FileKey) -> Result<()> {
        let mut guard = self.inner.lock();
        let entry = guard.entry(key.clone()).or_default();
        if entry.deleted {
            return Err(BlockFileError::Deleted);
        }
        entry.pin();
        Ok(())
    }

    /// Unpins the entry, pruning it from the map if it is now unreferenced.
    /// A tombstoned entry is reclaimed as soon as it has no pins and no
    /// intentions, regardless of whatever descriptor/parts it still carries
    /// — the backing-store row is already gone, so that cached state is
    /// unreachable by any future operation (they all fail fast on the
    /// tombstone) and has nothing left to flush for. A live entry is only
    /// pruned here if it never had any descriptor/parts to begin with; a
    /// populated, clean entry is left for the flusher's `clean` pass.
    pub fn unpin(&self, key: &FileKey) {
        let mut guard = self.inner.lock();
        if let Some(entry) = guard.get_mut(key) {
            entry.unpin();
            let reclaim = if entry.deleted {
                entry.pin_count == 0 && entry.intentions.is_empty()
            } else {
                entry.is_idle() && entry.desc.is_none() && entry.parts.is_empty()
            };
            if reclaim {
                guard.remove(key);
            }
        }
    }

    /// Installs a write intention. Fails with `Deleted` if the entry is
    /// tombstoned, or `WriteConflict` if it conflicts with an outstanding
    /// `Replace` intention (`write_file` is exclusive against
    /// concurrent `write_at`/`append_data` on the same entry). This is a
    /// distinct error from `Busy`, which is reserved for `flush_cache`
    /// finding a flush already in progress — the two situations have
    /// nothing to do with each other.
    pub fn install_intention(&self, key: &FileKey, intent: WriteIntention) -> Result<u64> {
        let mut guard = self.inner.lock();
        let entry = guard.entry(key.clone()).or_default();
        if entry.deleted {
            return Err(BlockFileError::Deleted);
        }
        entry.try_install_intention(intent).ok_or_else(|| {
            BlockFileError::WriteConflict("write_file replace conflicts with an in-flight write on the same file".into())
        })
    }

    pub fn clear_intention(&self, key: &FileKey, id: u64) {
        let mut guard = self.inner.lock();
        if let Some(entry) = guard.get_mut(key) {
            entry.clear_intention(id);
        }
    }

    pub fn is_deleted(&self, key: &FileKey) -> bool {
        let guard = self.inner.lock();
        guard.get(key).map(|e| e.deleted).unwrap_or(false)
    }

    pub fn mark_deleted(&self, key: &FileKey) {
        let mut guard = self.inner.lock();
        if let Some(entry) = guard.get_mut(key) {
            entry.deleted = true;
        }
    }

    /// `delete`'s cache-side half: if the entry has active pins or
    /// intentions, tombstones it so operations in flight finish but no new
    /// one can start; otherwise drops it outright. A no-op if no entry was
    /// ever cached for `key`.
    pub fn delete_entry(&self, key: &FileKey) {
        let mut guard = self.inner.lock();
        if let Some(entry) = guard.get_mut(key) {
            if entry.pin_count > 0 || !entry.intentions.is_empty() {
                entry.deleted = true;
            } else {
                guard.remove(key);
            }
        }
    }

    /// Removes an entry outright, used by `delete` when nothing references
    /// it and by the flusher's clean pass.
    pub fn remove(&self, key: &FileKey) {
        self.inner.lock().remove(key);
    }

    /// Returns the currently cached descriptor, if any, without hydrating
    /// from the backing store.
    pub fn get_desc(&self, key: &FileKey) -> Option<Arc<FileDescState>> {
        self.inner.lock().get(key).and_then(|e| e.desc.clone())
    }

    /// Installs a descriptor freshly hydrated from the backing store. Does
    /// nothing if a descriptor is already present (another caller won the
    /// race); the existing one is authoritative.
    pub fn set_desc_if_absent(&self, key: &FileKey, file: File) -> Arc<FileDescState> {
        let mut guard = self.inner.lock();
        let entry = guard.entry(key.clone()).or_default();
        if entry.desc.is_none() {
            entry.desc = Some(Arc::new(FileDescState::new(file, false)));
        }
        entry.desc.clone().expect("just inserted")
    }

    pub fn put_desc(&self, key: &FileKey, desc: Arc<FileDescState>) {
        let mut guard = self.inner.lock();
        guard.entry(key.clone()).or_default().desc = Some(desc);
    }

    /// Mutates the file descriptor with `f`. Always installs a fresh
    /// `FileDescState` under the lock (copy-on-flush), so a
    /// concurrent flusher reading the previous pointer is never affected by
    /// this mutation. Every current call site hydrates the descriptor first,
    /// so the `Internal` error below is unreachable today; it exists so a
    /// future caller that skips hydration fails cleanly instead of
    /// panicking, consistent with how `flusher.rs` treats the analogous
    /// "dirty parts without a cached descriptor" invariant break.
    pub fn mutate_desc(&self, key: &FileKey, f: impl FnOnce(&mut File)) -> Result<Arc<FileDescState>> {
        let mut guard = self.inner.lock();
        let entry = guard.entry(key.clone()).or_default();
        let current = entry.desc.clone().ok_or_else(|| {
            BlockFileError::Internal("mutate_desc called without a hydrated descriptor".into())
        })?;
        let mut file = current.file.clone();
        f(&mut file);
        let replacement = Arc::new(FileDescState::new(file, true));
        entry.desc = Some(replacement.clone());
        Ok(replacement)
    }

    pub fn get_part(&self, key: &FileKey, part_idx: u64) -> Option<Arc<DataPartEntry>> {
        self.inner
            .lock()
            .get(key)
            .and_then(|e| e.parts.get(&part_idx).cloned())
    }

    pub fn set_part_if_absent(&self, key: &FileKey, part_idx: u64, data: Bytes) -> Arc<DataPartEntry> {
        let mut guard = self.inner.lock();
        let entry = guard.entry(key.clone()).or_default();
        entry
            .parts
            .entry(part_idx)
            .or_insert_with(|| Arc::new(DataPartEntry::from_store(part_idx, data)))
            .clone()
    }

    /// Writes `data` into `part_idx`, performing copy-on-write if the
    /// existing part is mid-flush.
    pub fn write_part(&self, key: &FileKey, part_idx: u64, data: Bytes) {
        let mut guard = self.inner.lock();
        let entry = guard.entry(key.clone()).or_default();
        match entry.parts.get(&part_idx) {
            Some(existing) if existing.is_flushing() => {
                let forked = existing.fork(data);
                entry.parts.insert(part_idx, forked);
            }
            Some(existing) => {
                existing.mark_dirty();
                entry.parts.insert(part_idx, Arc::new(DataPartEntry::new(part_idx, data)));
            }
            None => {
                entry.parts.insert(part_idx, Arc::new(DataPartEntry::new(part_idx, data)));
            }
        }
    }

    /// Discards all cached parts for a file (used by `write_file`'s full
    /// replace).
    pub fn clear_parts(&self, key: &FileKey) {
        if let Some(entry) = self.inner.lock().get_mut(key) {
            entry.parts.clear();
        }
    }

    /// Marks that the next flush of this entry must delete every existing
    /// part row in the backing store before writing the dirty ones back,
    /// because a `write_file` replaced the file wholesale. Stays set until a
    /// flush actually succeeds, surviving transient failures.
    pub fn mark_replace_pending(&self, key: &FileKey) {
        self.inner.lock().entry(key.clone()).or_default().replace_pending = true;
    }

    /// Snapshot of every key with dirty state, for the flusher to iterate.
    pub fn dirty_keys(&self) -> Vec<FileKey> {
        self.inner
            .lock()
            .iter()
            .filter(|(_, e)| {
                e.desc.as_ref().is_some_and(|d| d.is_dirty()) || e.has_dirty_parts()
            })
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// All keys currently registered, for `list_files` cache-washing.
    pub fn all_keys(&self) -> Vec<FileKey> {
        self.inner.lock().keys().cloned().collect()
    }

    /// Begins a flush for `key`: marks the descriptor and every dirty part
    /// as flushing and returns a consistent snapshot to write out, plus
    /// whether a pending `write_file` replace must be applied. Returns
    /// `None` if the entry has disappeared since the snapshot was taken.
    pub fn begin_flush(
        &self,
        key: &FileKey,
    ) -> Option<(Option<Arc<FileDescState>>, Vec<Arc<DataPartEntry>>, bool)> {
        let mut guard = self.inner.lock();
        let entry = guard.get_mut(key)?;
        let desc = entry.desc.clone();
        if let Some(d) = &desc {
            if d.is_dirty() {
                d.begin_flush();
            }
        }
        let dirty_parts: Vec<_> = entry
            .parts
            .values()
            .filter(|p| p.is_dirty())
            .cloned()
            .collect();
        for p in &dirty_parts {
            p.begin_flush();
        }
        Some((desc, dirty_parts, entry.replace_pending))
    }

    /// Clears the replace-pending flag once a full-replace flush has
    /// actually succeeded.
    pub fn clear_replace_pending(&self, key: &FileKey) {
        if let Some(entry) = self.inner.lock().get_mut(key) {
            entry.replace_pending = false;
        }
    }

    pub fn complete_flush(&self, desc: &Option<Arc<FileDescState>>, parts: &[Arc<DataPartEntry>]) {
        if let Some(d) = desc {
            d.complete_flush();
        }
        for p in parts {
            p.complete_flush();
        }
    }

    pub fn abort_flush(&self, desc: &Option<Arc<FileDescState>>, parts: &[Arc<DataPartEntry>]) {
        if let Some(d) = desc {
            d.abort_flush();
        }
        for p in parts {
            p.abort_flush();
        }
    }

    pub fn record_flush_error(&self, key: &FileKey, max_errors: u32) -> bool {
        let mut guard = self.inner.lock();
        if let Some(entry) = guard.get_mut(key) {
            entry.flush_error_count += 1;
            if entry.flush_error_count >= max_errors {
                guard.remove(key);
                return true;
            }
        }
        false
    }

    /// Clean pass: drops parts that are neither dirty,
    /// flushing, nor pinned by an intention; removes the entry entirely if
    /// it is left with nothing live. A tombstoned entry is swept as soon as
    /// it has no pins and no intentions — its descriptor/parts, dirty or
    /// not, can never be flushed (the backing-store row is already gone) and
    /// can never be read again, so there is nothing to wait on.
    pub fn clean(&self, key: &FileKey, part_size: u64) {
        let mut guard = self.inner.lock();
        let remove_entirely = if let Some(entry) = guard.get_mut(key) {
            if entry.deleted {
                entry.pin_count == 0 && entry.intentions.is_empty()
            } else {
                let pinned: std::collections::HashSet<u64> =
                    entry.pinned_part_indices(part_size).into_iter().collect();
                entry
                    .parts
                    .retain(|idx, p| p.is_dirty() || p.is_flushing() || pinned.contains(idx));
                entry.pin_count == 0
                    && entry.intentions.is_empty()
                    && entry.parts.is_empty()
                    && entry.desc.as_ref().is_none_or(|d| !d.is_dirty() && !d.is_flushing())
                    && !entry.replace_pending
            }
        } else {
            false
        };
        if remove_entirely {
            guard.remove(key);
        }
    }
}
