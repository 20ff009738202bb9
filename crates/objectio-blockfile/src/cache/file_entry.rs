//! File cache entry: pin count, write intentions, deletion
//! tombstone, the file descriptor's own dirty/flushing state, and the map
//! of cached data parts.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::cache::data_part::DataPartEntry;
use crate::types::File;

/// What a call currently has in flight against an entry, so the flusher
/// knows which parts must survive the clean pass even while clean, and so
/// [`crate::BlockFileStore::write_file`] can detect a conflicting concurrent
/// writer: `write_file` is exclusive against any other intention.
#[derive(Debug, Clone)]
pub enum WriteIntention {
    Append,
    Replace,
    Parts(Vec<u64>),
}

impl WriteIntention {
    /// Part indices this intention pins against eviction during a flush's
    /// clean pass. `Replace` pins nothing: every part will be overwritten.
    pub fn pinned_parts(&self, last_incomplete: Option<u64>) -> Vec<u64> {
        match self {
            WriteIntention::Append => last_incomplete.into_iter().collect(),
            WriteIntention::Replace => Vec::new(),
            WriteIntention::Parts(parts) => parts.clone(),
        }
    }

    pub fn conflicts_with_replace(&self) -> bool {
        matches!(self, WriteIntention::Replace)
    }
}

/// The file descriptor plus its own dirty/flushing flag pair, mirroring
/// [`DataPartEntry`]'s copy-on-flush discipline.
#[derive(Debug)]
pub struct FileDescState {
    pub file: File,
    dirty: AtomicBool,
    flushing: AtomicBool,
}

impl FileDescState {
    pub fn new(file: File, dirty: bool) -> Self {
        Self {
            file,
            dirty: AtomicBool::new(dirty),
            flushing: AtomicBool::new(false),
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::Acquire)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn begin_flush(&self) {
        self.flushing.store(true, Ordering::Release);
    }

    pub fn complete_flush(&self) {
        self.dirty.store(false, Ordering::Release);
        self.flushing.store(false, Ordering::Release);
    }

    pub fn abort_flush(&self) {
        self.flushing.store(false, Ordering::Release);
    }

    /// Copy-on-write fork used when a mutation arrives while `flushing` is
    /// true: the caller clones the descriptor, mutates the clone, and the
    /// registry replaces the pointer under its lock.
    pub fn fork(&self) -> Arc<Self> {
        Arc::new(Self::new(self.file.clone(), true))
    }
}

/// An entry in the cache registry for one `(block_id, name)`.
#[derive(Debug)]
pub struct FileCacheEntry {
    pub pin_count: u64,
    pub deleted: bool,
    pub intentions: BTreeMap<u64, WriteIntention>,
    next_intention_id: u64,
    pub desc: Option<Arc<FileDescState>>,
    pub parts: BTreeMap<u64, Arc<DataPartEntry>>,
    pub flush_error_count: u32,
    /// Set by `write_file` to tell the next flush that every part row
    /// currently on disk for this file must be deleted before the dirty
    /// parts are written back (§6.1 `write_cache_entry`'s `full_replace`).
    /// Stays set across a failed flush attempt so a retry still replaces.
    pub replace_pending: bool,
}

impl Default for FileCacheEntry {
    fn default() -> Self {
        Self {
            pin_count: 0,
            deleted: false,
            intentions: BTreeMap::new(),
            next_intention_id: 0,
            desc: None,
            parts: BTreeMap::new(),
            flush_error_count: 0,
            replace_pending: false,
        }
    }
}

impl FileCacheEntry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pin(&mut self) {
        self.pin_count += 1;
    }

    pub fn unpin(&mut self) {
        self.pin_count = self.pin_count.saturating_sub(1);
    }

    pub fn is_idle(&self) -> bool {
        self.pin_count == 0
            && self.intentions.is_empty()
            && !self.replace_pending
            && self.desc.as_ref().is_none_or(|d| !d.is_dirty() && !d.is_flushing())
            && self.parts.values().all(|p| !p.is_dirty() && !p.is_flushing())
    }

    /// Installs a new write intention, returning its id so the caller can
    /// clear it when the operation finishes. Returns `None` if a `Replace`
    /// intention is already outstanding and the new one would race it.
    pub fn try_install_intention(&mut self, intent: WriteIntention) -> Option<u64> {
        let conflicts = self
            .intentions
            .values()
            .any(|existing| existing.conflicts_with_replace() || intent.conflicts_with_replace());
        if conflicts && !self.intentions.is_empty() {
            return None;
        }
        let id = self.next_intention_id;
        self.next_intention_id += 1;
        self.intentions.insert(id, intent);
        Some(id)
    }

    pub fn clear_intention(&mut self, id: u64) {
        self.intentions.remove(&id);
    }

    pub fn pinned_part_indices(&self, part_size: u64) -> Vec<u64> {
        let last_incomplete = self.desc.as_ref().and_then(|d| {
            if d.file.size % part_size == 0 {
                return None;
            }
            let linear = d.file.size / part_size;
            let physical = if d.file.opts.circular {
                linear % d.file.opts.circular_slots(part_size)
            } else {
                linear
            };
            Some(physical)
        });
        self.intentions
            .values()
            .flat_map(|i| i.pinned_parts(last_incomplete))
            .collect()
    }

    pub fn has_dirty_parts(&self) -> bool {
        self.parts.values().any(|p| p.is_dirty())
    }

    pub fn dirty_part_snapshot(&self) -> Vec<(u64, Bytes)> {
        self.parts
            .values()
            .filter(|p| p.is_dirty())
            .map(|p| (p.part_idx, p.data.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_unpin_tracks_count() {
        let mut e = FileCacheEntry::new();
        e.pin();
        e.pin();
        assert_eq!(e.pin_count, 2);
        e.unpin();
        assert_eq!(e.pin_count, 1);
    }

    #[test]
    fn unpin_does_not_underflow() {
        let mut e = FileCacheEntry::new();
        e.unpin();
        assert_eq!(e.pin_count, 0);
    }

    #[test]
    fn replace_intention_conflicts_with_parts_intention() {
        let mut e = FileCacheEntry::new();
        let id = e.try_install_intention(WriteIntention::Replace).unwrap();
        assert!(e
            .try_install_intention(WriteIntention::Parts(vec![0]))
            .is_none());
        e.clear_intention(id);
        assert!(e
            .try_install_intention(WriteIntention::Parts(vec![0]))
            .is_some());
    }

    #[test]
    fn append_and_parts_intentions_can_coexist() {
        let mut e = FileCacheEntry::new();
        e.try_install_intention(WriteIntention::Append).unwrap();
        assert!(e
            .try_install_intention(WriteIntention::Parts(vec![3]))
            .is_some());
    }

    #[test]
    fn append_intention_pins_the_physical_not_linear_part_for_circular_files() {
        use crate::types::{BlockId, File, Name, Opts};

        let mut e = FileCacheEntry::new();
        let opts = Opts {
            max_size: 128,
            circular: true,
            ijson: false,
        };
        let mut file = File::new(BlockId::new("b"), Name::new("f"), opts, Default::default());
        // size=200, part_size=64 -> linear last-incomplete part is 3, but
        // there are only 2 slots (128/64), so the physically-stored part is
        // 3 % 2 == 1, not the linear 3.
        file.size = 200;
        e.desc = Some(Arc::new(FileDescState::new(file, false)));
        e.try_install_intention(WriteIntention::Append).unwrap();
        assert_eq!(e.pinned_part_indices(64), vec![1]);
    }

    #[test]
    fn idle_entry_has_no_pins_intentions_or_dirty_state() {
        let mut e = FileCacheEntry::new();
        assert!(e.is_idle());
        e.pin();
        assert!(!e.is_idle());
        e.unpin();
        assert!(e.is_idle());
    }
}
