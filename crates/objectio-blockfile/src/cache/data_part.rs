//! Data-part cache entry: one part's bytes plus the `dirty`/`flushing`
//! flag pair that lets the flusher read a consistent snapshot without
//! holding the registry lock across backing-store I/O.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;

/// A single data part held in cache. Cloning a [`DataPartEntry`] (via
/// [`DataPartEntry::fork`]) is how callers perform copy-on-write when they
/// need to mutate a part that is currently `flushing`: a fresh entry with
/// fresh flags is produced and the registry's map is updated to point at it,
/// while the original continues to serve the in-flight flush untouched.
#[derive(Debug)]
pub struct DataPartEntry {
    pub part_idx: u64,
    pub data: Bytes,
    dirty: AtomicBool,
    flushing: AtomicBool,
}

impl DataPartEntry {
    pub fn new(part_idx: u64, data: Bytes) -> Self {
        Self {
            part_idx,
            data,
            dirty: AtomicBool::new(true),
            flushing: AtomicBool::new(false),
        }
    }

    pub fn from_store(part_idx: u64, data: Bytes) -> Self {
        Self {
            part_idx,
            data,
            dirty: AtomicBool::new(false),
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

    /// Called by the flusher, under the registry lock, before releasing it
    /// to do the actual I/O.
    pub fn begin_flush(&self) {
        self.flushing.store(true, Ordering::Release);
    }

    /// Called by the flusher after a successful write. Order matters: clear
    /// `dirty` first so a racing mutation between the two stores is still
    /// observed as dirty, never silently dropped.
    pub fn complete_flush(&self) {
        self.dirty.store(false, Ordering::Release);
        self.flushing.store(false, Ordering::Release);
    }

    /// Called by the flusher after a failed write; the part remains dirty
    /// and no longer flushing, so the next flush attempt retries it.
    pub fn abort_flush(&self) {
        self.flushing.store(false, Ordering::Release);
    }

    /// Produces a fresh, independent entry carrying new data, preserving
    /// `dirty=true` (the caller is about to mutate it). Used for
    /// copy-on-write when the original is `flushing`.
    pub fn fork(&self, data: Bytes) -> Arc<Self> {
        Arc::new(Self::new(self.part_idx, data))
    }
}
