//! Flusher: selects dirty cache entries, writes them to
//! the backing store in one transaction per entry, clears their dirty/
//! flushing flags, and prunes entries the clean pass finds unreferenced.
//!
//! Kept as a plain function rather than a method on `BlockFileStore` so it
//! can be called both from the manual `flush_cache()` entry point and from
//! the background thread in `store.rs`, which swallows a `Busy` result
//! instead of treating it as an error.

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tracing::{debug, error, warn};

use crate::backend::BackingStore;
use crate::cache::registry::CacheRegistry;
use crate::error::{BlockFileError, Result};
use crate::types::FileKey;

/// Runs one flush pass. Entered by at most one caller at a time: `is_flushing`
/// is a compare-and-swap guard shared between the manual `flush_cache()` call
/// and the optional background thread, so a concurrent call fails fast with
/// `Busy` rather than racing a second pass against this one.
pub fn flush_cache(
    backend: &dyn BackingStore,
    registry: &CacheRegistry,
    part_size: u64,
    max_flush_errors: u32,
    is_flushing: &AtomicBool,
) -> Result<()> {
    if is_flushing
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return Err(BlockFileError::Busy);
    }
    let result = flush_once(backend, registry, part_size, max_flush_errors);
    is_flushing.store(false, Ordering::Release);
    result
}

/// Flushes every currently-dirty entry. An entry whose write fails does not
/// stop the others from being attempted; the first error encountered is
/// returned to the caller once the whole snapshot has been processed, so one
/// bad entry cannot starve unrelated files of their flush.
fn flush_once(
    backend: &dyn BackingStore,
    registry: &CacheRegistry,
    part_size: u64,
    max_flush_errors: u32,
) -> Result<()> {
    let keys = registry.dirty_keys();
    let mut first_err = None;
    for key in keys {
        if let Err(e) = flush_one(backend, registry, &key, part_size, max_flush_errors) {
            if first_err.is_none() {
                first_err = Some(e);
            }
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn flush_one(
    backend: &dyn BackingStore,
    registry: &CacheRegistry,
    key: &FileKey,
    part_size: u64,
    max_flush_errors: u32,
) -> Result<()> {
    let Some((desc, parts, full_replace)) = registry.begin_flush(key) else {
        return Ok(());
    };
    if desc.is_none() && parts.is_empty() && !full_replace {
        // Nothing was actually dirty (a racing flush already cleared it).
        registry.clean(key, part_size);
        return Ok(());
    }
    let Some(desc) = desc else {
        // A dirty data part always implies a dirty file
        // descriptor. Seeing one without the other means an operation
        // mutated a part without going through the registry's write path.
        registry.abort_flush(&desc, &parts);
        warn!(block_id = %key.block_id, name = %key.name, "dirty data parts with no cached file descriptor");
        return Err(BlockFileError::Internal(
            "dirty data parts without a cached file descriptor".into(),
        ));
    };

    let dirty_parts: Vec<(u64, Bytes)> = parts.iter().map(|p| (p.part_idx, p.data.clone())).collect();

    match backend.write_cache_entry(&desc.file, &dirty_parts, full_replace) {
        Ok(()) => {
            registry.complete_flush(&Some(desc), &parts);
            if full_replace {
                registry.clear_replace_pending(key);
            }
            registry.clean(key, part_size);
            Ok(())
        }
        Err(BlockFileError::Cancelled) => {
            // Transient: leave flags exactly as they were so the next flush
            // retries this entry from scratch.
            registry.abort_flush(&Some(desc), &parts);
            Err(BlockFileError::Cancelled)
        }
        Err(BlockFileError::NotFound) => {
            // Definitive: the file was deleted out from under the cache.
            // The cached writes are discarded rather than retried.
            registry.abort_flush(&Some(desc), &parts);
            registry.record_flush_error(key, 1);
            debug!(block_id = %key.block_id, name = %key.name, "flush target missing, dropping cached writes");
            Err(BlockFileError::NotFound)
        }
        Err(e) => {
            registry.abort_flush(&Some(desc), &parts);
            if registry.record_flush_error(key, max_flush_errors) {
                error!(block_id = %key.block_id, name = %key.name, "evicting cache entry after repeated flush failures");
            } else {
                warn!(block_id = %key.block_id, name = %key.name, "flush failed, will retry");
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    use bytes::Bytes;

    use super::*;
    use crate::types::{BlockId, File, Name, Opts};

    /// A `BackingStore` double that lets tests force a specific outcome for
    /// `write_cache_entry` without spinning up `redb`.
    #[derive(Default)]
    struct FakeBackend {
        fail_with: StdMutex<Option<fn() -> BlockFileError>>,
        writes: StdMutex<Vec<File>>,
        full_replace_calls: StdMutex<Vec<bool>>,
    }

    impl BackingStore for FakeBackend {
        fn insert_file(&self, _file: &File) -> Result<()> {
            Ok(())
        }
        fn delete_file(&self, _block_id: &BlockId, _name: &Name) -> Result<()> {
            Ok(())
        }
        fn get_file(&self, _block_id: &BlockId, _name: &Name) -> Result<Option<File>> {
            Ok(None)
        }
        fn get_file_names(&self, _block_id: &BlockId) -> Result<Vec<Name>> {
            Ok(Vec::new())
        }
        fn get_all_block_ids(&self) -> Result<Vec<BlockId>> {
            Ok(Vec::new())
        }
        fn get_files(&self, _block_id: &BlockId) -> Result<Vec<File>> {
            Ok(Vec::new())
        }
        fn get_file_parts(
            &self,
            _block_id: &BlockId,
            _name: &Name,
            _part_indices: &[u64],
        ) -> Result<HashMap<u64, Bytes>> {
            Ok(HashMap::new())
        }
        fn write_cache_entry(&self, file: &File, _dirty_parts: &[(u64, Bytes)], full_replace: bool) -> Result<()> {
            if let Some(f) = *self.fail_with.lock().unwrap() {
                return Err(f());
            }
            self.writes.lock().unwrap().push(file.clone());
            self.full_replace_calls.lock().unwrap().push(full_replace);
            Ok(())
        }
    }

    fn sample_file() -> File {
        File::new(BlockId::new("b"), Name::new("f"), Opts::default(), Default::default())
    }

    fn key() -> FileKey {
        FileKey::new(BlockId::new("b"), Name::new("f"))
    }

    #[test]
    fn flush_writes_dirty_descriptor_and_parts_then_cleans() {
        let backend = FakeBackend::default();
        let registry = CacheRegistry::new();
        let k = key();
        registry.set_desc_if_absent(&k, sample_file());
        registry.mutate_desc(&k, |f| f.size = 5).unwrap();
        registry.write_part(&k, 0, Bytes::from_static(b"hello"));

        let is_flushing = AtomicBool::new(false);
        flush_cache(&backend, &registry, 64, 3, &is_flushing).unwrap();

        assert_eq!(backend.writes.lock().unwrap().len(), 1);
        assert!(registry.get_desc(&k).is_none() || !registry.get_desc(&k).unwrap().is_dirty());
    }

    #[test]
    fn concurrent_flush_fails_busy() {
        let backend = FakeBackend::default();
        let registry = CacheRegistry::new();
        let is_flushing = AtomicBool::new(true);
        assert!(matches!(
            flush_cache(&backend, &registry, 64, 3, &is_flushing),
            Err(BlockFileError::Busy)
        ));
    }

    #[test]
    fn idempotent_second_flush_does_no_additional_writes() {
        let backend = FakeBackend::default();
        let registry = CacheRegistry::new();
        let k = key();
        registry.set_desc_if_absent(&k, sample_file());
        registry.mutate_desc(&k, |f| f.size = 5).unwrap();
        registry.write_part(&k, 0, Bytes::from_static(b"hello"));

        let is_flushing = AtomicBool::new(false);
        flush_cache(&backend, &registry, 64, 3, &is_flushing).unwrap();
        assert_eq!(backend.writes.lock().unwrap().len(), 1);
        flush_cache(&backend, &registry, 64, 3, &is_flushing).unwrap();
        assert_eq!(backend.writes.lock().unwrap().len(), 1);
    }

    #[test]
    fn not_found_during_flush_drops_entry_immediately() {
        let backend = FakeBackend::default();
        *backend.fail_with.lock().unwrap() = Some(|| BlockFileError::NotFound);
        let registry = CacheRegistry::new();
        let k = key();
        registry.set_desc_if_absent(&k, sample_file());
        registry.mutate_desc(&k, |f| f.size = 5).unwrap();

        let is_flushing = AtomicBool::new(false);
        let err = flush_cache(&backend, &registry, 64, 3, &is_flushing).unwrap_err();
        assert!(matches!(err, BlockFileError::NotFound));
        assert!(registry.all_keys().is_empty());
    }

    #[test]
    fn transient_error_leaves_entry_dirty_for_retry() {
        let backend = FakeBackend::default();
        *backend.fail_with.lock().unwrap() = Some(|| BlockFileError::Cancelled);
        let registry = CacheRegistry::new();
        let k = key();
        registry.set_desc_if_absent(&k, sample_file());
        registry.mutate_desc(&k, |f| f.size = 5).unwrap();

        let is_flushing = AtomicBool::new(false);
        let err = flush_cache(&backend, &registry, 64, 3, &is_flushing).unwrap_err();
        assert!(matches!(err, BlockFileError::Cancelled));
        let desc = registry.get_desc(&k).unwrap();
        assert!(desc.is_dirty());
        assert!(!desc.is_flushing());
    }

    #[test]
    fn replace_pending_reaches_backend_as_full_replace_and_then_clears() {
        let backend = FakeBackend::default();
        let registry = CacheRegistry::new();
        let k = key();
        registry.set_desc_if_absent(&k, sample_file());
        registry.mutate_desc(&k, |f| f.size = 5).unwrap();
        registry.write_part(&k, 0, Bytes::from_static(b"hello"));
        registry.mark_replace_pending(&k);

        let is_flushing = AtomicBool::new(false);
        flush_cache(&backend, &registry, 64, 3, &is_flushing).unwrap();
        assert_eq!(backend.full_replace_calls.lock().unwrap().as_slice(), &[true]);

        // A second flush with no intervening write_file should not repeat
        // the full replace: nothing is dirty, so write_cache_entry is not
        // called again at all.
        flush_cache(&backend, &registry, 64, 3, &is_flushing).unwrap();
        assert_eq!(backend.writes.lock().unwrap().len(), 1);
    }

    #[test]
    fn replace_pending_survives_a_transient_failure_for_retry() {
        let backend = FakeBackend::default();
        *backend.fail_with.lock().unwrap() = Some(|| BlockFileError::Cancelled);
        let registry = CacheRegistry::new();
        let k = key();
        registry.set_desc_if_absent(&k, sample_file());
        registry.mutate_desc(&k, |f| f.size = 5).unwrap();
        registry.write_part(&k, 0, Bytes::from_static(b"hello"));
        registry.mark_replace_pending(&k);

        let is_flushing = AtomicBool::new(false);
        assert!(flush_cache(&backend, &registry, 64, 3, &is_flushing).is_err());

        *backend.fail_with.lock().unwrap() = None;
        flush_cache(&backend, &registry, 64, 3, &is_flushing).unwrap();
        assert_eq!(backend.full_replace_calls.lock().unwrap().as_slice(), &[true]);
    }

    #[test]
    fn repeated_io_errors_evict_after_max_flush_errors() {
        let backend = FakeBackend::default();
        *backend.fail_with.lock().unwrap() = Some(|| BlockFileError::Io("disk full".into()));
        let registry = CacheRegistry::new();
        let k = key();
        registry.set_desc_if_absent(&k, sample_file());
        registry.mutate_desc(&k, |f| f.size = 5).unwrap();

        let is_flushing = AtomicBool::new(false);
        for _ in 0..2 {
            assert!(flush_cache(&backend, &registry, 64, 3, &is_flushing).is_err());
            assert!(!registry.all_keys().is_empty());
            registry.mutate_desc(&k, |f| f.size += 1).unwrap();
        }
        assert!(flush_cache(&backend, &registry, 64, 3, &is_flushing).is_err());
        assert!(registry.all_keys().is_empty());
    }
}
