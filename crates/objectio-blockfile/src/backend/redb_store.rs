//! `redb`-backed realization of the backing-store contract: a
//! `Database::create` + `begin_write`/`open_table`/`commit` bootstrap,
//! `TableDefinition<&str, &[u8]>` tables, and `"{outer}\0{inner}"`-style
//! composite string keys for prefix scans.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use redb::{Database, ReadableTable, TableDefinition};
use tracing::{debug, info};

use crate::backend::BackingStore;
use crate::error::{BlockFileError, Result};
use crate::types::{BlockId, File, Name};

const FILES: TableDefinition<&str, &[u8]> = TableDefinition::new("blockfile_files");
const PARTS: TableDefinition<&str, &[u8]> = TableDefinition::new("blockfile_parts");
const META: TableDefinition<&str, &[u8]> = TableDefinition::new("blockfile_meta");

const SCHEMA_VERSION_KEY: &str = "schema_version";
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

pub struct RedbBackingStore {
    db: Arc<Database>,
}

impl RedbBackingStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::create(path.as_ref())?;
        let wtx = db.begin_write()?;
        {
            let _files = wtx.open_table(FILES)?;
            let _parts = wtx.open_table(PARTS)?;
            let mut meta = wtx.open_table(META)?;
            match meta.get(SCHEMA_VERSION_KEY)? {
                None => {
                    info!(version = CURRENT_SCHEMA_VERSION, "initializing new blockfile database");
                    meta.insert(SCHEMA_VERSION_KEY, CURRENT_SCHEMA_VERSION.to_be_bytes().as_slice())?;
                }
                Some(raw) => {
                    let bytes: [u8; 4] = raw.value().try_into().map_err(|_| {
                        BlockFileError::Io("corrupt schema_version marker".into())
                    })?;
                    let version = u32::from_be_bytes(bytes);
                    if version > CURRENT_SCHEMA_VERSION {
                        return Err(BlockFileError::Io(format!(
                            "database schema version {version} is newer than supported version {CURRENT_SCHEMA_VERSION}"
                        )));
                    }
                    debug!(version, "opened existing blockfile database");
                }
            }
        }
        wtx.commit()?;
        Ok(Self { db: Arc::new(db) })
    }

    fn file_key(block_id: &BlockId, name: &Name) -> String {
        format!("{}\0{}", block_id.as_str(), name.as_str())
    }

    fn part_key(block_id: &BlockId, name: &Name, part_idx: u64) -> String {
        format!("{}\0{}\0{part_idx:016x}", block_id.as_str(), name.as_str())
    }

    fn part_prefix(block_id: &BlockId, name: &Name) -> String {
        format!("{}\0{}\0", block_id.as_str(), name.as_str())
    }

    fn block_prefix(block_id: &BlockId) -> String {
        format!("{}\0", block_id.as_str())
    }
}

impl BackingStore for RedbBackingStore {
    fn insert_file(&self, file: &File) -> Result<()> {
        let key = Self::file_key(&file.block_id, &file.name);
        let wtx = self.db.begin_write()?;
        {
            let mut table = wtx.open_table(FILES)?;
            if table.get(key.as_str())?.is_some() {
                return Err(BlockFileError::Exists);
            }
            let json = serde_json::to_vec(file)?;
            table.insert(key.as_str(), json.as_slice())?;
        }
        wtx.commit()?;
        Ok(())
    }

    fn delete_file(&self, block_id: &BlockId, name: &Name) -> Result<()> {
        let key = Self::file_key(block_id, name);
        let prefix = Self::part_prefix(block_id, name);
        let wtx = self.db.begin_write()?;
        {
            let mut files = wtx.open_table(FILES)?;
            files.remove(key.as_str())?;
            let mut parts = wtx.open_table(PARTS)?;
            let to_remove: Vec<String> = parts
                .range(prefix.as_str()..)?
                .take_while(|r| r.as_ref().is_ok_and(|(k, _)| k.value().starts_with(&prefix)))
                .filter_map(|r| r.ok().map(|(k, _)| k.value().to_string()))
                .collect();
            for k in to_remove {
                parts.remove(k.as_str())?;
            }
        }
        wtx.commit()?;
        Ok(())
    }

    fn get_file(&self, block_id: &BlockId, name: &Name) -> Result<Option<File>> {
        let key = Self::file_key(block_id, name);
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(FILES)?;
        match table.get(key.as_str())? {
            None => Ok(None),
            Some(raw) => Ok(Some(serde_json::from_slice(raw.value())?)),
        }
    }

    fn get_file_names(&self, block_id: &BlockId) -> Result<Vec<Name>> {
        let prefix = Self::block_prefix(block_id);
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(FILES)?;
        let mut names = Vec::new();
        for row in table.range(prefix.as_str()..)? {
            let (k, _) = row?;
            let key = k.value();
            if !key.starts_with(&prefix) {
                break;
            }
            if let Some(name) = key.strip_prefix(&prefix) {
                names.push(Name::new(name));
            }
        }
        Ok(names)
    }

    fn get_all_block_ids(&self) -> Result<Vec<BlockId>> {
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(FILES)?;
        let mut seen = std::collections::BTreeSet::new();
        for row in table.iter()? {
            let (k, _) = row?;
            if let Some((block_id, _)) = k.value().split_once('\0') {
                seen.insert(block_id.to_string());
            }
        }
        Ok(seen.into_iter().map(BlockId::new).collect())
    }

    fn get_files(&self, block_id: &BlockId) -> Result<Vec<File>> {
        let prefix = Self::block_prefix(block_id);
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(FILES)?;
        let mut files = Vec::new();
        for row in table.range(prefix.as_str()..)? {
            let (k, v) = row?;
            if !k.value().starts_with(&prefix) {
                break;
            }
            files.push(serde_json::from_slice(v.value())?);
        }
        Ok(files)
    }

    fn get_file_parts(
        &self,
        block_id: &BlockId,
        name: &Name,
        part_indices: &[u64],
    ) -> Result<HashMap<u64, Bytes>> {
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(PARTS)?;
        let mut out = HashMap::with_capacity(part_indices.len());
        for &idx in part_indices {
            let key = Self::part_key(block_id, name, idx);
            if let Some(raw) = table.get(key.as_str())? {
                out.insert(idx, Bytes::copy_from_slice(raw.value()));
            }
        }
        Ok(out)
    }

    fn write_cache_entry(&self, file: &File, dirty_parts: &[(u64, Bytes)], full_replace: bool) -> Result<()> {
        let file_key = Self::file_key(&file.block_id, &file.name);
        let wtx = self.db.begin_write()?;
        {
            let mut files = wtx.open_table(FILES)?;
            if files.get(file_key.as_str())?.is_none() {
                return Err(BlockFileError::NotFound);
            }
            let json = serde_json::to_vec(file)?;
            files.insert(file_key.as_str(), json.as_slice())?;
        }
        {
            let mut parts = wtx.open_table(PARTS)?;
            if full_replace {
                let prefix = Self::part_prefix(&file.block_id, &file.name);
                let to_remove: Vec<String> = parts
                    .range(prefix.as_str()..)?
                    .take_while(|r| r.as_ref().is_ok_and(|(k, _)| k.value().starts_with(&prefix)))
                    .filter_map(|r| r.ok().map(|(k, _)| k.value().to_string()))
                    .collect();
                for k in to_remove {
                    parts.remove(k.as_str())?;
                }
            }
            for (idx, data) in dirty_parts {
                let key = Self::part_key(&file.block_id, &file.name, *idx);
                parts.insert(key.as_str(), data.as_ref())?;
            }
        }
        wtx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Opts;

    fn store() -> (RedbBackingStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbBackingStore::open(dir.path().join("db.redb")).unwrap();
        (store, dir)
    }

    fn sample(block: &str, name: &str) -> File {
        File::new(BlockId::new(block), Name::new(name), Opts::default(), Default::default())
    }

    #[test]
    fn insert_then_get_round_trips() {
        let (store, _dir) = store();
        let f = sample("b1", "f1");
        store.insert_file(&f).unwrap();
        let got = store.get_file(&f.block_id, &f.name).unwrap().unwrap();
        assert_eq!(got.block_id, f.block_id);
        assert_eq!(got.name, f.name);
    }

    #[test]
    fn insert_twice_fails_with_exists() {
        let (store, _dir) = store();
        let f = sample("b1", "f1");
        store.insert_file(&f).unwrap();
        let err = store.insert_file(&f).unwrap_err();
        assert!(matches!(err, BlockFileError::Exists));
    }

    #[test]
    fn write_cache_entry_requires_existing_file() {
        let (store, _dir) = store();
        let f = sample("b1", "f1");
        let err = store
            .write_cache_entry(&f, &[(0, Bytes::from_static(b"x"))], false)
            .unwrap_err();
        assert!(matches!(err, BlockFileError::NotFound));
    }

    #[test]
    fn write_cache_entry_persists_parts() {
        let (store, _dir) = store();
        let f = sample("b1", "f1");
        store.insert_file(&f).unwrap();
        store
            .write_cache_entry(&f, &[(0, Bytes::from_static(b"hello"))], false)
            .unwrap();
        let parts = store.get_file_parts(&f.block_id, &f.name, &[0]).unwrap();
        assert_eq!(&parts[&0][..], b"hello");
    }

    #[test]
    fn full_replace_drops_old_parts() {
        let (store, _dir) = store();
        let f = sample("b1", "f1");
        store.insert_file(&f).unwrap();
        store
            .write_cache_entry(&f, &[(0, Bytes::from_static(b"a")), (1, Bytes::from_static(b"b"))], false)
            .unwrap();
        store
            .write_cache_entry(&f, &[(0, Bytes::from_static(b"z"))], true)
            .unwrap();
        let parts = store.get_file_parts(&f.block_id, &f.name, &[0, 1]).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(&parts[&0][..], b"z");
    }

    #[test]
    fn delete_file_removes_file_and_parts() {
        let (store, _dir) = store();
        let f = sample("b1", "f1");
        store.insert_file(&f).unwrap();
        store
            .write_cache_entry(&f, &[(0, Bytes::from_static(b"a"))], false)
            .unwrap();
        store.delete_file(&f.block_id, &f.name).unwrap();
        assert!(store.get_file(&f.block_id, &f.name).unwrap().is_none());
        let parts = store.get_file_parts(&f.block_id, &f.name, &[0]).unwrap();
        assert!(parts.is_empty());
    }

    #[test]
    fn get_file_names_and_block_ids() {
        let (store, _dir) = store();
        store.insert_file(&sample("b1", "f1")).unwrap();
        store.insert_file(&sample("b1", "f2")).unwrap();
        store.insert_file(&sample("b2", "f1")).unwrap();
        let mut names: Vec<_> = store
            .get_file_names(&BlockId::new("b1"))
            .unwrap()
            .into_iter()
            .map(|n| n.0)
            .collect();
        names.sort();
        assert_eq!(names, vec!["f1".to_string(), "f2".to_string()]);
        let mut blocks: Vec<_> = store.get_all_block_ids().unwrap().into_iter().map(|b| b.0).collect();
        blocks.sort();
        assert_eq!(blocks, vec!["b1".to_string(), "b2".to_string()]);
    }

    #[test]
    fn reopen_preserves_schema_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.redb");
        {
            let store = RedbBackingStore::open(&path).unwrap();
            store.insert_file(&sample("b1", "f1")).unwrap();
        }
        let store = RedbBackingStore::open(&path).unwrap();
        assert!(store.get_file(&BlockId::new("b1"), &Name::new("f1")).unwrap().is_some());
    }
}
