use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use blockd_chainstate::coins::{
    CoinsDb, CoinsDbFactory, CoinsError, CoinsSlot, KvCoinsDb, MemoryCoinsFactory,
};
use blockd_storage::fjall::{FjallOptions, FjallStore};
use blockd_storage::memory::MemoryStore;
use blockd_storage::{Column, KeyValueStore, PrefixVisitor, StoreError, WriteBatch};

use crate::config::Backend;

/// Directory holding the block tree database, inside the blocks directory.
pub(crate) const BLOCK_TREE_DIR_NAME: &str = "index";

pub(crate) enum Store {
    Memory(MemoryStore),
    Fjall(FjallStore),
}

impl KeyValueStore for Store {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        match self {
            Store::Memory(store) => store.get(column, key),
            Store::Fjall(store) => store.get(column, key),
        }
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.put(column, key, value),
            Store::Fjall(store) => store.put(column, key, value),
        }
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.delete(column, key),
            Store::Fjall(store) => store.delete(column, key),
        }
    }

    fn scan_prefix(
        &self,
        column: Column,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        match self {
            Store::Memory(store) => store.scan_prefix(column, prefix),
            Store::Fjall(store) => store.scan_prefix(column, prefix),
        }
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.for_each_prefix(column, prefix, visitor),
            Store::Fjall(store) => store.for_each_prefix(column, prefix, visitor),
        }
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.write_batch(batch),
            Store::Fjall(store) => store.write_batch(batch),
        }
    }

    fn clear_column(&self, column: Column) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.clear_column(column),
            Store::Fjall(store) => store.clear_column(column),
        }
    }

    fn column_is_empty(&self, column: Column) -> Result<bool, StoreError> {
        match self {
            Store::Memory(store) => store.column_is_empty(column),
            Store::Fjall(store) => store.column_is_empty(column),
        }
    }

    fn sync(&self) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.sync(),
            Store::Fjall(store) => store.sync(),
        }
    }
}

pub(crate) fn fjall_options(db_cache_mib: Option<u64>) -> FjallOptions {
    FjallOptions {
        cache_bytes: db_cache_mib.map(|mib| mib.saturating_mul(1024 * 1024)),
        journal_bytes: None,
    }
}

pub(crate) fn open_block_tree_store(
    backend: Backend,
    blocks_dir: &Path,
    options: FjallOptions,
) -> Result<Store, String> {
    match backend {
        Backend::Memory => Ok(Store::Memory(MemoryStore::new())),
        Backend::Fjall => {
            let path = blocks_dir.join(BLOCK_TREE_DIR_NAME);
            fs::create_dir_all(&path)
                .map_err(|err| format!("failed to create {}: {err}", path.display()))?;
            let store = FjallStore::open_columns(&path, &Column::BLOCK_TREE, options)
                .map_err(|err| format!("failed to open block tree db {}: {err}", path.display()))?;
            Ok(Store::Fjall(store))
        }
    }
}

pub(crate) fn coins_factory(
    backend: Backend,
    data_dir: &Path,
    options: FjallOptions,
) -> Arc<dyn CoinsDbFactory> {
    match backend {
        Backend::Memory => Arc::new(MemoryCoinsFactory::new()),
        Backend::Fjall => Arc::new(FjallCoinsFactory::new(data_dir.to_path_buf(), options)),
    }
}

/// One fjall keyspace per coin database, named after its slot under the data
/// directory.
pub(crate) struct FjallCoinsFactory {
    data_dir: PathBuf,
    options: FjallOptions,
    open: Mutex<HashMap<CoinsSlot, Arc<FjallStore>>>,
}

impl FjallCoinsFactory {
    pub(crate) fn new(data_dir: PathBuf, options: FjallOptions) -> Self {
        Self {
            data_dir,
            options,
            open: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn path(&self, slot: CoinsSlot) -> PathBuf {
        self.data_dir.join(slot.as_str())
    }

    fn store(&self, slot: CoinsSlot) -> Result<Arc<FjallStore>, CoinsError> {
        let mut open = self.open.lock().expect("coins factory lock");
        if let Some(store) = open.get(&slot) {
            return Ok(Arc::clone(store));
        }
        let path = self.path(slot);
        fs::create_dir_all(&path).map_err(|err| io_error(&path, err))?;
        let store = Arc::new(FjallStore::open_columns(
            &path,
            &Column::COINS,
            self.options.clone(),
        )?);
        open.insert(slot, Arc::clone(&store));
        Ok(store)
    }
}

impl CoinsDbFactory for FjallCoinsFactory {
    fn open(&self, slot: CoinsSlot, wipe: bool) -> Result<Box<dyn CoinsDb>, CoinsError> {
        let mut db = KvCoinsDb::new(self.store(slot)?);
        if wipe {
            db.wipe()?;
        }
        Ok(Box::new(db))
    }

    fn exists(&self, slot: CoinsSlot) -> bool {
        if !self.path(slot).exists() {
            return false;
        }
        self.store(slot)
            .ok()
            .and_then(|store| store.column_is_empty(Column::CoinsMeta).ok())
            .is_some_and(|empty| !empty)
    }

    fn remove(&self, slot: CoinsSlot) -> Result<(), CoinsError> {
        let store = self.open.lock().expect("coins factory lock").remove(&slot);
        drop(store);
        let path = self.path(slot);
        match fs::remove_dir_all(&path) {
            Ok(()) => {
                blockd_log::log_info!("Removed coins database {}", path.display());
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_error(&path, err)),
        }
    }
}

fn io_error(path: &Path, err: std::io::Error) -> CoinsError {
    CoinsError::Store(StoreError::Backend(format!("{}: {err}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fjall_coins_survive_reopen_and_remove() {
        let dir = tempfile::tempdir().expect("tempdir");
        let best = [7u8; 32];
        {
            let factory = FjallCoinsFactory::new(dir.path().to_path_buf(), FjallOptions::default());
            assert!(!factory.exists(CoinsSlot::Primary));
            let mut db = factory.open(CoinsSlot::Primary, false).expect("open");
            db.set_best_block(best);
            db.flush().expect("flush");
            assert!(factory.exists(CoinsSlot::Primary));
            assert!(!factory.exists(CoinsSlot::Snapshot));
        }

        let factory = FjallCoinsFactory::new(dir.path().to_path_buf(), FjallOptions::default());
        assert!(factory.exists(CoinsSlot::Primary));
        let db = factory.open(CoinsSlot::Primary, false).expect("reopen");
        assert_eq!(db.best_block().expect("best"), Some(best));
        drop(db);

        factory.remove(CoinsSlot::Primary).expect("remove");
        assert!(!factory.path(CoinsSlot::Primary).exists());
        assert!(!factory.exists(CoinsSlot::Primary));
        factory
            .remove(CoinsSlot::Snapshot)
            .expect("removing a missing db is fine");
    }

    #[test]
    fn memory_backend_keeps_block_tree_in_memory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_block_tree_store(Backend::Memory, dir.path(), FjallOptions::default())
            .expect("store");
        store.put(Column::Meta, b"k", b"v").expect("put");
        assert_eq!(store.get(Column::Meta, b"k").expect("get"), Some(b"v".to_vec()));
        assert!(!dir.path().join(BLOCK_TREE_DIR_NAME).exists());
    }
}
