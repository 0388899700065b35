use std::path::Path;
use std::time::{Duration, Instant};

use fjall::{Batch, Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};

use crate::{Column, KeyValueStore, PrefixVisitor, ScanResult, StoreError, WriteBatch, WriteOp};

const SLOW_COMMIT_THRESHOLD: Duration = Duration::from_millis(500);
const CLEAR_BATCH_KEYS: usize = 10_000;

/// A fjall keyspace with one partition per opened column.
pub struct FjallStore {
    keyspace: Keyspace,
    partitions: [Option<PartitionHandle>; Column::ALL.len()],
}

#[derive(Clone, Debug, Default)]
pub struct FjallOptions {
    pub cache_bytes: Option<u64>,
    pub journal_bytes: Option<u64>,
}

impl FjallStore {
    /// Opens every column.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_columns(path, &Column::ALL, FjallOptions::default())
    }

    pub fn open_columns(
        path: impl AsRef<Path>,
        columns: &[Column],
        options: FjallOptions,
    ) -> Result<Self, StoreError> {
        let mut config = Config::new(path);
        if let Some(bytes) = options.cache_bytes {
            config = config.cache_size(bytes);
        }
        if let Some(bytes) = options.journal_bytes {
            config = config.max_journaling_size(bytes);
        }
        let keyspace = config.open().map_err(map_err)?;
        let mut partitions: [Option<PartitionHandle>; Column::ALL.len()] = Default::default();
        for column in columns {
            let handle = keyspace
                .open_partition(column.as_str(), PartitionCreateOptions::default())
                .map_err(map_err)?;
            partitions[column.index()] = Some(handle);
        }
        Ok(Self {
            keyspace,
            partitions,
        })
    }

    fn partition(&self, column: Column) -> Result<&PartitionHandle, StoreError> {
        self.partitions[column.index()].as_ref().ok_or_else(|| {
            StoreError::Backend(format!("column {} is not open in this store", column.as_str()))
        })
    }

    fn stage(&self, batch: &WriteBatch) -> Result<Batch, StoreError> {
        let mut staged = Batch::with_capacity(self.keyspace.clone(), batch.len())
            .durability(Some(PersistMode::Buffer));
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    staged.insert(self.partition(*column)?, key.as_slice(), value.as_slice());
                }
                WriteOp::Delete { column, key } => {
                    staged.remove(self.partition(*column)?, key.as_slice());
                }
            }
        }
        Ok(staged)
    }
}

impl KeyValueStore for FjallStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let value = self.partition(column)?.get(key).map_err(map_err)?;
        Ok(value.map(|bytes| bytes.to_vec()))
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.partition(column)?.insert(key, value).map_err(map_err)
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        self.partition(column)?.remove(key).map_err(map_err)
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        let mut results = Vec::new();
        let mut visitor = |key: &[u8], value: &[u8]| {
            results.push((key.to_vec(), value.to_vec()));
            Ok(())
        };
        self.for_each_prefix(column, prefix, &mut visitor)?;
        Ok(results)
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        for entry in self.partition(column)?.prefix(prefix) {
            let (key, value) = entry.map_err(map_err)?;
            visitor(key.as_ref(), value.as_ref())?;
        }
        Ok(())
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let staged = self.stage(batch)?;
        let started = Instant::now();
        staged.commit().map_err(map_err)?;
        let elapsed = started.elapsed();
        if elapsed >= SLOW_COMMIT_THRESHOLD {
            blockd_log::log_warn!(
                "fjall batch of {} ops took {}ms to commit (journals {})",
                batch.len(),
                elapsed.as_millis(),
                self.keyspace.journal_count(),
            );
        }
        Ok(())
    }

    fn clear_column(&self, column: Column) -> Result<(), StoreError> {
        let partition = self.partition(column)?;
        loop {
            let keys = partition
                .keys()
                .take(CLEAR_BATCH_KEYS)
                .collect::<Result<Vec<_>, _>>()
                .map_err(map_err)?;
            if keys.is_empty() {
                return Ok(());
            }
            let mut staged = Batch::with_capacity(self.keyspace.clone(), keys.len())
                .durability(Some(PersistMode::Buffer));
            for key in &keys {
                staged.remove(partition, key.as_ref());
            }
            staged.commit().map_err(map_err)?;
        }
    }

    fn column_is_empty(&self, column: Column) -> Result<bool, StoreError> {
        self.partition(column)?.is_empty().map_err(map_err)
    }

    fn sync(&self) -> Result<(), StoreError> {
        self.keyspace.persist(PersistMode::SyncAll).map_err(map_err)
    }
}

fn map_err(err: fjall::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}
