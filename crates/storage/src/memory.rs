use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::RwLock;

use crate::{Column, KeyValueStore, PrefixVisitor, ScanResult, StoreError, WriteBatch, WriteOp};

type Partition = BTreeMap<Vec<u8>, Vec<u8>>;

/// In-process store used by tests and the `memory` backend. One ordered map
/// per column, all behind a single lock so batches apply atomically.
pub struct MemoryStore {
    partitions: RwLock<Vec<Partition>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            partitions: RwLock::new(vec![Partition::new(); Column::ALL.len()]),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, column: Column) -> usize {
        let guard = self.partitions.read().expect("memory store lock");
        guard[column.index()].len()
    }

    pub fn is_empty(&self, column: Column) -> bool {
        self.len(column) == 0
    }
}

fn prefix_range<'a>(
    partition: &'a Partition,
    prefix: &'a [u8],
) -> impl Iterator<Item = (&'a Vec<u8>, &'a Vec<u8>)> + 'a {
    partition
        .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
        .take_while(move |(key, _)| key.starts_with(prefix))
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let guard = self.partitions.read().expect("memory store lock");
        Ok(guard[column.index()].get(key).cloned())
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut guard = self.partitions.write().expect("memory store lock");
        guard[column.index()].insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        let mut guard = self.partitions.write().expect("memory store lock");
        guard[column.index()].remove(key);
        Ok(())
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        let guard = self.partitions.read().expect("memory store lock");
        Ok(prefix_range(&guard[column.index()], prefix)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        let guard = self.partitions.read().expect("memory store lock");
        for (key, value) in prefix_range(&guard[column.index()], prefix) {
            visitor(key, value)?;
        }
        Ok(())
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut guard = self.partitions.write().expect("memory store lock");
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    guard[column.index()].insert(key.to_vec(), value.clone());
                }
                WriteOp::Delete { column, key } => {
                    guard[column.index()].remove(key.as_slice());
                }
            }
        }
        Ok(())
    }

    fn clear_column(&self, column: Column) -> Result<(), StoreError> {
        let mut guard = self.partitions.write().expect("memory store lock");
        guard[column.index()].clear();
        Ok(())
    }

    fn column_is_empty(&self, column: Column) -> Result<bool, StoreError> {
        Ok(self.is_empty(column))
    }
}
