//! Column-partitioned key-value storage shared by the block tree and coin
//! databases.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

pub mod memory;

#[cfg(feature = "fjall")]
pub mod fjall;

#[derive(Debug)]
pub enum StoreError {
    Backend(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Backend(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Partitions of a store. A block tree database uses the first three, a
/// coins database the last two.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Column {
    BlockIndex,
    BlockFileInfo,
    Meta,
    Coins,
    CoinsMeta,
}

impl Column {
    pub const ALL: [Column; 5] = [
        Column::BlockIndex,
        Column::BlockFileInfo,
        Column::Meta,
        Column::Coins,
        Column::CoinsMeta,
    ];

    pub const BLOCK_TREE: [Column; 3] = [Column::BlockIndex, Column::BlockFileInfo, Column::Meta];

    pub const COINS: [Column; 2] = [Column::Coins, Column::CoinsMeta];

    pub const fn index(self) -> usize {
        match self {
            Column::BlockIndex => 0,
            Column::BlockFileInfo => 1,
            Column::Meta => 2,
            Column::Coins => 3,
            Column::CoinsMeta => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Column::BlockIndex => "block_index",
            Column::BlockFileInfo => "block_file_info",
            Column::Meta => "meta",
            Column::Coins => "coins",
            Column::CoinsMeta => "coins_meta",
        }
    }
}

/// Keys are block hashes, outpoints, file numbers or short meta names, so
/// they fit inline.
pub type BatchKey = SmallVec<[u8; 40]>;

#[derive(Clone, Debug)]
pub enum WriteOp {
    Put {
        column: Column,
        key: BatchKey,
        value: Vec<u8>,
    },
    Delete {
        column: Column,
        key: BatchKey,
    },
}

/// Ordered set of writes applied atomically by `KeyValueStore::write_batch`.
#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserve(&mut self, additional: usize) {
        self.ops.reserve(additional);
    }

    pub fn put(&mut self, column: Column, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) {
        self.ops.push(WriteOp::Put {
            column,
            key: SmallVec::from_slice(key.as_ref()),
            value: value.as_ref().to_vec(),
        });
    }

    pub fn delete(&mut self, column: Column, key: impl AsRef<[u8]>) {
        self.ops.push(WriteOp::Delete {
            column,
            key: SmallVec::from_slice(key.as_ref()),
        });
    }

    pub fn iter(&self) -> impl Iterator<Item = &WriteOp> {
        self.ops.iter()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn append(&mut self, other: WriteBatch) {
        self.ops.extend(other.ops);
    }
}

pub type ScanResult = Vec<(Vec<u8>, Vec<u8>)>;
pub type PrefixVisitor<'a> = dyn FnMut(&[u8], &[u8]) -> Result<(), StoreError> + 'a;

pub trait KeyValueStore: Send + Sync {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError>;
    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError>;
    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError>;
    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError>;
    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError>;
    /// Removes every key in `column`.
    fn clear_column(&self, column: Column) -> Result<(), StoreError>;
    fn column_is_empty(&self, column: Column) -> Result<bool, StoreError>;
    /// Makes every committed batch durable.
    fn sync(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.as_ref().get(column, key)
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.as_ref().put(column, key, value)
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        self.as_ref().delete(column, key)
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        self.as_ref().scan_prefix(column, prefix)
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        self.as_ref().for_each_prefix(column, prefix, visitor)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        self.as_ref().write_batch(batch)
    }

    fn clear_column(&self, column: Column) -> Result<(), StoreError> {
        self.as_ref().clear_column(column)
    }

    fn column_is_empty(&self, column: Column) -> Result<bool, StoreError> {
        self.as_ref().column_is_empty(column)
    }

    fn sync(&self) -> Result<(), StoreError> {
        self.as_ref().sync()
    }
}
