use std::sync::Arc;

use blockd_primitives::block::{BlockHeader, HEADER_SIZE};
use blockd_primitives::encoding::{Decoder, Encoder};
use blockd_storage::{Column, KeyValueStore, StoreError, WriteBatch};
use rayon::prelude::*;

use crate::blockindex::DiskBlockIndex;
use crate::filemeta::{
    block_file_info_key, flag_key, parse_block_file_info_key, BlockFileInfo,
    META_LAST_BLOCK_FILE_KEY, META_REINDEXING_KEY,
};

const DISK_INDEX_VERSION: u8 = 1;
const META_SCHEMA_VERSION_KEY: &[u8] = b"schema_version";
const SCHEMA_VERSION: u32 = 1;

/// Durable mirror of the block index plus block file bookkeeping.
pub struct BlockTreeDb<S> {
    store: Arc<S>,
}

impl<S: KeyValueStore> BlockTreeDb<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Drops every record; used when a full reindex starts.
    pub fn wipe(&self) -> Result<(), StoreError> {
        for column in [Column::BlockIndex, Column::BlockFileInfo, Column::Meta] {
            self.store.clear_column(column)?;
        }
        self.store.sync()
    }

    pub fn write_batch_sync(
        &self,
        file_infos: &[(u32, BlockFileInfo)],
        last_file: u32,
        nodes: &[DiskBlockIndex],
    ) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        batch.reserve(file_infos.len() + nodes.len() + 2);
        for (file, info) in file_infos {
            batch.put(Column::BlockFileInfo, block_file_info_key(*file), info.encode());
        }
        batch.put(Column::Meta, META_LAST_BLOCK_FILE_KEY, last_file.to_le_bytes());
        batch.put(
            Column::Meta,
            META_SCHEMA_VERSION_KEY,
            SCHEMA_VERSION.to_le_bytes(),
        );
        for node in nodes {
            batch.put(Column::BlockIndex, node.hash, encode_disk_index(node));
        }
        self.store.write_batch(&batch)?;
        self.store.sync()
    }

    pub fn read_block_file_info(&self, file: u32) -> Result<Option<BlockFileInfo>, StoreError> {
        match self
            .store
            .get(Column::BlockFileInfo, &block_file_info_key(file))?
        {
            Some(bytes) => BlockFileInfo::decode(&bytes)
                .map(Some)
                .ok_or_else(|| StoreError::Backend(format!("corrupt block file info {file}"))),
            None => Ok(None),
        }
    }

    pub fn read_all_block_file_info(&self) -> Result<Vec<(u32, BlockFileInfo)>, StoreError> {
        let mut out = Vec::new();
        let mut visitor = |key: &[u8], value: &[u8]| {
            let file = parse_block_file_info_key(key)
                .ok_or_else(|| StoreError::Backend("invalid block file info key".to_string()))?;
            let info = BlockFileInfo::decode(value)
                .ok_or_else(|| StoreError::Backend(format!("corrupt block file info {file}")))?;
            out.push((file, info));
            Ok(())
        };
        self.store
            .for_each_prefix(Column::BlockFileInfo, &[], &mut visitor)?;
        Ok(out)
    }

    pub fn read_last_block_file(&self) -> Result<Option<u32>, StoreError> {
        match self.store.get(Column::Meta, META_LAST_BLOCK_FILE_KEY)? {
            Some(bytes) => {
                let raw: [u8; 4] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StoreError::Backend("invalid last block file".to_string()))?;
                Ok(Some(u32::from_le_bytes(raw)))
            }
            None => Ok(None),
        }
    }

    pub fn write_reindexing(&self, reindexing: bool) -> Result<(), StoreError> {
        if reindexing {
            self.store.put(Column::Meta, META_REINDEXING_KEY, &[1])?;
        } else {
            self.store.delete(Column::Meta, META_REINDEXING_KEY)?;
        }
        self.store.sync()
    }

    pub fn read_reindexing(&self) -> Result<bool, StoreError> {
        Ok(self.store.get(Column::Meta, META_REINDEXING_KEY)?.is_some())
    }

    pub fn write_flag(&self, name: &str, value: bool) -> Result<(), StoreError> {
        self.store
            .put(Column::Meta, &flag_key(name), &[u8::from(value)])?;
        self.store.sync()
    }

    pub fn read_flag(&self, name: &str) -> Result<bool, StoreError> {
        match self.store.get(Column::Meta, &flag_key(name))? {
            Some(bytes) => Ok(bytes.first() == Some(&1)),
            None => Ok(false),
        }
    }

    pub fn count_block_index(&self) -> Result<usize, StoreError> {
        let mut count = 0usize;
        let mut visitor = |_key: &[u8], _value: &[u8]| {
            count += 1;
            Ok(())
        };
        self.store
            .for_each_prefix(Column::BlockIndex, &[], &mut visitor)?;
        Ok(count)
    }

    /// Reads every persisted node record. Decoding fans out over rayon once
    /// the raw bytes are collected.
    pub fn load_block_index_guts(&self) -> Result<Vec<DiskBlockIndex>, StoreError> {
        let raw = self.store.scan_prefix(Column::BlockIndex, &[])?;
        raw.into_par_iter()
            .map(|(key, value)| {
                let record = decode_disk_index(&value).map_err(StoreError::Backend)?;
                if record.hash.as_slice() != key.as_slice() {
                    return Err(StoreError::Backend(
                        "block index key does not match header hash".to_string(),
                    ));
                }
                Ok(record)
            })
            .collect()
    }
}

pub fn encode_disk_index(record: &DiskBlockIndex) -> Vec<u8> {
    let mut encoder = Encoder::with_capacity(1 + 4 * 6 + 80);
    encoder.write_u8(DISK_INDEX_VERSION);
    encoder.write_i32_le(record.height);
    encoder.write_u32_le(record.status);
    encoder.write_u32_le(record.tx_count);
    encoder.write_u32_le(record.file);
    encoder.write_u32_le(record.data_pos);
    encoder.write_u32_le(record.undo_pos);
    encoder.write_bytes(&record.header.consensus_encode());
    encoder.into_inner()
}

pub(crate) fn decode_disk_index(bytes: &[u8]) -> Result<DiskBlockIndex, String> {
    let mut decoder = Decoder::new(bytes);
    let version = decoder.read_u8().map_err(|err| err.to_string())?;
    if version != DISK_INDEX_VERSION {
        return Err(format!("unsupported block index record version {version}"));
    }
    let height = decoder.read_i32_le().map_err(|err| err.to_string())?;
    let status = decoder.read_u32_le().map_err(|err| err.to_string())?;
    let tx_count = decoder.read_u32_le().map_err(|err| err.to_string())?;
    let file = decoder.read_u32_le().map_err(|err| err.to_string())?;
    let data_pos = decoder.read_u32_le().map_err(|err| err.to_string())?;
    let undo_pos = decoder.read_u32_le().map_err(|err| err.to_string())?;
    let header_bytes = decoder
        .read_fixed::<HEADER_SIZE>()
        .map_err(|err| err.to_string())?;
    let header = BlockHeader::consensus_decode(&header_bytes).map_err(|err| err.to_string())?;
    decoder.finish().map_err(|err| err.to_string())?;
    Ok(DiskBlockIndex {
        hash: header.hash(),
        height,
        status,
        tx_count,
        file,
        data_pos,
        undo_pos,
        header,
    })
}
