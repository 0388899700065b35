//! Block and undo flat files: where records go, reading them back, and the
//! per-file bookkeeping that drives rollover and pruning.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use blockd_consensus::constants::MAX_BLOCK_SERIALIZED_SIZE;
use blockd_consensus::params::ConsensusParams;
use blockd_consensus::{hash256_to_hex, Hash256};
use blockd_log::Category;
use blockd_pow::{check_proof_of_work, PowError};
use blockd_primitives::block::Block;
use blockd_primitives::encoding::DecodeError;
use blockd_storage::{KeyValueStore, StoreError};

use crate::blockindex::{BlockIndex, BlockIndexError, BlockIndexNode, DiskBlockIndex, NodeId};
use crate::filemeta::{BlockFileInfo, FLAG_PRUNED_BLOCK_FILES};
use crate::flatfiles::{
    read_record, read_undo_record, write_record, write_undo_record, FlatFileError, FlatFilePos,
    FlatFileSeq, STORAGE_HEADER_BYTES, UNDO_CHECKSUM_BYTES,
};
use crate::index::BlockTreeDb;
use crate::notifications::Notifications;
use crate::undo::BlockUndo;

pub const MAX_BLOCKFILE_SIZE: u32 = 0x800_0000;
pub const BLOCKFILE_CHUNK_SIZE: u32 = 0x100_0000;
pub const UNDOFILE_CHUNK_SIZE: u32 = 0x10_0000;
const FAST_PRUNE_MAX_BLOCKFILE_SIZE: u32 = 0x1_0000;
const FAST_PRUNE_BLOCKFILE_CHUNK_SIZE: u32 = 0x4000;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum PruneMode {
    #[default]
    Disabled,
    /// Only prunes when asked to through `prune_manual`.
    Manual,
    /// Keeps block and undo files under this many bytes.
    Target(u64),
}

impl PruneMode {
    pub fn is_enabled(self) -> bool {
        self != PruneMode::Disabled
    }

    pub fn automatic_target(self) -> Option<u64> {
        match self {
            PruneMode::Target(bytes) => Some(bytes),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct BlockManagerOptions {
    pub blocks_dir: PathBuf,
    pub message_start: [u8; 4],
    pub prune: PruneMode,
    pub fast_prune: bool,
}

impl Default for BlockManagerOptions {
    fn default() -> Self {
        Self {
            blocks_dir: PathBuf::from("blocks"),
            message_start: [0xfa, 0xbf, 0xb5, 0xda],
            prune: PruneMode::Disabled,
            fast_prune: false,
        }
    }
}

#[derive(Debug)]
pub enum BlockStoreError {
    FlatFile(FlatFileError),
    Store(StoreError),
    Decode(DecodeError),
    Index(BlockIndexError),
    Pow(PowError),
    HashMismatch { expected: Hash256, found: Hash256 },
    NotFound(String),
}

impl std::fmt::Display for BlockStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockStoreError::FlatFile(err) => write!(f, "{err}"),
            BlockStoreError::Store(err) => write!(f, "{err}"),
            BlockStoreError::Decode(err) => write!(f, "{err}"),
            BlockStoreError::Index(err) => write!(f, "{err}"),
            BlockStoreError::Pow(err) => write!(f, "{err}"),
            BlockStoreError::HashMismatch { expected, found } => write!(
                f,
                "block hash mismatch: expected {} found {}",
                hash256_to_hex(expected),
                hash256_to_hex(found)
            ),
            BlockStoreError::NotFound(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for BlockStoreError {}

impl From<FlatFileError> for BlockStoreError {
    fn from(err: FlatFileError) -> Self {
        BlockStoreError::FlatFile(err)
    }
}

impl From<StoreError> for BlockStoreError {
    fn from(err: StoreError) -> Self {
        BlockStoreError::Store(err)
    }
}

impl From<DecodeError> for BlockStoreError {
    fn from(err: DecodeError) -> Self {
        BlockStoreError::Decode(err)
    }
}

impl From<BlockIndexError> for BlockStoreError {
    fn from(err: BlockIndexError) -> Self {
        BlockStoreError::Index(err)
    }
}

impl From<PowError> for BlockStoreError {
    fn from(err: PowError) -> Self {
        BlockStoreError::Pow(err)
    }
}

/// Blocks at or above the snapshot height go to their own files so the
/// background chainstate's files can be pruned independently.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BlockfileType {
    Normal = 0,
    Assumed = 1,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockfileCursor {
    pub file_num: u32,
    /// Highest height whose undo data was written to this cursor's file.
    pub undo_height: i32,
}

#[derive(Default)]
pub(crate) struct BlockFileState {
    pub(crate) info: Vec<BlockFileInfo>,
    pub(crate) cursors: [Option<BlockfileCursor>; 2],
    pub(crate) dirty: BTreeSet<u32>,
    pub(crate) snapshot_height: Option<i32>,
}

impl BlockFileState {
    fn ensure(&mut self, file: u32) {
        if self.info.len() <= file as usize {
            self.info
                .resize(file as usize + 1, BlockFileInfo::default());
        }
    }

    fn blockfile_type_for_height(&self, height: i32) -> BlockfileType {
        match self.snapshot_height {
            Some(snapshot) if height >= snapshot => BlockfileType::Assumed,
            _ => BlockfileType::Normal,
        }
    }

    pub(crate) fn max_blockfile_num(&self) -> u32 {
        self.cursors
            .iter()
            .flatten()
            .map(|cursor| cursor.file_num)
            .max()
            .unwrap_or(0)
    }

    fn usage(&self) -> u64 {
        self.info
            .iter()
            .map(|info| u64::from(info.size) + u64::from(info.undo_size))
            .sum()
    }
}

/// Block index records and file infos collected under the locks, written
/// afterwards.
pub struct IndexFlush {
    pub file_infos: Vec<(u32, BlockFileInfo)>,
    pub last_file: u32,
    pub nodes: Vec<DiskBlockIndex>,
}

impl IndexFlush {
    pub fn is_empty(&self) -> bool {
        self.file_infos.is_empty() && self.nodes.is_empty()
    }
}

struct PendingFlush {
    file: u32,
    finalize: bool,
    finalize_undo: bool,
}

pub struct BlockManager<S> {
    opts: BlockManagerOptions,
    params: ConsensusParams,
    block_tree: BlockTreeDb<S>,
    block_files: FlatFileSeq,
    undo_files: FlatFileSeq,
    pub(crate) files: Mutex<BlockFileState>,
    have_pruned: AtomicBool,
    check_for_pruning: AtomicBool,
    reindexing: AtomicBool,
    notifications: Arc<dyn Notifications>,
}

impl<S: KeyValueStore> BlockManager<S> {
    pub fn new(
        opts: BlockManagerOptions,
        params: ConsensusParams,
        store: Arc<S>,
        notifications: Arc<dyn Notifications>,
    ) -> Self {
        let block_chunk = if opts.fast_prune {
            FAST_PRUNE_BLOCKFILE_CHUNK_SIZE
        } else {
            BLOCKFILE_CHUNK_SIZE
        };
        let block_files = FlatFileSeq::new(&opts.blocks_dir, "blk", block_chunk);
        let undo_files = FlatFileSeq::new(&opts.blocks_dir, "rev", UNDOFILE_CHUNK_SIZE);
        Self {
            opts,
            params,
            block_tree: BlockTreeDb::new(store),
            block_files,
            undo_files,
            files: Mutex::new(BlockFileState::default()),
            have_pruned: AtomicBool::new(false),
            check_for_pruning: AtomicBool::new(false),
            reindexing: AtomicBool::new(false),
            notifications,
        }
    }

    pub fn options(&self) -> &BlockManagerOptions {
        &self.opts
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    pub fn block_tree(&self) -> &BlockTreeDb<S> {
        &self.block_tree
    }

    pub fn blocks_dir(&self) -> &Path {
        &self.opts.blocks_dir
    }

    pub fn block_files(&self) -> &FlatFileSeq {
        &self.block_files
    }

    pub fn undo_files(&self) -> &FlatFileSeq {
        &self.undo_files
    }

    pub fn is_prune_mode(&self) -> bool {
        self.opts.prune.is_enabled()
    }

    pub fn have_pruned(&self) -> bool {
        self.have_pruned.load(Ordering::SeqCst)
    }

    pub(crate) fn set_have_pruned(&self) {
        self.have_pruned.store(true, Ordering::SeqCst);
    }

    pub fn is_reindexing(&self) -> bool {
        self.reindexing.load(Ordering::SeqCst)
    }

    pub fn set_reindexing(&self, reindexing: bool) {
        self.reindexing.store(reindexing, Ordering::SeqCst);
    }

    pub fn check_for_pruning(&self) -> bool {
        self.check_for_pruning.load(Ordering::SeqCst)
    }

    pub fn set_check_for_pruning(&self, value: bool) {
        self.check_for_pruning.store(value, Ordering::SeqCst);
    }

    pub(crate) fn notifications(&self) -> &Arc<dyn Notifications> {
        &self.notifications
    }

    pub fn block_chunk_size(&self) -> u32 {
        if self.opts.fast_prune {
            FAST_PRUNE_BLOCKFILE_CHUNK_SIZE
        } else {
            BLOCKFILE_CHUNK_SIZE
        }
    }

    pub fn max_blockfile_size(&self) -> u32 {
        if self.opts.fast_prune {
            FAST_PRUNE_MAX_BLOCKFILE_SIZE
        } else {
            MAX_BLOCKFILE_SIZE
        }
    }

    /// Forgets all file bookkeeping; the manager is reset before a reload.
    pub fn reset(&self) {
        *self.files.lock().expect("block files lock") = BlockFileState::default();
        self.have_pruned.store(false, Ordering::SeqCst);
        self.check_for_pruning.store(false, Ordering::SeqCst);
        self.reindexing.store(false, Ordering::SeqCst);
    }

    pub fn set_snapshot_height(&self, height: Option<i32>) {
        self.files.lock().expect("block files lock").snapshot_height = height;
    }

    pub fn file_info(&self, file: u32) -> Option<BlockFileInfo> {
        self.files
            .lock()
            .expect("block files lock")
            .info
            .get(file as usize)
            .copied()
    }

    pub fn file_count(&self) -> usize {
        self.files.lock().expect("block files lock").info.len()
    }

    pub fn cursor(&self, kind: BlockfileType) -> Option<BlockfileCursor> {
        self.files.lock().expect("block files lock").cursors[kind as usize]
    }

    pub fn max_blockfile_num(&self) -> u32 {
        self.files
            .lock()
            .expect("block files lock")
            .max_blockfile_num()
    }

    pub fn calculate_current_usage(&self) -> u64 {
        self.files.lock().expect("block files lock").usage()
    }

    /// Reserves room for a record of `add_size` bytes (header included) and
    /// returns the header position. A `known` position re-registers a block
    /// already on disk, as during reindex. Rolling over to a new file flushes
    /// the old one first.
    pub fn find_block_pos(
        &self,
        add_size: u32,
        height: i32,
        time: u32,
        known: Option<FlatFilePos>,
    ) -> Result<FlatFilePos, BlockStoreError> {
        let (pos, pending) = {
            let mut state = self.files.lock().expect("block files lock");
            let chain_type = state.blockfile_type_for_height(height);
            if state.cursors[chain_type as usize].is_none() {
                let file_num = match chain_type {
                    BlockfileType::Normal => 0,
                    BlockfileType::Assumed => {
                        if state.cursors.iter().flatten().next().is_some() {
                            state.max_blockfile_num() + 1
                        } else {
                            0
                        }
                    }
                };
                blockd_log::log_category!(
                    Category::BlockStorage,
                    "[{:?}] initializing blockfile cursor to {}",
                    chain_type,
                    file_num
                );
                state.cursors[chain_type as usize] = Some(BlockfileCursor {
                    file_num,
                    undo_height: 0,
                });
            }
            let cursor = state.cursors[chain_type as usize].unwrap_or(BlockfileCursor {
                file_num: 0,
                undo_height: 0,
            });
            let last_blockfile = cursor.file_num;

            let mut file = known.map(|pos| pos.file).unwrap_or(last_blockfile);
            state.ensure(file);
            let pos = match known {
                Some(known) => known,
                None => {
                    let mut max_size = self.max_blockfile_size();
                    if add_size >= max_size {
                        max_size = add_size + 1;
                    }
                    while state.info[file as usize].size + add_size >= max_size {
                        file = state.max_blockfile_num().max(file) + 1;
                        state.ensure(file);
                    }
                    FlatFilePos::new(file, state.info[file as usize].size)
                }
            };

            let mut pending = None;
            if file != last_blockfile {
                if known.is_none() {
                    blockd_log::log_category!(
                        Category::BlockStorage,
                        "Leaving block file {}: {}",
                        last_blockfile,
                        state.info[last_blockfile as usize]
                    );
                }
                let finalize_undo =
                    state.info[last_blockfile as usize].height_last == cursor.undo_height;
                pending = Some(PendingFlush {
                    file: last_blockfile,
                    finalize: known.is_none(),
                    finalize_undo,
                });
                state.cursors[chain_type as usize] = Some(BlockfileCursor {
                    file_num: file,
                    undo_height: 0,
                });
            }

            let info = &mut state.info[file as usize];
            info.add_block(height, time);
            match known {
                Some(known) => info.size = info.size.max(known.pos + add_size),
                None => info.size += add_size,
            }
            state.dirty.insert(file);
            (pos, pending)
        };

        if let Some(flush) = pending {
            if !self.flush_block_file(flush.file, flush.finalize, flush.finalize_undo) {
                blockd_log::log_warn!(
                    "Failed to flush previous block file {:05} (finalize=1, finalize_undo={}) before opening new block file {:05}",
                    flush.file,
                    u8::from(flush.finalize_undo),
                    pos.file
                );
            }
        }

        if known.is_none() {
            if let Err(err) = self.block_files.allocate(pos, add_size) {
                if matches!(err, FlatFileError::OutOfSpace { .. }) {
                    self.notifications.fatal_error("Disk space is too low!");
                }
                return Err(err.into());
            }
        }
        Ok(pos)
    }

    fn find_undo_pos(&self, file: u32, add_size: u32) -> Result<FlatFilePos, BlockStoreError> {
        let pos = {
            let mut state = self.files.lock().expect("block files lock");
            state.ensure(file);
            let info = &mut state.info[file as usize];
            let pos = FlatFilePos::new(file, info.undo_size);
            info.undo_size += add_size;
            state.dirty.insert(file);
            pos
        };
        if let Err(err) = self.undo_files.allocate(pos, add_size) {
            if matches!(err, FlatFileError::OutOfSpace { .. }) {
                self.notifications.fatal_error("Disk space is too low!");
            }
            return Err(err.into());
        }
        Ok(pos)
    }

    /// Stores `block` and returns the position of its payload. With a
    /// `known` payload position only the bookkeeping is updated.
    pub fn save_block(
        &self,
        block: &Block,
        height: i32,
        known: Option<FlatFilePos>,
    ) -> Result<FlatFilePos, BlockStoreError> {
        let bytes = block.consensus_encode();
        let size = bytes.len() as u32 + STORAGE_HEADER_BYTES;
        let known_header = known.map(|pos| {
            FlatFilePos::new(pos.file, pos.pos.saturating_sub(STORAGE_HEADER_BYTES))
        });
        let header_pos = self.find_block_pos(size, height, block.header.time, known_header)?;
        if let Some(known) = known {
            return Ok(known);
        }
        match write_record(
            &self.block_files,
            header_pos,
            self.opts.message_start,
            &bytes,
        ) {
            Ok(pos) => Ok(pos),
            Err(err) => {
                self.notifications.fatal_error("Failed to write block.");
                Err(err.into())
            }
        }
    }

    /// Appends the undo record for the block at `height` stored in
    /// `block_file`, then applies the undo finalization policy.
    pub fn write_undo(
        &self,
        undo: &BlockUndo,
        height: i32,
        block_file: u32,
        prev_hash: &Hash256,
    ) -> Result<FlatFilePos, BlockStoreError> {
        let payload = undo.encode();
        let size = payload.len() as u32 + STORAGE_HEADER_BYTES + UNDO_CHECKSUM_BYTES;
        let header_pos = self.find_undo_pos(block_file, size)?;
        let pos = match write_undo_record(
            &self.undo_files,
            header_pos,
            self.opts.message_start,
            &payload,
            prev_hash,
        ) {
            Ok(pos) => pos,
            Err(err) => {
                self.notifications.fatal_error("Failed to write undo data.");
                return Err(err.into());
            }
        };

        let finalize_file = {
            let mut state = self.files.lock().expect("block files lock");
            let chain_type = state.blockfile_type_for_height(height);
            let height_last = state
                .info
                .get(block_file as usize)
                .map(|info| info.height_last);
            match state.cursors[chain_type as usize].as_mut() {
                Some(cursor)
                    if block_file < cursor.file_num && Some(height) == height_last =>
                {
                    true
                }
                Some(cursor) if block_file == cursor.file_num && height > cursor.undo_height => {
                    cursor.undo_height = height;
                    false
                }
                _ => false,
            }
        };
        if finalize_file {
            self.flush_undo_file(block_file, true);
        }
        Ok(pos)
    }

    pub fn read_raw_block(&self, pos: FlatFilePos) -> Result<Vec<u8>, BlockStoreError> {
        Ok(read_record(
            &self.block_files,
            pos,
            self.opts.message_start,
            MAX_BLOCK_SERIALIZED_SIZE,
        )?)
    }

    pub fn read_block(&self, pos: FlatFilePos) -> Result<Block, BlockStoreError> {
        let bytes = self.read_raw_block(pos)?;
        let block = Block::consensus_decode(&bytes)?;
        check_proof_of_work(&block.hash(), block.header.bits, &self.params)?;
        Ok(block)
    }

    /// Reads the block a node points at and checks it is the right one.
    pub fn read_block_for_node(&self, node: &BlockIndexNode) -> Result<Block, BlockStoreError> {
        let pos = node.data_pos().ok_or_else(|| {
            BlockStoreError::NotFound(format!(
                "block data for {} not available",
                hash256_to_hex(&node.hash)
            ))
        })?;
        let block = self.read_block(pos)?;
        let found = block.hash();
        if found != node.hash {
            return Err(BlockStoreError::HashMismatch {
                expected: node.hash,
                found,
            });
        }
        Ok(block)
    }

    pub fn read_undo(
        &self,
        pos: FlatFilePos,
        prev_hash: &Hash256,
    ) -> Result<BlockUndo, BlockStoreError> {
        let payload = read_undo_record(
            &self.undo_files,
            pos,
            self.opts.message_start,
            MAX_BLOCK_SERIALIZED_SIZE,
            prev_hash,
        )?;
        Ok(BlockUndo::decode(&payload)?)
    }

    pub fn read_undo_for_node(&self, node: &BlockIndexNode) -> Result<BlockUndo, BlockStoreError> {
        let pos = node.undo_pos().ok_or_else(|| {
            BlockStoreError::NotFound(format!(
                "undo data for {} not available",
                hash256_to_hex(&node.hash)
            ))
        })?;
        self.read_undo(pos, &node.prev_hash)
    }

    pub fn flush_undo_file(&self, file: u32, finalize: bool) -> bool {
        let undo_size = match self.file_info(file) {
            Some(info) => info.undo_size,
            None => return true,
        };
        if let Err(err) = self
            .undo_files
            .flush(FlatFilePos::new(file, undo_size), finalize)
        {
            blockd_log::log_error!("failed to flush undo file {file:05}: {err}");
            self.notifications.flush_error(
                "Flushing undo file to disk failed. This is likely the result of an I/O error.",
            );
            return false;
        }
        true
    }

    /// Flushes a block file and, unless it is being finalized ahead of its
    /// undo data, the matching undo file.
    pub fn flush_block_file(&self, file: u32, finalize: bool, finalize_undo: bool) -> bool {
        let size = match self.file_info(file) {
            Some(info) => info.size,
            None => return true,
        };
        let mut success = true;
        if let Err(err) = self
            .block_files
            .flush(FlatFilePos::new(file, size), finalize)
        {
            blockd_log::log_error!("failed to flush block file {file:05}: {err}");
            self.notifications.flush_error(
                "Flushing block file to disk failed. This is likely the result of an I/O error.",
            );
            success = false;
        }
        if !finalize || finalize_undo {
            success &= self.flush_undo_file(file, finalize_undo);
        }
        success
    }

    /// Flushes the files every active cursor is appending to.
    pub fn flush_cursor_files(&self) -> bool {
        let files: BTreeSet<u32> = {
            let state = self.files.lock().expect("block files lock");
            state
                .cursors
                .iter()
                .flatten()
                .map(|cursor| cursor.file_num)
                .collect()
        };
        files
            .into_iter()
            .fold(true, |ok, file| self.flush_block_file(file, false, false) && ok)
    }

    /// Collects dirty file infos and nodes. Called with the main lock held so
    /// the snapshot is consistent; the write happens in [`Self::commit_index_flush`].
    pub fn stage_index_flush(&self, index: &mut BlockIndex) -> IndexFlush {
        let (file_infos, last_file) = {
            let mut state = self.files.lock().expect("block files lock");
            let dirty = std::mem::take(&mut state.dirty);
            let infos = dirty
                .into_iter()
                .filter_map(|file| {
                    state
                        .info
                        .get(file as usize)
                        .map(|info| (file, *info))
                })
                .collect();
            (infos, state.max_blockfile_num())
        };
        IndexFlush {
            file_infos,
            last_file,
            nodes: index.take_dirty(),
        }
    }

    pub fn commit_index_flush(&self, flush: &IndexFlush) -> Result<(), BlockStoreError> {
        self.block_tree
            .write_batch_sync(&flush.file_infos, flush.last_file, &flush.nodes)?;
        Ok(())
    }

    /// Puts back what a failed commit did not write.
    pub fn restore_index_flush(&self, index: &mut BlockIndex, flush: &IndexFlush) {
        index.restore_dirty(&flush.nodes);
        let mut state = self.files.lock().expect("block files lock");
        state
            .dirty
            .extend(flush.file_infos.iter().map(|(file, _)| *file));
    }

    /// Loads the persisted index into `index` and restores file bookkeeping.
    /// Returns every node sorted by height.
    pub fn load_block_index_db(
        &self,
        index: &mut BlockIndex,
        snapshot_base: Option<(Hash256, u64)>,
    ) -> Result<Vec<NodeId>, BlockStoreError> {
        let records = self.block_tree.load_block_index_guts()?;
        let sorted = index.load_from_records(records, snapshot_base)?;

        let last_file = self.block_tree.read_last_block_file()?.unwrap_or(0);
        let stored = self.block_tree.read_all_block_file_info()?;
        blockd_log::log_info!("Loading block index db: last block file = {last_file}");

        let snapshot_height = snapshot_base
            .and_then(|(hash, _)| index.get(&hash))
            .map(|node| node.height);
        let mut state = BlockFileState {
            snapshot_height,
            ..BlockFileState::default()
        };
        state.ensure(last_file);
        for (file, info) in stored {
            state.ensure(file);
            state.info[file as usize] = info;
        }
        if let Some(info) = state.info.get(last_file as usize) {
            blockd_log::log_info!("Loading block index db: last block file info: {info}");
        }

        let mut files_with_data = BTreeSet::new();
        let mut normal_max: Option<u32> = None;
        let mut assumed_max: Option<u32> = None;
        for id in &sorted {
            let node = index.node(*id);
            if !node.have_data() {
                continue;
            }
            files_with_data.insert(node.file);
            let slot = match snapshot_height {
                Some(snapshot) if node.height >= snapshot => &mut assumed_max,
                _ => &mut normal_max,
            };
            *slot = Some(slot.map_or(node.file, |file: u32| file.max(node.file)));
        }
        for file in &files_with_data {
            if !self.block_files.exists(*file) {
                return Err(BlockStoreError::FlatFile(FlatFileError::Missing(
                    self.block_files.file_name(*file),
                )));
            }
        }
        let normal_file = if snapshot_height.is_some() {
            normal_max.unwrap_or(0)
        } else {
            last_file
        };
        state.cursors[BlockfileType::Normal as usize] = Some(BlockfileCursor {
            file_num: normal_file,
            undo_height: 0,
        });
        state.cursors[BlockfileType::Assumed as usize] =
            assumed_max.map(|file_num| BlockfileCursor {
                file_num,
                undo_height: 0,
            });
        *self.files.lock().expect("block files lock") = state;

        if self.block_tree.read_flag(FLAG_PRUNED_BLOCK_FILES)? {
            self.have_pruned.store(true, Ordering::SeqCst);
        }
        if self.block_tree.read_reindexing()? {
            self.reindexing.store(true, Ordering::SeqCst);
        }
        Ok(sorted)
    }

    /// On a pruned-node reindex: deletes every undo file, and every block
    /// file after the first gap in numbering.
    pub fn cleanup_block_rev_files(&self) -> Result<(), BlockStoreError> {
        let dir = self.blocks_dir();
        blockd_log::log_info!(
            "Removing unusable blk?????.dat and rev?????.dat files for -reindex with -prune"
        );
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(FlatFileError::Io(err).into()),
        };
        let mut block_files: BTreeMap<u32, PathBuf> = BTreeMap::new();
        for entry in entries {
            let entry = entry.map_err(FlatFileError::Io)?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some((prefix, number)) = parse_flat_file_name(name) else {
                continue;
            };
            match prefix {
                "rev" => {
                    std::fs::remove_file(entry.path()).map_err(FlatFileError::Io)?;
                }
                "blk" => {
                    block_files.insert(number, entry.path());
                }
                _ => {}
            }
        }
        let mut contiguous = 0u32;
        for (number, path) in block_files {
            if number == contiguous {
                contiguous += 1;
            } else {
                std::fs::remove_file(path).map_err(FlatFileError::Io)?;
            }
        }
        Ok(())
    }

    /// Deletes leftover files of pruned entries; a crash may have come
    /// between recording a prune and unlinking.
    pub fn scan_and_unlink_already_pruned_files(&self) -> Result<(), BlockStoreError> {
        if !self.have_pruned() {
            return Ok(());
        }
        let files: BTreeSet<u32> = {
            let state = self.files.lock().expect("block files lock");
            state
                .info
                .iter()
                .enumerate()
                .filter(|(_, info)| info.size == 0)
                .map(|(file, _)| file as u32)
                .filter(|file| self.block_files.exists(*file) || self.undo_files.exists(*file))
                .collect()
        };
        self.unlink_pruned_files(&files)
    }

    pub fn unlink_pruned_files(&self, files: &BTreeSet<u32>) -> Result<(), BlockStoreError> {
        for file in files {
            let removed_block = self.block_files.remove(*file)?;
            let removed_undo = self.undo_files.remove(*file)?;
            if removed_block || removed_undo {
                blockd_log::log_category!(
                    Category::Prune,
                    "Prune: deleted blk/rev ({:05})",
                    file
                );
            }
        }
        Ok(())
    }

    pub fn is_block_pruned(&self, node: &BlockIndexNode) -> bool {
        self.have_pruned() && !node.have_data() && node.tx_count > 0
    }

    /// Walks back from `upper` while predecessors have data. Stops at
    /// `lower` when given. `None` when `upper` has no data or `lower` is
    /// not below it.
    pub fn get_first_stored_block(
        &self,
        index: &BlockIndex,
        upper: NodeId,
        lower: Option<NodeId>,
    ) -> Option<NodeId> {
        if !index.node(upper).have_data() {
            return None;
        }
        let mut last = upper;
        while let Some(prev) = index.node(last).prev {
            if !index.node(prev).have_data() {
                break;
            }
            if let Some(lower) = lower {
                if last == lower {
                    return Some(lower);
                }
                if index.node(last).height < index.node(lower).height {
                    return None;
                }
            }
            last = prev;
        }
        Some(last)
    }

    /// True when every block from `lower` up to `upper` has data.
    pub fn check_block_data_availability(
        &self,
        index: &BlockIndex,
        upper: NodeId,
        lower: NodeId,
    ) -> bool {
        self.get_first_stored_block(index, upper, Some(lower)) == Some(lower)
    }

    /// Persists the pruned marker once any file has been pruned.
    pub(crate) fn persist_pruned_flag(&self) -> Result<(), BlockStoreError> {
        self.block_tree.write_flag(FLAG_PRUNED_BLOCK_FILES, true)?;
        Ok(())
    }
}

fn parse_flat_file_name(name: &str) -> Option<(&str, u32)> {
    let stem = name.strip_suffix(".dat")?;
    if stem.len() != 8 {
        return None;
    }
    let (prefix, digits) = stem.split_at(3);
    if !digits.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    Some((prefix, digits.parse().ok()?))
}
