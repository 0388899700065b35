//! Choosing which block/undo file pairs may be deleted.
//!
//! A file is pruned whole or not at all, so every decision looks at the
//! file's full height span. Index mutation happens with the main lock held
//! (the caller passes the index in); unlinking happens later, off-lock.

use std::collections::{BTreeSet, HashMap};

use blockd_log::Category;
use blockd_storage::KeyValueStore;

use crate::blockindex::BlockIndex;
use crate::blockstorage::{BlockManager, UNDOFILE_CHUNK_SIZE};
use crate::filemeta::BlockFileInfo;

/// Blocks below the tip that are never pruned, for reorgs.
pub const MIN_BLOCKS_TO_KEEP: i32 = 288;
/// Extra blocks kept below a prune lock.
pub const PRUNE_LOCK_BUFFER: i32 = 10;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PruneLockInfo {
    /// Lowest height whose data the lock holder still needs.
    pub height_first: i32,
}

/// The highest height prune locks allow deleting, and the lock that set it.
pub fn last_height_can_prune(
    tip_height: i32,
    locks: &HashMap<String, PruneLockInfo>,
) -> (i32, Option<String>) {
    let mut last_prune = tip_height;
    let mut limiting = None;
    let mut names: Vec<&String> = locks.keys().collect();
    names.sort();
    for name in names {
        let lock = locks[name];
        if lock.height_first == i32::MAX {
            continue;
        }
        let lock_height = lock.height_first - PRUNE_LOCK_BUFFER - 1;
        last_prune = 1.max(last_prune.min(lock_height));
        if last_prune == lock_height {
            limiting = Some(name.clone());
        }
    }
    (last_prune, limiting)
}

/// Inclusive `(first, last)` heights a chainstate may prune. `floor` is the
/// first height belonging to this chainstate alone (above a snapshot base
/// while the background chainstate still needs the blocks below it).
pub fn prune_range(tip_height: i32, floor: Option<i32>, last_height_can_prune: i32) -> (i32, i32) {
    if tip_height < 0 {
        return (0, 0);
    }
    let start = floor.unwrap_or(0);
    let max_prune = 0.max(tip_height - MIN_BLOCKS_TO_KEEP);
    (start, last_height_can_prune.min(max_prune))
}

fn file_in_range(info: &BlockFileInfo, range: (i32, i32)) -> bool {
    info.size > 0 && info.height_last <= range.1 && info.height_first >= range.0
}

/// Files wholly inside `range`, considering only files below `max_file`.
pub fn select_files_manual(infos: &[BlockFileInfo], max_file: u32, range: (i32, i32)) -> Vec<u32> {
    infos
        .iter()
        .enumerate()
        .take(max_file as usize)
        .filter(|(_, info)| file_in_range(info, range))
        .map(|(file, _)| file as u32)
        .collect()
}

/// Files to delete, lowest first, until usage plus `buffer` drops under
/// `target`.
pub fn select_files_automatic(
    infos: &[BlockFileInfo],
    max_file: u32,
    range: (i32, i32),
    mut usage: u64,
    buffer: u64,
    target: u64,
) -> Vec<u32> {
    let mut selected = Vec::new();
    if usage + buffer < target {
        return selected;
    }
    for (file, info) in infos.iter().enumerate().take(max_file as usize) {
        if info.size == 0 {
            continue;
        }
        if usage + buffer < target {
            break;
        }
        if !file_in_range(info, range) {
            continue;
        }
        usage -= u64::from(info.size) + u64::from(info.undo_size);
        selected.push(file as u32);
    }
    selected
}

/// Inputs the chainstate manager supplies for one chainstate.
#[derive(Clone, Copy, Debug)]
pub struct PruneRequest {
    pub tip_height: i32,
    pub range: (i32, i32),
    pub chainstate_count: usize,
    pub initial_download: bool,
}

impl<S: KeyValueStore> BlockManager<S> {
    /// Clears data of every node stored in `file` and zeroes its info. The
    /// files themselves are unlinked separately.
    pub fn prune_one_block_file(&self, index: &mut BlockIndex, file: u32) {
        let affected: Vec<_> = index
            .iter()
            .filter(|(_, node)| node.file == file && (node.have_data() || node.have_undo()))
            .map(|(id, _)| id)
            .collect();
        for id in affected {
            index.clear_data(id);
        }
        let mut state = self.files.lock().expect("block files lock");
        if let Some(info) = state.info.get_mut(file as usize) {
            *info = BlockFileInfo::default();
            state.dirty.insert(file);
        }
    }

    pub fn find_files_to_prune_manual(
        &self,
        index: &mut BlockIndex,
        manual_height: i32,
        range: (i32, i32),
    ) -> BTreeSet<u32> {
        let range = (range.0, range.1.min(manual_height));
        let selected = {
            let state = self.files.lock().expect("block files lock");
            select_files_manual(&state.info, state.max_blockfile_num(), range)
        };
        for file in &selected {
            self.prune_one_block_file(index, *file);
        }
        if !selected.is_empty() {
            self.set_have_pruned();
        }
        blockd_log::log_info!(
            "Prune (Manual): prune_height={} removed {} blk/rev pairs",
            range.1,
            selected.len()
        );
        selected.into_iter().collect()
    }

    /// Automatic pruning for one chainstate. The configured target is split
    /// evenly across active chainstates; during initial download the buffer
    /// grows by a tenth of the target so pruning does not run on every
    /// flush.
    pub fn find_files_to_prune(
        &self,
        index: &mut BlockIndex,
        request: PruneRequest,
    ) -> BTreeSet<u32> {
        let Some(total_target) = self.options().prune.automatic_target() else {
            return BTreeSet::new();
        };
        let target = total_target / request.chainstate_count.max(1) as u64;
        if request.tip_height < 0 || target == 0 {
            return BTreeSet::new();
        }
        if request.tip_height <= self.params().prune_after_height {
            return BTreeSet::new();
        }

        let mut buffer = u64::from(self.block_chunk_size()) + u64::from(UNDOFILE_CHUNK_SIZE);
        if request.initial_download {
            buffer += target / 10;
        }
        let selected = {
            let state = self.files.lock().expect("block files lock");
            let usage: u64 = state
                .info
                .iter()
                .map(|info| u64::from(info.size) + u64::from(info.undo_size))
                .sum();
            select_files_automatic(
                &state.info,
                state.max_blockfile_num(),
                request.range,
                usage,
                buffer,
                target,
            )
        };
        for file in &selected {
            self.prune_one_block_file(index, *file);
        }
        if !selected.is_empty() {
            self.set_have_pruned();
        }
        let remaining = self.calculate_current_usage();
        blockd_log::log_category!(
            Category::Prune,
            "target={}MiB actual={}MiB diff={}MiB min_height={} max_prune_height={} removed {} blk/rev pairs",
            target / 1024 / 1024,
            remaining / 1024 / 1024,
            (target as i64 - remaining as i64) / 1024 / 1024,
            request.range.0,
            request.range.1,
            selected.len()
        );
        selected.into_iter().collect()
    }
}
