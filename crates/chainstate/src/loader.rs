//! The startup sequence: block index, genesis, then per chainstate the coin
//! database (open, upgrade, replay, tip), then the consistency checks and a
//! bounded verification pass.
//!
//! Every failure maps to one [`ChainstateLoadingError`]; none of them modify
//! data on disk further. Shutdown requests end the sequence with
//! [`LoadOutcome::Interrupted`].

use blockd_consensus::constants::MAX_FUTURE_BLOCK_TIME;
use blockd_consensus::{hash256_to_hex, Hash256};
use blockd_storage::KeyValueStore;

use crate::blockindex::{BlockIndex, BLOCK_VALID_SCRIPTS, STATUS_OPT_WITNESS};
use crate::chainstate::{Chainstate, ChainstateRole};
use crate::coins::{CoinsDb, CoinsSlot, DisconnectResult, SnapshotState};
use crate::manager::{now_secs, ChainstateManager, MainState};
use crate::verify::{VerifyError, VerifyOutcome, DEFAULT_CHECKBLOCKS, DEFAULT_CHECKLEVEL};

#[derive(Clone, Debug)]
pub struct ChainstateLoadOptions {
    /// Rebuild the block index from the block files.
    pub reindex: bool,
    /// Rebuild only the coin databases.
    pub reindex_chainstate: bool,
    pub check_blocks: i32,
    pub check_level: u32,
}

impl Default for ChainstateLoadOptions {
    fn default() -> Self {
        Self {
            reindex: false,
            reindex_chainstate: false,
            check_blocks: DEFAULT_CHECKBLOCKS,
            check_level: DEFAULT_CHECKLEVEL,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ChainstateLoadingError {
    LoadingBlockDb(String),
    BadGenesisBlock,
    PrunedNeedsReindex,
    LoadGenesisBlockFailed(String),
    ChainstateUpgradeFailed(String),
    ReplayBlocksFailed(String),
    LoadChainTipFailed(String),
    InsufficientlyValidated,
    BlockFromFuture,
    CorruptedBlockDb(String),
}

impl ChainstateLoadingError {
    /// The lightest rebuild that recovers from this failure.
    pub fn advice(&self) -> &'static str {
        match self {
            ChainstateLoadingError::ChainstateUpgradeFailed(_)
            | ChainstateLoadingError::ReplayBlocksFailed(_)
            | ChainstateLoadingError::LoadChainTipFailed(_)
            | ChainstateLoadingError::BlockFromFuture
            | ChainstateLoadingError::CorruptedBlockDb(_) => "--reindex-chainstate",
            ChainstateLoadingError::LoadingBlockDb(_)
            | ChainstateLoadingError::BadGenesisBlock
            | ChainstateLoadingError::PrunedNeedsReindex
            | ChainstateLoadingError::LoadGenesisBlockFailed(_)
            | ChainstateLoadingError::InsufficientlyValidated => "--reindex",
        }
    }
}

impl std::fmt::Display for ChainstateLoadingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainstateLoadingError::LoadingBlockDb(message) => {
                write!(f, "Error loading block database: {message}")
            }
            ChainstateLoadingError::BadGenesisBlock => write!(
                f,
                "Incorrect or no genesis block found. Wrong datadir for network?"
            ),
            ChainstateLoadingError::PrunedNeedsReindex => write!(
                f,
                "You need to rebuild the database using --reindex to go back to unpruned mode. This will redownload the entire blockchain"
            ),
            ChainstateLoadingError::LoadGenesisBlockFailed(message) => {
                write!(f, "Error initializing block database: {message}")
            }
            ChainstateLoadingError::ChainstateUpgradeFailed(message) => {
                write!(f, "Error upgrading chainstate database: {message}")
            }
            ChainstateLoadingError::ReplayBlocksFailed(message) => write!(
                f,
                "Unable to replay blocks ({message}). You will need to rebuild the database using --reindex-chainstate"
            ),
            ChainstateLoadingError::LoadChainTipFailed(message) => {
                write!(f, "Error initializing block database: {message}")
            }
            ChainstateLoadingError::InsufficientlyValidated => write!(
                f,
                "Witness data for blocks after the witness height requires validation. Please restart with --reindex"
            ),
            ChainstateLoadingError::BlockFromFuture => write!(
                f,
                "The block database contains a block which appears to be from the future. This may be due to your computer's date and time being set incorrectly. Only rebuild the block database if you are sure that your computer's date and time are correct"
            ),
            ChainstateLoadingError::CorruptedBlockDb(message) => {
                write!(f, "Corrupted block database detected: {message}")
            }
        }
    }
}

impl std::error::Error for ChainstateLoadingError {}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LoadOutcome {
    Ready,
    Interrupted,
}

/// Which coin databases exist from an earlier snapshot activation.
enum SnapshotLayout {
    None,
    /// Background validation of the snapshot is still running.
    Unvalidated(Hash256),
    /// The snapshot database replaced the primary one.
    Validated,
}

impl<S: KeyValueStore> ChainstateManager<S> {
    /// Runs the loading sequence. Safe to call again after a failure, for
    /// example with `reindex` set.
    pub fn load_chainstate(
        &self,
        options: &ChainstateLoadOptions,
    ) -> Result<LoadOutcome, ChainstateLoadingError> {
        self.reset();
        let wipe_coins = options.reindex || options.reindex_chainstate;

        if wipe_coins && self.coins_factory.exists(CoinsSlot::Snapshot) {
            blockd_log::log_info!("Removing snapshot chainstate for reindex");
            self.coins_factory
                .remove(CoinsSlot::Snapshot)
                .map_err(|err| ChainstateLoadingError::LoadingBlockDb(err.to_string()))?;
        }
        let layout = self.detect_snapshot()?;

        if options.reindex {
            blockd_log::log_info!("Wiping block tree database for reindex");
            let block_tree = self.blockman.block_tree();
            block_tree
                .wipe()
                .and_then(|_| block_tree.write_reindexing(true))
                .map_err(|err| ChainstateLoadingError::LoadingBlockDb(err.to_string()))?;
            self.blockman.set_reindexing(true);
            if self.blockman.is_prune_mode() {
                self.blockman
                    .cleanup_block_rev_files()
                    .map_err(|err| ChainstateLoadingError::LoadingBlockDb(err.to_string()))?;
            }
        }
        if self.interrupt.is_set() {
            return Ok(LoadOutcome::Interrupted);
        }

        blockd_log::log_info!("Loading block index...");
        let snapshot_base = match layout {
            SnapshotLayout::Unvalidated(base) => {
                let data = self.params.assumeutxo_for_hash(&base).ok_or_else(|| {
                    ChainstateLoadingError::LoadingBlockDb(format!(
                        "snapshot base {} is not a known assumeutxo block",
                        hash256_to_hex(&base)
                    ))
                })?;
                Some((base, data.chain_tx))
            }
            _ => None,
        };
        let mut index = BlockIndex::new();
        let sorted = self
            .blockman
            .load_block_index_db(&mut index, snapshot_base)
            .map_err(|err| ChainstateLoadingError::LoadingBlockDb(err.to_string()))?;
        blockd_log::log_info!("Loaded {} block index entries", index.len());

        if !index.is_empty() && index.lookup(&self.params.hash_genesis_block).is_none() {
            return Err(ChainstateLoadingError::BadGenesisBlock);
        }
        if self.blockman.have_pruned() && !self.blockman.is_prune_mode() {
            return Err(ChainstateLoadingError::PrunedNeedsReindex);
        }

        let mut chainstates = match layout {
            SnapshotLayout::None => vec![Chainstate::new(ChainstateRole::Normal, CoinsSlot::Primary)],
            SnapshotLayout::Validated => {
                vec![Chainstate::new(ChainstateRole::Normal, CoinsSlot::Snapshot)]
            }
            SnapshotLayout::Unvalidated(base) => {
                let base_id = index.lookup(&base).ok_or_else(|| {
                    ChainstateLoadingError::LoadingBlockDb(format!(
                        "snapshot base {} missing from block index",
                        hash256_to_hex(&base)
                    ))
                })?;
                let mut background =
                    Chainstate::new(ChainstateRole::Background, CoinsSlot::Primary);
                background.snapshot_base = Some(base_id);
                let mut snapshot = Chainstate::new(ChainstateRole::Snapshot, CoinsSlot::Snapshot);
                snapshot.snapshot_base = Some(base_id);
                vec![background, snapshot]
            }
        };
        for id in &sorted {
            for cs in chainstates.iter_mut() {
                cs.try_add_candidate(&index, *id);
            }
        }
        {
            let mut main = self.lock_main();
            main.index = index;
            main.chainstates = chainstates;
        }

        self.blockman
            .scan_and_unlink_already_pruned_files()
            .map_err(|err| ChainstateLoadingError::LoadingBlockDb(err.to_string()))?;

        if !self.blockman.is_reindexing() {
            self.load_genesis_block()
                .map_err(|err| ChainstateLoadingError::LoadGenesisBlockFailed(err.to_string()))?;
        }

        let roles = self.chainstate_roles();
        for role in &roles {
            if self.interrupt.is_set() {
                return Ok(LoadOutcome::Interrupted);
            }
            self.load_coins(*role, wipe_coins)?;
        }

        if !wipe_coins {
            for role in &roles {
                if self.needs_redownload(*role) {
                    return Err(ChainstateLoadingError::InsufficientlyValidated);
                }
            }
        }

        for role in &roles {
            let Some(tip) = self.tip(*role) else {
                continue;
            };
            if i64::from(tip.time) > now_secs() + MAX_FUTURE_BLOCK_TIME {
                return Err(ChainstateLoadingError::BlockFromFuture);
            }
            if wipe_coins {
                continue;
            }
            match self.verify_db(*role, options.check_level, options.check_blocks) {
                Ok(VerifyOutcome::Interrupted) => return Ok(LoadOutcome::Interrupted),
                Ok(_) => {}
                Err(VerifyError::Corrupted(message)) => {
                    return Err(ChainstateLoadingError::CorruptedBlockDb(message))
                }
                Err(VerifyError::Chainstate(err)) => {
                    return Err(ChainstateLoadingError::CorruptedBlockDb(err.to_string()))
                }
            }
        }

        blockd_log::log_info!(
            "Chainstate loaded: {}",
            roles
                .iter()
                .map(|role| role.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(LoadOutcome::Ready)
    }

    fn detect_snapshot(&self) -> Result<SnapshotLayout, ChainstateLoadingError> {
        if !self.coins_factory.exists(CoinsSlot::Snapshot) {
            return Ok(SnapshotLayout::None);
        }
        let state = self
            .coins_factory
            .open(CoinsSlot::Snapshot, false)
            .and_then(|db| db.snapshot_state())
            .map_err(|err| ChainstateLoadingError::LoadingBlockDb(err.to_string()))?;
        match state {
            SnapshotState::Unvalidated(base) => {
                blockd_log::log_info!(
                    "[snapshot] detected active snapshot chainstate, base {}",
                    hash256_to_hex(&base)
                );
                Ok(SnapshotLayout::Unvalidated(base))
            }
            SnapshotState::Validated(base) => {
                blockd_log::log_info!(
                    "[snapshot] using validated snapshot chainstate, base {}",
                    hash256_to_hex(&base)
                );
                if self.coins_factory.exists(CoinsSlot::Primary) {
                    self.coins_factory
                        .remove(CoinsSlot::Primary)
                        .map_err(|err| ChainstateLoadingError::LoadingBlockDb(err.to_string()))?;
                }
                Ok(SnapshotLayout::Validated)
            }
            SnapshotState::None => Ok(SnapshotLayout::None),
        }
    }

    /// Opens, upgrades and replays one chainstate's coin database, then
    /// points the chain at its best block.
    fn load_coins(&self, role: ChainstateRole, wipe: bool) -> Result<(), ChainstateLoadingError> {
        let slot = self
            .lock_main()
            .chainstate(role)
            .map(|cs| cs.slot)
            .ok_or_else(|| {
                ChainstateLoadingError::LoadingBlockDb(format!("no {} chainstate", role.as_str()))
            })?;
        blockd_log::log_info!("Opening {} coins database ({})", role.as_str(), slot.as_str());
        let mut coins = self
            .coins_factory
            .open(slot, wipe)
            .map_err(|err| ChainstateLoadingError::LoadingBlockDb(err.to_string()))?;
        coins
            .upgrade()
            .map_err(|err| ChainstateLoadingError::ChainstateUpgradeFailed(err.to_string()))?;
        self.replay_blocks(coins.as_mut())
            .map_err(ChainstateLoadingError::ReplayBlocksFailed)?;

        let best = coins
            .best_block()
            .map_err(|err| ChainstateLoadingError::LoadChainTipFailed(err.to_string()))?;
        let mut main = self.lock_main();
        let MainState {
            index, chainstates, ..
        } = &mut *main;
        let cs = chainstates
            .iter_mut()
            .find(|cs| cs.role == role)
            .ok_or_else(|| {
                ChainstateLoadingError::LoadChainTipFailed(format!("no {} chainstate", role.as_str()))
            })?;
        cs.coins = Some(coins);
        let Some(best) = best else {
            return Ok(());
        };
        let tip = index.lookup(&best).ok_or_else(|| {
            ChainstateLoadingError::LoadChainTipFailed(format!(
                "coins best block {} not in block index",
                hash256_to_hex(&best)
            ))
        })?;
        cs.set_tip(index, Some(tip));
        cs.prune_candidates(index);
        let node = index.node(tip);
        blockd_log::log_info!(
            "Loaded best chain: hashBestChain={} height={} date={} ({})",
            hash256_to_hex(&node.hash),
            node.height,
            node.time,
            role.as_str()
        );
        Ok(())
    }

    /// Brings a coin database whose last flush was interrupted to a
    /// consistent state: rolls back the old branch to the fork point and
    /// re-applies blocks up to the new tip.
    fn replay_blocks(&self, coins: &mut dyn CoinsDb) -> Result<(), String> {
        let heads = coins.head_blocks().map_err(|err| err.to_string())?;
        if heads.is_empty() {
            return Ok(());
        }
        if heads.len() != 2 {
            return Err("ReplayBlocks(): unknown inconsistent state".to_string());
        }
        let (rollback, forward) = {
            let main = self.lock_main();
            let index = &main.index;
            let new = index
                .lookup(&heads[0])
                .ok_or("ReplayBlocks(): reorganization to unknown block requested")?;
            let old = if heads[1] == [0u8; 32] {
                None
            } else {
                Some(
                    index
                        .lookup(&heads[1])
                        .ok_or("ReplayBlocks(): reorganization from unknown block requested")?,
                )
            };
            let fork = old.and_then(|old| index.last_common_ancestor(old, new));
            let mut rollback = Vec::new();
            let mut walk = old;
            while let Some(id) = walk {
                if Some(id) == fork {
                    break;
                }
                rollback.push(index.node(id).clone());
                walk = index.node(id).prev;
            }
            // Genesis is connected into the coin set, so with no fork replay starts at 0.
            let fork_height = fork.map(|fork| index.node(fork).height).unwrap_or(-1);
            let forward: Vec<_> = (fork_height + 1..=index.node(new).height)
                .filter_map(|height| index.ancestor(new, height))
                .map(|id| index.node(id).clone())
                .collect();
            (rollback, forward)
        };

        blockd_log::log_info!("Replaying blocks");
        for node in &rollback {
            if node.height == 0 {
                continue;
            }
            blockd_log::log_info!(
                "Rolling back {} ({})",
                hash256_to_hex(&node.hash),
                node.height
            );
            let block = self
                .blockman
                .read_block_for_node(node)
                .map_err(|err| format!("RollbackBlock(): ReadBlock failed at {}: {err}", node.height))?;
            let undo = self
                .blockman
                .read_undo_for_node(node)
                .map_err(|err| format!("RollbackBlock(): ReadUndo failed at {}: {err}", node.height))?;
            let result = coins
                .disconnect_block(&block, &undo)
                .map_err(|err| err.to_string())?;
            if result == DisconnectResult::Failed {
                return Err(format!(
                    "RollbackBlock(): DisconnectBlock failed at {}, hash={}",
                    node.height,
                    hash256_to_hex(&node.hash)
                ));
            }
        }
        for node in &forward {
            blockd_log::log_info!(
                "Rolling forward {} ({})",
                hash256_to_hex(&node.hash),
                node.height
            );
            let block = self
                .blockman
                .read_block_for_node(node)
                .map_err(|err| format!("RollforwardBlock(): ReadBlock failed at {}: {err}", node.height))?;
            coins
                .apply_replay(&block, node.height)
                .map_err(|err| err.to_string())?;
        }
        coins.set_best_block(heads[0]);
        coins.flush().map_err(|err| err.to_string())?;
        Ok(())
    }

    /// True when a connected block at or above the witness height lacks
    /// witness validation.
    fn needs_redownload(&self, role: ChainstateRole) -> bool {
        let main = self.lock_main();
        let Some(cs) = main.chainstate(role) else {
            return false;
        };
        let mut walk = cs.tip();
        while let Some(id) = walk {
            let node = main.index.node(id);
            if !self.params.witness_active_at(node.height) {
                break;
            }
            if node.is_valid(BLOCK_VALID_SCRIPTS) && node.status & STATUS_OPT_WITNESS == 0 {
                return true;
            }
            walk = node.prev;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advice_splits_block_and_coin_failures() {
        assert_eq!(ChainstateLoadingError::BadGenesisBlock.advice(), "--reindex");
        assert_eq!(ChainstateLoadingError::PrunedNeedsReindex.advice(), "--reindex");
        assert_eq!(
            ChainstateLoadingError::CorruptedBlockDb("x".into()).advice(),
            "--reindex-chainstate"
        );
        assert_eq!(
            ChainstateLoadingError::ReplayBlocksFailed("x".into()).advice(),
            "--reindex-chainstate"
        );
    }
}
