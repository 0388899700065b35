//! Owns the block index, the chainstates and the block manager, and moves
//! chain tips.
//!
//! `main` guards the index, every chainstate's tip and candidates, and the
//! prune locks. `connect` serializes tip movement, flushes and verification;
//! whoever holds it may take a coin database out of `main` and do I/O on it
//! without the main lock. Lock order: `connect`, then `main`, then the block
//! manager's file lock.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use blockd_consensus::params::ConsensusParams;
use blockd_consensus::{hash256_to_hex, Hash256};
use blockd_log::Category;
use blockd_pow::check_proof_of_work;
use blockd_primitives::block::{Block, BlockHeader};
use blockd_primitives::outpoint::OutPoint;
use blockd_storage::KeyValueStore;

use crate::blockindex::{
    BlockIndex, BlockIndexError, BlockIndexNode, NodeId, BLOCK_VALID_SCRIPTS,
};
use crate::blockstorage::{BlockManager, BlockManagerOptions, BlockStoreError};
use crate::chainstate::{Chainstate, ChainstateRole};
use crate::coins::{
    Coin, CoinsDb, CoinsDbFactory, CoinsError, CoinsSlot, DisconnectResult, SnapshotState,
};
use crate::flatfiles::FlatFilePos;
use crate::genesis::genesis_block;
use crate::notifications::{Notifications, SignalInterrupt};
use crate::prune::{last_height_can_prune, prune_range, PruneLockInfo, PruneRequest};
use crate::validation::{BlockValidator, ValidationError};

/// A tip older than this keeps the node in initial block download.
pub const DEFAULT_MAX_TIP_AGE: i64 = 24 * 60 * 60;
/// Pending coin changes that make an `IfNeeded` flush write.
pub const DEFAULT_COINS_FLUSH_ENTRIES: usize = 250_000;

#[derive(Clone, Debug)]
pub struct ChainstateManagerOptions {
    pub blockman: BlockManagerOptions,
    pub coins_flush_entries: usize,
    pub max_tip_age: i64,
}

impl Default for ChainstateManagerOptions {
    fn default() -> Self {
        Self {
            blockman: BlockManagerOptions::default(),
            coins_flush_entries: DEFAULT_COINS_FLUSH_ENTRIES,
            max_tip_age: DEFAULT_MAX_TIP_AGE,
        }
    }
}

#[derive(Debug)]
pub enum ChainstateError {
    BlockStore(BlockStoreError),
    Coins(CoinsError),
    Index(BlockIndexError),
    Invalid(ValidationError),
    UnknownBlock(Hash256),
    MissingChainstate(ChainstateRole),
    CoinsUnavailable(ChainstateRole),
    Genesis(String),
    Snapshot(String),
    PruneDisabled,
}

impl std::fmt::Display for ChainstateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainstateError::BlockStore(err) => write!(f, "{err}"),
            ChainstateError::Coins(err) => write!(f, "{err}"),
            ChainstateError::Index(err) => write!(f, "{err}"),
            ChainstateError::Invalid(err) => write!(f, "invalid block: {err}"),
            ChainstateError::UnknownBlock(hash) => {
                write!(f, "block {} not found", hash256_to_hex(hash))
            }
            ChainstateError::MissingChainstate(role) => {
                write!(f, "no {} chainstate", role.as_str())
            }
            ChainstateError::CoinsUnavailable(role) => {
                write!(f, "coins database of the {} chainstate is not open", role.as_str())
            }
            ChainstateError::Genesis(message) => write!(f, "{message}"),
            ChainstateError::Snapshot(message) => write!(f, "{message}"),
            ChainstateError::PruneDisabled => {
                write!(f, "cannot prune blocks because node is not in prune mode")
            }
        }
    }
}

impl std::error::Error for ChainstateError {}

impl From<BlockStoreError> for ChainstateError {
    fn from(err: BlockStoreError) -> Self {
        ChainstateError::BlockStore(err)
    }
}

impl From<CoinsError> for ChainstateError {
    fn from(err: CoinsError) -> Self {
        ChainstateError::Coins(err)
    }
}

impl From<BlockIndexError> for ChainstateError {
    fn from(err: BlockIndexError) -> Self {
        ChainstateError::Index(err)
    }
}

impl From<ValidationError> for ChainstateError {
    fn from(err: ValidationError) -> Self {
        ChainstateError::Invalid(err)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AcceptOutcome {
    Stored(NodeId),
    AlreadyHave(NodeId),
}

impl AcceptOutcome {
    pub fn id(self) -> NodeId {
        match self {
            AcceptOutcome::Stored(id) | AcceptOutcome::AlreadyHave(id) => id,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FlushMode {
    /// Write only when pruning removed files or the coin caches are large.
    IfNeeded,
    Always,
}

/// Everything the main lock protects.
#[derive(Default)]
pub struct MainState {
    pub index: BlockIndex,
    pub chainstates: Vec<Chainstate>,
    pub prune_locks: HashMap<String, PruneLockInfo>,
}

impl MainState {
    pub fn chainstate(&self, role: ChainstateRole) -> Option<&Chainstate> {
        self.chainstates.iter().find(|cs| cs.role == role)
    }

    pub(crate) fn chainstate_mut(&mut self, role: ChainstateRole) -> Option<&mut Chainstate> {
        self.chainstates.iter_mut().find(|cs| cs.role == role)
    }

    /// The chainstate whose tip the node reports: the snapshot one while it
    /// exists.
    pub fn active(&self) -> Option<&Chainstate> {
        self.chainstate(ChainstateRole::Snapshot)
            .or_else(|| self.chainstate(ChainstateRole::Normal))
    }

    pub fn roles(&self) -> Vec<ChainstateRole> {
        self.chainstates.iter().map(|cs| cs.role).collect()
    }

    /// Marks `id` failed and drops it, and its descendants, from every
    /// candidate set.
    pub(crate) fn invalidate(&mut self, id: NodeId, reason: &str) {
        let descendants = self.index.mark_failed(id);
        for cs in &mut self.chainstates {
            cs.prune_candidates(&self.index);
        }
        blockd_log::log_warn!(
            "InvalidChainFound: invalid block={} height={} ({}), {} descendants marked",
            hash256_to_hex(&self.index.node(id).hash),
            self.index.node(id).height,
            reason,
            descendants
        );
    }
}

enum Step {
    Disconnect { id: NodeId, node: BlockIndexNode },
    Connect { id: NodeId, node: BlockIndexNode, prev: Option<BlockIndexNode> },
}

pub(crate) fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

pub struct ChainstateManager<S> {
    pub(crate) opts: ChainstateManagerOptions,
    pub(crate) params: ConsensusParams,
    pub(crate) blockman: BlockManager<S>,
    pub(crate) main: Mutex<MainState>,
    connect: Mutex<()>,
    pub(crate) coins_factory: Arc<dyn CoinsDbFactory>,
    pub(crate) validator: Arc<dyn BlockValidator>,
    pub(crate) notifications: Arc<dyn Notifications>,
    pub(crate) interrupt: SignalInterrupt,
    finished_initial_download: AtomicBool,
}

impl<S: KeyValueStore> ChainstateManager<S> {
    pub fn new(
        opts: ChainstateManagerOptions,
        params: ConsensusParams,
        store: Arc<S>,
        coins_factory: Arc<dyn CoinsDbFactory>,
        validator: Arc<dyn BlockValidator>,
        notifications: Arc<dyn Notifications>,
        interrupt: SignalInterrupt,
    ) -> Self {
        let blockman = BlockManager::new(
            opts.blockman.clone(),
            params.clone(),
            store,
            Arc::clone(&notifications),
        );
        Self {
            opts,
            params,
            blockman,
            main: Mutex::new(MainState::default()),
            connect: Mutex::new(()),
            coins_factory,
            validator,
            notifications,
            interrupt,
            finished_initial_download: AtomicBool::new(false),
        }
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    pub fn options(&self) -> &ChainstateManagerOptions {
        &self.opts
    }

    pub fn blockman(&self) -> &BlockManager<S> {
        &self.blockman
    }

    pub fn interrupt(&self) -> &SignalInterrupt {
        &self.interrupt
    }

    pub fn notifications(&self) -> &Arc<dyn Notifications> {
        &self.notifications
    }

    pub(crate) fn lock_main(&self) -> MutexGuard<'_, MainState> {
        self.main.lock().expect("main lock")
    }

    pub(crate) fn lock_connect(&self) -> MutexGuard<'_, ()> {
        self.connect.lock().expect("connect lock")
    }

    /// Runs `f` with the main lock held. Nothing borrowed from the state
    /// outlives the call.
    pub fn with_state<R>(&self, f: impl FnOnce(&MainState) -> R) -> R {
        let main = self.lock_main();
        f(&main)
    }

    /// Runs `f` on a chainstate's coin database. The database is taken out
    /// of the main state for the duration so the main lock is not held.
    pub fn with_coins<R>(
        &self,
        role: ChainstateRole,
        f: impl FnOnce(&mut dyn CoinsDb) -> R,
    ) -> Result<R, ChainstateError> {
        let _connect = self.lock_connect();
        let mut coins = self.take_coins(role)?;
        let result = f(coins.as_mut());
        self.restore_coins(role, coins);
        Ok(result)
    }

    /// Caller holds the connect lock.
    pub(crate) fn take_coins(
        &self,
        role: ChainstateRole,
    ) -> Result<Box<dyn CoinsDb>, ChainstateError> {
        let mut main = self.lock_main();
        let cs = main
            .chainstate_mut(role)
            .ok_or(ChainstateError::MissingChainstate(role))?;
        cs.coins
            .take()
            .ok_or(ChainstateError::CoinsUnavailable(role))
    }

    pub(crate) fn restore_coins(&self, role: ChainstateRole, coins: Box<dyn CoinsDb>) {
        let mut main = self.lock_main();
        if let Some(cs) = main.chainstate_mut(role) {
            cs.coins = Some(coins);
        }
    }

    /// Drops all in-memory state so the loading sequence can run again.
    pub fn reset(&self) {
        {
            let mut main = self.lock_main();
            main.index.clear();
            main.chainstates.clear();
        }
        self.blockman.reset();
        self.finished_initial_download.store(false, Ordering::SeqCst);
    }

    pub fn lookup_block_index(&self, hash: &Hash256) -> Option<BlockIndexNode> {
        self.lock_main().index.get(hash).cloned()
    }

    pub fn best_header(&self) -> Option<BlockIndexNode> {
        let main = self.lock_main();
        main.index
            .best_header()
            .map(|id| main.index.node(id).clone())
    }

    pub fn tip(&self, role: ChainstateRole) -> Option<BlockIndexNode> {
        let main = self.lock_main();
        main.chainstate(role)
            .and_then(|cs| cs.tip())
            .map(|id| main.index.node(id).clone())
    }

    pub fn active_tip(&self) -> Option<BlockIndexNode> {
        let main = self.lock_main();
        main.active()
            .and_then(|cs| cs.tip())
            .map(|id| main.index.node(id).clone())
    }

    pub fn chainstate_roles(&self) -> Vec<ChainstateRole> {
        self.lock_main().roles()
    }

    pub fn read_block(&self, hash: &Hash256) -> Result<Block, ChainstateError> {
        let node = self
            .lookup_block_index(hash)
            .ok_or(ChainstateError::UnknownBlock(*hash))?;
        Ok(self.blockman.read_block_for_node(&node)?)
    }

    pub fn read_block_at(&self, pos: FlatFilePos) -> Result<Block, ChainstateError> {
        Ok(self.blockman.read_block(pos)?)
    }

    pub fn read_raw_block(&self, hash: &Hash256) -> Result<Vec<u8>, ChainstateError> {
        let pos = self
            .lookup_block_index(hash)
            .and_then(|node| node.data_pos())
            .ok_or(ChainstateError::UnknownBlock(*hash))?;
        Ok(self.blockman.read_raw_block(pos)?)
    }

    pub fn is_block_pruned(&self, hash: &Hash256) -> bool {
        self.lookup_block_index(hash)
            .is_some_and(|node| self.blockman.is_block_pruned(&node))
    }

    /// True when every block from `lower` up to `upper` has its data stored.
    pub fn check_data_availability(&self, upper: &Hash256, lower: &Hash256) -> bool {
        let main = self.lock_main();
        match (main.index.lookup(upper), main.index.lookup(lower)) {
            (Some(upper), Some(lower)) => {
                self.blockman
                    .check_block_data_availability(&main.index, upper, lower)
            }
            _ => false,
        }
    }

    pub fn set_prune_lock(&self, name: &str, lock: PruneLockInfo) {
        self.lock_main().prune_locks.insert(name.to_string(), lock);
    }

    pub fn delete_prune_lock(&self, name: &str) -> bool {
        self.lock_main().prune_locks.remove(name).is_some()
    }

    pub fn is_initial_block_download(&self) -> bool {
        if self.finished_initial_download.load(Ordering::Relaxed) {
            return false;
        }
        let main = self.lock_main();
        self.initial_download_locked(&main.index, &main.chainstates)
    }

    fn initial_download_locked(&self, index: &BlockIndex, chainstates: &[Chainstate]) -> bool {
        if self.finished_initial_download.load(Ordering::Relaxed) {
            return false;
        }
        if self.blockman.is_reindexing() {
            return true;
        }
        let active = chainstates
            .iter()
            .find(|cs| cs.role == ChainstateRole::Snapshot)
            .or_else(|| chainstates.iter().find(|cs| cs.role == ChainstateRole::Normal));
        let Some(tip) = active.and_then(|cs| cs.tip()) else {
            return true;
        };
        if i64::from(index.node(tip).time) < now_secs() - self.opts.max_tip_age {
            return true;
        }
        blockd_log::log_info!("Leaving InitialBlockDownload (latching to false)");
        self.finished_initial_download.store(true, Ordering::Relaxed);
        false
    }

    /// Adds a header to the index after checking its proof of work.
    pub fn accept_header(&self, header: &BlockHeader) -> Result<NodeId, ChainstateError> {
        self.accept_header_with_hash(header.hash(), header)
    }

    fn accept_header_with_hash(
        &self,
        hash: Hash256,
        header: &BlockHeader,
    ) -> Result<NodeId, ChainstateError> {
        check_proof_of_work(&hash, header.bits, &self.params).map_err(ValidationError::from)?;
        if header.prev_block == [0u8; 32] && hash != self.params.hash_genesis_block {
            return Err(ValidationError::InvalidBlock("unexpected genesis block").into());
        }
        let (id, header_tip) = {
            let mut main = self.lock_main();
            let previous_best = main.index.best_header();
            let id = main.index.insert_header_with_hash(hash, header)?;
            if main.index.node(id).is_failed() {
                return Err(ValidationError::Rejected("block is marked invalid".to_string()).into());
            }
            let best = main.index.best_header();
            let header_tip = (best != previous_best)
                .then_some(best)
                .flatten()
                .map(|best| (main.index.node(best).hash, main.index.node(best).height));
            (id, header_tip)
        };
        if let Some((best_hash, best_height)) = header_tip {
            self.notifications.header_tip(&best_hash, best_height);
        }
        Ok(id)
    }

    /// Stores a block and makes it a tip candidate once all its ancestors
    /// have data. `known` is the payload position when the block is already
    /// in a block file (reindex).
    pub fn accept_block(
        &self,
        block: &Block,
        known: Option<FlatFilePos>,
    ) -> Result<AcceptOutcome, ChainstateError> {
        let (root, mutated) = block.compute_merkle_root();
        if mutated {
            return Err(ValidationError::DuplicateTransaction.into());
        }
        if root != block.header.merkle_root {
            return Err(ValidationError::MerkleMismatch.into());
        }
        let id = self.accept_header_with_hash(block.hash(), &block.header)?;
        let height = {
            let main = self.lock_main();
            let node = main.index.node(id);
            if node.have_data() {
                return Ok(AcceptOutcome::AlreadyHave(id));
            }
            node.height
        };

        let pos = self.blockman.save_block(block, height, known)?;
        {
            let mut main = self.lock_main();
            let MainState {
                index, chainstates, ..
            } = &mut *main;
            if index.node(id).have_data() {
                return Ok(AcceptOutcome::AlreadyHave(id));
            }
            let witness = self.params.witness_active_at(height);
            let linked =
                index.mark_data_present(id, pos, block.transactions.len() as u32, witness);
            for linked_id in linked {
                for cs in chainstates.iter_mut() {
                    cs.try_add_candidate(index, linked_id);
                }
            }
        }
        if let Some(target) = self.blockman.options().prune.automatic_target() {
            if self.blockman.calculate_current_usage() >= target {
                self.blockman.set_check_for_pruning(true);
            }
        }
        Ok(AcceptOutcome::Stored(id))
    }

    /// Writes the genesis block unless it is already indexed with data.
    pub fn load_genesis_block(&self) -> Result<(), ChainstateError> {
        if self
            .lookup_block_index(&self.params.hash_genesis_block)
            .is_some_and(|node| node.have_data())
        {
            return Ok(());
        }
        let genesis = genesis_block(&self.params).map_err(ChainstateError::Genesis)?;
        self.accept_block(&genesis, None)?;
        Ok(())
    }

    /// Moves every chainstate to its best candidate.
    pub fn activate_best_chain(&self) -> Result<(), ChainstateError> {
        let connect = self.lock_connect();
        for role in [
            ChainstateRole::Snapshot,
            ChainstateRole::Normal,
            ChainstateRole::Background,
        ] {
            if self.lock_main().chainstate(role).is_some() {
                self.activate_best_chain_locked(role, &connect)?;
            }
        }
        Ok(())
    }

    pub fn activate_best_chain_for(&self, role: ChainstateRole) -> Result<(), ChainstateError> {
        let connect = self.lock_connect();
        self.activate_best_chain_locked(role, &connect)
    }

    fn next_step(&self, role: ChainstateRole) -> Result<Option<Step>, ChainstateError> {
        let mut main = self.lock_main();
        let MainState {
            index, chainstates, ..
        } = &mut *main;
        let cs = chainstates
            .iter_mut()
            .find(|cs| cs.role == role)
            .ok_or(ChainstateError::MissingChainstate(role))?;
        cs.prune_candidates(index);
        let Some(best) = cs.best_candidate(index) else {
            return Ok(None);
        };
        let tip = cs.tip();
        if tip == Some(best) {
            return Ok(None);
        }
        if let Some(tip) = tip {
            if !index.is_ancestor(tip, best) {
                return Ok(Some(Step::Disconnect {
                    id: tip,
                    node: index.node(tip).clone(),
                }));
            }
        }
        let next = index
            .ancestor(best, cs.height() + 1)
            .ok_or(ChainstateError::UnknownBlock(index.node(best).hash))?;
        let node = index.node(next).clone();
        let prev = node.prev.map(|prev| index.node(prev).clone());
        Ok(Some(Step::Connect {
            id: next,
            node,
            prev,
        }))
    }

    /// Disconnects to the fork point and connects forward, one block per
    /// step. Block and undo reads, validation and undo writes run without
    /// the main lock.
    fn activate_best_chain_locked(
        &self,
        role: ChainstateRole,
        _connect: &MutexGuard<'_, ()>,
    ) -> Result<(), ChainstateError> {
        loop {
            if self.interrupt.is_set() {
                return Ok(());
            }
            let Some(step) = self.next_step(role)? else {
                return Ok(());
            };
            match step {
                Step::Disconnect { id, node } => self.disconnect_tip(role, id, &node)?,
                Step::Connect { id, node, prev } => {
                    if self.connect_tip(role, id, &node, prev.as_ref())? {
                        return self.complete_snapshot_validation();
                    }
                }
            }
            self.flush_locked(FlushMode::IfNeeded, None)?;
        }
    }

    fn disconnect_tip(
        &self,
        role: ChainstateRole,
        id: NodeId,
        node: &BlockIndexNode,
    ) -> Result<(), ChainstateError> {
        let block = self.blockman.read_block_for_node(node)?;
        let undo = self.blockman.read_undo_for_node(node)?;
        let tip = {
            let mut main = self.lock_main();
            let MainState {
                index, chainstates, ..
            } = &mut *main;
            let cs = chainstates
                .iter_mut()
                .find(|cs| cs.role == role)
                .ok_or(ChainstateError::MissingChainstate(role))?;
            let coins = cs
                .coins
                .as_mut()
                .ok_or(ChainstateError::CoinsUnavailable(role))?;
            match coins.disconnect_block(&block, &undo)? {
                DisconnectResult::Ok => {}
                DisconnectResult::Unclean => blockd_log::log_warn!(
                    "inconsistent coin state while disconnecting block {}",
                    hash256_to_hex(&node.hash)
                ),
                DisconnectResult::Failed => {
                    return Err(CoinsError::Inconsistent("failed to disconnect block").into())
                }
            }
            cs.set_tip(index, node.prev);
            cs.try_add_candidate(index, id);
            node.prev.map(|prev| (index.node(prev).hash, index.node(prev).height))
        };
        blockd_log::log_category!(
            Category::Validation,
            "Disconnected block {} at height {}",
            hash256_to_hex(&node.hash),
            node.height
        );
        if let Some((hash, height)) = tip {
            let initial = self.is_initial_block_download();
            self.notifications.block_tip(&hash, height, initial);
        }
        Ok(())
    }

    /// Connects `id` on top of the tip. Returns true when a background
    /// chainstate just reached its snapshot base.
    fn connect_tip(
        &self,
        role: ChainstateRole,
        id: NodeId,
        node: &BlockIndexNode,
        prev: Option<&BlockIndexNode>,
    ) -> Result<bool, ChainstateError> {
        let block = self.blockman.read_block_for_node(node)?;
        if let Err(err) = self.validator.validate(&block, prev, node.height) {
            self.lock_main().invalidate(id, &err.to_string());
            return Ok(false);
        }

        let undo = {
            let mut main = self.lock_main();
            let connected = {
                let cs = main
                    .chainstate_mut(role)
                    .ok_or(ChainstateError::MissingChainstate(role))?;
                let coins = cs
                    .coins
                    .as_mut()
                    .ok_or(ChainstateError::CoinsUnavailable(role))?;
                coins.connect_block(&block, node.height)
            };
            match connected {
                Ok(undo) => undo,
                Err(err) if err.is_invalid_block() => {
                    main.invalidate(id, &err.to_string());
                    return Ok(false);
                }
                Err(err) => return Err(err.into()),
            }
        };

        let undo_pos = if node.height > 0 && !node.have_undo() {
            match self
                .blockman
                .write_undo(&undo, node.height, node.file, &node.prev_hash)
            {
                Ok(pos) => Some(pos),
                Err(err) => {
                    let mut main = self.lock_main();
                    if let Some(coins) = main
                        .chainstate_mut(role)
                        .and_then(|cs| cs.coins.as_mut())
                    {
                        coins.disconnect_block(&block, &undo)?;
                    }
                    return Err(err.into());
                }
            }
        } else {
            None
        };

        let reached_base = {
            let mut main = self.lock_main();
            let MainState {
                index, chainstates, ..
            } = &mut *main;
            if let Some(pos) = undo_pos {
                index.mark_undo_present(id, pos);
            }
            index.raise_validity(id, BLOCK_VALID_SCRIPTS);
            let cs = chainstates
                .iter_mut()
                .find(|cs| cs.role == role)
                .ok_or(ChainstateError::MissingChainstate(role))?;
            cs.set_tip(index, Some(id));
            cs.prune_candidates(index);
            cs.role == ChainstateRole::Background && cs.snapshot_base == Some(id)
        };
        blockd_log::log_category!(
            Category::Validation,
            "UpdateTip: {} best={} height={} tx={}",
            role.as_str(),
            hash256_to_hex(&node.hash),
            node.height,
            block.transactions.len()
        );
        let initial = self.is_initial_block_download();
        self.notifications.block_tip(&node.hash, node.height, initial);
        Ok(reached_base)
    }

    /// Compares the background chainstate's coin set at the snapshot base
    /// with the assumeutxo table. On a match the background chainstate is
    /// dropped; otherwise the snapshot chainstate is. Caller holds the
    /// connect lock.
    fn complete_snapshot_validation(&self) -> Result<(), ChainstateError> {
        let (base_hash, base_height) = {
            let main = self.lock_main();
            let background = main
                .chainstate(ChainstateRole::Background)
                .ok_or(ChainstateError::MissingChainstate(ChainstateRole::Background))?;
            let base = background
                .snapshot_base
                .ok_or_else(|| ChainstateError::Snapshot("background chainstate without base".into()))?;
            (main.index.node(base).hash, main.index.node(base).height)
        };
        let mut background = self.take_coins(ChainstateRole::Background)?;
        let hashed = background.flush().and_then(|_| background.coins_hash());
        let (coins_hash, coin_count) = match hashed {
            Ok(result) => result,
            Err(err) => {
                self.restore_coins(ChainstateRole::Background, background);
                return Err(err.into());
            }
        };
        let expected = self
            .params
            .assumeutxo_for_hash(&base_hash)
            .map(|data| data.coins_hash);

        if expected == Some(coins_hash) {
            let mut snapshot = self.take_coins(ChainstateRole::Snapshot)?;
            let marked = snapshot.set_snapshot_state(SnapshotState::Validated(base_hash));
            {
                let mut main = self.lock_main();
                main.chainstates
                    .retain(|cs| cs.role != ChainstateRole::Background);
                if let Some(cs) = main.chainstate_mut(ChainstateRole::Snapshot) {
                    cs.role = ChainstateRole::Normal;
                    cs.snapshot_base = None;
                    cs.coins = Some(snapshot);
                }
            }
            marked?;
            drop(background);
            self.coins_factory.remove(CoinsSlot::Primary)?;
            blockd_log::log_info!(
                "[snapshot] snapshot beginning at {} (height {}) has been fully validated ({} coins)",
                hash256_to_hex(&base_hash),
                base_height,
                coin_count
            );
            return Ok(());
        }

        blockd_log::log_error!(
            "[snapshot] hash mismatch: actual={}, expected={}",
            hash256_to_hex(&coins_hash),
            expected
                .as_ref()
                .map(hash256_to_hex)
                .unwrap_or_else(|| "none".to_string())
        );
        {
            let mut main = self.lock_main();
            main.chainstates
                .retain(|cs| cs.role != ChainstateRole::Snapshot);
            if let Some(cs) = main.chainstate_mut(ChainstateRole::Background) {
                cs.role = ChainstateRole::Normal;
                cs.snapshot_base = None;
                cs.coins = Some(background);
            }
            let MainState {
                index, chainstates, ..
            } = &mut *main;
            let ids: Vec<NodeId> = index.iter().map(|(id, _)| id).collect();
            for cs in chainstates.iter_mut() {
                for id in &ids {
                    cs.try_add_candidate(index, *id);
                }
            }
        }
        self.blockman.set_snapshot_height(None);
        self.coins_factory.remove(CoinsSlot::Snapshot)?;
        self.notifications.fatal_error(&format!(
            "The UTXO snapshot at {} failed validation. Restart to resume syncing from genesis.",
            hash256_to_hex(&base_hash)
        ));
        Ok(())
    }

    /// Loads a UTXO snapshot whose base block is listed in the assumeutxo
    /// table. The current chainstate becomes the background one.
    pub fn activate_snapshot(
        &self,
        coins: &[(OutPoint, Coin)],
        base_hash: Hash256,
    ) -> Result<(), ChainstateError> {
        let data = self
            .params
            .assumeutxo_for_hash(&base_hash)
            .cloned()
            .ok_or_else(|| {
                ChainstateError::Snapshot(format!(
                    "assumeutxo block hash in snapshot metadata not recognized ({})",
                    hash256_to_hex(&base_hash)
                ))
            })?;
        let _connect = self.lock_connect();
        {
            let main = self.lock_main();
            if main.chainstate(ChainstateRole::Snapshot).is_some()
                || main.chainstate(ChainstateRole::Background).is_some()
            {
                return Err(ChainstateError::Snapshot(
                    "can't activate a snapshot-based chainstate more than once".into(),
                ));
            }
            let base = main.index.lookup(&base_hash).ok_or_else(|| {
                ChainstateError::Snapshot(
                    "the base block header must appear in the headers chain".into(),
                )
            })?;
            let base_node = main.index.node(base);
            if base_node.height != data.height {
                return Err(ChainstateError::Snapshot(format!(
                    "snapshot base height {} does not match assumeutxo height {}",
                    base_node.height, data.height
                )));
            }
            if base_node.is_failed() {
                return Err(ChainstateError::Snapshot(
                    "the base block header is part of an invalid chain".into(),
                ));
            }
            let normal = main
                .chainstate(ChainstateRole::Normal)
                .ok_or(ChainstateError::MissingChainstate(ChainstateRole::Normal))?;
            if normal
                .tip()
                .is_some_and(|tip| main.index.node(tip).height >= base_node.height)
            {
                return Err(ChainstateError::Snapshot(
                    "a snapshot cannot be activated when the chain tip is at or above its base"
                        .into(),
                ));
            }
        }

        let mut db = self.coins_factory.open(CoinsSlot::Snapshot, true)?;
        db.load_snapshot(coins, base_hash)?;
        let (coins_hash, coin_count) = db.coins_hash()?;
        if coins_hash != data.coins_hash {
            drop(db);
            self.coins_factory.remove(CoinsSlot::Snapshot)?;
            return Err(ChainstateError::Snapshot(format!(
                "bad snapshot content hash: expected {}, got {}",
                hash256_to_hex(&data.coins_hash),
                hash256_to_hex(&coins_hash)
            )));
        }

        let base_height = {
            let mut main = self.lock_main();
            let MainState {
                index, chainstates, ..
            } = &mut *main;
            let base = index
                .lookup(&base_hash)
                .ok_or(ChainstateError::UnknownBlock(base_hash))?;
            index.set_assumed_chain_tx(base, data.chain_tx);
            for cs in chainstates.iter_mut() {
                if cs.role == ChainstateRole::Normal {
                    cs.role = ChainstateRole::Background;
                    cs.snapshot_base = Some(base);
                    let eligible: Vec<NodeId> = cs
                        .candidates
                        .iter()
                        .copied()
                        .filter(|id| index.is_ancestor(*id, base))
                        .collect();
                    cs.candidates = eligible.into_iter().collect();
                }
            }
            let mut snapshot = Chainstate::new(ChainstateRole::Snapshot, CoinsSlot::Snapshot);
            snapshot.snapshot_base = Some(base);
            snapshot.coins = Some(db);
            snapshot.set_tip(index, Some(base));
            let ids: Vec<NodeId> = index.iter().map(|(id, _)| id).collect();
            for id in ids {
                snapshot.try_add_candidate(index, id);
            }
            chainstates.push(snapshot);
            index.node(base).height
        };
        self.blockman.set_snapshot_height(Some(base_height));
        blockd_log::log_info!(
            "[snapshot] successfully activated snapshot {} at height {} ({} coins)",
            hash256_to_hex(&base_hash),
            base_height,
            coin_count
        );
        Ok(())
    }

    pub fn flush_state(&self, mode: FlushMode) -> Result<(), ChainstateError> {
        let _connect = self.lock_connect();
        self.flush_locked(mode, None)
    }

    /// Deletes block files wholly below `height` (and at least
    /// `MIN_BLOCKS_TO_KEEP` below every tip), honouring prune locks.
    pub fn prune_manual(&self, height: i32) -> Result<(), ChainstateError> {
        if !self.blockman.is_prune_mode() {
            return Err(ChainstateError::PruneDisabled);
        }
        let _connect = self.lock_connect();
        self.flush_locked(FlushMode::IfNeeded, Some(height))
    }

    /// Runs pruning when due, then writes block files, the block tree batch,
    /// unlinks pruned files and flushes coins. Caller holds the connect lock.
    pub(crate) fn flush_locked(
        &self,
        mode: FlushMode,
        manual_height: Option<i32>,
    ) -> Result<(), ChainstateError> {
        let (files, staged, mut coins) = {
            let mut main = self.lock_main();
            let MainState {
                index,
                chainstates,
                prune_locks,
            } = &mut *main;
            let mut files = BTreeSet::new();
            let prune_due = manual_height.is_some() || self.blockman.check_for_pruning();
            if self.blockman.is_prune_mode() && prune_due && !self.blockman.is_reindexing() {
                let initial_download = self.initial_download_locked(index, chainstates);
                let chainstate_count = chainstates.len();
                for cs in chainstates.iter() {
                    let tip_height = cs.height();
                    if tip_height < 0 {
                        continue;
                    }
                    let (last_can_prune, limiting) = last_height_can_prune(tip_height, prune_locks);
                    if let Some(name) = limiting {
                        blockd_log::log_category!(
                            Category::Prune,
                            "{} limited pruning to height {}",
                            name,
                            last_can_prune
                        );
                    }
                    let floor = match (cs.role, cs.snapshot_base) {
                        (ChainstateRole::Snapshot, Some(base)) => Some(index.node(base).height + 1),
                        _ => None,
                    };
                    let range = prune_range(tip_height, floor, last_can_prune);
                    let selected = match manual_height {
                        Some(height) => {
                            self.blockman
                                .find_files_to_prune_manual(index, height, range)
                        }
                        None => self.blockman.find_files_to_prune(
                            index,
                            PruneRequest {
                                tip_height,
                                range,
                                chainstate_count,
                                initial_download,
                            },
                        ),
                    };
                    files.extend(selected);
                }
                self.blockman.set_check_for_pruning(false);
            }
            let pending: usize = chainstates
                .iter()
                .filter_map(|cs| cs.coins.as_ref())
                .map(|coins| coins.cache_len())
                .sum();
            let write = mode == FlushMode::Always
                || !files.is_empty()
                || pending >= self.opts.coins_flush_entries;
            if !write {
                return Ok(());
            }
            let staged = self.blockman.stage_index_flush(index);
            let coins: Vec<(ChainstateRole, Box<dyn CoinsDb>)> = chainstates
                .iter_mut()
                .filter_map(|cs| cs.coins.take().map(|coins| (cs.role, coins)))
                .collect();
            (files, staged, coins)
        };

        self.blockman.flush_cursor_files();
        let mut result: Result<(), ChainstateError> = Ok(());
        if !files.is_empty() {
            result = self.blockman.persist_pruned_flag().map_err(Into::into);
        }
        if result.is_ok() && !staged.is_empty() {
            if let Err(err) = self.blockman.commit_index_flush(&staged) {
                self.notifications
                    .flush_error("Failed to write to block index database.");
                result = Err(err.into());
            }
        }
        let index_written = result.is_ok();
        if index_written {
            if let Err(err) = self.blockman.unlink_pruned_files(&files) {
                result = Err(err.into());
            }
        }
        if index_written {
            for (role, db) in coins.iter_mut() {
                if let Err(err) = db.flush() {
                    blockd_log::log_error!("failed to flush {} coins: {err}", role.as_str());
                    self.notifications
                        .flush_error("Failed to write to coin database.");
                    result = Err(err.into());
                    break;
                }
            }
        }

        let mut main = self.lock_main();
        if !index_written {
            self.blockman.restore_index_flush(&mut main.index, &staged);
        }
        for (role, db) in coins {
            if let Some(cs) = main.chainstate_mut(role) {
                cs.coins = Some(db);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coins::MemoryCoinsFactory;
    use crate::notifications::LoggingNotifications;
    use crate::validation::PowValidator;
    use blockd_consensus::{consensus_params, Network};
    use blockd_storage::memory::MemoryStore;

    fn manager(dir: &std::path::Path) -> ChainstateManager<MemoryStore> {
        let params = consensus_params(Network::Regtest);
        let interrupt = SignalInterrupt::new();
        let opts = ChainstateManagerOptions {
            blockman: BlockManagerOptions {
                blocks_dir: dir.to_path_buf(),
                ..BlockManagerOptions::default()
            },
            ..ChainstateManagerOptions::default()
        };
        ChainstateManager::new(
            opts,
            params.clone(),
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryCoinsFactory::new()),
            Arc::new(PowValidator::new(params)),
            Arc::new(LoggingNotifications::new(interrupt.clone())),
            interrupt,
        )
    }

    #[test]
    fn genesis_is_written_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let chainman = manager(dir.path());
        chainman.load_genesis_block().expect("genesis");
        chainman.load_genesis_block().expect("genesis again");
        let genesis = chainman
            .lookup_block_index(&chainman.params().hash_genesis_block)
            .expect("indexed");
        assert!(genesis.have_data());
        assert_eq!(chainman.blockman().file_info(0).expect("info").blocks, 1);
    }

    #[test]
    fn rejects_orphan_and_foreign_genesis() {
        let dir = tempfile::tempdir().expect("tempdir");
        let chainman = manager(dir.path());
        let mut genesis = genesis_block(chainman.params()).expect("genesis");
        genesis.header.prev_block = [7u8; 32];
        assert!(matches!(
            chainman.accept_block(&genesis, None),
            Err(ChainstateError::Invalid(_)) | Err(ChainstateError::Index(_))
        ));
        assert!(chainman.with_state(|state| state.index.is_empty()));
    }

    #[test]
    fn manual_prune_requires_prune_mode() {
        let dir = tempfile::tempdir().expect("tempdir");
        let chainman = manager(dir.path());
        assert!(matches!(
            chainman.prune_manual(10),
            Err(ChainstateError::PruneDisabled)
        ));
    }
}
