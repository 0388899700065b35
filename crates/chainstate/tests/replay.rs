mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use blockd_chainstate::blockstorage::PruneMode;
use blockd_chainstate::coins::{
    CoinsDb, CoinsDbFactory, CoinsError, CoinsSlot, KvCoinsDb, MemoryCoinsFactory,
};
use blockd_chainstate::validation::PowValidator;
use blockd_chainstate::{
    ChainstateLoadOptions, ChainstateLoadingError, ChainstateManager, FlushMode, LoadOutcome,
    LoggingNotifications, SignalInterrupt,
};
use blockd_consensus::{consensus_params, Network};
use blockd_primitives::outpoint::OutPoint;
use blockd_storage::memory::MemoryStore;
use blockd_storage::{Column, KeyValueStore, PrefixVisitor, ScanResult, StoreError, WriteBatch};

use common::{connect_all, genesis, mine_chain, node, options, Disk};

/// Accepts `batches_left` more batch writes, then fails every one after.
struct FailingStore {
    inner: Arc<MemoryStore>,
    batches_left: Arc<AtomicUsize>,
}

impl KeyValueStore for FailingStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.get(column, key)
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.inner.put(column, key, value)
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        self.inner.delete(column, key)
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        self.inner.scan_prefix(column, prefix)
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        self.inner.for_each_prefix(column, prefix, visitor)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        if self
            .batches_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_err()
        {
            return Err(StoreError::Backend("disk write failed".to_string()));
        }
        self.inner.write_batch(batch)
    }

    fn clear_column(&self, column: Column) -> Result<(), StoreError> {
        self.inner.clear_column(column)
    }

    fn column_is_empty(&self, column: Column) -> Result<bool, StoreError> {
        self.inner.column_is_empty(column)
    }
}

/// Serves the same stores as `inner`, behind a `FailingStore`.
struct FailingCoinsFactory {
    inner: Arc<MemoryCoinsFactory>,
    batches_left: Arc<AtomicUsize>,
}

impl CoinsDbFactory for FailingCoinsFactory {
    fn open(&self, slot: CoinsSlot, wipe: bool) -> Result<Box<dyn CoinsDb>, CoinsError> {
        self.inner.open(slot, false)?;
        let inner = self
            .inner
            .store(slot)
            .ok_or(CoinsError::Inconsistent("coins store missing"))?;
        let mut db = KvCoinsDb::new(Arc::new(FailingStore {
            inner,
            batches_left: Arc::clone(&self.batches_left),
        }));
        if wipe {
            db.wipe()?;
        }
        Ok(Box::new(db))
    }

    fn exists(&self, slot: CoinsSlot) -> bool {
        self.inner.exists(slot)
    }

    fn remove(&self, slot: CoinsSlot) -> Result<(), CoinsError> {
        self.inner.remove(slot)
    }
}

#[test]
fn coins_flush_cut_short_is_replayed_on_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let disk = Disk::new();
    let params = consensus_params(Network::Regtest);
    let blocks = mine_chain(&genesis(&params), 0, 10, 40, &params);
    let batches_left = Arc::new(AtomicUsize::new(usize::MAX));
    {
        let interrupt = SignalInterrupt::new();
        let chainman = ChainstateManager::new(
            options(dir.path(), PruneMode::Disabled),
            params.clone(),
            Arc::clone(&disk.store),
            Arc::new(FailingCoinsFactory {
                inner: Arc::clone(&disk.coins),
                batches_left: Arc::clone(&batches_left),
            }),
            Arc::new(PowValidator::new(params.clone())),
            Arc::new(LoggingNotifications::new(interrupt.clone())),
            interrupt,
        );
        chainman
            .load_chainstate(&ChainstateLoadOptions::default())
            .expect("load");
        chainman.activate_best_chain().expect("genesis");
        connect_all(&chainman, &blocks[..5]);
        chainman.flush_state(FlushMode::Always).expect("flush");

        connect_all(&chainman, &blocks[5..]);
        // The head marker lands, the coin batch after it does not.
        batches_left.store(1, Ordering::SeqCst);
        assert!(chainman.flush_state(FlushMode::Always).is_err());
    }

    let stored = disk
        .coins
        .open(CoinsSlot::Primary, false)
        .expect("open coins");
    assert_eq!(
        stored.head_blocks().expect("heads"),
        vec![blocks[9].hash(), blocks[4].hash()]
    );
    assert_eq!(stored.best_block().expect("best"), Some(blocks[4].hash()));
    drop(stored);

    let chainman = node(dir.path(), &disk);
    let outcome = chainman
        .load_chainstate(&ChainstateLoadOptions::default())
        .expect("reload replays");
    assert_eq!(outcome, LoadOutcome::Ready);
    let tip = chainman.active_tip().expect("tip");
    assert_eq!(tip.height, 10);
    assert_eq!(tip.hash, blocks[9].hash());

    let coins = disk
        .coins
        .open(CoinsSlot::Primary, false)
        .expect("open coins");
    assert!(coins.head_blocks().expect("heads").is_empty());
    assert_eq!(coins.best_block().expect("best"), Some(blocks[9].hash()));
    let replayed = coins
        .get_coin(&OutPoint::new(blocks[7].transactions[0].txid(), 0))
        .expect("read coin")
        .expect("coinbase of a replayed block");
    assert_eq!(replayed.height, 8);
    assert!(replayed.is_coinbase);
}

#[test]
fn first_coins_flush_cut_short_replays_from_genesis() {
    let dir = tempfile::tempdir().expect("tempdir");
    let disk = Disk::new();
    let params = consensus_params(Network::Regtest);
    let blocks = mine_chain(&genesis(&params), 0, 3, 40, &params);
    {
        let interrupt = SignalInterrupt::new();
        let batches_left = Arc::new(AtomicUsize::new(1));
        let chainman = ChainstateManager::new(
            options(dir.path(), PruneMode::Disabled),
            params.clone(),
            Arc::clone(&disk.store),
            Arc::new(FailingCoinsFactory {
                inner: Arc::clone(&disk.coins),
                batches_left,
            }),
            Arc::new(PowValidator::new(params.clone())),
            Arc::new(LoggingNotifications::new(interrupt.clone())),
            interrupt,
        );
        chainman
            .load_chainstate(&ChainstateLoadOptions::default())
            .expect("load");
        chainman.activate_best_chain().expect("genesis");
        connect_all(&chainman, &blocks);
        assert!(chainman.flush_state(FlushMode::Always).is_err());
    }
    let stored = disk
        .coins
        .open(CoinsSlot::Primary, false)
        .expect("open coins");
    assert_eq!(
        stored.head_blocks().expect("heads"),
        vec![blocks[2].hash(), [0u8; 32]]
    );
    assert_eq!(stored.best_block().expect("best"), None);
    drop(stored);

    let chainman = node(dir.path(), &disk);
    chainman
        .load_chainstate(&ChainstateLoadOptions::default())
        .expect("reload replays");
    assert_eq!(chainman.active_tip().expect("tip").hash, blocks[2].hash());
    let coins = disk
        .coins
        .open(CoinsSlot::Primary, false)
        .expect("open coins");
    let genesis_coinbase = OutPoint::new(genesis(&params).transactions[0].txid(), 0);
    let coin = coins
        .get_coin(&genesis_coinbase)
        .expect("read coin")
        .expect("genesis output replayed");
    assert_eq!(coin.height, 0);
    assert_eq!(coins.coin_count().expect("count"), 4);
}

#[test]
fn head_marker_with_one_hash_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let disk = Disk::new();
    {
        let chainman = node(dir.path(), &disk);
        chainman
            .load_chainstate(&ChainstateLoadOptions::default())
            .expect("load");
        chainman.flush_state(FlushMode::Always).expect("flush");
    }
    disk.coins
        .store(CoinsSlot::Primary)
        .expect("coins store")
        .put(Column::CoinsMeta, b"head_blocks", &[7u8; 32])
        .expect("write marker");

    let chainman = node(dir.path(), &disk);
    let err = chainman
        .load_chainstate(&ChainstateLoadOptions::default())
        .expect_err("inconsistent marker");
    assert_eq!(
        err,
        ChainstateLoadingError::ReplayBlocksFailed(
            "ReplayBlocks(): unknown inconsistent state".to_string()
        )
    );
    assert_eq!(err.advice(), "--reindex-chainstate");
}
