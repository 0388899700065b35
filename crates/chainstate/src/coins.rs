//! Coin (unspent output) databases, one per chainstate.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use blockd_consensus::constants::COINBASE_MATURITY;
use blockd_consensus::money::{money_range, Amount};
use blockd_consensus::Hash256;
use blockd_primitives::block::Block;
use blockd_primitives::encoding::{DecodeError, Decoder, Encoder};
use blockd_primitives::hash::Sha256dWriter;
use blockd_primitives::outpoint::OutPoint;
use blockd_storage::memory::MemoryStore;
use blockd_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::undo::{BlockUndo, SpentCoin};

pub const COINS_DB_VERSION: u32 = 1;

const META_BEST_BLOCK_KEY: &[u8] = b"best_block";
const META_HEAD_BLOCKS_KEY: &[u8] = b"head_blocks";
const META_VERSION_KEY: &[u8] = b"version";
const META_SNAPSHOT_KEY: &[u8] = b"snapshot";
const FLUSH_CHUNK_OPS: usize = 10_000;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Coin {
    pub value: Amount,
    pub script_pubkey: Vec<u8>,
    pub height: i32,
    pub is_coinbase: bool,
}

impl Coin {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(self.script_pubkey.len() + 16);
        self.encode_into(&mut encoder);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let coin = Self::decode_from(&mut decoder)?;
        decoder.finish()?;
        Ok(coin)
    }

    pub(crate) fn encode_into(&self, encoder: &mut Encoder) {
        // Height and coinbase flag share one field.
        let code = ((self.height as u32) << 1) | u32::from(self.is_coinbase);
        encoder.write_u32_le(code);
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
    }

    pub(crate) fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let code = decoder.read_u32_le()?;
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        Ok(Self {
            value,
            script_pubkey,
            height: (code >> 1) as i32,
            is_coinbase: code & 1 == 1,
        })
    }
}

/// Outputs that can never be spent are not added to the coin set.
pub fn is_unspendable(script_pubkey: &[u8]) -> bool {
    script_pubkey.first() == Some(&0x6a)
}

#[derive(Debug)]
pub enum CoinsError {
    Store(StoreError),
    Decode(DecodeError),
    MissingInput(OutPoint),
    PrematureSpend(OutPoint),
    ValueOutOfRange,
    UnsupportedVersion(u32),
    Inconsistent(&'static str),
}

impl CoinsError {
    /// True when the error is a property of the block rather than of the
    /// database.
    pub fn is_invalid_block(&self) -> bool {
        matches!(
            self,
            CoinsError::MissingInput(_) | CoinsError::PrematureSpend(_) | CoinsError::ValueOutOfRange
        )
    }
}

impl std::fmt::Display for CoinsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoinsError::Store(err) => write!(f, "{err}"),
            CoinsError::Decode(err) => write!(f, "{err}"),
            CoinsError::MissingInput(outpoint) => write!(
                f,
                "missing input {}:{}",
                blockd_consensus::hash256_to_hex(&outpoint.hash),
                outpoint.index
            ),
            CoinsError::PrematureSpend(outpoint) => write!(
                f,
                "premature spend of coinbase {}:{}",
                blockd_consensus::hash256_to_hex(&outpoint.hash),
                outpoint.index
            ),
            CoinsError::ValueOutOfRange => write!(f, "transaction value out of range"),
            CoinsError::UnsupportedVersion(version) => {
                write!(f, "unsupported coins database version {version}")
            }
            CoinsError::Inconsistent(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for CoinsError {}

impl From<StoreError> for CoinsError {
    fn from(err: StoreError) -> Self {
        CoinsError::Store(err)
    }
}

impl From<DecodeError> for CoinsError {
    fn from(err: DecodeError) -> Self {
        CoinsError::Decode(err)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DisconnectResult {
    Ok,
    /// Undone, but some coin was missing or already present.
    Unclean,
    Failed,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SnapshotState {
    None,
    Unvalidated(Hash256),
    Validated(Hash256),
}

pub trait CoinsRead {
    fn read_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, CoinsError>;
}

/// Pending coin changes layered over a reader. `None` marks a spent coin.
#[derive(Default)]
pub struct CoinsOverlay {
    entries: HashMap<OutPoint, Option<Coin>>,
    best_block: Option<Hash256>,
}

impl CoinsOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn best_block(&self) -> Option<Hash256> {
        self.best_block
    }

    pub fn set_best_block(&mut self, hash: Hash256) {
        self.best_block = Some(hash);
    }

    pub fn get(&self, base: &dyn CoinsRead, outpoint: &OutPoint) -> Result<Option<Coin>, CoinsError> {
        match self.entries.get(outpoint) {
            Some(entry) => Ok(entry.clone()),
            None => base.read_coin(outpoint),
        }
    }

    fn staged_get(
        &self,
        staged: &HashMap<OutPoint, Option<Coin>>,
        base: &dyn CoinsRead,
        outpoint: &OutPoint,
    ) -> Result<Option<Coin>, CoinsError> {
        match staged.get(outpoint) {
            Some(entry) => Ok(entry.clone()),
            None => self.get(base, outpoint),
        }
    }

    /// Spends every input and adds every spendable output. Nothing is applied
    /// when an error is returned.
    pub fn connect_block(
        &mut self,
        base: &dyn CoinsRead,
        block: &Block,
        height: i32,
    ) -> Result<BlockUndo, CoinsError> {
        let mut staged: HashMap<OutPoint, Option<Coin>> = HashMap::new();
        let mut undo = BlockUndo::default();
        for tx in &block.transactions {
            let txid = tx.txid();
            if !tx.is_coinbase() {
                let mut value_in: Amount = 0;
                for input in &tx.vin {
                    let coin = self
                        .staged_get(&staged, base, &input.prevout)?
                        .ok_or(CoinsError::MissingInput(input.prevout))?;
                    if coin.is_coinbase && height - coin.height < COINBASE_MATURITY {
                        return Err(CoinsError::PrematureSpend(input.prevout));
                    }
                    value_in = value_in
                        .checked_add(coin.value)
                        .filter(|value| money_range(*value))
                        .ok_or(CoinsError::ValueOutOfRange)?;
                    staged.insert(input.prevout, None);
                    undo.spent.push(SpentCoin {
                        outpoint: input.prevout,
                        coin,
                    });
                }
                let value_out = tx
                    .value_out()
                    .filter(|value| money_range(*value))
                    .ok_or(CoinsError::ValueOutOfRange)?;
                if value_in < value_out {
                    return Err(CoinsError::ValueOutOfRange);
                }
            }
            for (index, output) in tx.vout.iter().enumerate() {
                if is_unspendable(&output.script_pubkey) {
                    continue;
                }
                staged.insert(
                    OutPoint::new(txid, index as u32),
                    Some(Coin {
                        value: output.value,
                        script_pubkey: output.script_pubkey.clone(),
                        height,
                        is_coinbase: tx.is_coinbase(),
                    }),
                );
            }
        }
        self.entries.extend(staged);
        self.best_block = Some(block.hash());
        Ok(undo)
    }

    /// Reverses `connect_block` using the block's undo data.
    pub fn disconnect_block(
        &mut self,
        base: &dyn CoinsRead,
        block: &Block,
        undo: &BlockUndo,
    ) -> Result<DisconnectResult, CoinsError> {
        let expected: usize = block
            .transactions
            .iter()
            .filter(|tx| !tx.is_coinbase())
            .map(|tx| tx.vin.len())
            .sum();
        if expected != undo.spent.len() {
            return Ok(DisconnectResult::Failed);
        }

        let mut clean = true;
        let mut staged: HashMap<OutPoint, Option<Coin>> = HashMap::new();
        let mut spent = undo.spent.iter().rev();
        for tx in block.transactions.iter().rev() {
            let txid = tx.txid();
            for (index, output) in tx.vout.iter().enumerate().rev() {
                if is_unspendable(&output.script_pubkey) {
                    continue;
                }
                let outpoint = OutPoint::new(txid, index as u32);
                match self.staged_get(&staged, base, &outpoint)? {
                    Some(coin)
                        if coin.value == output.value
                            && coin.script_pubkey == output.script_pubkey => {}
                    _ => clean = false,
                }
                staged.insert(outpoint, None);
            }
            if tx.is_coinbase() {
                continue;
            }
            for input in tx.vin.iter().rev() {
                let Some(entry) = spent.next() else {
                    return Ok(DisconnectResult::Failed);
                };
                if entry.outpoint != input.prevout {
                    return Ok(DisconnectResult::Failed);
                }
                if self.staged_get(&staged, base, &input.prevout)?.is_some() {
                    clean = false;
                }
                staged.insert(input.prevout, Some(entry.coin.clone()));
            }
        }
        self.entries.extend(staged);
        self.best_block = Some(block.header.prev_block);
        Ok(if clean {
            DisconnectResult::Ok
        } else {
            DisconnectResult::Unclean
        })
    }

    /// Re-applies a block whose effects may already be partially present.
    pub fn apply_replay(&mut self, block: &Block, height: i32) {
        for tx in &block.transactions {
            if !tx.is_coinbase() {
                for input in &tx.vin {
                    self.entries.insert(input.prevout, None);
                }
            }
            let txid = tx.txid();
            for (index, output) in tx.vout.iter().enumerate() {
                if is_unspendable(&output.script_pubkey) {
                    continue;
                }
                self.entries.insert(
                    OutPoint::new(txid, index as u32),
                    Some(Coin {
                        value: output.value,
                        script_pubkey: output.script_pubkey.clone(),
                        height,
                        is_coinbase: tx.is_coinbase(),
                    }),
                );
            }
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.best_block = None;
    }
}

/// Per-chainstate coin database.
pub trait CoinsDb: Send {
    fn best_block(&self) -> Result<Option<Hash256>, CoinsError>;
    /// Non-empty only while a flush was interrupted: `[new_tip, old_tip]`.
    fn head_blocks(&self) -> Result<Vec<Hash256>, CoinsError>;
    fn upgrade(&mut self) -> Result<(), CoinsError>;
    fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, CoinsError>;
    fn connect_block(&mut self, block: &Block, height: i32) -> Result<BlockUndo, CoinsError>;
    fn disconnect_block(
        &mut self,
        block: &Block,
        undo: &BlockUndo,
    ) -> Result<DisconnectResult, CoinsError>;
    fn apply_replay(&mut self, block: &Block, height: i32) -> Result<(), CoinsError>;
    fn set_best_block(&mut self, hash: Hash256);
    fn flush(&mut self) -> Result<(), CoinsError>;
    fn wipe(&mut self) -> Result<(), CoinsError>;
    fn is_empty(&self) -> Result<bool, CoinsError> {
        Ok(self.best_block()?.is_none())
    }
    fn coin_count(&self) -> Result<u64, CoinsError>;
    /// Number of pending changes not yet flushed.
    fn cache_len(&self) -> usize;
    /// Hash over the flushed coin set in key order, with the coin count.
    fn coins_hash(&self) -> Result<(Hash256, u64), CoinsError>;
    fn load_snapshot(&mut self, coins: &[(OutPoint, Coin)], base: Hash256)
        -> Result<(), CoinsError>;
    fn snapshot_state(&self) -> Result<SnapshotState, CoinsError>;
    fn set_snapshot_state(&mut self, state: SnapshotState) -> Result<(), CoinsError>;
}

struct StoreView<'a, S>(&'a S);

impl<S: KeyValueStore> CoinsRead for StoreView<'_, S> {
    fn read_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, CoinsError> {
        match self.0.get(Column::Coins, &outpoint.to_key())? {
            Some(bytes) => Ok(Some(Coin::decode(&bytes)?)),
            None => Ok(None),
        }
    }
}

pub struct KvCoinsDb<S> {
    store: Arc<S>,
    cache: CoinsOverlay,
}

impl<S: KeyValueStore> KvCoinsDb<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            cache: CoinsOverlay::new(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    fn stored_best_block(&self) -> Result<Option<Hash256>, CoinsError> {
        match self.store.get(Column::CoinsMeta, META_BEST_BLOCK_KEY)? {
            Some(bytes) => Ok(Some(
                bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| CoinsError::Inconsistent("malformed best block"))?,
            )),
            None => Ok(None),
        }
    }

    fn write_chunked(&self, batch: &mut WriteBatch) -> Result<(), CoinsError> {
        if batch.len() >= FLUSH_CHUNK_OPS {
            self.store.write_batch(batch)?;
            *batch = WriteBatch::new();
        }
        Ok(())
    }
}

impl<S: KeyValueStore + 'static> CoinsDb for KvCoinsDb<S> {
    fn best_block(&self) -> Result<Option<Hash256>, CoinsError> {
        match self.cache.best_block() {
            Some(hash) => Ok(Some(hash)),
            None => self.stored_best_block(),
        }
    }

    fn head_blocks(&self) -> Result<Vec<Hash256>, CoinsError> {
        let Some(bytes) = self.store.get(Column::CoinsMeta, META_HEAD_BLOCKS_KEY)? else {
            return Ok(Vec::new());
        };
        if bytes.len() % 32 != 0 {
            return Err(CoinsError::Inconsistent("malformed head blocks"));
        }
        Ok(bytes
            .chunks(32)
            .map(|chunk| {
                let mut hash = [0u8; 32];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect())
    }

    fn upgrade(&mut self) -> Result<(), CoinsError> {
        match self.store.get(Column::CoinsMeta, META_VERSION_KEY)? {
            Some(bytes) => {
                let version = u32::from_le_bytes(
                    bytes
                        .as_slice()
                        .try_into()
                        .map_err(|_| CoinsError::Inconsistent("malformed coins version"))?,
                );
                if version > COINS_DB_VERSION {
                    return Err(CoinsError::UnsupportedVersion(version));
                }
                if version < COINS_DB_VERSION {
                    blockd_log::log_info!(
                        "Upgrading coins database from version {} to {}",
                        version,
                        COINS_DB_VERSION
                    );
                    self.store.put(
                        Column::CoinsMeta,
                        META_VERSION_KEY,
                        &COINS_DB_VERSION.to_le_bytes(),
                    )?;
                }
            }
            None => {
                self.store.put(
                    Column::CoinsMeta,
                    META_VERSION_KEY,
                    &COINS_DB_VERSION.to_le_bytes(),
                )?;
            }
        }
        Ok(())
    }

    fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, CoinsError> {
        self.cache.get(&StoreView(self.store.as_ref()), outpoint)
    }

    fn connect_block(&mut self, block: &Block, height: i32) -> Result<BlockUndo, CoinsError> {
        let view = StoreView(self.store.as_ref());
        self.cache.connect_block(&view, block, height)
    }

    fn disconnect_block(
        &mut self,
        block: &Block,
        undo: &BlockUndo,
    ) -> Result<DisconnectResult, CoinsError> {
        let view = StoreView(self.store.as_ref());
        self.cache.disconnect_block(&view, block, undo)
    }

    fn apply_replay(&mut self, block: &Block, height: i32) -> Result<(), CoinsError> {
        self.cache.apply_replay(block, height);
        Ok(())
    }

    fn set_best_block(&mut self, hash: Hash256) {
        self.cache.set_best_block(hash);
    }

    fn flush(&mut self) -> Result<(), CoinsError> {
        let Some(best) = self.cache.best_block() else {
            if self.cache.is_empty() {
                return Ok(());
            }
            return Err(CoinsError::Inconsistent("flushing coins without a best block"));
        };
        let old = self.stored_best_block()?.unwrap_or([0u8; 32]);

        let mut heads = Vec::with_capacity(64);
        heads.extend_from_slice(&best);
        heads.extend_from_slice(&old);
        let mut marker = WriteBatch::new();
        marker.put(Column::CoinsMeta, META_HEAD_BLOCKS_KEY, heads);
        self.store.write_batch(&marker)?;

        let mut batch = WriteBatch::new();
        for (outpoint, entry) in &self.cache.entries {
            match entry {
                Some(coin) => batch.put(Column::Coins, outpoint.to_key(), coin.encode()),
                None => batch.delete(Column::Coins, outpoint.to_key()),
            }
            self.write_chunked(&mut batch)?;
        }
        batch.delete(Column::CoinsMeta, META_HEAD_BLOCKS_KEY);
        batch.put(Column::CoinsMeta, META_BEST_BLOCK_KEY, best);
        self.store.write_batch(&batch)?;
        self.store.sync()?;

        blockd_log::log_category!(
            blockd_log::Category::Coins,
            "Flushed {} coin changes at {}",
            self.cache.len(),
            blockd_consensus::hash256_to_hex(&best)
        );
        self.cache.clear();
        Ok(())
    }

    fn wipe(&mut self) -> Result<(), CoinsError> {
        self.store.clear_column(Column::Coins)?;
        self.store.clear_column(Column::CoinsMeta)?;
        self.cache.clear();
        Ok(())
    }

    fn coin_count(&self) -> Result<u64, CoinsError> {
        let mut count = 0u64;
        let mut visitor = |_: &[u8], _: &[u8]| {
            count += 1;
            Ok(())
        };
        self.store
            .for_each_prefix(Column::Coins, &[], &mut visitor)?;
        Ok(count)
    }

    fn cache_len(&self) -> usize {
        self.cache.len()
    }

    fn coins_hash(&self) -> Result<(Hash256, u64), CoinsError> {
        if !self.cache.is_empty() {
            return Err(CoinsError::Inconsistent("coins cache not flushed"));
        }
        let mut writer = Sha256dWriter::new();
        let mut count = 0u64;
        let mut visitor = |key: &[u8], value: &[u8]| {
            writer.update(key).update(value);
            count += 1;
            Ok(())
        };
        self.store
            .for_each_prefix(Column::Coins, &[], &mut visitor)?;
        Ok((writer.finalize(), count))
    }

    fn load_snapshot(
        &mut self,
        coins: &[(OutPoint, Coin)],
        base: Hash256,
    ) -> Result<(), CoinsError> {
        self.wipe()?;
        let mut batch = WriteBatch::new();
        for (outpoint, coin) in coins {
            batch.put(Column::Coins, outpoint.to_key(), coin.encode());
            self.write_chunked(&mut batch)?;
        }
        batch.put(
            Column::CoinsMeta,
            META_VERSION_KEY,
            COINS_DB_VERSION.to_le_bytes(),
        );
        batch.put(Column::CoinsMeta, META_BEST_BLOCK_KEY, base);
        batch.put(
            Column::CoinsMeta,
            META_SNAPSHOT_KEY,
            encode_snapshot_state(SnapshotState::Unvalidated(base)),
        );
        self.store.write_batch(&batch)?;
        self.store.sync()?;
        Ok(())
    }

    fn snapshot_state(&self) -> Result<SnapshotState, CoinsError> {
        match self.store.get(Column::CoinsMeta, META_SNAPSHOT_KEY)? {
            Some(bytes) => decode_snapshot_state(&bytes)
                .ok_or(CoinsError::Inconsistent("malformed snapshot marker")),
            None => Ok(SnapshotState::None),
        }
    }

    fn set_snapshot_state(&mut self, state: SnapshotState) -> Result<(), CoinsError> {
        match state {
            SnapshotState::None => self.store.delete(Column::CoinsMeta, META_SNAPSHOT_KEY)?,
            other => self.store.put(
                Column::CoinsMeta,
                META_SNAPSHOT_KEY,
                &encode_snapshot_state(other),
            )?,
        }
        Ok(())
    }
}

fn encode_snapshot_state(state: SnapshotState) -> Vec<u8> {
    let (tag, hash) = match state {
        SnapshotState::None => return Vec::new(),
        SnapshotState::Unvalidated(hash) => (0u8, hash),
        SnapshotState::Validated(hash) => (1u8, hash),
    };
    let mut out = Vec::with_capacity(33);
    out.push(tag);
    out.extend_from_slice(&hash);
    out
}

fn decode_snapshot_state(bytes: &[u8]) -> Option<SnapshotState> {
    if bytes.len() != 33 {
        return None;
    }
    let hash: Hash256 = bytes[1..].try_into().ok()?;
    match bytes[0] {
        0 => Some(SnapshotState::Unvalidated(hash)),
        1 => Some(SnapshotState::Validated(hash)),
        _ => None,
    }
}

/// Which coin database a chainstate is backed by.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CoinsSlot {
    Primary,
    Snapshot,
}

impl CoinsSlot {
    pub fn as_str(self) -> &'static str {
        match self {
            CoinsSlot::Primary => "chainstate",
            CoinsSlot::Snapshot => "chainstate_snapshot",
        }
    }
}

/// Opens coin databases for the chainstate manager.
pub trait CoinsDbFactory: Send + Sync {
    fn open(&self, slot: CoinsSlot, wipe: bool) -> Result<Box<dyn CoinsDb>, CoinsError>;
    fn exists(&self, slot: CoinsSlot) -> bool;
    fn remove(&self, slot: CoinsSlot) -> Result<(), CoinsError>;
}

/// In-memory coin databases that survive being reopened, so a manager can be
/// rebuilt over the same state.
#[derive(Default)]
pub struct MemoryCoinsFactory {
    stores: Mutex<HashMap<CoinsSlot, Arc<MemoryStore>>>,
}

impl MemoryCoinsFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, slot: CoinsSlot) -> Option<Arc<MemoryStore>> {
        self.stores
            .lock()
            .expect("coins factory lock")
            .get(&slot)
            .cloned()
    }
}

impl CoinsDbFactory for MemoryCoinsFactory {
    fn open(&self, slot: CoinsSlot, wipe: bool) -> Result<Box<dyn CoinsDb>, CoinsError> {
        let store = {
            let mut stores = self.stores.lock().expect("coins factory lock");
            Arc::clone(stores.entry(slot).or_default())
        };
        let mut db = KvCoinsDb::new(store);
        if wipe {
            db.wipe()?;
        }
        Ok(Box::new(db))
    }

    fn exists(&self, slot: CoinsSlot) -> bool {
        self.store(slot)
            .is_some_and(|store| !store.is_empty(Column::CoinsMeta))
    }

    fn remove(&self, slot: CoinsSlot) -> Result<(), CoinsError> {
        self.stores.lock().expect("coins factory lock").remove(&slot);
        Ok(())
    }
}

/// A throwaway view over a chainstate's coins; nothing written here reaches
/// the database.
pub struct ScratchCoins<'a> {
    base: &'a dyn CoinsDb,
}

impl<'a> ScratchCoins<'a> {
    pub fn new(base: &'a dyn CoinsDb) -> Self {
        Self { base }
    }
}

impl CoinsRead for ScratchCoins<'_> {
    fn read_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, CoinsError> {
        self.base.get_coin(outpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockd_primitives::block::BlockHeader;
    use blockd_primitives::transaction::{Transaction, TxIn, TxOut, SEQUENCE_FINAL};

    fn coinbase(tag: u8, value: Amount) -> Transaction {
        Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout: OutPoint::null(),
                script_sig: vec![1, tag],
                sequence: SEQUENCE_FINAL,
            }],
            vout: vec![TxOut {
                value,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    fn spend(prevout: OutPoint, value: Amount) -> Transaction {
        Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout,
                script_sig: Vec::new(),
                sequence: SEQUENCE_FINAL,
            }],
            vout: vec![TxOut {
                value,
                script_pubkey: vec![0x52],
            }],
            lock_time: 0,
        }
    }

    fn block(prev: Hash256, transactions: Vec<Transaction>) -> Block {
        Block {
            header: BlockHeader {
                version: 4,
                prev_block: prev,
                merkle_root: [0u8; 32],
                time: 0,
                bits: 0x207fffff,
                nonce: 0,
            },
            transactions,
        }
    }

    #[test]
    fn coin_codec_packs_height_and_flag() {
        let coin = Coin {
            value: 5,
            script_pubkey: vec![1, 2],
            height: 1234,
            is_coinbase: true,
        };
        assert_eq!(Coin::decode(&coin.encode()).expect("decode"), coin);
    }

    #[test]
    fn connect_then_disconnect_restores_coins() {
        let mut db = KvCoinsDb::new(Arc::new(MemoryStore::new()));
        let funding = block([0u8; 32], vec![coinbase(1, 50)]);
        let funding_txid = funding.transactions[0].txid();
        db.connect_block(&funding, 1).expect("connect funding");
        db.flush().expect("flush");

        let spending = block(
            funding.hash(),
            vec![coinbase(2, 50), spend(OutPoint::new(funding_txid, 0), 40)],
        );
        let undo = db.connect_block(&spending, 101).expect("connect spend");
        assert_eq!(undo.spent.len(), 1);
        assert!(db
            .get_coin(&OutPoint::new(funding_txid, 0))
            .expect("get")
            .is_none());

        let result = db.disconnect_block(&spending, &undo).expect("disconnect");
        assert_eq!(result, DisconnectResult::Ok);
        assert!(db
            .get_coin(&OutPoint::new(funding_txid, 0))
            .expect("get")
            .is_some());
        assert_eq!(db.best_block().expect("best"), Some(funding.hash()));
    }

    #[test]
    fn immature_coinbase_spend_is_rejected_atomically() {
        let mut db = KvCoinsDb::new(Arc::new(MemoryStore::new()));
        let funding = block([0u8; 32], vec![coinbase(1, 50)]);
        let funding_txid = funding.transactions[0].txid();
        db.connect_block(&funding, 1).expect("connect");
        let before = db.cache_len();

        let spending = block(
            funding.hash(),
            vec![coinbase(2, 50), spend(OutPoint::new(funding_txid, 0), 40)],
        );
        let err = db.connect_block(&spending, 50).expect_err("immature");
        assert!(err.is_invalid_block());
        assert_eq!(db.cache_len(), before);
        assert_eq!(db.best_block().expect("best"), Some(funding.hash()));
    }

    #[test]
    fn flush_clears_head_marker_and_persists_best() {
        let store = Arc::new(MemoryStore::new());
        let mut db = KvCoinsDb::new(Arc::clone(&store));
        let funding = block([0u8; 32], vec![coinbase(1, 50)]);
        db.connect_block(&funding, 1).expect("connect");
        db.flush().expect("flush");
        assert!(db.head_blocks().expect("heads").is_empty());

        let reopened = KvCoinsDb::new(store);
        assert_eq!(reopened.best_block().expect("best"), Some(funding.hash()));
        assert_eq!(reopened.coin_count().expect("count"), 1);
    }

    #[test]
    fn upgrade_rejects_newer_versions() {
        let store = Arc::new(MemoryStore::new());
        store
            .put(Column::CoinsMeta, META_VERSION_KEY, &9u32.to_le_bytes())
            .expect("put");
        let mut db = KvCoinsDb::new(store);
        assert!(matches!(db.upgrade(), Err(CoinsError::UnsupportedVersion(9))));
    }

    #[test]
    fn snapshot_load_marks_state_and_hash_is_stable() {
        let mut first = KvCoinsDb::new(Arc::new(MemoryStore::new()));
        let mut second = KvCoinsDb::new(Arc::new(MemoryStore::new()));
        let coins = vec![
            (
                OutPoint::new([1u8; 32], 0),
                Coin {
                    value: 10,
                    script_pubkey: vec![0x51],
                    height: 3,
                    is_coinbase: false,
                },
            ),
            (
                OutPoint::new([2u8; 32], 1),
                Coin {
                    value: 20,
                    script_pubkey: vec![0x52],
                    height: 4,
                    is_coinbase: true,
                },
            ),
        ];
        first.load_snapshot(&coins, [7u8; 32]).expect("load");
        let reversed: Vec<_> = coins.iter().rev().cloned().collect();
        second.load_snapshot(&reversed, [7u8; 32]).expect("load");
        assert_eq!(
            first.coins_hash().expect("hash"),
            second.coins_hash().expect("hash")
        );
        assert_eq!(
            first.snapshot_state().expect("state"),
            SnapshotState::Unvalidated([7u8; 32])
        );
        assert_eq!(first.best_block().expect("best"), Some([7u8; 32]));
    }

    #[test]
    fn memory_factory_reopens_same_store() {
        let factory = MemoryCoinsFactory::new();
        let mut db = factory.open(CoinsSlot::Primary, false).expect("open");
        db.set_best_block([5u8; 32]);
        db.flush().expect("flush");
        assert!(factory.exists(CoinsSlot::Primary));
        let db = factory.open(CoinsSlot::Primary, false).expect("reopen");
        assert_eq!(db.best_block().expect("best"), Some([5u8; 32]));
        let db = factory.open(CoinsSlot::Primary, true).expect("wipe");
        assert!(db.is_empty().expect("empty"));
        assert!(!factory.exists(CoinsSlot::Snapshot));
    }
}
