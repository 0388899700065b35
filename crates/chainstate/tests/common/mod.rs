#![allow(dead_code)]

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use blockd_chainstate::blockstorage::{BlockManagerOptions, PruneMode};
use blockd_chainstate::coins::MemoryCoinsFactory;
use blockd_chainstate::genesis::genesis_block;
use blockd_chainstate::validation::PowValidator;
use blockd_chainstate::{
    ChainstateManager, ChainstateManagerOptions, LoggingNotifications, Notifications,
    SignalInterrupt,
};
use blockd_consensus::params::ConsensusParams;
use blockd_consensus::{consensus_params, Network};
use blockd_pow::check_proof_of_work;
use blockd_primitives::block::{merkle_root, Block, BlockHeader};
use blockd_primitives::outpoint::OutPoint;
use blockd_primitives::transaction::{Transaction, TxIn, TxOut, SEQUENCE_FINAL};
use blockd_storage::memory::MemoryStore;

pub const REGTEST_MAGIC: [u8; 4] = [0xfa, 0xbf, 0xb5, 0xda];

/// Durable state that survives a node restart.
#[derive(Clone)]
pub struct Disk {
    pub store: Arc<MemoryStore>,
    pub coins: Arc<MemoryCoinsFactory>,
}

impl Disk {
    pub fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            coins: Arc::new(MemoryCoinsFactory::new()),
        }
    }
}

pub fn options(dir: &Path, prune: PruneMode) -> ChainstateManagerOptions {
    ChainstateManagerOptions {
        blockman: BlockManagerOptions {
            blocks_dir: dir.to_path_buf(),
            message_start: REGTEST_MAGIC,
            prune,
            fast_prune: true,
        },
        ..ChainstateManagerOptions::default()
    }
}

pub fn start(
    opts: ChainstateManagerOptions,
    params: ConsensusParams,
    disk: &Disk,
    interrupt: SignalInterrupt,
    notifications: Option<Arc<dyn Notifications>>,
) -> ChainstateManager<MemoryStore> {
    let notifications = notifications
        .unwrap_or_else(|| Arc::new(LoggingNotifications::new(interrupt.clone())));
    ChainstateManager::new(
        opts,
        params.clone(),
        Arc::clone(&disk.store),
        disk.coins.clone(),
        Arc::new(PowValidator::new(params)),
        notifications,
        interrupt,
    )
}

pub fn node(dir: &Path, disk: &Disk) -> ChainstateManager<MemoryStore> {
    start(
        options(dir, PruneMode::Disabled),
        consensus_params(Network::Regtest),
        disk,
        SignalInterrupt::new(),
        None,
    )
}

pub fn coinbase(height: i32, script_len: usize) -> Transaction {
    let mut script_sig = vec![4];
    script_sig.extend_from_slice(&height.to_le_bytes());
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig,
            sequence: SEQUENCE_FINAL,
        }],
        vout: vec![TxOut {
            value: 50,
            script_pubkey: vec![0x51; script_len.max(1)],
        }],
        lock_time: 0,
    }
}

pub fn mine(prev: &Block, height: i32, script_len: usize, params: &ConsensusParams) -> Block {
    let transactions = vec![coinbase(height, script_len)];
    let txids: Vec<_> = transactions.iter().map(|tx| tx.txid()).collect();
    let mut block = Block {
        header: BlockHeader {
            version: 4,
            prev_block: prev.hash(),
            merkle_root: merkle_root(&txids).0,
            time: prev.header.time + 600,
            bits: params.genesis_bits,
            nonce: 0,
        },
        transactions,
    };
    while check_proof_of_work(&block.hash(), block.header.bits, params).is_err() {
        block.header.nonce += 1;
    }
    block
}

/// `count` blocks on top of `prev`, which sits at `prev_height`.
pub fn mine_chain(
    prev: &Block,
    prev_height: i32,
    count: usize,
    script_len: usize,
    params: &ConsensusParams,
) -> Vec<Block> {
    let mut blocks: Vec<Block> = Vec::with_capacity(count);
    for n in 0..count {
        let parent = blocks.last().unwrap_or(prev);
        let block = mine(parent, prev_height + 1 + n as i32, script_len, params);
        blocks.push(block);
    }
    blocks
}

pub fn genesis(params: &ConsensusParams) -> Block {
    genesis_block(params).expect("genesis")
}

/// Writes blocks framed the way block files frame them.
pub fn write_dump(path: &Path, blocks: &[Block]) {
    let mut file = std::fs::File::create(path).expect("create dump");
    for block in blocks {
        let bytes = block.consensus_encode();
        file.write_all(&REGTEST_MAGIC).expect("magic");
        file.write_all(&(bytes.len() as u32).to_le_bytes()).expect("len");
        file.write_all(&bytes).expect("payload");
    }
    file.sync_all().expect("sync dump");
}

pub fn connect_all(chainman: &ChainstateManager<MemoryStore>, blocks: &[Block]) {
    for block in blocks {
        chainman.accept_block(block, None).expect("accept");
    }
    chainman.activate_best_chain().expect("activate");
}
