mod common;

use std::io::{Read, Seek, SeekFrom, Write};

use blockd_chainstate::blockstorage::PruneMode;
use blockd_chainstate::prune::{PruneLockInfo, MIN_BLOCKS_TO_KEEP};
use blockd_chainstate::{
    ChainstateLoadOptions, ChainstateManager, ChainstateRole, FlushMode, SignalInterrupt,
};
use blockd_consensus::{consensus_params, Network};
use blockd_primitives::block::Block;
use blockd_storage::memory::MemoryStore;

use common::{connect_all, genesis, mine_chain, node, options, start, Disk};

#[test]
fn block_and_undo_round_trip_and_corruption_is_detected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let disk = Disk::new();
    let params = consensus_params(Network::Regtest);
    let blocks = mine_chain(&genesis(&params), 0, 3, 40, &params);
    let chainman = node(dir.path(), &disk);
    chainman
        .load_chainstate(&ChainstateLoadOptions::default())
        .expect("load");
    connect_all(&chainman, &blocks);

    for block in &blocks {
        let raw = chainman.read_raw_block(&block.hash()).expect("raw");
        assert_eq!(raw, block.consensus_encode());
        assert_eq!(&chainman.read_block(&block.hash()).expect("decoded"), block);
    }

    let node = chainman
        .lookup_block_index(&blocks[1].hash())
        .expect("indexed");
    assert!(node.have_undo());
    chainman
        .blockman()
        .read_undo_for_node(&node)
        .expect("undo reads back");

    let undo_pos = node.undo_pos().expect("undo position");
    let path = chainman.blockman().undo_files().file_name(undo_pos.file);
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .expect("open rev file");
    file.seek(SeekFrom::Start(u64::from(undo_pos.pos)))
        .expect("seek");
    let mut byte = [0u8; 1];
    file.read_exact(&mut byte).expect("read byte");
    file.seek(SeekFrom::Start(u64::from(undo_pos.pos)))
        .expect("seek back");
    file.write_all(&[byte[0] ^ 0xff]).expect("corrupt");
    file.sync_all().expect("sync");
    drop(file);

    assert!(chainman.blockman().read_undo_for_node(&node).is_err());
    let other = chainman
        .lookup_block_index(&blocks[2].hash())
        .expect("indexed");
    assert!(chainman.blockman().read_undo_for_node(&other).is_ok());
}

#[test]
fn block_files_roll_over_under_the_size_limit() {
    let dir = tempfile::tempdir().expect("tempdir");
    let disk = Disk::new();
    let params = consensus_params(Network::Regtest);
    let blocks = mine_chain(&genesis(&params), 0, 60, 3000, &params);
    let chainman = node(dir.path(), &disk);
    chainman
        .load_chainstate(&ChainstateLoadOptions::default())
        .expect("load");
    for block in &blocks {
        chainman.accept_block(block, None).expect("accept");
    }

    let max = chainman.blockman().max_blockfile_size();
    let files = chainman.blockman().file_count() as u32;
    assert!(files >= 3, "expected several block files, got {files}");
    let mut total = 0;
    let mut next_height = 0;
    for file in 0..files {
        let info = chainman.blockman().file_info(file).expect("info");
        assert!(info.size < max, "file {file} grew to {}", info.size);
        assert!(info.blocks > 0);
        assert_eq!(info.height_first, next_height);
        next_height = info.height_last + 1;
        total += info.blocks;
        assert!(chainman.blockman().block_files().exists(file));
    }
    assert_eq!(total, 61);
    assert_eq!(next_height, 61);
}

#[test]
fn prune_lock_keeps_its_range() {
    let dir = tempfile::tempdir().expect("tempdir");
    let disk = Disk::new();
    let params = consensus_params(Network::Regtest);
    let count = (MIN_BLOCKS_TO_KEEP + 100) as usize;
    let blocks = mine_chain(&genesis(&params), 0, count, 1000, &params);
    let chainman = start(
        options(dir.path(), PruneMode::Manual),
        params,
        &disk,
        SignalInterrupt::new(),
        None,
    );
    chainman
        .load_chainstate(&ChainstateLoadOptions::default())
        .expect("load");
    connect_all(&chainman, &blocks);
    let tip_height = chainman.active_tip().expect("tip").height;
    assert_eq!(tip_height, count as i32);

    let lock_height = 100;
    chainman.set_prune_lock("index", PruneLockInfo { height_first: lock_height });
    chainman.prune_manual(tip_height).expect("prune");

    assert!(chainman.blockman().have_pruned());
    assert!(!chainman.blockman().block_files().exists(0));
    assert!(chainman.is_block_pruned(&blocks[0].hash()));
    for (n, block) in blocks.iter().enumerate() {
        let height = n as i32 + 1;
        let node = chainman.lookup_block_index(&block.hash()).expect("indexed");
        if height >= lock_height {
            assert!(node.have_data(), "block at {height} was pruned");
            chainman.read_block(&block.hash()).expect("still readable");
        }
    }
    for file in 0..chainman.blockman().file_count() as u32 {
        let info = chainman.blockman().file_info(file).expect("info");
        if info.size == 0 {
            continue;
        }
        assert!(chainman.blockman().block_files().exists(file));
    }
    let tip = chainman.tip(ChainstateRole::Normal).expect("tip");
    assert!(chainman.check_data_availability(&tip.hash, &blocks[lock_height as usize].hash()));
    assert!(!chainman.check_data_availability(&tip.hash, &chainman.params().hash_genesis_block));

    assert!(chainman.delete_prune_lock("index"));
    assert!(!chainman.delete_prune_lock("index"));
}

const PRUNE_TARGET: u64 = 400_000;

/// A node with automatic pruning that has connected `count` blocks, flushing
/// every hundred.
fn pruning_node(
    dir: &std::path::Path,
    disk: &Disk,
    count: usize,
) -> (ChainstateManager<MemoryStore>, Vec<Block>) {
    let params = consensus_params(Network::Regtest);
    let blocks = mine_chain(&genesis(&params), 0, count, 500, &params);
    let chainman = start(
        options(dir, PruneMode::Target(PRUNE_TARGET)),
        params,
        disk,
        SignalInterrupt::new(),
        None,
    );
    chainman
        .load_chainstate(&ChainstateLoadOptions::default())
        .expect("load");
    for batch in blocks.chunks(100) {
        connect_all(&chainman, batch);
        chainman.flush_state(FlushMode::IfNeeded).expect("flush");
    }
    (chainman, blocks)
}

#[test]
fn automatic_pruning_keeps_recent_blocks() {
    let dir = tempfile::tempdir().expect("tempdir");
    let disk = Disk::new();
    let (chainman, blocks) = pruning_node(dir.path(), &disk, 1400);

    let tip = chainman.active_tip().expect("tip");
    assert_eq!(tip.height, 1400);
    assert!(chainman.blockman().have_pruned());
    assert!(chainman.is_block_pruned(&chainman.params().hash_genesis_block));

    let min_kept = blocks
        .iter()
        .position(|block| {
            chainman
                .lookup_block_index(&block.hash())
                .expect("indexed")
                .have_data()
        })
        .map(|n| n as i32 + 1)
        .expect("recent blocks kept");
    assert!(min_kept > 1, "nothing was pruned");
    assert!(min_kept <= 1400 - MIN_BLOCKS_TO_KEEP + 1, "kept from {min_kept}");
    for (n, block) in blocks.iter().enumerate() {
        let height = n as i32 + 1;
        if height < min_kept {
            assert!(chainman.is_block_pruned(&block.hash()), "block {height}");
        } else {
            assert_eq!(&chainman.read_block(&block.hash()).expect("readable"), block);
        }
    }

    let mut first_kept_file = None;
    for file in 0..chainman.blockman().file_count() as u32 {
        let info = chainman.blockman().file_info(file).expect("info");
        let on_disk = chainman.blockman().block_files().exists(file);
        if info.size == 0 {
            assert!(!on_disk, "blk{file:05}.dat left behind");
            assert!(!chainman.blockman().undo_files().exists(file));
        } else {
            assert!(on_disk);
            first_kept_file.get_or_insert(info.height_first);
        }
    }
    assert_eq!(first_kept_file, Some(min_kept));
}

#[test]
fn automatic_pruning_waits_for_prune_after_height() {
    let dir = tempfile::tempdir().expect("tempdir");
    let disk = Disk::new();
    let (chainman, blocks) = pruning_node(dir.path(), &disk, 1000);

    assert_eq!(chainman.active_tip().expect("tip").height, 1000);
    assert!(chainman.blockman().calculate_current_usage() >= PRUNE_TARGET);
    assert!(!chainman.blockman().have_pruned());
    for file in 0..chainman.blockman().file_count() as u32 {
        assert!(chainman.blockman().block_files().exists(file));
    }
    for block in &blocks {
        let node = chainman.lookup_block_index(&block.hash()).expect("indexed");
        assert!(node.have_data());
    }
}
