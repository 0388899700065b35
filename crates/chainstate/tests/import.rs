mod common;

use std::sync::Arc;

use blockd_chainstate::blockstorage::PruneMode;
use blockd_chainstate::{
    ChainstateLoadOptions, FlushMode, GenesisSignal, ImportOptions, ImportOutcome, Notifications,
    SignalInterrupt, StartupEvent,
};
use blockd_consensus::{consensus_params, Hash256, Network};
use blockd_primitives::block::Block;

use common::{connect_all, genesis, mine_chain, node, options, start, write_dump, Disk, REGTEST_MAGIC};

fn frame(block: &Block) -> Vec<u8> {
    let bytes = block.consensus_encode();
    let mut framed = REGTEST_MAGIC.to_vec();
    framed.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    framed.extend_from_slice(&bytes);
    framed
}

/// Requests shutdown the first time the best header reaches `height`.
struct InterruptAtHeader {
    height: i32,
    interrupt: SignalInterrupt,
}

impl Notifications for InterruptAtHeader {
    fn header_tip(&self, _hash: &Hash256, height: i32) {
        if height == self.height {
            self.interrupt.request();
        }
    }

    fn flush_error(&self, _message: &str) {}

    fn fatal_error(&self, _message: &str) {
        self.interrupt.request();
    }
}

#[test]
fn interrupted_import_resumes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dump_dir = tempfile::tempdir().expect("dump dir");
    let disk = Disk::new();
    let params = consensus_params(Network::Regtest);
    let blocks = mine_chain(&genesis(&params), 0, 10, 40, &params);
    let dump = dump_dir.path().join("bootstrap.dat");
    write_dump(&dump, &blocks);

    let interrupt = SignalInterrupt::new();
    let notifications = Arc::new(InterruptAtHeader {
        height: 4,
        interrupt: interrupt.clone(),
    });
    let chainman = start(
        options(dir.path(), PruneMode::Disabled),
        params,
        &disk,
        interrupt.clone(),
        Some(notifications),
    );
    chainman
        .load_chainstate(&ChainstateLoadOptions::default())
        .expect("load");
    let import = ImportOptions {
        files: vec![dump.clone()],
        stop_after_import: false,
    };

    let (signal, events) = GenesisSignal::new();
    let first = chainman.import_blocks(&import, &signal).expect("first import");
    assert_eq!(first, ImportOutcome::Interrupted);
    assert_eq!(events.try_recv().ok(), Some(StartupEvent::Interrupted));
    assert_eq!(chainman.with_state(|state| state.index.len()), 5);

    interrupt.reset();
    let (signal, events) = GenesisSignal::new();
    let second = chainman.import_blocks(&import, &signal).expect("second import");
    assert_eq!(second, ImportOutcome::Completed);
    assert_eq!(events.try_recv().ok(), Some(StartupEvent::GenesisConnected));

    assert_eq!(chainman.with_state(|state| state.index.len()), 11);
    let stored: u32 = (0..chainman.blockman().file_count() as u32)
        .filter_map(|file| chainman.blockman().file_info(file))
        .map(|info| info.blocks)
        .sum();
    assert_eq!(stored, 11);
    let tip = chainman.active_tip().expect("tip");
    assert_eq!(tip.height, 10);
    assert_eq!(tip.hash, blocks[9].hash());
}

#[test]
fn missing_dump_file_is_skipped() {
    let dir = tempfile::tempdir().expect("tempdir");
    let disk = Disk::new();
    let interrupt = SignalInterrupt::new();
    let chainman = start(
        options(dir.path(), PruneMode::Disabled),
        consensus_params(Network::Regtest),
        &disk,
        interrupt.clone(),
        None,
    );
    chainman
        .load_chainstate(&ChainstateLoadOptions::default())
        .expect("load");
    let import = ImportOptions {
        files: vec![dir.path().join("does-not-exist.dat")],
        stop_after_import: true,
    };
    let (signal, events) = GenesisSignal::new();
    let outcome = chainman.import_blocks(&import, &signal).expect("import");
    assert_eq!(outcome, ImportOutcome::Completed);
    assert_eq!(events.try_recv().ok(), Some(StartupEvent::GenesisConnected));
    assert_eq!(chainman.active_tip().expect("tip").height, 0);
    assert!(interrupt.is_set());
}

#[test]
fn out_of_order_dump_blocks_wait_for_parent_only_on_reindex() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dump_dir = tempfile::tempdir().expect("dump dir");
    let disk = Disk::new();
    let params = consensus_params(Network::Regtest);
    let blocks = mine_chain(&genesis(&params), 0, 3, 10, &params);
    let dump = dump_dir.path().join("shuffled.dat");
    write_dump(&dump, &[blocks[1].clone(), blocks[0].clone(), blocks[2].clone()]);

    let chainman = start(
        options(dir.path(), PruneMode::Disabled),
        params,
        &disk,
        SignalInterrupt::new(),
        None,
    );
    chainman
        .load_chainstate(&ChainstateLoadOptions::default())
        .expect("load");
    let (signal, _events) = GenesisSignal::new();
    chainman
        .import_blocks(
            &ImportOptions {
                files: vec![dump],
                stop_after_import: false,
            },
            &signal,
        )
        .expect("import");
    assert!(chainman.lookup_block_index(&blocks[1].hash()).is_none());
    assert_eq!(chainman.active_tip().expect("tip").height, 1);
}

#[test]
fn torn_record_does_not_hide_the_next_block() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dump_dir = tempfile::tempdir().expect("dump dir");
    let disk = Disk::new();
    let params = consensus_params(Network::Regtest);
    let blocks = mine_chain(&genesis(&params), 0, 3, 10, &params);

    // A write cut off right after its magic, followed by a complete record.
    let mut bytes = frame(&genesis(&params));
    bytes.extend_from_slice(&REGTEST_MAGIC);
    for block in &blocks {
        bytes.extend_from_slice(&frame(block));
    }
    let dump = dump_dir.path().join("torn.dat");
    std::fs::write(&dump, &bytes).expect("write dump");

    let chainman = start(
        options(dir.path(), PruneMode::Disabled),
        params,
        &disk,
        SignalInterrupt::new(),
        None,
    );
    chainman
        .load_chainstate(&ChainstateLoadOptions::default())
        .expect("load");
    let (signal, _events) = GenesisSignal::new();
    let outcome = chainman
        .import_blocks(
            &ImportOptions {
                files: vec![dump],
                stop_after_import: false,
            },
            &signal,
        )
        .expect("import");
    assert_eq!(outcome, ImportOutcome::Completed);
    let tip = chainman.active_tip().expect("tip");
    assert_eq!(tip.height, 3);
    assert_eq!(tip.hash, blocks[2].hash());
}

#[test]
fn reindex_links_blocks_stored_out_of_order_across_files() {
    let dir = tempfile::tempdir().expect("tempdir");
    let disk = Disk::new();
    let params = consensus_params(Network::Regtest);
    let blocks = mine_chain(&genesis(&params), 0, 5, 40, &params);
    let (b1, b2, b3, b4, b5) = (&blocks[0], &blocks[1], &blocks[2], &blocks[3], &blocks[4]);
    write_dump(
        &dir.path().join("blk00000.dat"),
        &[genesis(&params), b2.clone()],
    );
    write_dump(
        &dir.path().join("blk00001.dat"),
        &[b1.clone(), b4.clone(), b3.clone()],
    );

    {
        let chainman = node(dir.path(), &disk);
        chainman
            .load_chainstate(&ChainstateLoadOptions {
                reindex: true,
                ..ChainstateLoadOptions::default()
            })
            .expect("load for reindex");
        let (signal, events) = GenesisSignal::new();
        let outcome = chainman
            .import_blocks(&ImportOptions::default(), &signal)
            .expect("reindex");
        assert_eq!(outcome, ImportOutcome::Completed);
        assert_eq!(events.try_recv().ok(), Some(StartupEvent::GenesisConnected));

        let tip = chainman.active_tip().expect("tip");
        assert_eq!(tip.height, 4);
        assert_eq!(tip.hash, b4.hash());
        assert_eq!(chainman.with_state(|state| state.index.len()), 5);
        let stored: Vec<u32> = (0..2)
            .map(|file| chainman.blockman().file_info(file).expect("info").blocks)
            .collect();
        assert_eq!(stored, vec![2, 3]);
        assert_eq!(
            chainman
                .lookup_block_index(&b2.hash())
                .and_then(|node| node.data_pos())
                .map(|pos| pos.file),
            Some(0)
        );
        chainman.flush_state(FlushMode::Always).expect("flush");
    }

    let chainman = node(dir.path(), &disk);
    chainman
        .load_chainstate(&ChainstateLoadOptions::default())
        .expect("restart");
    assert_eq!(chainman.active_tip().expect("tip").hash, b4.hash());

    connect_all(&chainman, &[b5.clone()]);
    let tip = chainman.active_tip().expect("tip");
    assert_eq!(tip.height, 5);
    assert_eq!(tip.hash, b5.hash());
    for block in [b1, b2, b3, b4, b5] {
        assert_eq!(&chainman.read_block(&block.hash()).expect("readable"), block);
    }
    assert_eq!(
        chainman
            .read_block(&chainman.params().hash_genesis_block)
            .expect("genesis"),
        genesis(chainman.params())
    );
}

#[test]
fn interrupted_reindex_resumes_after_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let disk = Disk::new();
    let params = consensus_params(Network::Regtest);
    let blocks = mine_chain(&genesis(&params), 0, 10, 40, &params);
    {
        let chainman = node(dir.path(), &disk);
        chainman
            .load_chainstate(&ChainstateLoadOptions::default())
            .expect("load");
        chainman.activate_best_chain().expect("genesis");
        connect_all(&chainman, &blocks);
        chainman.flush_state(FlushMode::Always).expect("flush");
    }

    {
        let interrupt = SignalInterrupt::new();
        let chainman = start(
            options(dir.path(), PruneMode::Disabled),
            params.clone(),
            &disk,
            interrupt.clone(),
            Some(Arc::new(InterruptAtHeader {
                height: 4,
                interrupt: interrupt.clone(),
            })),
        );
        chainman
            .load_chainstate(&ChainstateLoadOptions {
                reindex: true,
                ..ChainstateLoadOptions::default()
            })
            .expect("load for reindex");
        let (signal, _events) = GenesisSignal::new();
        let outcome = chainman
            .import_blocks(&ImportOptions::default(), &signal)
            .expect("reindex");
        assert_eq!(outcome, ImportOutcome::Interrupted);
        assert!(chainman.blockman().is_reindexing());
        chainman.flush_state(FlushMode::Always).expect("shutdown flush");
    }

    let chainman = node(dir.path(), &disk);
    chainman
        .load_chainstate(&ChainstateLoadOptions::default())
        .expect("restart");
    assert!(chainman.blockman().is_reindexing());
    let (signal, _events) = GenesisSignal::new();
    let outcome = chainman.import_blocks(&ImportOptions::default(), &signal);
    assert_eq!(outcome.ok(), Some(ImportOutcome::Completed));
    assert_eq!(chainman.active_tip().map(|tip| tip.height), Some(10));
    assert_eq!(
        chainman.active_tip().map(|tip| tip.hash),
        Some(blocks[9].hash())
    );
    assert!(!chainman.blockman().is_reindexing());
}
