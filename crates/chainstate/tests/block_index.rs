use blockd_chainstate::blockindex::{BlockIndex, NodeId};
use blockd_chainstate::flatfiles::FlatFilePos;
use blockd_pow::block_proof;
use blockd_primitives::block::BlockHeader;

fn header(prev: [u8; 32], nonce: u32, bits: u32) -> BlockHeader {
    BlockHeader {
        version: 4,
        prev_block: prev,
        merkle_root: [nonce as u8; 32],
        time: 1_000 + nonce,
        bits,
        nonce,
    }
}

/// A main chain of 30 with forks at heights 10 and 20, mixed difficulty.
fn forked_tree(index: &mut BlockIndex) -> Vec<NodeId> {
    let mut ids = Vec::new();
    let mut nonce = 0;
    let mut extend = |index: &mut BlockIndex, ids: &mut Vec<NodeId>, from: Option<NodeId>, len: u32| {
        let mut prev = from.map(|id| index.node(id).hash).unwrap_or([0u8; 32]);
        let mut last = None;
        for n in 0..len {
            nonce += 1;
            let bits = if n % 3 == 0 { 0x1f00ffff } else { 0x207fffff };
            let id = index
                .insert_header(&header(prev, nonce, bits))
                .expect("insert");
            prev = index.node(id).hash;
            ids.push(id);
            last = Some(id);
        }
        last
    };
    extend(index, &mut ids, None, 30);
    let at_10 = ids[10];
    let at_20 = ids[20];
    extend(index, &mut ids, Some(at_10), 5);
    extend(index, &mut ids, Some(at_20), 12);
    ids
}

fn assert_work_consistent(index: &BlockIndex) {
    for (_, node) in index.iter() {
        let expected = match node.prev {
            Some(prev) => index.node(prev).chain_work + block_proof(node.bits),
            None => block_proof(node.bits),
        };
        assert_eq!(node.chain_work, expected, "work of {}", node.height);
    }
}

#[test]
fn reinserting_headers_is_idempotent() {
    let mut index = BlockIndex::new();
    let ids = forked_tree(&mut index);
    let len = index.len();
    for id in &ids {
        let header = index.node(*id).header();
        let again = index.insert_header(&header).expect("again");
        assert_eq!(again, *id);
    }
    assert_eq!(index.len(), len);
}

#[test]
fn work_is_consistent_for_any_load_order() {
    let mut source = BlockIndex::new();
    let ids = forked_tree(&mut source);
    for (n, id) in ids.iter().enumerate() {
        source.mark_data_present(*id, FlatFilePos::new(0, 8 + n as u32 * 200), 1, true);
    }
    assert_work_consistent(&source);
    let records = source.take_dirty();

    for seed in [1usize, 7, 13, 29] {
        let mut shuffled = records.clone();
        let len = shuffled.len();
        for i in 0..len {
            shuffled.swap(i, (i * seed + seed * seed) % len);
        }
        let mut loaded = BlockIndex::new();
        let sorted = loaded.load_from_records(shuffled, None).expect("load");
        assert_eq!(sorted.len(), ids.len());
        assert!(sorted
            .windows(2)
            .all(|pair| loaded.node(pair[0]).height <= loaded.node(pair[1]).height));
        assert_work_consistent(&loaded);
        assert_eq!(
            loaded.best_header().map(|id| loaded.node(id).hash),
            source.best_header().map(|id| source.node(id).hash)
        );
    }
}

#[test]
fn failure_marks_only_descendants() {
    let mut index = BlockIndex::new();
    let ids = forked_tree(&mut index);
    let main_15 = ids[15];
    let affected = index.mark_failed(main_15);
    assert!(affected >= 1);
    for (id, node) in index.iter() {
        let descends = index.is_ancestor(main_15, id);
        assert_eq!(node.is_failed(), descends, "node at {}", node.height);
    }
    // The fork off height 10 branches below the failure.
    assert!(!index.node(ids[30]).is_failed());
    // The fork off height 20 sits above it.
    assert!(index.node(ids[35]).is_failed());
}
