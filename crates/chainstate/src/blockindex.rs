//! In-memory tree of every known block header.
//!
//! Nodes live in an arena and refer to each other by [`NodeId`]; a node is
//! never removed once inserted, so ids stay valid for the lifetime of the
//! index. All mutation happens under the chainstate manager's main lock.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, VecDeque};

use blockd_consensus::Hash256;
use blockd_pow::block_proof;
use blockd_primitives::block::BlockHeader;
use primitive_types::U256;
use smallvec::SmallVec;

use crate::flatfiles::FlatFilePos;

pub const BLOCK_VALID_UNKNOWN: u32 = 0;
pub const BLOCK_VALID_RESERVED: u32 = 1;
pub const BLOCK_VALID_TREE: u32 = 2;
pub const BLOCK_VALID_TRANSACTIONS: u32 = 3;
pub const BLOCK_VALID_CHAIN: u32 = 4;
pub const BLOCK_VALID_SCRIPTS: u32 = 5;
pub const BLOCK_VALID_MASK: u32 = 7;

pub const STATUS_HAVE_DATA: u32 = 8;
pub const STATUS_HAVE_UNDO: u32 = 16;
pub const STATUS_FAILED_VALID: u32 = 32;
pub const STATUS_FAILED_CHILD: u32 = 64;
pub const STATUS_FAILED_MASK: u32 = STATUS_FAILED_VALID | STATUS_FAILED_CHILD;
pub const STATUS_OPT_WITNESS: u32 = 128;
pub const STATUS_ASSUMED_VALID: u32 = 256;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum BlockIndexError {
    NullHash,
    UnknownPredecessor(Hash256),
    NonContiguous(i32),
}

impl std::fmt::Display for BlockIndexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockIndexError::NullHash => write!(f, "block hash is null"),
            BlockIndexError::UnknownPredecessor(hash) => write!(
                f,
                "unknown predecessor {}",
                blockd_consensus::hash256_to_hex(hash)
            ),
            BlockIndexError::NonContiguous(height) => {
                write!(f, "block index is non-contiguous, index of height {height} missing")
            }
        }
    }
}

impl std::error::Error for BlockIndexError {}

#[derive(Clone, Debug)]
pub struct BlockIndexNode {
    pub hash: Hash256,
    pub prev: Option<NodeId>,
    pub skip: Option<NodeId>,
    pub height: i32,
    pub version: i32,
    pub prev_hash: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub time_max: u32,
    pub bits: u32,
    pub nonce: u32,
    pub chain_work: U256,
    pub status: u32,
    pub file: u32,
    pub data_pos: u32,
    pub undo_pos: u32,
    pub tx_count: u32,
    /// Transactions in this block and all its ancestors; zero until every
    /// ancestor's data has been seen.
    pub chain_tx: u64,
    pub sequence_id: i32,
}

impl BlockIndexNode {
    fn new(hash: Hash256) -> Self {
        Self {
            hash,
            prev: None,
            skip: None,
            height: 0,
            version: 0,
            prev_hash: [0u8; 32],
            merkle_root: [0u8; 32],
            time: 0,
            time_max: 0,
            bits: 0,
            nonce: 0,
            chain_work: U256::zero(),
            status: BLOCK_VALID_UNKNOWN,
            file: 0,
            data_pos: 0,
            undo_pos: 0,
            tx_count: 0,
            chain_tx: 0,
            sequence_id: 0,
        }
    }

    pub fn header(&self) -> BlockHeader {
        BlockHeader {
            version: self.version,
            prev_block: self.prev_hash,
            merkle_root: self.merkle_root,
            time: self.time,
            bits: self.bits,
            nonce: self.nonce,
        }
    }

    pub fn have_data(&self) -> bool {
        self.status & STATUS_HAVE_DATA != 0
    }

    pub fn have_undo(&self) -> bool {
        self.status & STATUS_HAVE_UNDO != 0
    }

    pub fn is_failed(&self) -> bool {
        self.status & STATUS_FAILED_MASK != 0
    }

    /// True when the node reached `tier` and has not failed.
    pub fn is_valid(&self, tier: u32) -> bool {
        !self.is_failed() && self.status & BLOCK_VALID_MASK >= tier
    }

    pub fn data_pos(&self) -> Option<FlatFilePos> {
        self.have_data()
            .then_some(FlatFilePos::new(self.file, self.data_pos))
    }

    pub fn undo_pos(&self) -> Option<FlatFilePos> {
        self.have_undo()
            .then_some(FlatFilePos::new(self.file, self.undo_pos))
    }
}

fn invert_lowest_one(value: i32) -> i32 {
    value & value.saturating_sub(1)
}

/// Height the skip pointer of a node at `height` jumps to.
pub fn get_skip_height(height: i32) -> i32 {
    if height < 2 {
        return 0;
    }
    if (height & 1) != 0 {
        invert_lowest_one(invert_lowest_one(height - 1)) + 1
    } else {
        invert_lowest_one(height)
    }
}

/// Node fields as persisted by the block tree database.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DiskBlockIndex {
    pub hash: Hash256,
    pub height: i32,
    pub status: u32,
    pub tx_count: u32,
    pub file: u32,
    pub data_pos: u32,
    pub undo_pos: u32,
    pub header: BlockHeader,
}

impl DiskBlockIndex {
    pub fn from_node(node: &BlockIndexNode) -> Self {
        Self {
            hash: node.hash,
            height: node.height,
            status: node.status,
            tx_count: node.tx_count,
            file: node.file,
            data_pos: node.data_pos,
            undo_pos: node.undo_pos,
            header: node.header(),
        }
    }
}

#[derive(Default)]
pub struct BlockIndex {
    nodes: Vec<BlockIndexNode>,
    by_hash: HashMap<Hash256, NodeId>,
    dirty: BTreeSet<NodeId>,
    /// Nodes with data whose predecessor's chain tx is still unknown, keyed by
    /// predecessor.
    unlinked: HashMap<NodeId, SmallVec<[NodeId; 2]>>,
    best_header: Option<NodeId>,
    next_sequence: i32,
}

impl BlockIndex {
    pub fn new() -> Self {
        Self {
            next_sequence: 1,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn lookup(&self, hash: &Hash256) -> Option<NodeId> {
        self.by_hash.get(hash).copied()
    }

    pub fn node(&self, id: NodeId) -> &BlockIndexNode {
        &self.nodes[id.index()]
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut BlockIndexNode {
        self.dirty.insert(id);
        &mut self.nodes[id.index()]
    }

    pub fn get(&self, hash: &Hash256) -> Option<&BlockIndexNode> {
        self.lookup(hash).map(|id| self.node(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &BlockIndexNode)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(index, node)| (NodeId(index as u32), node))
    }

    pub fn best_header(&self) -> Option<NodeId> {
        self.best_header
    }

    pub fn mark_dirty(&mut self, id: NodeId) {
        self.dirty.insert(id);
    }

    pub fn dirty_len(&self) -> usize {
        self.dirty.len()
    }

    /// Drains the dirty set into persistable records.
    pub fn take_dirty(&mut self) -> Vec<DiskBlockIndex> {
        let dirty = std::mem::take(&mut self.dirty);
        dirty
            .into_iter()
            .map(|id| DiskBlockIndex::from_node(self.node(id)))
            .collect()
    }

    /// Re-marks records whose write failed.
    pub fn restore_dirty(&mut self, records: &[DiskBlockIndex]) {
        for record in records {
            if let Some(id) = self.lookup(&record.hash) {
                self.dirty.insert(id);
            }
        }
    }

    pub fn unlinked_len(&self) -> usize {
        self.unlinked.values().map(|children| children.len()).sum()
    }

    pub fn clear(&mut self) {
        *self = Self::new();
    }

    fn push(&mut self, node: BlockIndexNode) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.by_hash.insert(node.hash, id);
        self.nodes.push(node);
        id
    }

    /// Returns the node for `hash`, creating an empty placeholder if needed.
    fn insert_placeholder(&mut self, hash: Hash256) -> NodeId {
        match self.lookup(&hash) {
            Some(id) => id,
            None => self.push(BlockIndexNode::new(hash)),
        }
    }

    pub fn insert_header(&mut self, header: &BlockHeader) -> Result<NodeId, BlockIndexError> {
        self.insert_header_with_hash(header.hash(), header)
    }

    /// Adds a header whose hash the caller already computed. Re-inserting a
    /// known hash returns the existing node unchanged.
    pub fn insert_header_with_hash(
        &mut self,
        hash: Hash256,
        header: &BlockHeader,
    ) -> Result<NodeId, BlockIndexError> {
        if hash == [0u8; 32] {
            return Err(BlockIndexError::NullHash);
        }
        if let Some(existing) = self.lookup(&hash) {
            return Ok(existing);
        }
        let prev = if header.prev_block == [0u8; 32] {
            None
        } else {
            Some(
                self.lookup(&header.prev_block)
                    .ok_or(BlockIndexError::UnknownPredecessor(header.prev_block))?,
            )
        };

        let mut node = BlockIndexNode::new(hash);
        node.prev = prev;
        node.version = header.version;
        node.prev_hash = header.prev_block;
        node.merkle_root = header.merkle_root;
        node.time = header.time;
        node.bits = header.bits;
        node.nonce = header.nonce;
        node.status = BLOCK_VALID_TREE;
        let proof = block_proof(header.bits);
        match prev {
            Some(prev_id) => {
                let parent = self.node(prev_id);
                node.height = parent.height + 1;
                node.time_max = parent.time_max.max(header.time);
                node.chain_work = parent.chain_work.saturating_add(proof);
                if parent.is_failed() {
                    node.status |= STATUS_FAILED_CHILD;
                }
                node.skip = self.ancestor(prev_id, get_skip_height(node.height));
            }
            None => {
                node.time_max = header.time;
                node.chain_work = proof;
            }
        }

        let failed = node.status & STATUS_FAILED_MASK != 0;
        let id = self.push(node);
        self.dirty.insert(id);
        if !failed {
            self.consider_best_header(id);
        }
        Ok(id)
    }

    fn consider_best_header(&mut self, id: NodeId) {
        let better = match self.best_header {
            None => true,
            Some(best) => self.compare_work(id, best) == Ordering::Greater,
        };
        if better {
            self.best_header = Some(id);
        }
    }

    /// Orders nodes by preference as chain tips: more work first, then the
    /// earlier arrival, then the lower id.
    pub fn compare_work(&self, a: NodeId, b: NodeId) -> Ordering {
        let left = self.node(a);
        let right = self.node(b);
        left.chain_work
            .cmp(&right.chain_work)
            .then_with(|| right.sequence_id.cmp(&left.sequence_id))
            .then_with(|| b.cmp(&a))
    }

    /// Records that the block's data is stored at `pos`. Returns every node
    /// whose chain tx became known as a result, this one included, in the
    /// order they were linked.
    pub fn mark_data_present(
        &mut self,
        id: NodeId,
        pos: FlatFilePos,
        tx_count: u32,
        witness: bool,
    ) -> Vec<NodeId> {
        {
            let node = self.node_mut(id);
            node.tx_count = tx_count;
            node.chain_tx = 0;
            node.file = pos.file;
            node.data_pos = pos.pos;
            node.undo_pos = 0;
            node.status |= STATUS_HAVE_DATA;
            if witness {
                node.status |= STATUS_OPT_WITNESS;
            }
        }
        self.raise_validity(id, BLOCK_VALID_TRANSACTIONS);

        let prev = self.node(id).prev;
        let linkable = match prev {
            None => true,
            Some(prev_id) => self.node(prev_id).chain_tx != 0,
        };
        if !linkable {
            if let Some(prev_id) = prev {
                if self.node(prev_id).is_valid(BLOCK_VALID_TREE) {
                    self.unlinked.entry(prev_id).or_default().push(id);
                }
            }
            return Vec::new();
        }

        let mut linked = Vec::new();
        let mut queue = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            let prev_chain_tx = self
                .node(current)
                .prev
                .map(|prev_id| self.node(prev_id).chain_tx)
                .unwrap_or(0);
            let sequence = self.next_sequence;
            self.next_sequence += 1;
            let node = self.node_mut(current);
            node.chain_tx = prev_chain_tx + u64::from(node.tx_count);
            node.sequence_id = sequence;
            linked.push(current);
            if let Some(children) = self.unlinked.remove(&current) {
                queue.extend(children);
            }
        }
        linked
    }

    pub fn mark_undo_present(&mut self, id: NodeId, pos: FlatFilePos) {
        let node = self.node_mut(id);
        node.undo_pos = pos.pos;
        node.status |= STATUS_HAVE_UNDO;
    }

    /// Raises the validity tier. Returns false for failed nodes or when the
    /// tier was already reached.
    pub fn raise_validity(&mut self, id: NodeId, tier: u32) -> bool {
        let node = self.node(id);
        if node.is_failed() || node.status & BLOCK_VALID_MASK >= tier {
            return false;
        }
        let node = self.node_mut(id);
        node.status = (node.status & !BLOCK_VALID_MASK) | tier;
        true
    }

    pub fn set_status_flag(&mut self, id: NodeId, flag: u32) {
        if self.node(id).status & flag != flag {
            self.node_mut(id).status |= flag;
        }
    }

    /// Marks `id` invalid and every descendant as a failed child. Nodes that
    /// already carry a failure flag are left as they are. Returns how many
    /// descendants changed.
    pub fn mark_failed(&mut self, id: NodeId) -> usize {
        self.node_mut(id).status |= STATUS_FAILED_VALID;
        let failed_height = self.node(id).height;
        let mut descendants = Vec::new();
        for (candidate, node) in self.iter() {
            if node.is_failed() || node.height <= failed_height {
                continue;
            }
            if self.ancestor(candidate, failed_height) == Some(id) {
                descendants.push(candidate);
            }
        }
        for candidate in &descendants {
            self.node_mut(*candidate).status |= STATUS_FAILED_CHILD;
        }
        self.recompute_best_header();
        descendants.len()
    }

    /// Drops block and undo positions after the file holding them was pruned.
    pub fn clear_data(&mut self, id: NodeId) {
        let node = self.node_mut(id);
        node.status &= !(STATUS_HAVE_DATA | STATUS_HAVE_UNDO);
        node.file = 0;
        node.data_pos = 0;
        node.undo_pos = 0;
        let prev = node.prev;
        if let Some(prev_id) = prev {
            if let Some(children) = self.unlinked.get_mut(&prev_id) {
                children.retain(|child| *child != id);
                if children.is_empty() {
                    self.unlinked.remove(&prev_id);
                }
            }
        }
    }

    /// Overrides the chain tx of a snapshot base block, whose ancestors'
    /// transaction counts are not known locally.
    pub fn set_assumed_chain_tx(&mut self, id: NodeId, chain_tx: u64) {
        let node = self.node_mut(id);
        node.chain_tx = chain_tx;
        node.status |= STATUS_ASSUMED_VALID;
        let mut queue: VecDeque<NodeId> = self
            .unlinked
            .remove(&id)
            .unwrap_or_default()
            .into_iter()
            .collect();
        while let Some(current) = queue.pop_front() {
            let prev_chain_tx = self
                .node(current)
                .prev
                .map(|prev_id| self.node(prev_id).chain_tx)
                .unwrap_or(0);
            let node = self.node_mut(current);
            node.chain_tx = prev_chain_tx + u64::from(node.tx_count);
            if let Some(children) = self.unlinked.remove(&current) {
                queue.extend(children);
            }
        }
    }

    pub fn ancestor(&self, id: NodeId, height: i32) -> Option<NodeId> {
        let start = self.node(id);
        if height > start.height || height < 0 {
            return None;
        }
        let mut walk = id;
        let mut walk_height = start.height;
        while walk_height > height {
            let skip_height = get_skip_height(walk_height);
            let skip_height_prev = get_skip_height(walk_height - 1);
            let node = self.node(walk);
            let take_skip = match node.skip {
                Some(_) => {
                    skip_height == height
                        || (skip_height > height
                            && !(skip_height_prev < skip_height - 2 && skip_height_prev >= height))
                }
                None => false,
            };
            if take_skip {
                walk = node.skip?;
                walk_height = skip_height;
            } else {
                walk = node.prev?;
                walk_height -= 1;
            }
        }
        Some(walk)
    }

    pub fn build_skip(&mut self, id: NodeId) {
        let node = self.node(id);
        let skip = node
            .prev
            .and_then(|prev| self.ancestor(prev, get_skip_height(node.height)));
        self.nodes[id.index()].skip = skip;
    }

    pub fn last_common_ancestor(&self, a: NodeId, b: NodeId) -> Option<NodeId> {
        let mut left = a;
        let mut right = b;
        let left_height = self.node(left).height;
        let right_height = self.node(right).height;
        if left_height > right_height {
            left = self.ancestor(left, right_height)?;
        } else if right_height > left_height {
            right = self.ancestor(right, left_height)?;
        }
        while left != right {
            left = self.node(left).prev?;
            right = self.node(right).prev?;
        }
        Some(left)
    }

    /// True when `descendant` is `ancestor` or builds on it.
    pub fn is_ancestor(&self, ancestor: NodeId, descendant: NodeId) -> bool {
        self.ancestor(descendant, self.node(ancestor).height) == Some(ancestor)
    }

    /// Eligible to become a chain tip: transactions valid, not failed and
    /// every ancestor's data seen.
    pub fn is_candidate(&self, id: NodeId) -> bool {
        let node = self.node(id);
        node.is_valid(BLOCK_VALID_TRANSACTIONS) && (node.chain_tx != 0 || node.prev.is_none())
    }

    fn recompute_best_header(&mut self) {
        self.best_header = None;
        for index in 0..self.nodes.len() {
            let id = NodeId(index as u32);
            if self.node(id).is_valid(BLOCK_VALID_TREE) {
                self.consider_best_header(id);
            }
        }
    }

    /// Rebuilds the index from persisted records. Derived fields (work, time
    /// max, chain tx, skip pointers, failed-child flags) are recomputed in
    /// height order. `snapshot_base` supplies the chain tx of a snapshot base
    /// block. Returns all node ids sorted by height.
    pub fn load_from_records(
        &mut self,
        records: Vec<DiskBlockIndex>,
        snapshot_base: Option<(Hash256, u64)>,
    ) -> Result<Vec<NodeId>, BlockIndexError> {
        for record in records {
            if record.hash == [0u8; 32] {
                return Err(BlockIndexError::NullHash);
            }
            let id = self.insert_placeholder(record.hash);
            let prev = if record.header.prev_block == [0u8; 32] {
                None
            } else {
                Some(self.insert_placeholder(record.header.prev_block))
            };
            let node = &mut self.nodes[id.index()];
            node.prev = prev;
            node.height = record.height;
            node.version = record.header.version;
            node.prev_hash = record.header.prev_block;
            node.merkle_root = record.header.merkle_root;
            node.time = record.header.time;
            node.bits = record.header.bits;
            node.nonce = record.header.nonce;
            node.status = record.status;
            node.file = record.file;
            node.data_pos = record.data_pos;
            node.undo_pos = record.undo_pos;
            node.tx_count = record.tx_count;
        }

        let mut sorted: Vec<NodeId> = (0..self.nodes.len() as u32).map(NodeId).collect();
        sorted.sort_by_key(|id| (self.node(*id).height, *id));

        let snapshot_id = snapshot_base.and_then(|(hash, _)| self.lookup(&hash));
        if let (Some(id), Some((_, chain_tx))) = (snapshot_id, snapshot_base) {
            self.nodes[id.index()].chain_tx = chain_tx;
            self.nodes[id.index()].status |= STATUS_ASSUMED_VALID;
        }

        let mut previous_height: Option<i32> = None;
        for id in &sorted {
            let id = *id;
            let height = self.node(id).height;
            if let Some(previous) = previous_height {
                if height > previous + 1 {
                    return Err(BlockIndexError::NonContiguous(previous + 1));
                }
            }
            previous_height = Some(height);

            let node = self.node(id);
            let proof = block_proof(node.bits);
            let (work, time_max, prev_chain_tx, prev_failed) = match node.prev {
                Some(prev_id) => {
                    let parent = self.node(prev_id);
                    (
                        parent.chain_work.saturating_add(proof),
                        parent.time_max.max(node.time),
                        Some(parent.chain_tx),
                        parent.is_failed(),
                    )
                }
                None => (proof, node.time, None, false),
            };
            let tx_count = node.tx_count;
            let prev = node.prev;

            let node = &mut self.nodes[id.index()];
            node.chain_work = work;
            node.time_max = time_max;
            if tx_count > 0 && Some(id) != snapshot_id {
                match prev_chain_tx {
                    Some(0) => {
                        node.chain_tx = 0;
                        if let Some(prev_id) = prev {
                            self.unlinked.entry(prev_id).or_default().push(id);
                        }
                    }
                    Some(prev_tx) => node.chain_tx = prev_tx + u64::from(tx_count),
                    None => node.chain_tx = u64::from(tx_count),
                }
            }
            let node = &mut self.nodes[id.index()];
            if node.status & STATUS_FAILED_MASK == 0 && prev_failed {
                node.status |= STATUS_FAILED_CHILD;
                self.dirty.insert(id);
            }
            if prev.is_some() {
                self.build_skip(id);
            }
        }

        self.recompute_best_header();
        Ok(sorted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(prev: Hash256, nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 4,
            prev_block: prev,
            merkle_root: [nonce as u8; 32],
            time: 1_000 + nonce,
            bits: 0x207fffff,
            nonce,
        }
    }

    fn chain(index: &mut BlockIndex, len: u32) -> Vec<NodeId> {
        let mut ids = Vec::new();
        let mut prev = [0u8; 32];
        for n in 0..len {
            let h = header(prev, n);
            let id = index.insert_header(&h).expect("insert");
            prev = index.node(id).hash;
            ids.push(id);
        }
        ids
    }

    #[test]
    fn skip_heights_match_reference_values() {
        assert_eq!(get_skip_height(0), 0);
        assert_eq!(get_skip_height(1), 0);
        assert_eq!(get_skip_height(2), 0);
        assert_eq!(get_skip_height(3), 1);
        assert_eq!(get_skip_height(4), 0);
        assert_eq!(get_skip_height(6), 4);
        assert_eq!(get_skip_height(7), 1);
        assert_eq!(get_skip_height(12), 8);
    }

    #[test]
    fn insert_is_idempotent() {
        let mut index = BlockIndex::new();
        let h = header([0u8; 32], 0);
        let first = index.insert_header(&h).expect("insert");
        let second = index.insert_header(&h).expect("insert");
        assert_eq!(first, second);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn rejects_null_hash_and_unknown_predecessor() {
        let mut index = BlockIndex::new();
        let h = header([0u8; 32], 0);
        assert_eq!(
            index.insert_header_with_hash([0u8; 32], &h),
            Err(BlockIndexError::NullHash)
        );
        let orphan = header([9u8; 32], 1);
        assert_eq!(
            index.insert_header(&orphan),
            Err(BlockIndexError::UnknownPredecessor([9u8; 32]))
        );
    }

    #[test]
    fn ancestor_walk_matches_linear_walk() {
        let mut index = BlockIndex::new();
        let ids = chain(&mut index, 300);
        let tip = *ids.last().expect("tip");
        for height in [0, 1, 17, 128, 255, 298, 299] {
            assert_eq!(index.ancestor(tip, height), Some(ids[height as usize]));
        }
        assert_eq!(index.ancestor(tip, 300), None);
        assert_eq!(index.ancestor(tip, -1), None);
    }

    #[test]
    fn work_increases_along_chain() {
        let mut index = BlockIndex::new();
        let ids = chain(&mut index, 20);
        for pair in ids.windows(2) {
            assert!(index.node(pair[1]).chain_work > index.node(pair[0]).chain_work);
        }
        assert_eq!(index.best_header(), ids.last().copied());
    }

    #[test]
    fn common_ancestor_of_fork() {
        let mut index = BlockIndex::new();
        let ids = chain(&mut index, 10);
        let fork = index
            .insert_header(&header(index.node(ids[5]).hash, 99))
            .expect("fork");
        assert_eq!(index.last_common_ancestor(fork, ids[9]), Some(ids[5]));
        assert!(index.is_ancestor(ids[5], fork));
        assert!(!index.is_ancestor(ids[6], fork));
    }

    #[test]
    fn data_out_of_order_links_transitively() {
        let mut index = BlockIndex::new();
        let ids = chain(&mut index, 4);
        assert!(index
            .mark_data_present(ids[2], FlatFilePos::new(0, 300), 2, false)
            .is_empty());
        assert!(index
            .mark_data_present(ids[1], FlatFilePos::new(0, 200), 3, false)
            .is_empty());
        assert_eq!(index.unlinked_len(), 2);

        let linked = index.mark_data_present(ids[0], FlatFilePos::new(0, 8), 1, true);
        assert_eq!(linked, vec![ids[0], ids[1], ids[2]]);
        assert_eq!(index.node(ids[2]).chain_tx, 6);
        assert_eq!(index.unlinked_len(), 0);
        assert!(index.node(ids[0]).status & STATUS_OPT_WITNESS != 0);
        assert!(index.is_candidate(ids[2]));
        assert!(!index.is_candidate(ids[3]));
        assert!(index.node(ids[0]).sequence_id < index.node(ids[2]).sequence_id);
    }

    #[test]
    fn earlier_sequence_wins_equal_work() {
        let mut index = BlockIndex::new();
        let ids = chain(&mut index, 1);
        index.mark_data_present(ids[0], FlatFilePos::new(0, 8), 1, false);
        let a = index
            .insert_header(&header(index.node(ids[0]).hash, 50))
            .expect("a");
        let b = index
            .insert_header(&header(index.node(ids[0]).hash, 51))
            .expect("b");
        index.mark_data_present(b, FlatFilePos::new(0, 100), 1, false);
        index.mark_data_present(a, FlatFilePos::new(0, 200), 1, false);
        assert_eq!(index.compare_work(b, a), Ordering::Greater);
    }

    #[test]
    fn failure_propagates_to_descendants_only() {
        let mut index = BlockIndex::new();
        let ids = chain(&mut index, 8);
        let side = index
            .insert_header(&header(index.node(ids[2]).hash, 77))
            .expect("side");
        let changed = index.mark_failed(ids[4]);
        assert_eq!(changed, 3);
        assert!(index.node(ids[4]).status & STATUS_FAILED_VALID != 0);
        for id in &ids[5..] {
            assert!(index.node(*id).status & STATUS_FAILED_CHILD != 0);
        }
        assert!(!index.node(ids[3]).is_failed());
        assert!(!index.node(side).is_failed());
        assert_eq!(index.best_header(), Some(ids[3]));
        assert!(!index.raise_validity(ids[6], BLOCK_VALID_SCRIPTS));

        let late = index
            .insert_header(&header(index.node(ids[7]).hash, 123))
            .expect("late");
        assert!(index.node(late).status & STATUS_FAILED_CHILD != 0);
    }

    #[test]
    fn load_from_records_is_order_independent() {
        let mut source = BlockIndex::new();
        let ids = chain(&mut source, 40);
        for (n, id) in ids.iter().enumerate() {
            if n != 30 {
                source.mark_data_present(*id, FlatFilePos::new(0, n as u32 * 100), 1, false);
            }
        }
        source.mark_failed(ids[35]);
        let mut records = source.take_dirty();
        records.reverse();
        records.swap(3, 17);

        let mut loaded = BlockIndex::new();
        let sorted = loaded.load_from_records(records, None).expect("load");
        assert_eq!(sorted.len(), 40);
        for id in &ids {
            let hash = source.node(*id).hash;
            let restored = loaded.get(&hash).expect("node");
            assert_eq!(restored.chain_work, source.node(*id).chain_work);
            assert_eq!(restored.height, source.node(*id).height);
        }
        let above_gap = loaded.get(&source.node(ids[31]).hash).expect("node");
        assert_eq!(above_gap.chain_tx, 0);
        assert_eq!(loaded.unlinked_len(), 1);
        let failed_child = loaded.get(&source.node(ids[39]).hash).expect("node");
        assert!(failed_child.is_failed());
        assert_eq!(
            loaded.best_header().map(|id| loaded.node(id).hash),
            Some(source.node(ids[34]).hash)
        );
    }

    #[test]
    fn load_detects_height_gap() {
        let mut source = BlockIndex::new();
        let ids = chain(&mut source, 5);
        let records: Vec<_> = source
            .take_dirty()
            .into_iter()
            .filter(|record| record.hash != source.node(ids[2]).hash)
            .collect();
        let mut loaded = BlockIndex::new();
        assert_eq!(
            loaded.load_from_records(records, None),
            Err(BlockIndexError::NonContiguous(2))
        );
    }
}
