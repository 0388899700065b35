use std::collections::HashSet;

use crate::blockindex::{BlockIndex, NodeId};
use crate::coins::{CoinsDb, CoinsSlot};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ChainstateRole {
    /// Fully validated from genesis.
    Normal,
    /// Validating from genesis up to a snapshot base in the background.
    Background,
    /// Built on an unvalidated UTXO snapshot.
    Snapshot,
}

impl ChainstateRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ChainstateRole::Normal => "normal",
            ChainstateRole::Background => "background",
            ChainstateRole::Snapshot => "snapshot",
        }
    }
}

/// One view of the best chain with its own coin database.
pub struct Chainstate {
    pub(crate) role: ChainstateRole,
    pub(crate) slot: CoinsSlot,
    /// `chain[h]` is the active block at height `h`.
    pub(crate) chain: Vec<NodeId>,
    /// Taken out while a flush or verification runs off the main lock.
    pub(crate) coins: Option<Box<dyn CoinsDb>>,
    pub(crate) candidates: HashSet<NodeId>,
    /// Snapshot base block; background chainstates stop there, snapshot
    /// chainstates start there.
    pub(crate) snapshot_base: Option<NodeId>,
}

impl Chainstate {
    pub(crate) fn new(role: ChainstateRole, slot: CoinsSlot) -> Self {
        Self {
            role,
            slot,
            chain: Vec::new(),
            coins: None,
            candidates: HashSet::new(),
            snapshot_base: None,
        }
    }

    pub fn role(&self) -> ChainstateRole {
        self.role
    }

    pub fn slot(&self) -> CoinsSlot {
        self.slot
    }

    pub fn tip(&self) -> Option<NodeId> {
        self.chain.last().copied()
    }

    /// Height of the tip, -1 when empty.
    pub fn height(&self) -> i32 {
        self.chain.len() as i32 - 1
    }

    pub fn at(&self, height: i32) -> Option<NodeId> {
        usize::try_from(height)
            .ok()
            .and_then(|height| self.chain.get(height).copied())
    }

    pub fn contains(&self, index: &BlockIndex, id: NodeId) -> bool {
        self.at(index.node(id).height) == Some(id)
    }

    pub fn candidates(&self) -> &HashSet<NodeId> {
        &self.candidates
    }

    pub fn snapshot_base(&self) -> Option<NodeId> {
        self.snapshot_base
    }

    /// Points the chain at `tip`, rewriting only the heights that differ.
    pub(crate) fn set_tip(&mut self, index: &BlockIndex, tip: Option<NodeId>) {
        let Some(tip) = tip else {
            self.chain.clear();
            return;
        };
        let height = index.node(tip).height as usize;
        self.chain.truncate(height + 1);
        self.chain.resize(height + 1, tip);
        let mut walk = Some(tip);
        while let Some(id) = walk {
            let h = index.node(id).height as usize;
            if self.chain[h] == id && h != height {
                break;
            }
            self.chain[h] = id;
            walk = index.node(id).prev;
        }
    }

    /// Whether `id` may become this chainstate's tip.
    pub(crate) fn accepts_candidate(&self, index: &BlockIndex, id: NodeId) -> bool {
        match (self.role, self.snapshot_base) {
            (ChainstateRole::Background, Some(base)) => index.is_ancestor(id, base),
            (ChainstateRole::Snapshot, Some(base)) => index.is_ancestor(base, id),
            _ => true,
        }
    }

    /// Adds `id` when it is eligible and not worse than the current tip.
    pub(crate) fn try_add_candidate(&mut self, index: &BlockIndex, id: NodeId) {
        if !index.is_candidate(id) || !self.accepts_candidate(index, id) {
            return;
        }
        let better = match self.tip() {
            None => true,
            Some(tip) => index.compare_work(id, tip) != std::cmp::Ordering::Less,
        };
        if better {
            self.candidates.insert(id);
        }
    }

    /// Drops candidates that failed or are now worse than the tip.
    pub(crate) fn prune_candidates(&mut self, index: &BlockIndex) {
        let tip = self.tip();
        self.candidates.retain(|id| {
            if index.node(*id).is_failed() {
                return false;
            }
            match tip {
                Some(tip) => index.compare_work(*id, tip) != std::cmp::Ordering::Less,
                None => true,
            }
        });
    }

    /// Best candidate by the work order.
    pub(crate) fn best_candidate(&self, index: &BlockIndex) -> Option<NodeId> {
        self.candidates
            .iter()
            .copied()
            .filter(|id| !index.node(*id).is_failed())
            .max_by(|a, b| index.compare_work(*a, *b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flatfiles::FlatFilePos;
    use blockd_primitives::block::BlockHeader;

    fn build(index: &mut BlockIndex, prev: [u8; 32], nonce: u32) -> NodeId {
        let header = BlockHeader {
            version: 4,
            prev_block: prev,
            merkle_root: [0u8; 32],
            time: 100 + nonce,
            bits: 0x207fffff,
            nonce,
        };
        let id = index.insert_header(&header).expect("insert");
        index.mark_data_present(id, FlatFilePos::new(0, nonce * 10 + 8), 1, false);
        id
    }

    #[test]
    fn set_tip_rewrites_fork_heights() {
        let mut index = BlockIndex::new();
        let g = build(&mut index, [0u8; 32], 0);
        let a1 = { let prev = index.node(g).hash; build(&mut index, prev, 1) };
        let a2 = { let prev = index.node(a1).hash; build(&mut index, prev, 2) };
        let b1 = { let prev = index.node(g).hash; build(&mut index, prev, 3) };
        let mut cs = Chainstate::new(ChainstateRole::Normal, CoinsSlot::Primary);
        cs.set_tip(&index, Some(a2));
        assert_eq!(cs.chain, vec![g, a1, a2]);
        cs.set_tip(&index, Some(b1));
        assert_eq!(cs.chain, vec![g, b1]);
        assert!(cs.contains(&index, g));
        assert!(!cs.contains(&index, a1));
        assert_eq!(cs.height(), 1);
        cs.set_tip(&index, None);
        assert_eq!(cs.height(), -1);
    }

    #[test]
    fn background_only_accepts_ancestors_of_base() {
        let mut index = BlockIndex::new();
        let g = build(&mut index, [0u8; 32], 0);
        let a1 = { let prev = index.node(g).hash; build(&mut index, prev, 1) };
        let a2 = { let prev = index.node(a1).hash; build(&mut index, prev, 2) };
        let mut background = Chainstate::new(ChainstateRole::Background, CoinsSlot::Primary);
        background.snapshot_base = Some(a1);
        let mut snapshot = Chainstate::new(ChainstateRole::Snapshot, CoinsSlot::Snapshot);
        snapshot.snapshot_base = Some(a1);
        for id in [g, a1, a2] {
            background.try_add_candidate(&index, id);
            snapshot.try_add_candidate(&index, id);
        }
        assert!(background.candidates.contains(&a1));
        assert!(!background.candidates.contains(&a2));
        assert!(snapshot.candidates.contains(&a2));
        assert!(!snapshot.candidates.contains(&g));
        assert_eq!(background.best_candidate(&index), Some(a1));
    }
}
