//! Bounded startup check of the most recent blocks against the coin
//! database.

use blockd_consensus::hash256_to_hex;
use blockd_storage::KeyValueStore;

use crate::blockindex::BlockIndexNode;
use crate::chainstate::ChainstateRole;
use crate::coins::{CoinsDb, CoinsOverlay, DisconnectResult, ScratchCoins};
use crate::manager::{ChainstateError, ChainstateManager};

pub const DEFAULT_CHECKBLOCKS: i32 = 6;
pub const DEFAULT_CHECKLEVEL: u32 = 3;
pub const MAX_CHECKLEVEL: u32 = 4;

#[derive(Debug)]
pub enum VerifyError {
    Corrupted(String),
    Chainstate(ChainstateError),
}

impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerifyError::Corrupted(message) => write!(f, "{message}"),
            VerifyError::Chainstate(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for VerifyError {}

impl From<ChainstateError> for VerifyError {
    fn from(err: ChainstateError) -> Self {
        VerifyError::Chainstate(err)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VerifyOutcome {
    Verified,
    /// Stopped early at a block whose data was pruned.
    SkippedMissingBlocks,
    Interrupted,
}

type CheckedBlock = (BlockIndexNode, Option<BlockIndexNode>);

impl<S: KeyValueStore> ChainstateManager<S> {
    /// Checks the last `check_depth` blocks of a chainstate (all of them when
    /// zero or negative). Level 0 reads blocks, 1 validates them, 2 reads
    /// undo data, 3 disconnects them on a scratch coin view, 4 reconnects.
    pub fn verify_db(
        &self,
        role: ChainstateRole,
        check_level: u32,
        check_depth: i32,
    ) -> Result<VerifyOutcome, VerifyError> {
        let _connect = self.lock_connect();
        let (blocks, depth) = {
            let main = self.lock_main();
            let cs = main
                .chainstate(role)
                .ok_or(ChainstateError::MissingChainstate(role))?;
            let Some(tip) = cs.tip() else {
                return Ok(VerifyOutcome::Verified);
            };
            if main.index.node(tip).prev.is_none() {
                return Ok(VerifyOutcome::Verified);
            }
            let tip_height = cs.height();
            let depth = if check_depth <= 0 || check_depth > tip_height {
                tip_height
            } else {
                check_depth
            };
            let blocks: Vec<CheckedBlock> = (tip_height - depth + 1..=tip_height)
                .rev()
                .filter_map(|height| cs.at(height))
                .map(|id| {
                    let node = main.index.node(id).clone();
                    let prev = node.prev.map(|prev| main.index.node(prev).clone());
                    (node, prev)
                })
                .collect();
            (blocks, depth)
        };
        let level = check_level.min(MAX_CHECKLEVEL);
        blockd_log::log_info!("Verifying last {} blocks at level {}", depth, level);

        let coins = self.take_coins(role)?;
        let result = self.verify_blocks(coins.as_ref(), &blocks, level);
        self.restore_coins(role, coins);
        result
    }

    fn verify_blocks(
        &self,
        coins: &dyn CoinsDb,
        blocks: &[CheckedBlock],
        level: u32,
    ) -> Result<VerifyOutcome, VerifyError> {
        let base = ScratchCoins::new(coins);
        let mut scratch = CoinsOverlay::new();
        let mut failure_height: Option<i32> = None;
        let mut good_transactions = 0usize;
        let mut checked = 0usize;
        let mut skipped = false;
        let mut reported = 0usize;

        for (node, prev) in blocks {
            if self.interrupt.is_set() {
                return Ok(VerifyOutcome::Interrupted);
            }
            let percent = checked * 100 / blocks.len().max(1);
            if percent >= reported + 10 {
                reported = percent / 10 * 10;
                blockd_log::log_info!("Verification progress: {}%", reported);
            }
            if self.blockman.have_pruned() && !node.have_data() {
                blockd_log::log_info!(
                    "Block verification stopping at height {} (no data). This could be due to pruning.",
                    node.height
                );
                skipped = true;
                break;
            }
            let block = self.blockman.read_block_for_node(node).map_err(|err| {
                VerifyError::Corrupted(format!(
                    "*** ReadBlock failed at {}, hash={}: {err}",
                    node.height,
                    hash256_to_hex(&node.hash)
                ))
            })?;
            if level >= 1 {
                self.validator
                    .validate(&block, prev.as_ref(), node.height)
                    .map_err(|err| {
                        VerifyError::Corrupted(format!(
                            "*** found bad block at {}, hash={} ({err})",
                            node.height,
                            hash256_to_hex(&node.hash)
                        ))
                    })?;
            }
            let undo = match node.undo_pos() {
                Some(pos) if level >= 2 => {
                    Some(self.blockman.read_undo(pos, &node.prev_hash).map_err(|err| {
                        VerifyError::Corrupted(format!(
                            "*** found bad undo data at {}, hash={}: {err}",
                            node.height,
                            hash256_to_hex(&node.hash)
                        ))
                    })?)
                }
                _ => None,
            };
            if level >= 3 {
                let undo = undo.ok_or_else(|| {
                    VerifyError::Corrupted(format!(
                        "*** missing undo data at {}, hash={}",
                        node.height,
                        hash256_to_hex(&node.hash)
                    ))
                })?;
                let result = scratch
                    .disconnect_block(&base, &block, &undo)
                    .map_err(|err| VerifyError::Corrupted(err.to_string()))?;
                match result {
                    DisconnectResult::Ok => good_transactions += block.transactions.len(),
                    DisconnectResult::Unclean => {
                        good_transactions = 0;
                        failure_height = Some(node.height);
                    }
                    DisconnectResult::Failed => {
                        return Err(VerifyError::Corrupted(format!(
                            "*** irrecoverable inconsistency in block data at {}, hash={}",
                            node.height,
                            hash256_to_hex(&node.hash)
                        )))
                    }
                }
            }
            checked += 1;
        }

        if let (Some(height), Some((tip, _))) = (failure_height, blocks.first()) {
            return Err(VerifyError::Corrupted(format!(
                "*** coin database inconsistencies found (last {} blocks, {} good transactions before that)",
                tip.height - height + 1,
                good_transactions
            )));
        }

        if level >= 4 && !skipped {
            for (node, _) in blocks[..checked].iter().rev() {
                if self.interrupt.is_set() {
                    return Ok(VerifyOutcome::Interrupted);
                }
                let block = self.blockman.read_block_for_node(node).map_err(|err| {
                    VerifyError::Corrupted(format!(
                        "*** ReadBlock failed at {}, hash={}: {err}",
                        node.height,
                        hash256_to_hex(&node.hash)
                    ))
                })?;
                scratch
                    .connect_block(&base, &block, node.height)
                    .map_err(|err| {
                        VerifyError::Corrupted(format!(
                            "*** found unconnectable block at {}, hash={} ({err})",
                            node.height,
                            hash256_to_hex(&node.hash)
                        ))
                    })?;
            }
        }

        blockd_log::log_info!(
            "Verification: No coin database inconsistencies in last {} blocks ({} transactions)",
            checked,
            good_transactions
        );
        Ok(if skipped {
            VerifyOutcome::SkippedMissingBlocks
        } else {
            VerifyOutcome::Verified
        })
    }
}
