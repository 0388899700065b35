//! The block validity seam. The engine only stores and indexes blocks; what
//! makes a block valid is decided by a [`BlockValidator`].

use std::collections::HashSet;

use blockd_consensus::constants::MAX_BLOCK_SERIALIZED_SIZE;
use blockd_consensus::money::money_range;
use blockd_consensus::params::ConsensusParams;
use blockd_consensus::Hash256;
use blockd_pow::{check_proof_of_work, PowError};
use blockd_primitives::block::{merkle_root, Block};
use rayon::prelude::*;

use crate::blockindex::BlockIndexNode;

/// Transaction counts above which txids are hashed on the rayon pool.
const PARALLEL_TXID_THRESHOLD: usize = 64;

#[derive(Debug)]
pub enum ValidationError {
    InvalidBlock(&'static str),
    InvalidTransaction(&'static str),
    ValueOutOfRange,
    DuplicateTransaction,
    MerkleMismatch,
    Pow(PowError),
    /// Reason supplied by an external validator.
    Rejected(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::InvalidBlock(message) => write!(f, "{message}"),
            ValidationError::InvalidTransaction(message) => write!(f, "{message}"),
            ValidationError::ValueOutOfRange => write!(f, "value out of range"),
            ValidationError::DuplicateTransaction => write!(f, "duplicate transaction"),
            ValidationError::MerkleMismatch => write!(f, "merkle root mismatch"),
            ValidationError::Pow(err) => write!(f, "{err}"),
            ValidationError::Rejected(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<PowError> for ValidationError {
    fn from(err: PowError) -> Self {
        ValidationError::Pow(err)
    }
}

pub trait BlockValidator: Send + Sync {
    /// Context-dependent check of `block` on top of `prev` (`None` for the
    /// genesis block).
    fn validate(
        &self,
        block: &Block,
        prev: Option<&BlockIndexNode>,
        height: i32,
    ) -> Result<(), ValidationError>;
}

/// Structural checks plus proof of work. Scripts are not evaluated.
pub struct PowValidator {
    params: ConsensusParams,
}

impl PowValidator {
    pub fn new(params: ConsensusParams) -> Self {
        Self { params }
    }
}

impl BlockValidator for PowValidator {
    fn validate(
        &self,
        block: &Block,
        prev: Option<&BlockIndexNode>,
        height: i32,
    ) -> Result<(), ValidationError> {
        match prev {
            Some(prev) => {
                if block.header.prev_block != prev.hash || height != prev.height + 1 {
                    return Err(ValidationError::InvalidBlock("prev block mismatch"));
                }
            }
            None => {
                if block.hash() != self.params.hash_genesis_block {
                    return Err(ValidationError::InvalidBlock("unexpected genesis block"));
                }
            }
        }
        validate_block(block, &self.params).map(|_| ())
    }
}

/// Context-free block checks. Returns the txids on success.
pub fn validate_block(
    block: &Block,
    params: &ConsensusParams,
) -> Result<Vec<Hash256>, ValidationError> {
    check_proof_of_work(&block.hash(), block.header.bits, params)?;
    if block.transactions.is_empty() {
        return Err(ValidationError::InvalidBlock(
            "block must contain at least one transaction",
        ));
    }
    if block.consensus_encode().len() > MAX_BLOCK_SERIALIZED_SIZE as usize {
        return Err(ValidationError::InvalidBlock("block size too large"));
    }
    if !block.transactions[0].is_coinbase() {
        return Err(ValidationError::InvalidBlock("first transaction is not coinbase"));
    }
    if block.transactions[1..].iter().any(|tx| tx.is_coinbase()) {
        return Err(ValidationError::InvalidBlock("more than one coinbase"));
    }

    let txids: Vec<Hash256> = if block.transactions.len() > PARALLEL_TXID_THRESHOLD {
        block.transactions.par_iter().map(|tx| tx.txid()).collect()
    } else {
        block.transactions.iter().map(|tx| tx.txid()).collect()
    };
    let (root, mutated) = merkle_root(&txids);
    if mutated {
        return Err(ValidationError::DuplicateTransaction);
    }
    if root != block.header.merkle_root {
        return Err(ValidationError::MerkleMismatch);
    }

    let mut seen_inputs = HashSet::new();
    for tx in &block.transactions {
        if tx.vin.is_empty() || tx.vout.is_empty() {
            return Err(ValidationError::InvalidTransaction(
                "transaction has no inputs or outputs",
            ));
        }
        for output in &tx.vout {
            if !money_range(output.value) {
                return Err(ValidationError::ValueOutOfRange);
            }
        }
        let total = tx.value_out().ok_or(ValidationError::ValueOutOfRange)?;
        if !money_range(total) {
            return Err(ValidationError::ValueOutOfRange);
        }
        if !tx.is_coinbase() {
            for input in &tx.vin {
                if input.prevout.is_null() {
                    return Err(ValidationError::InvalidTransaction("null prevout"));
                }
                if !seen_inputs.insert(input.prevout) {
                    return Err(ValidationError::InvalidTransaction("duplicate input"));
                }
            }
        }
    }
    Ok(txids)
}
