//! Compact targets, per-block work and the proof-of-work check.

pub mod difficulty;
pub mod validation;

pub use difficulty::{block_proof, compact_to_u256, u256_to_compact, CompactError};
pub use validation::{check_proof_of_work, PowError};
