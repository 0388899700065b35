//! Chain parameters and consensus-wide constants.

pub mod constants;
pub mod money;
pub mod params;

pub use params::{
    chain_params, consensus_params, hash256_from_hex, hash256_to_hex, AssumeutxoData,
    ChainParams, ConsensusParams, HexError, Network,
};

pub type Hash256 = [u8; 32];
