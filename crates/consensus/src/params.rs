//! Network parameter definitions.

use crate::money::{Amount, COIN};
use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "mainnet" | "main" => Some(Network::Mainnet),
            "testnet" | "test" => Some(Network::Testnet),
            "regtest" => Some(Network::Regtest),
            _ => None,
        }
    }
}

/// A trusted coin-set snapshot height. `coins_hash` commits to the serialized
/// coin set at `block_hash`; `chain_tx` is the cumulative transaction count up
/// to and including that block.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AssumeutxoData {
    pub height: i32,
    pub block_hash: Hash256,
    pub coins_hash: Hash256,
    pub chain_tx: u64,
}

#[derive(Clone, Debug)]
pub struct ConsensusParams {
    pub network: Network,
    pub hash_genesis_block: Hash256,
    pub genesis_time: u32,
    pub genesis_bits: u32,
    pub genesis_nonce: u32,
    pub genesis_reward: Amount,
    pub pow_limit: Hash256,
    pub pow_target_spacing: i64,
    /// Height from which blocks must carry the witness-validated flag.
    pub witness_height: Option<i32>,
    /// Automatic pruning never runs while the tip is at or below this height.
    pub prune_after_height: i32,
    pub assumeutxo: Vec<AssumeutxoData>,
}

impl ConsensusParams {
    pub fn assumeutxo_for_height(&self, height: i32) -> Option<&AssumeutxoData> {
        self.assumeutxo.iter().find(|entry| entry.height == height)
    }

    pub fn assumeutxo_for_hash(&self, hash: &Hash256) -> Option<&AssumeutxoData> {
        self.assumeutxo.iter().find(|entry| &entry.block_hash == hash)
    }

    pub fn witness_active_at(&self, height: i32) -> bool {
        self.witness_height.is_some_and(|start| height >= start)
    }
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub consensus: ConsensusParams,
    pub message_start: [u8; 4],
    /// Subdirectory of the data dir used for this network; empty for mainnet.
    pub data_dir_suffix: &'static str,
    pub assumed_blockchain_size_gb: u64,
}

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Mainnet => ChainParams {
            network,
            consensus: consensus_params(network),
            message_start: [0xb1, 0x0c, 0xdf, 0x5a],
            data_dir_suffix: "",
            assumed_blockchain_size_gb: 20,
        },
        Network::Testnet => ChainParams {
            network,
            consensus: consensus_params(network),
            message_start: [0x0b, 0x1d, 0x7e, 0x42],
            data_dir_suffix: "testnet",
            assumed_blockchain_size_gb: 4,
        },
        Network::Regtest => ChainParams {
            network,
            consensus: consensus_params(network),
            message_start: [0xfa, 0xbf, 0xb5, 0xda],
            data_dir_suffix: "regtest",
            assumed_blockchain_size_gb: 0,
        },
    }
}

pub fn consensus_params(network: Network) -> ConsensusParams {
    match network {
        Network::Mainnet => ConsensusParams {
            network,
            hash_genesis_block: hash256_from_hex(
                "00005ca9aa374363440760dfcffdd900b1379a9693e712123ebc5b1cb2f7a227",
            )
            .expect("mainnet genesis hash"),
            genesis_time: 1_760_000_000,
            genesis_bits: 0x1f00ffff,
            genesis_nonce: 10_941,
            genesis_reward: 50 * COIN,
            pow_limit: hash256_from_hex(
                "0000ffff00000000000000000000000000000000000000000000000000000000",
            )
            .expect("mainnet pow limit"),
            pow_target_spacing: 600,
            witness_height: Some(0),
            prune_after_height: 100_000,
            assumeutxo: Vec::new(),
        },
        Network::Testnet => ConsensusParams {
            network,
            hash_genesis_block: hash256_from_hex(
                "00557f90abcc74129c3dbd3e37388175b98e36e1b59839fe2289b3339c46a1bc",
            )
            .expect("testnet genesis hash"),
            genesis_time: 1_760_000_100,
            genesis_bits: 0x2000ffff,
            genesis_nonce: 510,
            genesis_reward: 50 * COIN,
            pow_limit: hash256_from_hex(
                "00ffff0000000000000000000000000000000000000000000000000000000000",
            )
            .expect("testnet pow limit"),
            pow_target_spacing: 600,
            witness_height: Some(0),
            prune_after_height: 1_000,
            assumeutxo: Vec::new(),
        },
        Network::Regtest => ConsensusParams {
            network,
            hash_genesis_block: hash256_from_hex(
                "1efee498a001ebe53925aae03f7006232f5710b558ee8d7623da4e8ad93b8b55",
            )
            .expect("regtest genesis hash"),
            genesis_time: 1_760_000_200,
            genesis_bits: 0x207fffff,
            genesis_nonce: 0,
            genesis_reward: 50 * COIN,
            pow_limit: hash256_from_hex(
                "7fffff0000000000000000000000000000000000000000000000000000000000",
            )
            .expect("regtest pow limit"),
            pow_target_spacing: 600,
            witness_height: Some(0),
            prune_after_height: 1_000,
            assumeutxo: Vec::new(),
        },
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

impl std::fmt::Display for HexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HexError::InvalidLength => write!(f, "hash hex must be 1..=64 digits"),
            HexError::InvalidHex => write!(f, "invalid hex digit"),
        }
    }
}

impl std::error::Error for HexError {}

/// Parses a display-order (big-endian) hash into its little-endian bytes.
pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let mut hex = input.trim();
    if let Some(stripped) = hex.strip_prefix("0x").or_else(|| hex.strip_prefix("0X")) {
        hex = stripped;
    }
    if hex.is_empty() || hex.len() > 64 {
        return Err(HexError::InvalidLength);
    }

    let padded = format!("{hex:0>64}");
    let mut bytes = [0u8; 32];
    for (i, byte_out) in bytes.iter_mut().enumerate() {
        let start = i * 2;
        *byte_out =
            u8::from_str_radix(&padded[start..start + 2], 16).map_err(|_| HexError::InvalidHex)?;
    }
    bytes.reverse();
    Ok(bytes)
}

pub fn hash256_to_hex(hash: &Hash256) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        let _ = write!(out, "{byte:02x}");
    }
    out
}
