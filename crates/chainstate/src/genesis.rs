use blockd_consensus::params::ConsensusParams;
use blockd_consensus::{hash256_to_hex, Hash256};
use blockd_primitives::block::{Block, BlockHeader, CURRENT_VERSION};
use blockd_primitives::outpoint::OutPoint;
use blockd_primitives::transaction::{Transaction, TxIn, TxOut, SEQUENCE_FINAL};

const GENESIS_TIMESTAMP: &str = "blockd 17/Oct/2026 flat files keep the chain honest";
const GENESIS_OUTPUT_PUBKEY: [u8; 33] = [
    0x02, 0x79, 0xbe, 0x66, 0x7e, 0xf9, 0xdc, 0xbb, 0xac, 0x55, 0xa0, 0x62, 0x95, 0xce, 0x87,
    0x0b, 0x07, 0x02, 0x9b, 0xfc, 0xdb, 0x2d, 0xce, 0x28, 0xd9, 0x59, 0xf2, 0x81, 0x5b, 0x16,
    0xf8, 0x17, 0x98,
];
const OP_CHECKSIG: u8 = 0xac;

fn push_data(script: &mut Vec<u8>, data: &[u8]) {
    script.push(data.len() as u8);
    script.extend_from_slice(data);
}

fn genesis_script_sig() -> Vec<u8> {
    let mut script = Vec::new();
    push_data(&mut script, &0x1d00ffffu32.to_le_bytes());
    push_data(&mut script, &[4]);
    push_data(&mut script, GENESIS_TIMESTAMP.as_bytes());
    script
}

fn genesis_script_pubkey() -> Vec<u8> {
    let mut script = Vec::with_capacity(GENESIS_OUTPUT_PUBKEY.len() + 2);
    push_data(&mut script, &GENESIS_OUTPUT_PUBKEY);
    script.push(OP_CHECKSIG);
    script
}

/// Builds the network's genesis block and checks it hashes to the
/// configured value.
pub fn genesis_block(params: &ConsensusParams) -> Result<Block, String> {
    let coinbase = Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: genesis_script_sig(),
            sequence: SEQUENCE_FINAL,
        }],
        vout: vec![TxOut {
            value: params.genesis_reward,
            script_pubkey: genesis_script_pubkey(),
        }],
        lock_time: 0,
    };
    let block = Block {
        header: BlockHeader {
            version: CURRENT_VERSION,
            prev_block: [0u8; 32],
            merkle_root: coinbase.txid(),
            time: params.genesis_time,
            bits: params.genesis_bits,
            nonce: params.genesis_nonce,
        },
        transactions: vec![coinbase],
    };
    let hash: Hash256 = block.hash();
    if hash != params.hash_genesis_block {
        return Err(format!(
            "genesis hash mismatch: built {} expected {}",
            hash256_to_hex(&hash),
            hash256_to_hex(&params.hash_genesis_block)
        ));
    }
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockd_consensus::{consensus_params, Network};
    use blockd_pow::check_proof_of_work;

    #[test]
    fn genesis_matches_params_on_every_network() {
        for network in [Network::Mainnet, Network::Testnet, Network::Regtest] {
            let params = consensus_params(network);
            let block = genesis_block(&params).expect("genesis");
            assert_eq!(block.hash(), params.hash_genesis_block);
            check_proof_of_work(&block.hash(), block.header.bits, &params).expect("pow");
            assert_eq!(block.compute_merkle_root().0, block.header.merkle_root);
        }
    }
}
