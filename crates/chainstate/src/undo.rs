use blockd_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use blockd_primitives::outpoint::OutPoint;

use crate::coins::Coin;

const BLOCK_UNDO_VERSION: u8 = 1;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SpentCoin {
    pub outpoint: OutPoint,
    pub coin: Coin,
}

/// Coins consumed by a block, in transaction order then input order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BlockUndo {
    pub spent: Vec<SpentCoin>,
}

impl BlockUndo {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u8(BLOCK_UNDO_VERSION);
        encoder.write_varint(self.spent.len() as u64);
        for spent in &self.spent {
            spent.outpoint.consensus_encode(&mut encoder);
            spent.coin.encode_into(&mut encoder);
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let version = decoder.read_u8()?;
        if version != BLOCK_UNDO_VERSION {
            return Err(DecodeError::InvalidData("unsupported block undo version"));
        }
        let count = decoder.read_varint()? as usize;
        let mut spent = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            let outpoint = OutPoint::consensus_decode(&mut decoder)?;
            let coin = Coin::decode_from(&mut decoder)?;
            spent.push(SpentCoin { outpoint, coin });
        }
        decoder.finish()?;
        Ok(Self { spent })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undo_roundtrip() {
        let undo = BlockUndo {
            spent: vec![SpentCoin {
                outpoint: OutPoint::new([9u8; 32], 1),
                coin: Coin {
                    value: 42,
                    script_pubkey: vec![0x51],
                    height: 7,
                    is_coinbase: true,
                },
            }],
        };
        assert_eq!(BlockUndo::decode(&undo.encode()).expect("decode"), undo);
    }

    #[test]
    fn rejects_unknown_version() {
        let mut bytes = BlockUndo::default().encode();
        bytes[0] = 9;
        assert!(BlockUndo::decode(&bytes).is_err());
    }
}
