//! Block/transaction types and their consensus serialization.

pub mod block;
pub mod encoding;
pub mod hash;
pub mod outpoint;
pub mod transaction;

pub use block::{merkle_root, Block, BlockHeader};
pub use hash::{sha256, sha256d, Sha256dWriter};
pub use outpoint::OutPoint;
pub use transaction::{Transaction, TxIn, TxOut};
