//! Consensus-wide constants shared by storage and validation.

/// The maximum allowed size for a serialized block, in bytes.
pub const MAX_BLOCK_SERIALIZED_SIZE: u32 = 4_000_000;
/// Coinbase outputs can only be spent after this number of new blocks.
pub const COINBASE_MATURITY: i32 = 100;
/// How far a block timestamp may run ahead of the adjusted local clock.
pub const MAX_FUTURE_BLOCK_TIME: i64 = 2 * 60 * 60;
