//! Monetary units and the money range rule.

pub type Amount = i64;

pub const COIN: Amount = 100_000_000;

/// No single output or output sum may exceed this.
pub const MAX_MONEY: Amount = 21_000_000 * COIN;

pub fn money_range(value: Amount) -> bool {
    (0..=MAX_MONEY).contains(&value)
}
