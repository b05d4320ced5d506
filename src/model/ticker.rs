use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A ticker snapshot. No identity: a fresh fetch replaces the previous
/// snapshot entirely, never merged incrementally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub bid: Decimal,
    pub bid_size: Decimal,
    pub ask: Decimal,
    pub ask_size: Decimal,
    pub daily_change: Decimal,
    pub daily_change_relative: Decimal,
    pub last_price: Decimal,
    /// 24h traded volume.
    pub volume: Decimal,
    pub high: Decimal,
    pub low: Decimal,
}
