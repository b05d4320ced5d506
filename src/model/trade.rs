use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Trade direction, encoded on the wire as the sign of the amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

/// A single executed trade. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    /// Exchange-assigned identifier, unique per pair and time.
    pub id: String,
    pub pair: String,
    pub time: DateTime<Utc>,
    /// Signed amount: positive for buys, negative for sells.
    pub amount: Decimal,
    pub price: Decimal,
}

impl Trade {
    pub fn side(&self) -> Side {
        if self.amount < Decimal::ZERO {
            Side::Sell
        } else {
            Side::Buy
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn trade(amount: Decimal) -> Trade {
        Trade {
            id: "412".to_string(),
            pair: "tBTCUSD".to_string(),
            time: Utc::now(),
            amount,
            price: dec!(27000.1),
        }
    }

    #[test]
    fn test_positive_amount_is_buy() {
        assert_eq!(trade(dec!(0.5)).side(), Side::Buy);
    }

    #[test]
    fn test_negative_amount_is_sell() {
        assert_eq!(trade(dec!(-0.5)).side(), Side::Sell);
    }
}
