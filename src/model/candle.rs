use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::message::CandleRow;
use super::datetime_from_ms;
use crate::error::BitfinexError;

/// One OHLC bucket.
///
/// While the bucket is still open on the wire, successive updates with the
/// same open time replace the high/low/close/volume fields in place; the
/// bucket becomes immutable once data for a newer open time arrives.
/// Identity is (pair, resolution, open time).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub pair: String,
    /// Bucket start, aligned to the subscribed resolution.
    pub open_time: DateTime<Utc>,
    pub open: Decimal,
    pub close: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub volume: Decimal,
    /// Derived notional: volume x close.
    pub total_value: Decimal,
}

impl Candle {
    pub fn from_row(pair: &str, row: &CandleRow) -> Result<Self, BitfinexError> {
        Ok(Self {
            pair: pair.to_string(),
            open_time: datetime_from_ms(row.open_time_ms)?,
            open: row.open,
            close: row.close,
            high: row.high,
            low: row.low,
            volume: row.volume,
            total_value: row.volume * row.close,
        })
    }

    /// Whether `row` belongs to this bucket.
    pub fn same_bucket(&self, row: &CandleRow) -> bool {
        self.open_time.timestamp_millis() == row.open_time_ms
    }

    /// Fold an update for the same bucket into this candle. The server row
    /// carries the full running values, so merge means replace.
    pub fn merge_update(&mut self, row: &CandleRow) {
        debug_assert!(self.same_bucket(row));
        self.open = row.open;
        self.close = row.close;
        self.high = row.high;
        self.low = row.low;
        self.volume = row.volume;
        self.total_value = row.volume * row.close;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn row(open_time_ms: i64, close: Decimal, volume: Decimal) -> CandleRow {
        CandleRow {
            open_time_ms,
            open: dec!(100),
            close,
            high: dec!(110),
            low: dec!(95),
            volume,
        }
    }

    #[test]
    fn test_from_row_derives_notional() {
        let candle = Candle::from_row("tBTCUSD", &row(1_690_000_000_000, dec!(105), dec!(2))).unwrap();
        assert_eq!(candle.total_value, dec!(210));
        assert_eq!(candle.open_time.timestamp_millis(), 1_690_000_000_000);
    }

    #[test]
    fn test_merge_replaces_running_fields() {
        let mut candle =
            Candle::from_row("tBTCUSD", &row(1_690_000_000_000, dec!(105), dec!(2))).unwrap();
        candle.merge_update(&row(1_690_000_000_000, dec!(107), dec!(3)));
        assert_eq!(candle.close, dec!(107));
        assert_eq!(candle.volume, dec!(3));
        assert_eq!(candle.total_value, dec!(321));
    }

    #[test]
    fn test_bucket_identity_by_open_time() {
        let candle =
            Candle::from_row("tBTCUSD", &row(1_690_000_000_000, dec!(105), dec!(2))).unwrap();
        assert!(candle.same_bucket(&row(1_690_000_000_000, dec!(1), dec!(1))));
        assert!(!candle.same_bucket(&row(1_690_000_060_000, dec!(1), dec!(1))));
    }
}
