//! Domain types emitted by the connector.

pub mod candle;
pub mod message;
pub mod ticker;
pub mod trade;

pub use candle::Candle;
pub use ticker::Ticker;
pub use trade::{Side, Trade};

use chrono::{DateTime, TimeZone, Utc};

use crate::error::BitfinexError;

/// Bitfinex timestamps are milliseconds since the Unix epoch.
pub(crate) fn datetime_from_ms(ms: i64) -> Result<DateTime<Utc>, BitfinexError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| BitfinexError::Protocol(format!("timestamp out of range: {ms}")))
}
