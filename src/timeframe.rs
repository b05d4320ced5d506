//! Candle resolutions supported by the Bitfinex candles channel.

use serde::{Deserialize, Serialize};

/// A candle resolution, per the Bitfinex API documentation.
///
/// Subscriptions and REST candle queries address a series by its code
/// (e.g. `1m`); callers address it by the bucket width in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    M30,
    H1,
    H3,
    H6,
    H12,
    D1,
    W1,
    D14,
    Month1,
}

static TABLE: [(u64, Timeframe); 12] = [
    (60, Timeframe::M1),
    (300, Timeframe::M5),
    (900, Timeframe::M15),
    (1800, Timeframe::M30),
    (3600, Timeframe::H1),
    (10800, Timeframe::H3),
    (21600, Timeframe::H6),
    (43200, Timeframe::H12),
    (86400, Timeframe::D1),
    (604800, Timeframe::W1),
    (1209600, Timeframe::D14),
    (2629744, Timeframe::Month1),
];

impl Timeframe {
    /// Look up a resolution by bucket width. Returns `None` for any period
    /// the exchange does not offer.
    pub fn from_secs(seconds: u64) -> Option<Self> {
        TABLE
            .iter()
            .find(|(secs, _)| *secs == seconds)
            .map(|(_, tf)| *tf)
    }

    /// Look up a resolution by its wire code (e.g. from a subscription key).
    pub fn from_code(code: &str) -> Option<Self> {
        TABLE
            .iter()
            .find(|(_, tf)| tf.code() == code)
            .map(|(_, tf)| *tf)
    }

    /// The code used in subscription keys and REST paths.
    pub fn code(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H3 => "3h",
            Timeframe::H6 => "6h",
            Timeframe::H12 => "12h",
            Timeframe::D1 => "1D",
            Timeframe::W1 => "1W",
            Timeframe::D14 => "14D",
            Timeframe::Month1 => "1M",
        }
    }

    /// Bucket width in seconds.
    pub fn secs(&self) -> u64 {
        TABLE
            .iter()
            .find(|(_, tf)| tf == self)
            .map(|(secs, _)| *secs)
            .unwrap_or(0)
    }

    /// All supported bucket widths, in ascending order.
    pub fn supported_periods() -> impl Iterator<Item = u64> {
        TABLE.iter().map(|(secs, _)| *secs)
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}
