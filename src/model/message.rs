//! Typed representation of inbound WebSocket frames.
//!
//! Bitfinex sends two top-level shapes: JSON objects carry lifecycle
//! events, JSON arrays carry channel data prefixed with the channel id.
//! Classifying into an exhaustive enum keeps the merge-vs-append logic
//! for candles compiler-checked instead of inferred from value shapes.

use rust_decimal::Decimal;

/// One complete inbound frame, classified.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Lifecycle(LifecycleEvent),
    Data {
        channel_id: i64,
        payload: DataPayload,
    },
}

/// Object frames: subscription handshakes and server status.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    /// The server acknowledged a subscription and assigned a channel id.
    /// `symbol` is present for trade channels, `key` for candle channels.
    Subscribed {
        channel: String,
        chan_id: i64,
        symbol: Option<String>,
        key: Option<String>,
    },
    /// The server confirmed an unsubscribe for a channel id.
    Unsubscribed { chan_id: i64 },
    /// A recoverable protocol-level error, never fatal to the session.
    Error { msg: String },
    /// Server status. Some codes demand a full reconnect; the greeting
    /// frame carries no code at all.
    Info { code: Option<i64> },
    /// Any event we do not act on.
    Other { event: String },
}

/// Array-frame payloads, after the leading channel id.
#[derive(Debug, Clone, PartialEq)]
pub enum DataPayload {
    /// `"hb"` keep-alive; consumed, produces no domain event.
    Heartbeat,
    /// A `"tu"` trade update.
    Trade(TradeUpdate),
    /// Array-of-arrays: the initial batch of candle buckets.
    CandleSnapshot(Vec<CandleRow>),
    /// A flat row: an update for the most recent bucket.
    CandleUpdate(CandleRow),
    /// String tags we deliberately skip (e.g. `"te"` pre-confirmations).
    Ignored,
}

/// Raw trade tuple `[id, mts, amount, price]`. The pair is not on the
/// wire; it is resolved from the channel registry.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeUpdate {
    pub id: String,
    pub time_ms: i64,
    pub amount: Decimal,
    pub price: Decimal,
}

/// Raw candle row `[mts, open, close, high, low, volume]`.
#[derive(Debug, Clone, PartialEq)]
pub struct CandleRow {
    pub open_time_ms: i64,
    pub open: Decimal,
    pub close: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub volume: Decimal,
}
