//! Wire codec for the Bitfinex v2 WebSocket protocol.
//!
//! Decoding classifies one complete text frame into an [`InboundMessage`];
//! encoding produces the subscribe/unsubscribe request payloads. A decode
//! failure is reported for that one frame only and never tears down the
//! session.

use rust_decimal::Decimal;
use serde_json::{json, Value};

use crate::error::BitfinexError;
use crate::model::message::{CandleRow, DataPayload, InboundMessage, LifecycleEvent, TradeUpdate};
use crate::timeframe::Timeframe;

/// Info codes after which the server terminates the connection
/// (20051: restart, 20060: maintenance). Both demand a full reconnect.
pub const RECONNECT_INFO_CODES: [i64; 2] = [20051, 20060];

pub fn is_reconnect_code(code: i64) -> bool {
    RECONNECT_INFO_CODES.contains(&code)
}

/// Classify and decode one complete inbound frame.
pub fn decode(raw: &str) -> Result<InboundMessage, BitfinexError> {
    let value: Value = serde_json::from_str(raw)?;
    match value {
        Value::Object(obj) => decode_lifecycle(&obj).map(InboundMessage::Lifecycle),
        Value::Array(arr) => decode_data(&arr),
        other => Err(BitfinexError::Protocol(format!(
            "frame is neither object nor array: {other}"
        ))),
    }
}

fn decode_lifecycle(
    obj: &serde_json::Map<String, Value>,
) -> Result<LifecycleEvent, BitfinexError> {
    let event = obj
        .get("event")
        .and_then(Value::as_str)
        .ok_or_else(|| BitfinexError::Protocol("object frame without event field".into()))?;

    match event {
        "subscribed" => {
            let channel = obj
                .get("channel")
                .and_then(Value::as_str)
                .ok_or_else(|| BitfinexError::Protocol("subscribed without channel".into()))?
                .to_string();
            let chan_id = obj
                .get("chanId")
                .and_then(Value::as_i64)
                .ok_or_else(|| BitfinexError::Protocol("subscribed without chanId".into()))?;
            Ok(LifecycleEvent::Subscribed {
                channel,
                chan_id,
                symbol: obj.get("symbol").and_then(Value::as_str).map(String::from),
                key: obj.get("key").and_then(Value::as_str).map(String::from),
            })
        }
        "unsubscribed" => {
            let chan_id = obj
                .get("chanId")
                .and_then(Value::as_i64)
                .ok_or_else(|| BitfinexError::Protocol("unsubscribed without chanId".into()))?;
            Ok(LifecycleEvent::Unsubscribed { chan_id })
        }
        "error" => Ok(LifecycleEvent::Error {
            msg: obj
                .get("msg")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        }),
        "info" => Ok(LifecycleEvent::Info {
            code: obj.get("code").and_then(Value::as_i64),
        }),
        other => Ok(LifecycleEvent::Other {
            event: other.to_string(),
        }),
    }
}

fn decode_data(arr: &[Value]) -> Result<InboundMessage, BitfinexError> {
    if arr.len() < 2 {
        return Err(BitfinexError::Protocol(format!(
            "array frame too short: {} elements",
            arr.len()
        )));
    }
    let channel_id = arr[0]
        .as_i64()
        .ok_or_else(|| BitfinexError::Protocol("channel id is not an integer".into()))?;

    let payload = match &arr[1] {
        Value::String(tag) if tag == "hb" => DataPayload::Heartbeat,
        Value::String(tag) if tag == "tu" => {
            let tuple = arr
                .get(2)
                .and_then(Value::as_array)
                .ok_or_else(|| BitfinexError::Protocol("tu frame without trade tuple".into()))?;
            DataPayload::Trade(parse_trade_tuple(tuple)?)
        }
        // "te" pre-confirmations and funding tags carry no extra information
        // over the matching "tu"; acting on both would duplicate trades.
        Value::String(_) => DataPayload::Ignored,
        Value::Array(inner) if inner.first().map(Value::is_array).unwrap_or(true) => {
            let rows = inner
                .iter()
                .map(|row| {
                    row.as_array()
                        .ok_or_else(|| {
                            BitfinexError::Protocol("snapshot row is not an array".into())
                        })
                        .and_then(|row| parse_candle_row(row))
                })
                .collect::<Result<Vec<_>, _>>()?;
            DataPayload::CandleSnapshot(rows)
        }
        Value::Array(inner) => DataPayload::CandleUpdate(parse_candle_row(inner)?),
        other => {
            return Err(BitfinexError::Protocol(format!(
                "unexpected data payload: {other}"
            )))
        }
    };

    Ok(InboundMessage::Data {
        channel_id,
        payload,
    })
}

/// `[id, mts, amount, price]`, values arriving as numbers or numeric strings.
pub(crate) fn parse_trade_tuple(tuple: &[Value]) -> Result<TradeUpdate, BitfinexError> {
    if tuple.len() < 4 {
        return Err(BitfinexError::Protocol(format!(
            "trade tuple has {} elements, expected 4",
            tuple.len()
        )));
    }
    Ok(TradeUpdate {
        id: as_text(&tuple[0]),
        time_ms: as_i64(&tuple[1])?,
        amount: as_decimal(&tuple[2])?,
        price: as_decimal(&tuple[3])?,
    })
}

/// `[mts, open, close, high, low, volume]`.
pub(crate) fn parse_candle_row(row: &[Value]) -> Result<CandleRow, BitfinexError> {
    if row.len() < 6 {
        return Err(BitfinexError::Protocol(format!(
            "candle row has {} elements, expected 6",
            row.len()
        )));
    }
    Ok(CandleRow {
        open_time_ms: as_i64(&row[0])?,
        open: as_decimal(&row[1])?,
        close: as_decimal(&row[2])?,
        high: as_decimal(&row[3])?,
        low: as_decimal(&row[4])?,
        volume: as_decimal(&row[5])?,
    })
}

pub(crate) fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub(crate) fn as_i64(value: &Value) -> Result<i64, BitfinexError> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .ok_or_else(|| BitfinexError::Protocol(format!("not an integer: {n}"))),
        Value::String(s) => s
            .parse()
            .map_err(|_| BitfinexError::Protocol(format!("not an integer: {s}"))),
        other => Err(BitfinexError::Protocol(format!("not an integer: {other}"))),
    }
}

pub(crate) fn as_decimal(value: &Value) -> Result<Decimal, BitfinexError> {
    let text = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        other => {
            return Err(BitfinexError::Protocol(format!("not a number: {other}")));
        }
    };
    text.parse::<Decimal>()
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(|_| BitfinexError::Protocol(format!("not a number: {text}")))
}

/// `{"event":"subscribe","channel":"trades","symbol":"<PAIR>"}`
pub fn subscribe_trades(pair: &str) -> String {
    json!({
        "event": "subscribe",
        "channel": "trades",
        "symbol": pair,
    })
    .to_string()
}

/// `{"event":"subscribe","channel":"candles","key":"trade:<RES>:<PAIR>"}`
pub fn subscribe_candles(pair: &str, timeframe: Timeframe) -> String {
    json!({
        "event": "subscribe",
        "channel": "candles",
        "key": candle_key(pair, timeframe),
    })
    .to_string()
}

/// `{"event":"unsubscribe","chanId":<id>}`
pub fn unsubscribe(channel_id: i64) -> String {
    json!({
        "event": "unsubscribe",
        "chanId": channel_id,
    })
    .to_string()
}

pub fn candle_key(pair: &str, timeframe: Timeframe) -> String {
    format!("trade:{}:{}", timeframe.code(), pair)
}
