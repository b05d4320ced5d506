//! One-shot REST fetches against the Bitfinex public API.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::codec;
use crate::error::BitfinexError;
use crate::model::{datetime_from_ms, Candle, Ticker, Trade};
use crate::timeframe::Timeframe;

/// Bitfinex public REST endpoint.
pub const DEFAULT_REST_ENDPOINT: &str = "https://api-pub.bitfinex.com/v2/";

pub struct RestClient {
    http: reqwest::Client,
    base_url: Url,
}

impl RestClient {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_REST_ENDPOINT).expect("default endpoint is valid")
    }

    pub fn with_base_url(base_url: &str) -> Result<Self, BitfinexError> {
        Ok(Self {
            http: reqwest::Client::new(),
            base_url: Url::parse(base_url)?,
        })
    }

    /// Fetch the most recent trades for a pair, newest first.
    pub async fn get_trades(&self, pair: &str, limit: u32) -> Result<Vec<Trade>, BitfinexError> {
        if pair.is_empty() {
            return Err(BitfinexError::EmptyPair);
        }
        if limit == 0 {
            return Err(BitfinexError::InvalidCount);
        }

        let url = self.base_url.join(&format!("trades/{pair}/hist"))?;
        debug!(%url, limit, "fetching trades");
        let rows: Vec<Vec<Value>> = self
            .http
            .get(url)
            .query(&[("limit", limit)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        rows.iter()
            .map(|row| {
                let update = codec::parse_trade_tuple(row)?;
                Ok(Trade {
                    id: update.id,
                    pair: pair.to_string(),
                    time: datetime_from_ms(update.time_ms)?,
                    amount: update.amount,
                    price: update.price,
                })
            })
            .collect()
    }

    /// Fetch a candle series for a pair at the resolution whose bucket
    /// width is `period_secs`, newest first.
    pub async fn get_candles(
        &self,
        pair: &str,
        period_secs: u64,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        limit: Option<u32>,
    ) -> Result<Vec<Candle>, BitfinexError> {
        if pair.is_empty() {
            return Err(BitfinexError::EmptyPair);
        }
        let timeframe = Timeframe::from_secs(period_secs)
            .ok_or(BitfinexError::UnsupportedPeriod(period_secs))?;
        if limit == Some(0) {
            return Err(BitfinexError::InvalidCount);
        }

        let key = codec::candle_key(pair, timeframe);
        let url = self.base_url.join(&format!("candles/{key}/hist"))?;
        debug!(%url, "fetching candles");

        let mut request = self.http.get(url);
        if let Some(from) = from {
            request = request.query(&[("start", from.timestamp_millis())]);
        }
        if let Some(to) = to {
            request = request.query(&[("end", to.timestamp_millis())]);
        }
        if let Some(limit) = limit {
            request = request.query(&[("limit", limit)]);
        }

        let rows: Vec<Vec<Value>> = request
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        rows.iter()
            .map(|row| Candle::from_row(pair, &codec::parse_candle_row(row)?))
            .collect()
    }

    /// Fetch the current ticker snapshot for a symbol.
    pub async fn get_ticker(&self, symbol: &str) -> Result<Ticker, BitfinexError> {
        if symbol.is_empty() {
            return Err(BitfinexError::EmptyPair);
        }

        let url = self.base_url.join(&format!("ticker/{symbol}"))?;
        debug!(%url, "fetching ticker");
        let row: Vec<Value> = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if row.len() < 10 {
            return Err(BitfinexError::Protocol(format!(
                "ticker row has {} elements, expected 10",
                row.len()
            )));
        }
        Ok(Ticker {
            bid: codec::as_decimal(&row[0])?,
            bid_size: codec::as_decimal(&row[1])?,
            ask: codec::as_decimal(&row[2])?,
            ask_size: codec::as_decimal(&row[3])?,
            daily_change: codec::as_decimal(&row[4])?,
            daily_change_relative: codec::as_decimal(&row[5])?,
            last_price: codec::as_decimal(&row[6])?,
            volume: codec::as_decimal(&row[7])?,
            high: codec::as_decimal(&row[8])?,
            low: codec::as_decimal(&row[9])?,
        })
    }
}

impl Default for RestClient {
    fn default() -> Self {
        Self::new()
    }
}
