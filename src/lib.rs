//! Bitfinex public market-data connector: REST snapshots (trades, candles,
//! tickers), a reconnecting WebSocket subscription client, and a portfolio
//! valuation helper built on top.

pub mod channel;
pub mod client;
pub mod codec;
mod error;
pub mod events;
pub mod model;
pub mod network;
pub mod portfolio;
pub mod rest;
pub mod timeframe;

pub use channel::{ChannelRegistry, Subscription, SubscriptionKind};
pub use client::{BitfinexClient, ClientConfig, DEFAULT_ENDPOINT};
pub use error::BitfinexError;
pub use events::{EventListeners, ListenerToken, MarketEvent};
pub use model::{Candle, Side, Ticker, Trade};
pub use network::{ConnectionSession, SessionState};
pub use portfolio::{Portfolio, PortfolioCalculator, PortfolioValuation};
pub use rest::RestClient;
pub use timeframe::Timeframe;
