use thiserror::Error;

#[derive(Error, Debug)]
pub enum BitfinexError {
    #[error("WebSocket error: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Failed to parse JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Malformed frame: {0}")]
    Protocol(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid URL")]
    UrlParse(#[from] url::ParseError),

    #[error("Internal channel closed")]
    ChannelClosed,

    #[error("Not connected")]
    NotConnected,

    #[error("Pair must not be empty")]
    EmptyPair,

    #[error("Count must be greater than zero")]
    InvalidCount,

    #[error("Unsupported candle period: {0}s")]
    UnsupportedPeriod(u64),

    #[error("Reconnect attempts exhausted after {0} tries")]
    ReconnectExhausted(u32),

    #[error("No conversion rate available from {from} to {to}")]
    MissingRate { from: String, to: String },
}
