//! Subscriptions and their server-assigned channel bindings.

use std::collections::HashMap;

use crate::timeframe::Timeframe;

/// What kind of stream a subscription covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    Trades,
    Candles(Timeframe),
}

/// The caller's persistent intent: pair plus stream kind. Independent of
/// any particular physical connection or channel id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub pair: String,
    pub kind: SubscriptionKind,
}

impl Subscription {
    pub fn trades(pair: impl Into<String>) -> Self {
        Self {
            pair: pair.into(),
            kind: SubscriptionKind::Trades,
        }
    }

    pub fn candles(pair: impl Into<String>, timeframe: Timeframe) -> Self {
        Self {
            pair: pair.into(),
            kind: SubscriptionKind::Candles(timeframe),
        }
    }

    pub fn is_trades(&self) -> bool {
        self.kind == SubscriptionKind::Trades
    }

    pub fn is_candles(&self) -> bool {
        matches!(self.kind, SubscriptionKind::Candles(_))
    }

    /// Rebuild a candle subscription from a `trade:<code>:<pair>` key, as
    /// echoed back in the server's subscribe acknowledgement.
    pub fn from_candle_key(key: &str) -> Option<Self> {
        let mut parts = key.splitn(3, ':');
        if parts.next()? != "trade" {
            return None;
        }
        let timeframe = Timeframe::from_code(parts.next()?)?;
        let pair = parts.next()?;
        if pair.is_empty() {
            return None;
        }
        Some(Self::candles(pair, timeframe))
    }
}

/// Maps server-assigned channel ids to subscriptions.
///
/// Bindings are valid only for the lifetime of one physical connection;
/// `unbind_all` wipes them on disconnect and the set is rebuilt from the
/// live subscriptions on reconnect.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    bindings: HashMap<i64, Subscription>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a channel id to a subscription. The server is the source of
    /// truth for id reuse, so an existing binding for the same id is
    /// overwritten; any previous id bound to the same subscription is
    /// dropped so a subscription holds at most one id.
    pub fn bind(&mut self, subscription: Subscription, channel_id: i64) {
        self.bindings.retain(|_, bound| *bound != subscription);
        self.bindings.insert(channel_id, subscription);
    }

    /// Resolve an inbound channel id. `None` means the data is for an
    /// unknown (typically just-unsubscribed) channel and is dropped.
    pub fn resolve(&self, channel_id: i64) -> Option<&Subscription> {
        self.bindings.get(&channel_id)
    }

    /// The channel id currently bound to `subscription`, if any.
    pub fn binding_for(&self, subscription: &Subscription) -> Option<i64> {
        self.bindings
            .iter()
            .find_map(|(id, bound)| (bound == subscription).then_some(*id))
    }

    pub fn unbind(&mut self, channel_id: i64) -> Option<Subscription> {
        self.bindings.remove(&channel_id)
    }

    /// Invalidate every binding. Called on disconnect.
    pub fn unbind_all(&mut self) {
        self.bindings.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}
