//! Public client: subscription management and the reconnect policy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::channel::{ChannelRegistry, Subscription, SubscriptionKind};
use crate::codec;
use crate::error::BitfinexError;
use crate::events::{EventListeners, ListenerToken, MarketEvent};
use crate::network::session::ConnectionSession;
use crate::timeframe::Timeframe;

/// Bitfinex public WebSocket endpoint.
pub const DEFAULT_ENDPOINT: &str = "wss://api-pub.bitfinex.com/ws/2";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: Url,
    /// Reconnect attempts after a lost connection before giving up.
    pub max_reconnect_attempts: u32,
    /// Delay before the first reconnect attempt; doubles per attempt.
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: Url::parse(DEFAULT_ENDPOINT).expect("default endpoint is valid"),
            max_reconnect_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(16),
        }
    }
}

/// Subscription manager for the Bitfinex market-data feed.
///
/// Connects on the first subscribe, reconnects with bounded backoff on
/// connection loss (replaying every live subscription), and disconnects
/// when the last subscription is removed.
///
/// One trade subscription and one candle subscription are active at a time
/// per client instance; subscribing to a new pair supersedes the previous
/// subscription of the same kind. Run one client per connection to stream
/// multiple pairs concurrently.
///
/// Must be created inside a Tokio runtime: the constructor spawns the
/// reconnect supervisor task.
pub struct BitfinexClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    listeners: Arc<EventListeners>,
    registry: Arc<Mutex<ChannelRegistry>>,
    /// The caller's live intent; survives reconnects.
    subscriptions: Mutex<Vec<Subscription>>,
    session: tokio::sync::Mutex<ConnectionSession>,
    /// Set when reconnect attempts are exhausted; cleared by the next
    /// successful subscribe.
    gave_up: AtomicBool,
    shutdown: CancellationToken,
}

impl BitfinexClient {
    pub fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    pub fn with_config(config: ClientConfig) -> Self {
        let listeners = Arc::new(EventListeners::new());
        let registry = Arc::new(Mutex::new(ChannelRegistry::new()));
        let (lost_tx, lost_rx) = mpsc::channel(4);
        let session =
            ConnectionSession::new(Arc::clone(&registry), Arc::clone(&listeners), lost_tx);

        let inner = Arc::new(ClientInner {
            config,
            listeners,
            registry,
            subscriptions: Mutex::new(Vec::new()),
            session: tokio::sync::Mutex::new(session),
            gave_up: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });

        let supervisor = Arc::clone(&inner);
        tokio::spawn(async move { supervisor.supervise(lost_rx).await });

        Self { inner }
    }

    /// Register a callback for market events. The returned token removes
    /// exactly this listener when passed to [`unregister_listener`].
    ///
    /// [`unregister_listener`]: Self::unregister_listener
    pub fn register_listener<F>(&self, callback: F) -> ListenerToken
    where
        F: Fn(&MarketEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.register(callback)
    }

    pub fn unregister_listener(&self, token: ListenerToken) {
        self.inner.listeners.unregister(token);
    }

    /// Subscribe to the trade stream for `pair`, connecting first if
    /// necessary. A no-op if the identical subscription is already live.
    pub async fn subscribe_trades(&self, pair: &str) -> Result<(), BitfinexError> {
        if pair.is_empty() {
            return Err(BitfinexError::EmptyPair);
        }
        let subscription = Subscription::trades(pair);
        let mut session = self.inner.session.lock().await;

        if session.is_open() && self.inner.has_subscription(&subscription) {
            debug!(%pair, "already subscribed to trades");
            return Ok(());
        }

        let superseded = self
            .inner
            .take_subscriptions(|s| s.is_trades() && s.pair != pair);
        for old in &superseded {
            info!(pair = %old.pair, "superseding previous trade subscription");
            self.inner.send_unsubscribe(&session, old).await;
        }

        self.inner.add_subscription(subscription);
        self.inner.ensure_open(&mut session).await?;
        session.send(codec::subscribe_trades(pair)).await
    }

    /// Remove the trade subscription for `pair`. The unsubscribe request is
    /// best-effort; the local subscription is removed even if the
    /// connection is already gone.
    pub async fn unsubscribe_trades(&self, pair: &str) -> Result<(), BitfinexError> {
        if pair.is_empty() {
            return Err(BitfinexError::EmptyPair);
        }
        let mut session = self.inner.session.lock().await;
        let removed = self
            .inner
            .take_subscriptions(|s| s.is_trades() && s.pair == pair);
        for subscription in &removed {
            self.inner.send_unsubscribe(&session, subscription).await;
        }
        self.inner.close_if_idle(&mut session).await;
        Ok(())
    }

    /// Subscribe to the candle stream for `pair` at the resolution whose
    /// bucket width is `period_secs`. Unsupported periods are rejected
    /// before any connection is attempted.
    pub async fn subscribe_candles(
        &self,
        pair: &str,
        period_secs: u64,
    ) -> Result<(), BitfinexError> {
        if pair.is_empty() {
            return Err(BitfinexError::EmptyPair);
        }
        let timeframe = Timeframe::from_secs(period_secs)
            .ok_or(BitfinexError::UnsupportedPeriod(period_secs))?;
        let subscription = Subscription::candles(pair, timeframe);
        let mut session = self.inner.session.lock().await;

        if session.is_open() && self.inner.has_subscription(&subscription) {
            debug!(%pair, %timeframe, "already subscribed to candles");
            return Ok(());
        }

        let superseded = self
            .inner
            .take_subscriptions(|s| s.is_candles() && *s != subscription);
        for old in &superseded {
            info!(pair = %old.pair, "superseding previous candle subscription");
            self.inner.send_unsubscribe(&session, old).await;
        }

        self.inner.add_subscription(subscription);
        self.inner.ensure_open(&mut session).await?;
        session.send(codec::subscribe_candles(pair, timeframe)).await
    }

    /// Remove the candle subscription for `pair`. If no subscriptions
    /// remain the connection is torn down.
    pub async fn unsubscribe_candles(&self, pair: &str) -> Result<(), BitfinexError> {
        if pair.is_empty() {
            return Err(BitfinexError::EmptyPair);
        }
        let mut session = self.inner.session.lock().await;
        let removed = self
            .inner
            .take_subscriptions(|s| s.is_candles() && s.pair == pair);
        for subscription in &removed {
            self.inner.send_unsubscribe(&session, subscription).await;
        }
        self.inner.close_if_idle(&mut session).await;
        Ok(())
    }

    /// Currently live subscriptions.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.inner
            .subscriptions
            .lock()
            .expect("subscriptions poisoned")
            .clone()
    }

    /// Cancel the receive loop, close the connection, and release every
    /// registered listener. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let mut session = self.inner.session.lock().await;
        session.close().await;
        self.inner
            .subscriptions
            .lock()
            .expect("subscriptions poisoned")
            .clear();
        self.inner
            .registry
            .lock()
            .expect("registry poisoned")
            .unbind_all();
        self.inner.listeners.clear();
    }
}

impl ClientInner {
    fn has_subscription(&self, subscription: &Subscription) -> bool {
        self.subscriptions
            .lock()
            .expect("subscriptions poisoned")
            .contains(subscription)
    }

    fn add_subscription(&self, subscription: Subscription) {
        let mut subs = self.subscriptions.lock().expect("subscriptions poisoned");
        if !subs.contains(&subscription) {
            subs.push(subscription);
        }
    }

    fn take_subscriptions<F>(&self, pred: F) -> Vec<Subscription>
    where
        F: Fn(&Subscription) -> bool,
    {
        let mut subs = self.subscriptions.lock().expect("subscriptions poisoned");
        let mut removed = Vec::new();
        subs.retain(|s| {
            if pred(s) {
                removed.push(s.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Send an unsubscribe for the channel bound to `subscription`, if any.
    /// Best-effort: the local subscription set is the source of truth, so a
    /// failed send only logs.
    async fn send_unsubscribe(&self, session: &ConnectionSession, subscription: &Subscription) {
        let binding = self
            .registry
            .lock()
            .expect("registry poisoned")
            .binding_for(subscription);
        if let Some(chan_id) = binding {
            if session.is_open() {
                if let Err(e) = session.send(codec::unsubscribe(chan_id)).await {
                    warn!(chan_id, "unsubscribe send failed: {e}");
                }
            }
            self.registry
                .lock()
                .expect("registry poisoned")
                .unbind(chan_id);
        }
    }

    async fn ensure_open(&self, session: &mut ConnectionSession) -> Result<(), BitfinexError> {
        if session.is_open() {
            return Ok(());
        }
        session.connect(&self.config.endpoint).await?;
        self.gave_up.store(false, Ordering::SeqCst);
        self.listeners.dispatch(&MarketEvent::Connected);
        Ok(())
    }

    async fn close_if_idle(&self, session: &mut ConnectionSession) {
        let idle = self
            .subscriptions
            .lock()
            .expect("subscriptions poisoned")
            .is_empty();
        if idle {
            debug!("last subscription removed, disconnecting");
            session.close().await;
        }
    }

    /// Owns the connection-lost signal: wipes stale bindings, retries with
    /// exponential backoff, and replays live subscriptions on success.
    async fn supervise(self: Arc<Self>, mut lost_rx: mpsc::Receiver<()>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                signal = lost_rx.recv() => {
                    if signal.is_none() {
                        return;
                    }
                }
            }

            // Channel ids from the dead connection mean nothing now.
            self.registry
                .lock()
                .expect("registry poisoned")
                .unbind_all();

            let idle = self
                .subscriptions
                .lock()
                .expect("subscriptions poisoned")
                .is_empty();
            if idle || self.gave_up.load(Ordering::SeqCst) {
                continue;
            }

            warn!("connection lost, starting reconnect attempts");
            self.listeners
                .dispatch(&MarketEvent::Error("connection lost".to_string()));

            if !self.reconnect().await {
                self.gave_up.store(true, Ordering::SeqCst);
                let terminal =
                    BitfinexError::ReconnectExhausted(self.config.max_reconnect_attempts);
                error!("{terminal}");
                self.listeners
                    .dispatch(&MarketEvent::Error(terminal.to_string()));
                self.listeners.dispatch(&MarketEvent::Disconnected);
            }
        }
    }

    /// Returns false only when every attempt was made and none connected.
    /// Shutdown or the last unsubscribe landing mid-backoff abandons the
    /// cycle without dialing again.
    async fn reconnect(&self) -> bool {
        let mut delay = self.config.initial_backoff;
        for attempt in 1..=self.config.max_reconnect_attempts {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("shutdown during backoff, abandoning reconnect");
                    return true;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(self.config.max_backoff);

            let idle = self
                .subscriptions
                .lock()
                .expect("subscriptions poisoned")
                .is_empty();
            if idle {
                debug!("subscriptions removed during backoff, abandoning reconnect");
                return true;
            }

            let mut session = self.session.lock().await;
            if self.shutdown.is_cancelled() {
                return true;
            }
            match session.connect(&self.config.endpoint).await {
                Ok(()) => {
                    if self.shutdown.is_cancelled() {
                        session.close().await;
                        return true;
                    }
                    info!(attempt, "reconnected");
                    self.listeners.dispatch(&MarketEvent::Connected);
                    if let Err(e) = self.replay_subscriptions(&session).await {
                        // The fresh connection dropped already; the next
                        // lost signal restarts the cycle.
                        warn!("failed to replay subscriptions: {e}");
                    }
                    return true;
                }
                Err(e) => warn!(attempt, "reconnect attempt failed: {e}"),
            }
        }
        false
    }

    async fn replay_subscriptions(
        &self,
        session: &ConnectionSession,
    ) -> Result<(), BitfinexError> {
        let subs: Vec<Subscription> = self
            .subscriptions
            .lock()
            .expect("subscriptions poisoned")
            .clone();
        for subscription in subs {
            debug!(?subscription, "replaying subscription");
            let frame = match subscription.kind {
                SubscriptionKind::Trades => codec::subscribe_trades(&subscription.pair),
                SubscriptionKind::Candles(timeframe) => {
                    codec::subscribe_candles(&subscription.pair, timeframe)
                }
            };
            session.send(frame).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::session::SessionState;
    use futures::{SinkExt, StreamExt};
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::Message;

    #[tokio::test]
    async fn test_empty_pair_rejected() {
        let client = BitfinexClient::new();
        assert!(matches!(
            client.subscribe_trades("").await,
            Err(BitfinexError::EmptyPair)
        ));
        assert!(matches!(
            client.unsubscribe_candles("").await,
            Err(BitfinexError::EmptyPair)
        ));
    }

    #[tokio::test]
    async fn test_unsupported_period_rejected_before_connecting() {
        let client = BitfinexClient::new();
        assert!(matches!(
            client.subscribe_candles("tBTCUSD", 123).await,
            Err(BitfinexError::UnsupportedPeriod(123))
        ));
        // Validation precedes I/O: no connection was even attempted.
        assert_eq!(
            client.inner.session.lock().await.state(),
            SessionState::Idle
        );
        assert!(client.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_local_state_without_connection() {
        let client = BitfinexClient::new();
        let subscription = Subscription::trades("tBTCUSD");
        client.inner.add_subscription(subscription.clone());
        client
            .inner
            .registry
            .lock()
            .unwrap()
            .bind(subscription.clone(), 17);

        // The connection is long gone; removal must not get stuck.
        client.unsubscribe_trades("tBTCUSD").await.unwrap();

        assert!(client.subscriptions().is_empty());
        assert_eq!(
            client
                .inner
                .registry
                .lock()
                .unwrap()
                .binding_for(&subscription),
            None
        );
    }

    #[tokio::test]
    async fn test_shutdown_releases_listeners() {
        let client = BitfinexClient::new();
        let _token = client.register_listener(|_| {});
        assert_eq!(client.inner.listeners.len(), 1);

        client.shutdown().await;
        client.shutdown().await; // idempotent
        assert!(client.inner.listeners.is_empty());
    }

    #[tokio::test]
    async fn test_dial_failure_surfaces_socket_error() {
        let config = ClientConfig {
            endpoint: Url::parse("ws://127.0.0.1:1").unwrap(),
            ..ClientConfig::default()
        };
        let client = BitfinexClient::with_config(config);
        assert!(matches!(
            client.subscribe_trades("tBTCUSD").await,
            Err(BitfinexError::Socket(_))
        ));
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_during_backoff_stops_redialing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handshakes = Arc::new(AtomicUsize::new(0));

        // Kill every connection as soon as the client says anything.
        let count = Arc::clone(&handshakes);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };
                count.fetch_add(1, Ordering::SeqCst);
                let _ = ws.next().await;
            }
        });

        let config = ClientConfig {
            endpoint: Url::parse(&format!("ws://{addr}")).unwrap(),
            max_reconnect_attempts: 3,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_millis(250),
        };
        let client = BitfinexClient::with_config(config);
        client.subscribe_trades("tBTCUSD").await.unwrap();

        // The server drops the connection; dispose the client while the
        // supervisor is sleeping off its first backoff.
        tokio::time::sleep(Duration::from_millis(100)).await;
        client.shutdown().await;
        tokio::time::sleep(Duration::from_millis(900)).await;

        assert_eq!(handshakes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_restart_request_triggers_resubscribe() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel();

        // First connection answers the subscribe with a restart request;
        // later connections just record what the client sends.
        tokio::spawn(async move {
            let mut conn = 0u32;
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                conn += 1;
                let restart = conn == 1;
                let frame_tx = frame_tx.clone();
                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };
                    while let Some(Ok(msg)) = ws.next().await {
                        if let Message::Text(text) = msg {
                            let _ = frame_tx.send((conn, text));
                            if restart {
                                let frame = r#"{"event":"info","code":20051}"#;
                                let _ = ws.send(Message::Text(frame.into())).await;
                            }
                        }
                    }
                });
            }
        });

        let config = ClientConfig {
            endpoint: Url::parse(&format!("ws://{addr}")).unwrap(),
            max_reconnect_attempts: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(50),
        };
        let client = BitfinexClient::with_config(config);
        client.subscribe_trades("tBTCUSD").await.unwrap();

        let (conn, frame) = timeout(Duration::from_secs(2), frame_rx.recv())
            .await
            .expect("no subscribe on first connection")
            .expect("server task gone");
        assert_eq!(conn, 1);
        assert!(frame.contains(r#""channel":"trades""#));

        // The restart frame closed the session; the manager must dial a
        // fresh connection and replay the subscription unprompted.
        let (conn, frame) = timeout(Duration::from_secs(5), frame_rx.recv())
            .await
            .expect("no resubscribe after restart request")
            .expect("server task gone");
        assert_eq!(conn, 2);
        assert!(frame.contains(r#""event":"subscribe""#));
        assert!(frame.contains("tBTCUSD"));
        assert_eq!(client.subscriptions().len(), 1);

        client.shutdown().await;
    }

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.endpoint.as_str(), DEFAULT_ENDPOINT);
        assert!(config.max_reconnect_attempts > 0);
        assert!(config.initial_backoff < config.max_backoff);
    }
}
