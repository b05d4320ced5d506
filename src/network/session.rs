//! One physical WebSocket connection and its receive loop.
//!
//! A session owns exactly one connection. The receive loop runs as a
//! background task that multiplexes outbound commands and inbound frames;
//! decoded domain events are dispatched synchronously, in receive order,
//! through the shared listener registry. The session never reconnects on
//! its own: any unexpected closure fires a connection-lost signal and the
//! subscription manager decides what to do with it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::channel::{ChannelRegistry, Subscription};
use crate::codec;
use crate::error::BitfinexError;
use crate::events::{EventListeners, MarketEvent};
use crate::model::message::{CandleRow, DataPayload, InboundMessage, LifecycleEvent};
use crate::model::{datetime_from_ms, Candle, Side, Trade};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection lifecycle. `Closed` is re-entrant: a closed session can be
/// connected again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Idle = 0,
    Connecting = 1,
    Open = 2,
    Closing = 3,
    Closed = 4,
}

impl SessionState {
    fn as_u8(self) -> u8 {
        self as u8
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => SessionState::Connecting,
            2 => SessionState::Open,
            3 => SessionState::Closing,
            4 => SessionState::Closed,
            _ => SessionState::Idle,
        }
    }
}

/// Owns one physical duplex connection.
pub struct ConnectionSession {
    registry: Arc<Mutex<ChannelRegistry>>,
    listeners: Arc<EventListeners>,
    /// Fired once per connection on unexpected closure.
    lost_tx: mpsc::Sender<()>,
    state: Arc<AtomicU8>,
    command_tx: Option<mpsc::Sender<String>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ConnectionSession {
    pub fn new(
        registry: Arc<Mutex<ChannelRegistry>>,
        listeners: Arc<EventListeners>,
        lost_tx: mpsc::Sender<()>,
    ) -> Self {
        Self {
            registry,
            listeners,
            lost_tx,
            state: Arc::new(AtomicU8::new(SessionState::Idle.as_u8())),
            command_tx: None,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    /// Dial the endpoint and start the receive loop. A no-op on an already
    /// open session; a closed session is torn down and redialed.
    pub async fn connect(&mut self, endpoint: &Url) -> Result<(), BitfinexError> {
        if self.is_open() {
            return Ok(());
        }
        self.teardown().await;
        self.set_state(SessionState::Connecting);
        info!(%endpoint, "connecting");

        let (ws, _) = match connect_async(endpoint.as_str()).await {
            Ok(ok) => ok,
            Err(e) => {
                self.set_state(SessionState::Closed);
                return Err(e.into());
            }
        };

        let (command_tx, command_rx) = mpsc::channel(32);
        let cancel = CancellationToken::new();
        let ctx = SessionContext {
            registry: Arc::clone(&self.registry),
            listeners: Arc::clone(&self.listeners),
            lost_tx: self.lost_tx.clone(),
            state: Arc::clone(&self.state),
            cancel: cancel.clone(),
        };

        self.set_state(SessionState::Open);
        self.task = Some(tokio::spawn(run_session(ws, command_rx, ctx)));
        self.command_tx = Some(command_tx);
        self.cancel = cancel;
        info!("connected");
        Ok(())
    }

    /// Queue one outbound frame for the receive loop to send.
    pub async fn send(&self, frame: String) -> Result<(), BitfinexError> {
        let tx = self.command_tx.as_ref().ok_or(BitfinexError::NotConnected)?;
        tx.send(frame).await.map_err(|_| BitfinexError::ChannelClosed)
    }

    /// Close the connection and stop the receive loop. Idempotent; all
    /// exit paths converge here exactly once per connection.
    pub async fn close(&mut self) {
        if self.task.is_none() {
            self.set_state(SessionState::Closed);
            return;
        }
        self.set_state(SessionState::Closing);
        self.teardown().await;
        self.set_state(SessionState::Closed);
        info!("session closed");
    }

    async fn teardown(&mut self) {
        self.cancel.cancel();
        self.command_tx = None;
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

/// Everything the receive loop needs besides the stream itself.
struct SessionContext {
    registry: Arc<Mutex<ChannelRegistry>>,
    listeners: Arc<EventListeners>,
    lost_tx: mpsc::Sender<()>,
    state: Arc<AtomicU8>,
    cancel: CancellationToken,
}

async fn run_session(ws: WsStream, mut command_rx: mpsc::Receiver<String>, ctx: SessionContext) {
    let (mut write, mut read) = ws.split();
    // At most one open bucket per candle channel; identity is the open time.
    let mut open_candles: HashMap<i64, Candle> = HashMap::new();
    let mut lost = false;

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                debug!("receive loop cancelled");
                break;
            }
            cmd = command_rx.recv() => match cmd {
                Some(frame) => {
                    trace!(%frame, "sending frame");
                    if let Err(e) = write.send(Message::Text(frame.into())).await {
                        error!("send failed: {e}");
                        ctx.listeners.dispatch(&MarketEvent::Error(format!("send failed: {e}")));
                        lost = true;
                        break;
                    }
                }
                None => {
                    let _ = write.send(Message::Close(None)).await;
                    debug!("command channel closed, shutting down");
                    break;
                }
            },
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if handle_frame(&text, &mut open_candles, &ctx) == FrameOutcome::Reconnect {
                        lost = true;
                        break;
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = write.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) => {
                    warn!("peer closed the connection");
                    lost = true;
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!("websocket error: {e}");
                    ctx.listeners.dispatch(&MarketEvent::Error(format!("websocket error: {e}")));
                    lost = true;
                    break;
                }
                None => {
                    warn!("stream ended unexpectedly");
                    lost = true;
                    break;
                }
            },
        }
    }

    ctx.state.store(SessionState::Closed.as_u8(), Ordering::SeqCst);
    if lost {
        let _ = ctx.lost_tx.try_send(());
    }
}

#[derive(Debug, PartialEq)]
enum FrameOutcome {
    Continue,
    /// A server signal made this connection unusable; tear it down and let
    /// the subscription manager reconnect.
    Reconnect,
}

fn handle_frame(
    raw: &str,
    open_candles: &mut HashMap<i64, Candle>,
    ctx: &SessionContext,
) -> FrameOutcome {
    let message = match codec::decode(raw) {
        Ok(message) => message,
        Err(e) => {
            // One bad frame never takes the session down.
            warn!("dropping malformed frame: {e}");
            ctx.listeners.dispatch(&MarketEvent::Error(e.to_string()));
            return FrameOutcome::Continue;
        }
    };

    match message {
        InboundMessage::Lifecycle(event) => handle_lifecycle(event, ctx),
        InboundMessage::Data {
            channel_id,
            payload,
        } => {
            handle_data(channel_id, payload, open_candles, ctx);
            FrameOutcome::Continue
        }
    }
}

fn handle_lifecycle(event: LifecycleEvent, ctx: &SessionContext) -> FrameOutcome {
    match event {
        LifecycleEvent::Subscribed {
            channel,
            chan_id,
            symbol,
            key,
        } => {
            let subscription = match channel.as_str() {
                "trades" => symbol.map(Subscription::trades),
                "candles" => key.as_deref().and_then(Subscription::from_candle_key),
                _ => None,
            };
            match subscription {
                Some(subscription) => {
                    debug!(chan_id, ?subscription, "channel bound");
                    ctx.registry
                        .lock()
                        .expect("registry poisoned")
                        .bind(subscription, chan_id);
                }
                None => warn!(%channel, chan_id, "unrecognized subscribe ack"),
            }
            FrameOutcome::Continue
        }
        LifecycleEvent::Unsubscribed { chan_id } => {
            ctx.registry
                .lock()
                .expect("registry poisoned")
                .unbind(chan_id);
            debug!(chan_id, "channel unbound");
            FrameOutcome::Continue
        }
        LifecycleEvent::Error { msg } => {
            warn!("server error: {msg}");
            ctx.listeners.dispatch(&MarketEvent::Error(msg));
            FrameOutcome::Continue
        }
        LifecycleEvent::Info { code: Some(code) } if codec::is_reconnect_code(code) => {
            warn!(code, "server requested reconnect");
            FrameOutcome::Reconnect
        }
        LifecycleEvent::Info { code } => {
            debug!(?code, "server info");
            FrameOutcome::Continue
        }
        LifecycleEvent::Other { event } => {
            trace!(%event, "ignoring lifecycle event");
            FrameOutcome::Continue
        }
    }
}

fn handle_data(
    channel_id: i64,
    payload: DataPayload,
    open_candles: &mut HashMap<i64, Candle>,
    ctx: &SessionContext,
) {
    let subscription = {
        let registry = ctx.registry.lock().expect("registry poisoned");
        registry.resolve(channel_id).cloned()
    };
    let Some(subscription) = subscription else {
        // Late data for a just-unsubscribed channel. Not an error.
        trace!(channel_id, "data for unknown channel dropped");
        return;
    };

    match payload {
        DataPayload::Heartbeat | DataPayload::Ignored => {}
        DataPayload::Trade(update) => {
            let time = match datetime_from_ms(update.time_ms) {
                Ok(time) => time,
                Err(e) => {
                    warn!("dropping trade with bad timestamp: {e}");
                    ctx.listeners.dispatch(&MarketEvent::Error(e.to_string()));
                    return;
                }
            };
            let trade = Trade {
                id: update.id,
                pair: subscription.pair.clone(),
                time,
                amount: update.amount,
                price: update.price,
            };
            let event = match trade.side() {
                Side::Buy => MarketEvent::TradeBuy(trade),
                Side::Sell => MarketEvent::TradeSell(trade),
            };
            ctx.listeners.dispatch(&event);
        }
        DataPayload::CandleSnapshot(rows) => {
            for row in &rows {
                emit_candle(channel_id, &subscription, row, open_candles, ctx);
            }
        }
        DataPayload::CandleUpdate(row) => {
            emit_candle(channel_id, &subscription, &row, open_candles, ctx);
        }
    }
}

/// Merge a row into the channel's open bucket, or start a new bucket, then
/// dispatch the resulting candle.
fn emit_candle(
    channel_id: i64,
    subscription: &Subscription,
    row: &CandleRow,
    open_candles: &mut HashMap<i64, Candle>,
    ctx: &SessionContext,
) {
    let candle = match open_candles.get_mut(&channel_id) {
        Some(current) if current.same_bucket(row) => {
            current.merge_update(row);
            current.clone()
        }
        _ => match Candle::from_row(&subscription.pair, row) {
            Ok(candle) => {
                open_candles.insert(channel_id, candle.clone());
                candle
            }
            Err(e) => {
                warn!("dropping candle with bad timestamp: {e}");
                ctx.listeners.dispatch(&MarketEvent::Error(e.to_string()));
                return;
            }
        },
    };
    ctx.listeners.dispatch(&MarketEvent::Candle(candle));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeframe::Timeframe;
    use rust_decimal_macros::dec;

    fn test_ctx() -> (SessionContext, Arc<Mutex<Vec<MarketEvent>>>) {
        let listeners = Arc::new(EventListeners::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        listeners.register(move |event| {
            sink.lock().unwrap().push(event.clone());
        });

        let (lost_tx, _lost_rx) = mpsc::channel(1);
        let ctx = SessionContext {
            registry: Arc::new(Mutex::new(ChannelRegistry::new())),
            listeners,
            lost_tx,
            state: Arc::new(AtomicU8::new(SessionState::Open.as_u8())),
            cancel: CancellationToken::new(),
        };
        (ctx, seen)
    }

    fn bind(ctx: &SessionContext, subscription: Subscription, chan_id: i64) {
        ctx.registry.lock().unwrap().bind(subscription, chan_id);
    }

    #[test]
    fn test_heartbeat_emits_nothing() {
        let (ctx, seen) = test_ctx();
        bind(&ctx, Subscription::trades("tBTCUSD"), 17);

        let mut candles = HashMap::new();
        let outcome = handle_frame(r#"[17,"hb"]"#, &mut candles, &ctx);

        assert_eq!(outcome, FrameOutcome::Continue);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_trade_sign_selects_buy_or_sell() {
        let (ctx, seen) = test_ctx();
        bind(&ctx, Subscription::trades("tBTCUSD"), 17);
        let mut candles = HashMap::new();

        handle_frame(
            r#"[17,"tu",["412","1690000000000","0.5","27000.1"]]"#,
            &mut candles,
            &ctx,
        );
        handle_frame(
            r#"[17,"tu",["413","1690000001000","-0.5","27000.0"]]"#,
            &mut candles,
            &ctx,
        );

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        let MarketEvent::TradeBuy(buy) = &seen[0] else {
            panic!("expected buy, got {:?}", seen[0]);
        };
        assert_eq!(buy.amount, dec!(0.5));
        assert_eq!(buy.pair, "tBTCUSD");
        assert!(matches!(&seen[1], MarketEvent::TradeSell(t) if t.amount == dec!(-0.5)));
    }

    #[test]
    fn test_unknown_channel_data_is_dropped() {
        let (ctx, seen) = test_ctx();
        let mut candles = HashMap::new();

        handle_frame(
            r#"[99,"tu",["412","1690000000000","0.5","27000.1"]]"#,
            &mut candles,
            &ctx,
        );
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_same_bucket_updates_merge() {
        let (ctx, seen) = test_ctx();
        bind(&ctx, Subscription::candles("tBTCUSD", Timeframe::M1), 42);
        let mut candles = HashMap::new();

        handle_frame(r#"[42,[1690000000000,100,105,110,95,2]]"#, &mut candles, &ctx);
        handle_frame(r#"[42,[1690000000000,100,107,111,95,3]]"#, &mut candles, &ctx);

        // One open bucket, two events reflecting its evolution.
        assert_eq!(candles.len(), 1);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        let (MarketEvent::Candle(first), MarketEvent::Candle(second)) = (&seen[0], &seen[1])
        else {
            panic!("expected candle events");
        };
        assert_eq!(first.open_time, second.open_time);
        assert_eq!(second.close, dec!(107));
        assert_eq!(second.high, dec!(111));
        assert_eq!(second.volume, dec!(3));
        assert_eq!(second.total_value, dec!(321));
    }

    #[test]
    fn test_new_bucket_replaces_open_candle() {
        let (ctx, seen) = test_ctx();
        bind(&ctx, Subscription::candles("tBTCUSD", Timeframe::M1), 42);
        let mut candles = HashMap::new();

        handle_frame(r#"[42,[1690000000000,100,105,110,95,2]]"#, &mut candles, &ctx);
        handle_frame(r#"[42,[1690000060000,105,106,107,104,1]]"#, &mut candles, &ctx);

        assert_eq!(candles.len(), 1);
        assert_eq!(
            candles.get(&42).unwrap().open_time.timestamp_millis(),
            1_690_000_060_000
        );
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_snapshot_batch_emits_each_row() {
        let (ctx, seen) = test_ctx();
        bind(&ctx, Subscription::candles("tBTCUSD", Timeframe::M1), 42);
        let mut candles = HashMap::new();

        handle_frame(
            r#"[42,[[1690000060000,105,106,107,104,1],[1690000000000,100,105,110,95,2]]]"#,
            &mut candles,
            &ctx,
        );

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|e| matches!(e, MarketEvent::Candle(_))));
    }

    #[test]
    fn test_decode_failure_does_not_poison_the_stream() {
        let (ctx, seen) = test_ctx();
        bind(&ctx, Subscription::trades("tBTCUSD"), 17);
        let mut candles = HashMap::new();

        let outcome = handle_frame(r#"[17,"tu",[1,2]]"#, &mut candles, &ctx);
        assert_eq!(outcome, FrameOutcome::Continue);
        handle_frame(
            r#"[17,"tu",["412","1690000000000","0.5","27000.1"]]"#,
            &mut candles,
            &ctx,
        );

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(matches!(&seen[0], MarketEvent::Error(_)));
        assert!(matches!(&seen[1], MarketEvent::TradeBuy(_)));
    }

    #[test]
    fn test_subscribe_ack_binds_channel() {
        let (ctx, _seen) = test_ctx();
        let mut candles = HashMap::new();

        handle_frame(
            r#"{"event":"subscribed","channel":"trades","chanId":17,"symbol":"tBTCUSD"}"#,
            &mut candles,
            &ctx,
        );
        handle_frame(
            r#"{"event":"subscribed","channel":"candles","chanId":42,"key":"trade:1m:tBTCUSD"}"#,
            &mut candles,
            &ctx,
        );

        let registry = ctx.registry.lock().unwrap();
        assert_eq!(
            registry.binding_for(&Subscription::trades("tBTCUSD")),
            Some(17)
        );
        assert_eq!(
            registry.binding_for(&Subscription::candles("tBTCUSD", Timeframe::M1)),
            Some(42)
        );
    }

    #[test]
    fn test_unsubscribe_ack_unbinds_channel() {
        let (ctx, _seen) = test_ctx();
        bind(&ctx, Subscription::trades("tBTCUSD"), 17);
        let mut candles = HashMap::new();

        handle_frame(
            r#"{"event":"unsubscribed","status":"OK","chanId":17}"#,
            &mut candles,
            &ctx,
        );
        assert!(ctx.registry.lock().unwrap().is_empty());
    }

    #[test]
    fn test_restart_code_forces_reconnect() {
        let (ctx, seen) = test_ctx();
        let mut candles = HashMap::new();

        let outcome = handle_frame(r#"{"event":"info","code":20051}"#, &mut candles, &ctx);
        assert_eq!(outcome, FrameOutcome::Reconnect);
        // A reconnect trigger is not a user-facing error by itself.
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_info_greeting_is_ignored() {
        let (ctx, seen) = test_ctx();
        let mut candles = HashMap::new();

        let outcome = handle_frame(r#"{"event":"info","version":2}"#, &mut candles, &ctx);
        assert_eq!(outcome, FrameOutcome::Continue);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_server_error_is_recoverable() {
        let (ctx, seen) = test_ctx();
        let mut candles = HashMap::new();

        let outcome = handle_frame(
            r#"{"event":"error","msg":"symbol: invalid"}"#,
            &mut candles,
            &ctx,
        );
        assert_eq!(outcome, FrameOutcome::Continue);
        let seen = seen.lock().unwrap();
        assert!(matches!(&seen[0], MarketEvent::Error(msg) if msg == "symbol: invalid"));
    }
}
