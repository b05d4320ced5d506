//! Market events and the listener registry they fan out through.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tracing::{error, trace};

use crate::model::{Candle, Trade};

/// Events exposed to consumers of the connector.
#[derive(Debug, Clone)]
pub enum MarketEvent {
    /// A trade with a positive amount.
    TradeBuy(Trade),
    /// A trade with a negative amount.
    TradeSell(Trade),
    /// A new or updated candle bucket.
    Candle(Candle),
    /// The physical connection was (re)established.
    Connected,
    /// A recoverable error: protocol-level rejections, per-frame decode
    /// failures, transport hiccups the reconnect policy will handle.
    Error(String),
    /// Terminal: reconnect attempts are exhausted and the client will not
    /// retry until a new subscribe call is made.
    Disconnected,
}

type Callback = Arc<dyn Fn(&MarketEvent) + Send + Sync>;

/// Capability token returned by [`EventListeners::register`]. Passing it
/// back to `unregister` removes exactly the listener it was issued for.
#[derive(Debug, PartialEq, Eq)]
pub struct ListenerToken(u64);

/// An ordered set of event callbacks.
///
/// Dispatch iterates a snapshot taken under the lock, so a listener that
/// unregisters (or registers) during dispatch cannot corrupt iteration. A
/// panicking listener is caught and logged; it never takes down the
/// receive loop that dispatched to it.
#[derive(Default)]
pub struct EventListeners {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    entries: Vec<(u64, Callback)>,
}

impl EventListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, callback: F) -> ListenerToken
    where
        F: Fn(&MarketEvent) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock().expect("listener registry poisoned");
        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.push((id, Arc::new(callback)));
        ListenerToken(id)
    }

    pub fn unregister(&self, token: ListenerToken) {
        let mut inner = self.inner.lock().expect("listener registry poisoned");
        inner.entries.retain(|(id, _)| *id != token.0);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("listener registry poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every registered listener. Used on shutdown.
    pub fn clear(&self) {
        self.inner
            .lock()
            .expect("listener registry poisoned")
            .entries
            .clear();
    }

    /// Dispatch `event` synchronously, in registration order, to the
    /// listeners registered at the moment of the call.
    pub fn dispatch(&self, event: &MarketEvent) {
        let snapshot: Vec<Callback> = {
            let inner = self.inner.lock().expect("listener registry poisoned");
            inner.entries.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };
        trace!(listeners = snapshot.len(), ?event, "dispatching event");
        for callback in snapshot {
            if catch_unwind(AssertUnwindSafe(|| (*callback)(event))).is_err() {
                error!(?event, "listener panicked during dispatch");
            }
        }
    }
}
