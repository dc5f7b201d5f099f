//! Request/response over the extension's fire-and-forget message bus.
//!
//! Every call gets a fresh integer id, is parked in the pending map, and settles on the
//! first reply carrying that id or on its deadline, whichever comes first. The bus is
//! shared with unrelated traffic, so anything that is not an extension reply for a
//! parked id is dropped on the floor.

pub mod api;
pub mod protocol;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::channel::MessageChannel;
use crate::config::HubConfig;
use crate::error::{Error, Result};

type Waiter = oneshot::Sender<std::result::Result<Value, String>>;
type PendingMap = Arc<Mutex<HashMap<u64, Waiter>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeOptions {
    pub call_timeout: Duration,
    pub slow_call_warn: Duration,
}

impl Default for BridgeOptions {
    fn default() -> Self { Self::from(&HubConfig::default()) }
}

impl From<&HubConfig> for BridgeOptions {
    fn from(cfg: &HubConfig) -> Self {
        Self { call_timeout: cfg.call_timeout(), slow_call_warn: cfg.slow_call_warn() }
    }
}

pub struct Bridge {
    channel: Option<Arc<dyn MessageChannel>>,
    options: BridgeOptions,
    next_id: AtomicU64,
    pending: PendingMap,
    listening: OnceLock<()>,
}

impl Bridge {
    /// Bridge over an existing bus. Subscribes immediately.
    pub fn new(channel: Arc<dyn MessageChannel>, options: BridgeOptions) -> Self {
        let bridge = Self::build(Some(channel), options);
        // Cannot fail: the channel is present.
        let _ = bridge.listen();
        bridge
    }

    /// Bridge for a context with no bus at all. Every call fails fast with `ChannelUnavailable`.
    pub fn detached(options: BridgeOptions) -> Self { Self::build(None, options) }

    fn build(channel: Option<Arc<dyn MessageChannel>>, options: BridgeOptions) -> Self {
        Self {
            channel,
            options,
            next_id: AtomicU64::new(0),
            pending: Arc::new(Mutex::new(HashMap::new())),
            listening: OnceLock::new(),
        }
    }

    pub fn options(&self) -> BridgeOptions { self.options }

    /// False for a detached bridge.
    pub fn has_channel(&self) -> bool { self.channel.is_some() }

    /// Number of calls still waiting for a reply.
    pub fn in_flight(&self) -> usize { lock(&self.pending).len() }

    // Subscribes to the bus at most once for the lifetime of the bridge.
    fn listen(&self) -> Result<&Arc<dyn MessageChannel>> {
        let channel = self.channel.as_ref().ok_or(Error::ChannelUnavailable)?;
        self.listening.get_or_init(|| {
            let pending = self.pending.clone();
            channel.on_message(Arc::new(move |message| deliver(&pending, message)));
        });
        Ok(channel)
    }

    /// Send one request and decode its reply as `T`.
    pub async fn call<T, P>(&self, kind: &str, payload: P) -> Result<T>
    where
        T: DeserializeOwned,
        P: Serialize,
    {
        let payload = protocol::payload_object(kind, payload)?;
        let data = self.call_raw(kind, payload).await?;
        Ok(serde_json::from_value(data)?)
    }

    pub async fn call_raw(&self, kind: &str, payload: Map<String, Value>) -> Result<Value> {
        let channel = self.listen()?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        // Park before posting: a synchronous bus may deliver the reply inside `post`.
        lock(&self.pending).insert(id, tx);
        let _parked = Parked { pending: &self.pending, id };

        debug!(id, request = kind, "posting request");
        channel.post(protocol::outbound(id, kind, payload))?;

        let start = Instant::now();
        let outcome = tokio::time::timeout(self.options.call_timeout, rx).await;
        self.warn_if_slow(start, kind, id);
        match outcome {
            Ok(Ok(Ok(data))) => Ok(data),
            Ok(Ok(Err(message))) => {
                debug!(id, request = kind, error = %message, "extension rejected request");
                Err(Error::Provider(message))
            }
            Ok(Err(_)) | Err(_) => {
                debug!(id, request = kind, "request timed out");
                Err(Error::NotResponding { request: kind.to_string(), after: self.options.call_timeout })
            }
        }
    }

    fn warn_if_slow(&self, start: Instant, kind: &str, id: u64) {
        let elapsed = start.elapsed();
        if elapsed > self.options.slow_call_warn {
            warn!(id, request = kind, ?elapsed, "slow extension call");
        }
    }
}

// Removes the pending slot however the call ends: reply, timeout, or the caller dropping us.
struct Parked<'a> {
    pending: &'a PendingMap,
    id: u64,
}

impl Drop for Parked<'_> {
    fn drop(&mut self) { lock(self.pending).remove(&self.id); }
}

fn deliver(pending: &PendingMap, message: &Value) {
    let Some(reply) = protocol::parse_reply(message) else { return };
    let waiter = lock(pending).remove(&reply.id);
    match waiter {
        Some(tx) => { let _ = tx.send(reply.outcome); }
        None => trace!(id = reply.id, "ignoring reply for unknown or settled call"),
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannel;
    use serde_json::json;

    fn options() -> BridgeOptions {
        BridgeOptions { call_timeout: Duration::from_secs(5), slow_call_warn: Duration::from_secs(2) }
    }

    #[tokio::test]
    async fn detached_bridge_fails_fast() {
        let bridge = Bridge::detached(options());
        let err = bridge.call::<Value, _>(protocol::request::PING, ()).await.unwrap_err();
        assert!(matches!(err, Error::ChannelUnavailable));
        assert_eq!(bridge.in_flight(), 0);
    }

    #[tokio::test]
    async fn subscribes_exactly_once() {
        let bus = Arc::new(MemoryChannel::new());
        let bridge = Bridge::new(bus.clone(), options());
        // Answer synchronously from the bus itself.
        let echo = bus.clone();
        bus.on_message(Arc::new(move |msg| {
            if let Some(req) = protocol::parse_request(msg) {
                echo.post(protocol::reply_ok(req.id, json!(req.id))).unwrap();
            }
        }));
        for _ in 0..3 {
            let _: u64 = bridge.call("ANY", ()).await.unwrap();
        }
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn ids_strictly_increase() {
        let bus = Arc::new(MemoryChannel::new());
        let bridge = Bridge::new(bus.clone(), options());
        let echo = bus.clone();
        bus.on_message(Arc::new(move |msg| {
            if let Some(req) = protocol::parse_request(msg) {
                echo.post(protocol::reply_ok(req.id, json!(req.id))).unwrap();
            }
        }));
        let a: u64 = bridge.call("A", ()).await.unwrap();
        let b: u64 = bridge.call("B", ()).await.unwrap();
        let c: u64 = bridge.call("C", ()).await.unwrap();
        assert!(a < b && b < c);
    }

    #[tokio::test]
    async fn provider_error_rejects() {
        let bus = Arc::new(MemoryChannel::new());
        let bridge = Bridge::new(bus.clone(), options());
        let echo = bus.clone();
        bus.on_message(Arc::new(move |msg| {
            if let Some(req) = protocol::parse_request(msg) {
                echo.post(protocol::reply_err(req.id, "Entry not found")).unwrap();
            }
        }));
        let err = bridge.call::<Value, _>("X", ()).await.unwrap_err();
        assert!(matches!(err, Error::Provider(ref m) if m == "Entry not found"));
        assert_eq!(bridge.in_flight(), 0);
    }

    #[tokio::test]
    async fn mismatched_reply_shape_is_a_decode_error() {
        let bus = Arc::new(MemoryChannel::new());
        let bridge = Bridge::new(bus.clone(), options());
        let echo = bus.clone();
        bus.on_message(Arc::new(move |msg| {
            if let Some(req) = protocol::parse_request(msg) {
                echo.post(protocol::reply_ok(req.id, json!("not a number"))).unwrap();
            }
        }));
        let err = bridge.call::<u64, _>("X", ()).await.unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }
}
