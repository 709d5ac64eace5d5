//! Best-effort lifecycle events and the cache invalidator that consumes them.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use mqflux_utils::{timestamp_nanos, Counter, TimestampNanos};

use crate::bus::{event_subject, Packet, PubSubRef, PublisherRef, Subscription, SUBJECT_ALL_EVENTS};
use crate::cache::AuthCacheRef;
use crate::Result;

pub type EventRef = Arc<Event>;
pub type EventStoreRef = Arc<dyn EventStore>;
pub type EventSinkRef = Arc<dyn EventSink>;

pub const DEFAULT_STREAM: &str = "core";

pub const DEVICE_CONNECT: &str = "device.connect";
pub const DEVICE_DISCONNECT: &str = "device.disconnect";
pub const DEVICE_DELETED: &str = "device.deleted";
pub const CHANNEL_REMOVED: &str = "channel.removed";
pub const POLICY_REVOKED: &str = "policy.revoked";
pub const CONNECTION_REMOVED: &str = "connection.removed";

/// One append-only audit record.
///
/// Encoded as a flat JSON object: `operation`, `occurred_at` (ns) and the payload keys.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default = "Event::stream_default")]
    pub stream_id: String,
    #[serde(rename = "operation")]
    pub op: String,
    #[serde(rename = "occurred_at", default)]
    pub ts: TimestampNanos,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Event {{ stream: {}, op: {}, ts: {}, payload: {:?} }}", self.stream_id, self.op, self.ts, self.payload)
    }
}

impl Event {
    pub fn new(op: &str, payload: Map<String, Value>) -> Self {
        Self { stream_id: Self::stream_default(), op: op.to_owned(), ts: timestamp_nanos(), payload }
    }

    #[inline]
    pub fn stream(mut self, stream_id: &str) -> Self {
        self.stream_id = stream_id.to_owned();
        self
    }

    fn stream_default() -> String {
        DEFAULT_STREAM.into()
    }

    #[inline]
    pub fn subject(&self) -> String {
        event_subject(&self.stream_id, &self.op)
    }

    #[inline]
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str()).filter(|s| !s.is_empty())
    }

    pub fn device_connect(device: &str, client_id: &str) -> Self {
        Self::new(DEVICE_CONNECT, payload(json!({"thing_id": device, "client_id": client_id})))
    }

    pub fn device_disconnect(device: &str, client_id: &str) -> Self {
        Self::new(DEVICE_DISCONNECT, payload(json!({"thing_id": device, "client_id": client_id})))
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }
}

#[inline]
fn payload(v: Value) -> Map<String, Value> {
    match v {
        Value::Object(m) => m,
        _ => Map::new(),
    }
}

/// Emission never blocks, events that do not fit are dropped and counted.
pub trait EventStore: Sync + Send {
    fn emit(&self, event: Event);

    fn dropped(&self) -> isize;
}

/// Destination the queued store writes into.
#[async_trait]
pub trait EventSink: Sync + Send {
    async fn append(&self, event: &Event) -> Result<()>;
}

/// Publishes events on the bus under `events.<stream>.<op>`.
pub struct BusSink {
    publisher: PublisherRef,
}

impl BusSink {
    pub fn new(publisher: PublisherRef) -> Self {
        Self { publisher }
    }
}

#[async_trait]
impl EventSink for BusSink {
    async fn append(&self, event: &Event) -> Result<()> {
        self.publisher.publish(&event.subject(), Packet::Event(Arc::new(event.clone()))).await?;
        Ok(())
    }
}

/// Bounded queue in front of a sink, drained by one background task.
pub struct QueuedEventStore {
    tx: mpsc::Sender<Event>,
    stream_id: String,
    dropped: Arc<Counter>,
}

impl QueuedEventStore {
    pub fn new(sink: EventSinkRef, capacity: usize, stream_id: &str) -> Self {
        let (tx, mut rx) = mpsc::channel::<Event>(capacity.max(1));
        let dropped = Arc::new(Counter::new());
        let failed = dropped.clone();
        tokio::spawn(async move {
            while let Some(ev) = rx.recv().await {
                if let Err(e) = sink.append(&ev).await {
                    failed.inc();
                    log::warn!("event append failed, op: {}, {:?}", ev.op, e);
                }
            }
            log::debug!("event store worker exit");
        });
        Self { tx, stream_id: stream_id.to_owned(), dropped }
    }
}

impl EventStore for QueuedEventStore {
    fn emit(&self, event: Event) {
        let event = event.stream(&self.stream_id);
        if let Err(e) = self.tx.try_send(event) {
            self.dropped.inc();
            log::warn!("event dropped, {}", e);
        }
    }

    fn dropped(&self) -> isize {
        self.dropped.count()
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventStore;

impl EventStore for NoopEventStore {
    fn emit(&self, _event: Event) {}

    fn dropped(&self) -> isize {
        0
    }
}

/// Consumes lifecycle events and evicts the affected cache entries.
///
/// Depends only on the bus and the cache, the session handler never sees it.
#[derive(Clone)]
pub struct CacheInvalidator {
    cache: AuthCacheRef,
}

impl CacheInvalidator {
    pub fn new(cache: AuthCacheRef) -> Self {
        Self { cache }
    }

    pub async fn handle(&self, event: &Event) -> Result<()> {
        match event.op.as_str() {
            DEVICE_DELETED => {
                if let Some(id) = event.str_field("id") {
                    self.cache.evict_device(id).await?;
                }
            }
            CHANNEL_REMOVED => {
                if let Some(id) = event.str_field("id") {
                    self.cache.evict_channel_authorizations(id).await?;
                }
            }
            POLICY_REVOKED | CONNECTION_REMOVED => {
                if let (Some(channel), Some(device)) = (event.str_field("channel_id"), event.str_field("thing_id")) {
                    self.cache.evict_authz(channel, device).await?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Subscribes to `events.>` and handles events until `token` is cancelled.
    pub async fn start(self, bus: PubSubRef, token: CancellationToken) -> Result<JoinHandle<()>> {
        let sub = bus.subscribe(SUBJECT_ALL_EVENTS, None).await?;
        Ok(tokio::spawn(self.run(sub, token)))
    }

    async fn run(self, sub: Subscription, token: CancellationToken) {
        loop {
            let d = tokio::select! {
                _ = token.cancelled() => break,
                d = sub.next() => match d {
                    Some(d) => d,
                    None => break,
                },
            };
            if let Packet::Event(ev) = d.packet {
                if let Err(e) = self.handle(&ev).await {
                    log::warn!("cache invalidation failed, op: {}, {:?}", ev.op, e);
                } else {
                    log::debug!("cache invalidator handled {}", ev.op);
                }
            }
        }
        log::info!("cache invalidator exit");
    }
}
