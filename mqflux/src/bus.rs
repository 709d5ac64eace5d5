//! Subject-addressed pub/sub with broadcast and queue-group delivery.
//!
//! Subjects are dot separated tokens. In subscription patterns `*` matches
//! exactly one token and a trailing `>` matches one or more tokens.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::json;

use mqflux_utils::Counter;

use crate::events::EventRef;
use crate::queue::Queue;
use crate::types::MessageRef;

pub type PubSubRef = Arc<dyn PubSub>;
pub type PublisherRef = Arc<dyn Publisher>;

pub const SUBJECT_ALL_CHANNELS: &str = "channels.>";
pub const SUBJECT_ALL_EVENTS: &str = "events.>";
pub const SUBJECT_CHANNEL_MESSAGES: &str = "channels.*.messages";
pub const SUBJECT_CHANNEL_SUBTOPICS: &str = "channels.*.messages.>";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("bus is closed")]
    Closed,
    #[error("invalid subject '{0}'")]
    InvalidSubject(String),
    #[error("encode failed, {0}")]
    Encode(String),
    #[error("decode failed, {0}")]
    Decode(String),
    #[error("bus transport error, {0}")]
    Transport(String),
}

#[derive(Clone)]
pub enum Packet {
    Message(MessageRef),
    Event(EventRef),
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Packet::Message(m) => write!(f, "{:?}", m),
            Packet::Event(e) => write!(f, "{:?}", e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub subject: String,
    pub packet: Packet,
    ///Number of times this delivery was handed back
    pub attempt: u32,
}

impl Delivery {
    #[inline]
    pub fn new(subject: String, packet: Packet) -> Self {
        Self { subject, packet, attempt: 0 }
    }
}

type Closer = Box<dyn FnOnce() + Send + Sync>;

/// Receiving end of one subscription, unsubscribes when dropped.
pub struct Subscription {
    subject: String,
    group: Option<String>,
    queue: Arc<Queue<Delivery>>,
    max_redeliveries: u32,
    closer: Option<Closer>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Subscription {{ subject: {}, group: {:?}, queue: {:?} }}", self.subject, self.group, self.queue)
    }
}

impl Subscription {
    pub fn new<F>(
        subject: &str,
        group: Option<&str>,
        queue: Arc<Queue<Delivery>>,
        max_redeliveries: u32,
        closer: F,
    ) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            subject: subject.to_owned(),
            group: group.map(|g| g.to_owned()),
            queue,
            max_redeliveries,
            closer: Some(Box::new(closer)),
        }
    }

    #[inline]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    #[inline]
    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    /// Next delivery, `None` once unsubscribed or the bus is closed.
    #[inline]
    pub async fn next(&self) -> Option<Delivery> {
        self.queue.pop().await
    }

    /// Hands a delivery back to the head of the queue, `false` once redeliveries are exhausted.
    pub fn redeliver(&self, mut d: Delivery) -> bool {
        if d.attempt >= self.max_redeliveries || self.queue.is_closed() {
            return false;
        }
        d.attempt += 1;
        self.queue.push_front(d);
        true
    }

    #[inline]
    pub fn dropped(&self) -> &Counter {
        self.queue.dropped()
    }

    pub fn unsubscribe(&mut self) {
        self.queue.close();
        if let Some(closer) = self.closer.take() {
            closer();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[async_trait]
pub trait Publisher: Sync + Send {
    async fn publish(&self, subject: &str, packet: Packet) -> Result<(), BusError>;

    async fn publish_message(&self, msg: MessageRef) -> Result<(), BusError> {
        let subject = message_subject(&msg.channel, &msg.subtopic);
        self.publish(&subject, Packet::Message(msg)).await
    }
}

#[async_trait]
pub trait PubSub: Publisher {
    ///Broadcast when `group` is `None`, otherwise each message reaches one member of the group
    async fn subscribe(&self, subject: &str, group: Option<&str>) -> Result<Subscription, BusError>;

    async fn close(&self) -> Result<(), BusError>;

    fn stats(&self) -> serde_json::Value {
        json!({})
    }
}

#[async_trait]
impl Publisher for PubSubRef {
    async fn publish(&self, subject: &str, packet: Packet) -> Result<(), BusError> {
        (**self).publish(subject, packet).await
    }
}

/// Publishing half of a shared bus.
#[inline]
pub fn publisher(bus: &PubSubRef) -> PublisherRef {
    Arc::new(bus.clone())
}

/// `channels.<channel>.messages[.<subtopic>]`
#[inline]
pub fn message_subject(channel: &str, subtopic: &str) -> String {
    if subtopic.is_empty() {
        format!("channels.{}.messages", channel)
    } else {
        format!("channels.{}.messages.{}", channel, subtopic)
    }
}

/// `events.<stream>.<op>`, `op` itself is dot separated (`device.connect`)
#[inline]
pub fn event_subject(stream: &str, op: &str) -> String {
    format!("events.{}.{}", stream, op)
}

/// Whether a concrete `subject` matches a subscription `pattern`.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pats = pattern.split('.');
    let mut subs = subject.split('.');
    loop {
        match (pats.next(), subs.next()) {
            (Some(">"), Some(_)) => return pats.next().is_none(),
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Whether `pattern` is a well formed subscription subject.
pub fn valid_pattern(pattern: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }
    let toks: Vec<&str> = pattern.split('.').collect();
    toks.iter().enumerate().all(|(i, t)| {
        !t.is_empty()
            && (*t == "*" || *t == ">" || !(t.contains('*') || t.contains('>')))
            && (*t != ">" || i == toks.len() - 1)
    })
}

/// Whether `subject` is a concrete, wildcard free subject.
pub fn valid_subject(subject: &str) -> bool {
    !subject.is_empty() && subject.split('.').all(|t| !t.is_empty() && !t.contains(['*', '>']))
}

struct LocalSub {
    id: u64,
    pattern: String,
    group: Option<String>,
    queue: Arc<Queue<Delivery>>,
}

struct LocalInner {
    subs: RwLock<Vec<LocalSub>>,
    next_id: AtomicU64,
    //Next member index per (pattern, group)
    round_robin: DashMap<(String, String), usize, ahash::RandomState>,
    closed: AtomicBool,
    published: Counter,
    dropped: Counter,
}

/// In-process bus.
///
/// Every subscription owns a bounded queue, on overflow the oldest delivery is
/// dropped and counted, publishers never block.
#[derive(Clone)]
pub struct LocalBus {
    inner: Arc<LocalInner>,
    queue_capacity: usize,
    max_redeliveries: u32,
}

impl LocalBus {
    pub fn new(queue_capacity: usize, max_redeliveries: u32) -> Self {
        Self {
            inner: Arc::new(LocalInner {
                subs: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
                round_robin: DashMap::default(),
                closed: AtomicBool::new(false),
                published: Counter::new(),
                dropped: Counter::new(),
            }),
            queue_capacity,
            max_redeliveries,
        }
    }

    #[inline]
    pub fn subscriptions(&self) -> usize {
        self.inner.subs.read().len()
    }

    #[inline]
    pub fn dropped(&self) -> isize {
        self.inner.dropped.count()
    }

    fn deliver(&self, q: &Queue<Delivery>, subject: &str, packet: &Packet) {
        if q.push(Delivery::new(subject.to_owned(), packet.clone())).is_err() {
            self.inner.dropped.inc();
            log::debug!("subscription queue is full, oldest delivery dropped, subject: {}", subject);
        }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(65_536, 3)
    }
}

#[async_trait]
impl Publisher for LocalBus {
    async fn publish(&self, subject: &str, packet: Packet) -> Result<(), BusError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        if !valid_subject(subject) {
            return Err(BusError::InvalidSubject(subject.to_owned()));
        }
        self.inner.published.inc();
        let subs = self.inner.subs.read();
        let mut groups: HashMap<(&str, &str), Vec<&LocalSub>> = HashMap::new();
        for sub in subs.iter().filter(|s| subject_matches(&s.pattern, subject)) {
            match sub.group.as_deref() {
                None => self.deliver(&sub.queue, subject, &packet),
                Some(g) => groups.entry((sub.pattern.as_str(), g)).or_default().push(sub),
            }
        }
        for ((pattern, group), members) in groups {
            let idx = {
                let mut next =
                    self.inner.round_robin.entry((pattern.to_owned(), group.to_owned())).or_insert(0);
                let idx = *next % members.len();
                *next = next.wrapping_add(1);
                idx
            };
            self.deliver(&members[idx].queue, subject, &packet);
        }
        Ok(())
    }
}

#[async_trait]
impl PubSub for LocalBus {
    async fn subscribe(&self, subject: &str, group: Option<&str>) -> Result<Subscription, BusError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        if !valid_pattern(subject) {
            return Err(BusError::InvalidSubject(subject.to_owned()));
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let queue = Arc::new(Queue::new(self.queue_capacity));
        self.inner.subs.write().push(LocalSub {
            id,
            pattern: subject.to_owned(),
            group: group.map(|g| g.to_owned()),
            queue: queue.clone(),
        });
        log::debug!("local bus subscribe, id: {}, subject: {}, group: {:?}", id, subject, group);

        let inner = Arc::downgrade(&self.inner);
        Ok(Subscription::new(subject, group, queue, self.max_redeliveries, move || {
            if let Some(inner) = inner.upgrade() {
                let mut subs = inner.subs.write();
                subs.retain(|s| s.id != id);
                inner.round_robin.retain(|(p, g), _| subs.iter().any(|s| &s.pattern == p && s.group.as_ref() == Some(g)));
            }
        }))
    }

    async fn close(&self) -> Result<(), BusError> {
        self.inner.closed.store(true, Ordering::SeqCst);
        for sub in self.inner.subs.write().drain(..) {
            sub.queue.close();
        }
        Ok(())
    }

    fn stats(&self) -> serde_json::Value {
        json!({
            "subscriptions": self.subscriptions(),
            "published": self.inner.published.to_json(),
            "dropped": self.inner.dropped.to_json(),
        })
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::types::Message;

    fn msg(channel: &str, subtopic: &str) -> MessageRef {
        Arc::new(Message {
            channel: channel.into(),
            subtopic: subtopic.into(),
            publisher: "thing-1".into(),
            protocol: "mqtt".into(),
            created: 1,
            content_type: None,
            payload: Bytes::from_static(b"{}"),
        })
    }

    #[test]
    fn wildcard_matching() {
        assert!(subject_matches("channels.>", "channels.ch-1.messages"));
        assert!(subject_matches("channels.>", "channels.ch-1.messages.a.b"));
        assert!(!subject_matches("channels.>", "channels"));
        assert!(subject_matches("channels.*.messages", "channels.ch-1.messages"));
        assert!(!subject_matches("channels.*.messages", "channels.ch-1.messages.a"));
        assert!(subject_matches("channels.*.messages.>", "channels.ch-1.messages.a"));
        assert!(!subject_matches("channels.*.messages.>", "channels.ch-1.messages"));
        assert!(subject_matches("events.core.device.connect", "events.core.device.connect"));
        assert!(!subject_matches("events.core.device", "events.core.device.connect"));
    }

    #[test]
    fn pattern_validation() {
        assert!(valid_pattern("channels.>"));
        assert!(valid_pattern("channels.*.messages"));
        assert!(!valid_pattern("channels.>.messages"));
        assert!(!valid_pattern("channels..messages"));
        assert!(!valid_pattern("channels.a*"));
        assert!(valid_subject("channels.ch-1.messages"));
        assert!(!valid_subject("channels.*.messages"));
        assert_eq!(message_subject("ch", ""), "channels.ch.messages");
        assert_eq!(message_subject("ch", "a.b"), "channels.ch.messages.a.b");
        assert_eq!(event_subject("core", "device.connect"), "events.core.device.connect");
    }

    #[tokio::test]
    async fn broadcast_reaches_every_subscriber() {
        let bus = LocalBus::new(16, 3);
        let a = bus.subscribe("channels.>", None).await.unwrap();
        let b = bus.subscribe("channels.ch-1.messages.>", None).await.unwrap();
        bus.publish_message(msg("ch-1", "engine")).await.unwrap();
        bus.publish_message(msg("ch-2", "")).await.unwrap();

        assert_eq!(a.next().await.unwrap().subject, "channels.ch-1.messages.engine");
        assert_eq!(a.next().await.unwrap().subject, "channels.ch-2.messages");
        assert_eq!(b.next().await.unwrap().subject, "channels.ch-1.messages.engine");
        assert!(b.queue.is_empty());
    }

    #[tokio::test]
    async fn queue_group_delivers_once() {
        let bus = LocalBus::new(16, 3);
        let w1 = bus.subscribe("channels.>", Some("writers")).await.unwrap();
        let w2 = bus.subscribe("channels.>", Some("writers")).await.unwrap();
        let f = bus.subscribe("channels.>", Some("forwarders")).await.unwrap();
        for _ in 0..10 {
            bus.publish_message(msg("ch-1", "")).await.unwrap();
        }
        assert_eq!(w1.queue.len() + w2.queue.len(), 10);
        assert_eq!(w1.queue.len(), 5);
        assert_eq!(f.queue.len(), 10);
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_keeps_subscription() {
        let bus = LocalBus::new(2, 3);
        let s = bus.subscribe("channels.>", None).await.unwrap();
        for i in 0..4 {
            bus.publish_message(msg(&format!("ch-{}", i), "")).await.unwrap();
        }
        assert_eq!(bus.dropped(), 2);
        assert_eq!(s.dropped().count(), 2);
        assert_eq!(s.next().await.unwrap().subject, "channels.ch-2.messages");
        assert_eq!(bus.subscriptions(), 1);
    }

    #[tokio::test]
    async fn redelivery_is_bounded() {
        let bus = LocalBus::new(8, 2);
        let s = bus.subscribe("channels.>", None).await.unwrap();
        bus.publish_message(msg("ch-1", "")).await.unwrap();
        let mut d = s.next().await.unwrap();
        for attempt in 1..=2 {
            assert!(s.redeliver(d));
            d = s.next().await.unwrap();
            assert_eq!(d.attempt, attempt);
        }
        assert!(!s.redeliver(d));
    }

    #[tokio::test]
    async fn drop_unsubscribes_and_close_ends_streams() {
        let bus = LocalBus::new(8, 0);
        let s = bus.subscribe("channels.>", None).await.unwrap();
        drop(bus.subscribe("events.>", None).await.unwrap());
        assert_eq!(bus.subscriptions(), 1);

        bus.close().await.unwrap();
        assert!(s.next().await.is_none());
        assert_eq!(bus.publish_message(msg("ch-1", "")).await, Err(BusError::Closed));
        assert!(bus.subscribe("channels.>", None).await.is_err());
    }
}
