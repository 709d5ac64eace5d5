//! MQTT session hooks.
//!
//! The external proxy calls the hooks in protocol order:
//! `AuthConnect -> Connect -> (AuthPublish -> Publish | AuthSubscribe -> Subscribe | Unsubscribe)* -> Disconnect`.
//! [`SessionHandler`] implements them, [`Layer`]s wrap it once at construction.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;

use mqflux_utils::{Counter, MonotonicClock};

use crate::auth::{AuthError, Authorizer};
use crate::bus::PublisherRef;
use crate::events::{Event, EventStoreRef};
use crate::session::{Session, State};
use crate::topic::{parse_publish_topic, parse_subscribe_topic, TopicError};
use crate::types::{Message, PROTOCOL_MQTT};

pub type HandlerRef = Arc<dyn Handler>;
pub type HookResult = Result<(), HandlerError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    #[error("client is not initialized")]
    ClientNotInitialized,
    #[error("missing client id")]
    MissingClientId,
    #[error("authentication failed")]
    Unauthenticated,
    #[error("missing topic")]
    MissingTopic,
    #[error("malformed topic")]
    MalformedTopic,
    #[error("malformed subtopic")]
    MalformedSubtopic,
    #[error("not authorized")]
    Unauthorized,
    #[error("auth service unavailable, {0}")]
    Unavailable(String),
    #[error("failed to publish to message bus, {0}")]
    Publish(String),
}

/// The MQTT CONNACK return codes hooks are narrowed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnackReason {
    NotAuthorized,
    ClientIdentifierNotValid,
    ServerUnavailable,
}

impl HandlerError {
    pub fn connack_reason(&self) -> ConnackReason {
        match self {
            HandlerError::ClientNotInitialized | HandlerError::MissingClientId => {
                ConnackReason::ClientIdentifierNotValid
            }
            HandlerError::Unavailable(_) | HandlerError::Publish(_) => ConnackReason::ServerUnavailable,
            _ => ConnackReason::NotAuthorized,
        }
    }
}

impl From<TopicError> for HandlerError {
    fn from(e: TopicError) -> Self {
        match e {
            TopicError::MalformedTopic => HandlerError::MalformedTopic,
            TopicError::MalformedSubtopic => HandlerError::MalformedSubtopic,
        }
    }
}

impl From<AuthError> for HandlerError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::NotFound | AuthError::Unauthenticated => HandlerError::Unauthenticated,
            AuthError::Unavailable(e) | AuthError::InvalidResponse(e) => HandlerError::Unavailable(e),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub enum Type {
    AuthConnect,
    AuthPublish,
    AuthSubscribe,
    Connect,
    Publish,
    Subscribe,
    Unsubscribe,
    Disconnect,
}

impl Type {
    pub const ALL: [Type; 8] = [
        Type::AuthConnect,
        Type::AuthPublish,
        Type::AuthSubscribe,
        Type::Connect,
        Type::Publish,
        Type::Subscribe,
        Type::Unsubscribe,
        Type::Disconnect,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Type::AuthConnect => "auth_connect",
            Type::AuthPublish => "auth_publish",
            Type::AuthSubscribe => "auth_subscribe",
            Type::Connect => "connect",
            Type::Publish => "publish",
            Type::Subscribe => "subscribe",
            Type::Unsubscribe => "unsubscribe",
            Type::Disconnect => "disconnect",
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hook input, `None` sessions model a proxy that lost its client state.
#[derive(Debug)]
pub enum Parameter<'a> {
    AuthConnect(Option<&'a mut Session>),
    AuthPublish(Option<&'a mut Session>, Option<&'a str>, &'a [u8]),
    AuthSubscribe(Option<&'a mut Session>, Option<&'a [String]>),
    Connect(Option<&'a mut Session>),
    Publish(Option<&'a mut Session>, &'a str, Bytes),
    Subscribe(Option<&'a mut Session>, &'a [String]),
    Unsubscribe(Option<&'a mut Session>, &'a [String]),
    Disconnect(Option<&'a mut Session>),
}

impl Parameter<'_> {
    pub fn get_type(&self) -> Type {
        match self {
            Parameter::AuthConnect(_) => Type::AuthConnect,
            Parameter::AuthPublish(_, _, _) => Type::AuthPublish,
            Parameter::AuthSubscribe(_, _) => Type::AuthSubscribe,
            Parameter::Connect(_) => Type::Connect,
            Parameter::Publish(_, _, _) => Type::Publish,
            Parameter::Subscribe(_, _) => Type::Subscribe,
            Parameter::Unsubscribe(_, _) => Type::Unsubscribe,
            Parameter::Disconnect(_) => Type::Disconnect,
        }
    }

    fn session(&self) -> Option<&Session> {
        match self {
            Parameter::AuthConnect(s)
            | Parameter::AuthPublish(s, _, _)
            | Parameter::AuthSubscribe(s, _)
            | Parameter::Connect(s)
            | Parameter::Publish(s, _, _)
            | Parameter::Subscribe(s, _)
            | Parameter::Unsubscribe(s, _)
            | Parameter::Disconnect(s) => s.as_deref(),
        }
    }

    /// Short description for logs, never includes the password or payload.
    pub fn describe(&self) -> String {
        let (client_id, username) =
            self.session().map(|s| (s.client_id.as_str(), s.username.as_str())).unwrap_or(("-", "-"));
        let topics = match self {
            Parameter::AuthPublish(_, t, _) => t.map(|t| t.to_owned()).unwrap_or_default(),
            Parameter::Publish(_, t, _) => (*t).to_owned(),
            Parameter::AuthSubscribe(_, ts) => ts.map(|ts| ts.join(",")).unwrap_or_default(),
            Parameter::Subscribe(_, ts) | Parameter::Unsubscribe(_, ts) => ts.join(","),
            _ => String::new(),
        };
        format!("{} client_id: {}, username: {}, topics: {}", self.get_type(), client_id, username, topics)
    }
}

#[async_trait]
pub trait Handler: Sync + Send {
    async fn hook(&self, param: Parameter<'_>) -> HookResult;
}

/// Wraps a handler in another handler.
pub trait Layer: Sync + Send {
    fn layer(&self, inner: HandlerRef) -> HandlerRef;
}

/// Layers applied once, the first pushed layer is the outermost.
#[derive(Default)]
pub struct Stack {
    layers: Vec<Box<dyn Layer>>,
}

impl Stack {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn push<L: Layer + 'static>(mut self, layer: L) -> Self {
        self.layers.push(Box::new(layer));
        self
    }

    pub fn build(self, core: HandlerRef) -> HandlerRef {
        self.layers.iter().rev().fold(core, |inner, l| l.layer(inner))
    }
}

/// The session state machine.
pub struct SessionHandler {
    authorizer: Authorizer,
    publisher: PublisherRef,
    events: EventStoreRef,
    clock: MonotonicClock,
}

impl SessionHandler {
    pub fn new(authorizer: Authorizer, publisher: PublisherRef, events: EventStoreRef) -> Self {
        Self { authorizer, publisher, events, clock: MonotonicClock::new() }
    }

    async fn auth_connect(&self, s: Option<&mut Session>) -> HookResult {
        let s = s.ok_or(HandlerError::ClientNotInitialized)?;
        if s.client_id.is_empty() {
            return Err(HandlerError::MissingClientId);
        }
        if s.username.is_empty() || s.password.is_empty() {
            return Err(HandlerError::Unauthenticated);
        }
        let device = self.authorizer.identify(&s.password).await?;
        if device != s.username {
            return Err(HandlerError::Unauthenticated);
        }
        s.authenticated();
        self.events.emit(Event::device_connect(&s.username, &s.client_id));
        Ok(())
    }

    async fn authorize_channel(&self, channel: &str, device: &str) -> HookResult {
        if self.authorizer.authorize(channel, device).await? {
            Ok(())
        } else {
            Err(HandlerError::Unauthorized)
        }
    }

    async fn auth_publish(&self, s: Option<&mut Session>, topic: Option<&str>) -> HookResult {
        let s = s.ok_or(HandlerError::ClientNotInitialized)?;
        if !s.is_authenticated() {
            return Err(HandlerError::Unauthenticated);
        }
        let topic = topic.filter(|t| !t.is_empty()).ok_or(HandlerError::MissingTopic)?;
        let t = parse_publish_topic(topic)?;
        self.authorize_channel(&t.channel, &s.username).await?;
        s.authorize_topic(topic);
        Ok(())
    }

    async fn auth_subscribe(&self, s: Option<&mut Session>, topics: Option<&[String]>) -> HookResult {
        let s = s.ok_or(HandlerError::ClientNotInitialized)?;
        if !s.is_authenticated() {
            return Err(HandlerError::Unauthenticated);
        }
        let topics = topics.filter(|ts| !ts.is_empty()).ok_or(HandlerError::MissingTopic)?;
        for topic in topics {
            let (channel, _subtopic) = parse_subscribe_topic(topic)?;
            self.authorize_channel(&channel, &s.username).await?;
        }
        Ok(())
    }

    fn connect(&self, s: Option<&mut Session>) -> HookResult {
        let s = s.ok_or(HandlerError::ClientNotInitialized)?;
        if !s.is_authenticated() {
            return Err(HandlerError::Unauthenticated);
        }
        s.state = State::Connected;
        Ok(())
    }

    async fn publish(&self, s: Option<&mut Session>, topic: &str, payload: Bytes) -> HookResult {
        let s = s.ok_or(HandlerError::ClientNotInitialized)?;
        if !s.is_authenticated() || !s.is_topic_authorized(topic) {
            return Err(HandlerError::Unauthorized);
        }
        let t = parse_publish_topic(topic)?;
        if t.channel.is_empty() || s.username.is_empty() {
            return Err(HandlerError::Unauthorized);
        }
        let msg = Message {
            channel: t.channel,
            subtopic: t.subtopic,
            publisher: s.username.clone(),
            protocol: PROTOCOL_MQTT.into(),
            created: self.clock.now_nanos(),
            content_type: t.content_type,
            payload,
        };
        self.publisher.publish_message(Arc::new(msg)).await.map_err(|e| HandlerError::Publish(e.to_string()))
    }

    fn disconnect(&self, s: Option<&mut Session>) -> HookResult {
        let s = s.ok_or(HandlerError::ClientNotInitialized)?;
        if s.state == State::Disconnected {
            return Ok(());
        }
        if s.is_authenticated() {
            self.events.emit(Event::device_disconnect(&s.username, &s.client_id));
        }
        s.terminate();
        Ok(())
    }
}

#[async_trait]
impl Handler for SessionHandler {
    async fn hook(&self, param: Parameter<'_>) -> HookResult {
        match param {
            Parameter::AuthConnect(s) => self.auth_connect(s).await,
            Parameter::AuthPublish(s, topic, _payload) => self.auth_publish(s, topic).await,
            Parameter::AuthSubscribe(s, topics) => self.auth_subscribe(s, topics).await,
            Parameter::Connect(s) => self.connect(s),
            Parameter::Publish(s, topic, payload) => self.publish(s, topic, payload).await,
            Parameter::Subscribe(s, _) | Parameter::Unsubscribe(s, _) => {
                s.map(|_| ()).ok_or(HandlerError::ClientNotInitialized)
            }
            Parameter::Disconnect(s) => self.disconnect(s),
        }
    }
}

/// Logs every hook and its outcome.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogLayer;

struct Logged {
    inner: HandlerRef,
}

impl Layer for LogLayer {
    fn layer(&self, inner: HandlerRef) -> HandlerRef {
        Arc::new(Logged { inner })
    }
}

#[async_trait]
impl Handler for Logged {
    async fn hook(&self, param: Parameter<'_>) -> HookResult {
        let typ = param.get_type();
        let desc = param.describe();
        let res = self.inner.hook(param).await;
        match (&res, typ) {
            (Ok(()), _) => log::info!("{}, ok", desc),
            (Err(e), Type::Publish | Type::Connect | Type::Subscribe | Type::Unsubscribe | Type::Disconnect) => {
                log::error!("{}, {}", desc, e)
            }
            (Err(e), _) => log::warn!("{}, rejected: {}", desc, e),
        }
        res
    }
}

#[derive(Default)]
struct HookCounters {
    accepted: Counter,
    rejected: Counter,
}

/// Accepted and rejected counts per hook type.
#[derive(Default)]
pub struct HookStats {
    counters: DashMap<Type, HookCounters, ahash::RandomState>,
}

impl HookStats {
    #[inline]
    fn record(&self, typ: Type, ok: bool) {
        let c = self.counters.entry(typ).or_default();
        if ok {
            c.accepted.inc()
        } else {
            c.rejected.inc()
        }
    }

    pub fn accepted(&self, typ: Type) -> isize {
        self.counters.get(&typ).map(|c| c.accepted.count()).unwrap_or_default()
    }

    pub fn rejected(&self, typ: Type) -> isize {
        self.counters.get(&typ).map(|c| c.rejected.count()).unwrap_or_default()
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut m = serde_json::Map::new();
        for typ in Type::ALL {
            m.insert(
                typ.as_str().into(),
                json!({"accepted": self.accepted(typ), "rejected": self.rejected(typ)}),
            );
        }
        serde_json::Value::Object(m)
    }
}

/// Counts hook outcomes into a shared [`HookStats`].
#[derive(Clone, Default)]
pub struct StatsLayer {
    stats: Arc<HookStats>,
}

impl StatsLayer {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn stats(&self) -> Arc<HookStats> {
        self.stats.clone()
    }
}

struct Counted {
    inner: HandlerRef,
    stats: Arc<HookStats>,
}

impl Layer for StatsLayer {
    fn layer(&self, inner: HandlerRef) -> HandlerRef {
        Arc::new(Counted { inner, stats: self.stats.clone() })
    }
}

#[async_trait]
impl Handler for Counted {
    async fn hook(&self, param: Parameter<'_>) -> HookResult {
        let typ = param.get_type();
        let res = self.inner.hook(param).await;
        self.stats.record(typ, res.is_ok());
        res
    }
}

/// Typed entry points over a layered handler.
#[derive(Clone)]
pub struct Hooks {
    handler: HandlerRef,
}

impl Hooks {
    pub fn new(handler: HandlerRef) -> Self {
        Self { handler }
    }

    #[inline]
    pub async fn auth_connect(&self, s: Option<&mut Session>) -> HookResult {
        self.handler.hook(Parameter::AuthConnect(s)).await
    }

    #[inline]
    pub async fn auth_publish(&self, s: Option<&mut Session>, topic: Option<&str>, payload: &[u8]) -> HookResult {
        self.handler.hook(Parameter::AuthPublish(s, topic, payload)).await
    }

    #[inline]
    pub async fn auth_subscribe(&self, s: Option<&mut Session>, topics: Option<&[String]>) -> HookResult {
        self.handler.hook(Parameter::AuthSubscribe(s, topics)).await
    }

    #[inline]
    pub async fn connect(&self, s: Option<&mut Session>) -> HookResult {
        self.handler.hook(Parameter::Connect(s)).await
    }

    /// The outcome is for observation only, it is never reported to the device.
    #[inline]
    pub async fn publish(&self, s: Option<&mut Session>, topic: &str, payload: Bytes) -> HookResult {
        self.handler.hook(Parameter::Publish(s, topic, payload)).await
    }

    #[inline]
    pub async fn subscribe(&self, s: Option<&mut Session>, topics: &[String]) -> HookResult {
        self.handler.hook(Parameter::Subscribe(s, topics)).await
    }

    #[inline]
    pub async fn unsubscribe(&self, s: Option<&mut Session>, topics: &[String]) -> HookResult {
        self.handler.hook(Parameter::Unsubscribe(s, topics)).await
    }

    #[inline]
    pub async fn disconnect(&self, s: Option<&mut Session>) -> HookResult {
        self.handler.hook(Parameter::Disconnect(s)).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::auth::tests::StaticAuth;
    use crate::bus::{LocalBus, PubSub, Packet};
    use crate::cache::MemoryCache;
    use crate::events::{BusSink, QueuedEventStore};

    struct Fixture {
        bus: Arc<LocalBus>,
        hooks: Hooks,
        stats: Arc<HookStats>,
    }

    fn fixture() -> Fixture {
        let bus = Arc::new(LocalBus::new(64, 0));
        let authorizer = Authorizer::new(
            Arc::new(MemoryCache::new()),
            Arc::new(StaticAuth::with("s1", "thing-1", "ch-1")),
            Duration::from_secs(600),
            Duration::from_secs(30),
        );
        let events = Arc::new(QueuedEventStore::new(Arc::new(BusSink::new(bus.clone())), 16, "core"));
        let core = Arc::new(SessionHandler::new(authorizer, bus.clone(), events));
        let stats = StatsLayer::new();
        let handler = Stack::new().push(LogLayer).push(stats.clone()).build(core);
        Fixture { bus, hooks: Hooks::new(handler), stats: stats.stats() }
    }

    async fn connected(f: &Fixture) -> Session {
        let mut s = Session::new("c1", "thing-1", "s1");
        f.hooks.auth_connect(Some(&mut s)).await.unwrap();
        f.hooks.connect(Some(&mut s)).await.unwrap();
        s
    }

    #[tokio::test]
    async fn connect_validation() {
        let f = fixture();
        assert_eq!(f.hooks.auth_connect(None).await, Err(HandlerError::ClientNotInitialized));

        let mut s = Session::new("", "thing-1", "s1");
        assert_eq!(f.hooks.auth_connect(Some(&mut s)).await, Err(HandlerError::MissingClientId));

        let mut s = Session::new("c1", "thing-1", "");
        assert_eq!(f.hooks.auth_connect(Some(&mut s)).await, Err(HandlerError::Unauthenticated));

        let mut s = Session::new("c1", "thing-2", "s1");
        let err = f.hooks.auth_connect(Some(&mut s)).await.unwrap_err();
        assert_eq!(err, HandlerError::Unauthenticated);
        assert_eq!(err.connack_reason(), ConnackReason::NotAuthorized);

        let mut s = Session::new("c1", "thing-1", "unknown");
        assert_eq!(f.hooks.auth_connect(Some(&mut s)).await, Err(HandlerError::Unauthenticated));

        assert_eq!(f.stats.rejected(Type::AuthConnect), 5);
    }

    #[tokio::test]
    async fn connect_emits_event() {
        let f = fixture();
        let events = f.bus.subscribe("events.>", None).await.unwrap();
        let s = connected(&f).await;
        assert!(s.is_authenticated());
        assert_eq!(s.state, State::Connected);
        let d = tokio::time::timeout(Duration::from_secs(1), events.next()).await.unwrap().unwrap();
        assert_eq!(d.subject, "events.core.device.connect");
    }

    #[tokio::test]
    async fn publish_requires_prior_auth_publish() {
        let f = fixture();
        let sub = f.bus.subscribe("channels.>", None).await.unwrap();
        let mut s = connected(&f).await;
        let topic = "channels/ch-1/messages/engine/temperature";

        let res = f.hooks.publish(Some(&mut s), topic, Bytes::from_static(b"1")).await;
        assert_eq!(res, Err(HandlerError::Unauthorized));

        f.hooks.auth_publish(Some(&mut s), Some(topic), b"1").await.unwrap();
        f.hooks.publish(Some(&mut s), topic, Bytes::from_static(b"1")).await.unwrap();

        let d = sub.next().await.unwrap();
        assert_eq!(d.subject, "channels.ch-1.messages.engine.temperature");
        match d.packet {
            Packet::Message(m) => {
                assert_eq!(m.publisher, "thing-1");
                assert_eq!(m.protocol, "mqtt");
                assert_eq!(m.subtopic, "engine.temperature");
                assert!(m.created > 0);
            }
            p => panic!("unexpected {:?}", p),
        }
        assert_eq!(f.stats.accepted(Type::Publish), 1);
        assert_eq!(f.stats.rejected(Type::Publish), 1);
    }

    #[tokio::test]
    async fn auth_publish_rejections() {
        let f = fixture();
        let mut fresh = Session::new("c1", "thing-1", "s1");
        let res = f.hooks.auth_publish(Some(&mut fresh), Some("channels/ch-1/messages"), b"").await;
        assert_eq!(res, Err(HandlerError::Unauthenticated));

        let mut s = connected(&f).await;
        assert_eq!(f.hooks.auth_publish(Some(&mut s), None, b"").await, Err(HandlerError::MissingTopic));
        assert_eq!(
            f.hooks.auth_publish(Some(&mut s), Some("invalid/topic"), b"").await,
            Err(HandlerError::MalformedTopic)
        );
        assert_eq!(
            f.hooks.auth_publish(Some(&mut s), Some("channels/ch-1/messages/foo/bar>"), b"").await,
            Err(HandlerError::MalformedSubtopic)
        );
        assert_eq!(
            f.hooks.auth_publish(Some(&mut s), Some("channels/ch-9/messages"), b"").await,
            Err(HandlerError::Unauthorized)
        );
    }

    #[tokio::test]
    async fn auth_subscribe_rejects_whole_batch() {
        let f = fixture();
        let mut s = connected(&f).await;
        let ok = vec!["channels/ch-1/messages/#".to_owned(), "channels/ch-1/messages/+/t".to_owned()];
        f.hooks.auth_subscribe(Some(&mut s), Some(ok.as_slice())).await.unwrap();

        let bad = vec!["channels/ch-1/messages".to_owned(), "channels/ch-2/messages".to_owned()];
        assert_eq!(f.hooks.auth_subscribe(Some(&mut s), Some(bad.as_slice())).await, Err(HandlerError::Unauthorized));
        assert_eq!(f.hooks.auth_subscribe(Some(&mut s), Some(&[][..])).await, Err(HandlerError::MissingTopic));
        assert_eq!(f.hooks.subscribe(Some(&mut s), &ok).await, Ok(()));
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let f = fixture();
        let events = f.bus.subscribe("events.*.device.disconnect", None).await.unwrap();

        let mut never = Session::new("c2", "thing-1", "bad");
        f.hooks.disconnect(Some(&mut never)).await.unwrap();

        let mut s = connected(&f).await;
        f.hooks.disconnect(Some(&mut s)).await.unwrap();
        f.hooks.disconnect(Some(&mut s)).await.unwrap();
        assert_eq!(s.state, State::Disconnected);

        let d = tokio::time::timeout(Duration::from_secs(1), events.next()).await.unwrap().unwrap();
        assert_eq!(d.subject, "events.core.device.disconnect");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(tokio::time::timeout(Duration::from_millis(20), events.next()).await.is_err());
        assert_eq!(f.hooks.disconnect(None).await, Err(HandlerError::ClientNotInitialized));
    }

    #[test]
    fn connack_reasons() {
        assert_eq!(HandlerError::MissingClientId.connack_reason(), ConnackReason::ClientIdentifierNotValid);
        assert_eq!(HandlerError::Unavailable("x".into()).connack_reason(), ConnackReason::ServerUnavailable);
        assert_eq!(HandlerError::Unauthorized.connack_reason(), ConnackReason::NotAuthorized);
    }
}
