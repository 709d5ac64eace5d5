#![deny(unsafe_code)]

//! Message bus over NATS.
//!
//! Messages travel protobuf encoded, lifecycle events (`events.>` subjects)
//! travel as flat JSON. Queue groups map onto NATS queue subscriptions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use async_nats::{connect_with_options, Client, ConnectOptions, ServerAddr, Subscriber};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use mqflux::bus::{valid_pattern, valid_subject, BusError, Delivery, Packet, PubSub, Publisher, Subscription};
use mqflux::codec;
use mqflux::events::Event;
use mqflux::queue::Queue;
use mqflux::Result;
use mqflux_utils::Counter;

pub use config::NatsConfig;

mod config;

const EVENTS_PREFIX: &str = "events.";

/// Bytes put on the wire for a packet.
pub fn encode_packet(packet: &Packet) -> Result<Bytes, BusError> {
    match packet {
        Packet::Message(m) => Ok(codec::encode(m)),
        Packet::Event(e) => e.to_json().map(Bytes::from).map_err(|e| BusError::Transport(e.to_string())),
    }
}

/// Inverse of [`encode_packet`], the subject tells events from messages.
pub fn decode_packet(subject: &str, payload: &[u8]) -> Result<Packet> {
    if subject.starts_with(EVENTS_PREFIX) {
        Ok(Packet::Event(Arc::new(Event::from_json(payload)?)))
    } else {
        Ok(Packet::Message(Arc::new(codec::decode(payload)?)))
    }
}

#[derive(Clone)]
pub struct NatsBus {
    client: Client,
    queue_capacity: usize,
    max_redeliveries: u32,
    token: CancellationToken,
    closed: Arc<AtomicBool>,
    subscriptions: Arc<Counter>,
    published: Arc<Counter>,
    dropped: Arc<Counter>,
}

impl NatsBus {
    pub async fn connect(cfg: &NatsConfig, queue_capacity: usize, max_redeliveries: u32) -> Result<Self> {
        let client = Self::build_nats(cfg).await?;
        log::info!("connected to NATS {}", cfg.servers);
        Ok(Self {
            client,
            queue_capacity,
            max_redeliveries,
            token: CancellationToken::new(),
            closed: Arc::new(AtomicBool::new(false)),
            subscriptions: Arc::new(Counter::new()),
            published: Arc::new(Counter::new()),
            dropped: Arc::new(Counter::new()),
        })
    }

    async fn build_nats(cfg: &NatsConfig) -> Result<Client> {
        let addrs = cfg
            .servers
            .as_str()
            .split(',')
            .map(|url| url.trim().parse())
            .collect::<std::result::Result<Vec<ServerAddr>, _>>()?;
        let mut opts = ConnectOptions::new().name(&cfg.name).connection_timeout(cfg.connection_timeout);
        if let Some(ping_interval) = cfg.ping_interval {
            opts = opts.ping_interval(ping_interval);
        }
        if let Some(max_reconnects) = cfg.max_reconnects {
            opts = opts.max_reconnects(max_reconnects);
        }
        if cfg.retry_on_initial_connect {
            opts = opts.retry_on_initial_connect();
        }
        if let (Some(username), Some(password)) = (cfg.username.as_ref(), cfg.password.as_ref()) {
            opts = opts.user_and_password(username.into(), password.into());
        }
        if let Some(token) = cfg.token.as_ref() {
            opts = opts.token(token.into());
        }
        connect_with_options(addrs, opts).await.map_err(|e| anyhow!(format!("Failed to connect to NATS, {}", e)))
    }

    async fn pump(
        mut sub: Subscriber,
        queue: Arc<Queue<Delivery>>,
        token: CancellationToken,
        dropped: Arc<Counter>,
    ) {
        loop {
            let msg = tokio::select! {
                _ = token.cancelled() => break,
                msg = sub.next() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            if queue.is_closed() {
                break;
            }
            let subject = msg.subject.to_string();
            match decode_packet(&subject, &msg.payload) {
                Ok(packet) => {
                    if queue.push(Delivery::new(subject, packet)).is_err() {
                        dropped.inc();
                    }
                }
                Err(e) => log::warn!("undecodable packet on {}, {:?}", subject, e),
            }
        }
        if let Err(e) = sub.unsubscribe().await {
            log::debug!("NATS unsubscribe failed, {}", e);
        }
        queue.close();
    }
}

#[async_trait]
impl Publisher for NatsBus {
    async fn publish(&self, subject: &str, packet: Packet) -> Result<(), BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        if !valid_subject(subject) {
            return Err(BusError::InvalidSubject(subject.to_owned()));
        }
        let payload = encode_packet(&packet)?;
        self.client.publish(subject.to_owned(), payload).await.map_err(|e| BusError::Transport(e.to_string()))?;
        self.published.inc();
        Ok(())
    }
}

#[async_trait]
impl PubSub for NatsBus {
    async fn subscribe(&self, subject: &str, group: Option<&str>) -> Result<Subscription, BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        if !valid_pattern(subject) {
            return Err(BusError::InvalidSubject(subject.to_owned()));
        }
        let sub = match group {
            Some(g) => self.client.queue_subscribe(subject.to_owned(), g.to_owned()).await,
            None => self.client.subscribe(subject.to_owned()).await,
        }
        .map_err(|e| BusError::Transport(e.to_string()))?;
        log::debug!("NATS subscribe, subject: {}, group: {:?}", subject, group);

        let queue = Arc::new(Queue::new(self.queue_capacity));
        let token = self.token.child_token();
        tokio::spawn(Self::pump(sub, queue.clone(), token.clone(), self.dropped.clone()));
        self.subscriptions.inc();
        let subscriptions = self.subscriptions.clone();
        Ok(Subscription::new(subject, group, queue, self.max_redeliveries, move || {
            subscriptions.dec();
            token.cancel();
        }))
    }

    async fn close(&self) -> Result<(), BusError> {
        self.closed.store(true, Ordering::SeqCst);
        self.token.cancel();
        self.client.flush().await.map_err(|e| BusError::Transport(e.to_string()))
    }

    fn stats(&self) -> serde_json::Value {
        json!({
            "subscriptions": self.subscriptions.count(),
            "published": self.published.to_json(),
            "dropped": self.dropped.to_json(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqflux::types::Message;

    #[test]
    fn packets_keep_their_kind() {
        let msg = Message {
            channel: "ch-1".into(),
            subtopic: "a.b".into(),
            publisher: "thing-1".into(),
            protocol: "http".into(),
            created: 42,
            content_type: Some("application/senml+json".into()),
            payload: Bytes::from_static(b"[]"),
        };
        let data = encode_packet(&Packet::Message(Arc::new(msg.clone()))).unwrap();
        match decode_packet("channels.ch-1.messages.a.b", &data).unwrap() {
            Packet::Message(m) => assert_eq!(*m, msg),
            p => panic!("unexpected {:?}", p),
        }

        let ev = Event::device_connect("thing-1", "c1");
        let data = encode_packet(&Packet::Event(Arc::new(ev.clone()))).unwrap();
        match decode_packet(&ev.subject(), &data).unwrap() {
            Packet::Event(e) => assert_eq!(*e, ev),
            p => panic!("unexpected {:?}", p),
        }
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(decode_packet("events.core.device.connect", b"not json").is_err());
    }

    #[test]
    fn config_from_settings() {
        let s = mqflux_conf::Settings::from_toml("[nats]\nservers = \"nats://a:4222,nats://b:4222\"\nretry_on_initial_connect = true")
            .unwrap();
        let cfg: NatsConfig = s.section(NatsConfig::SECTION).unwrap();
        assert_eq!(cfg.servers.split(',').count(), 2);
        assert!(cfg.retry_on_initial_connect);
        assert_eq!(cfg.name, "mqflux");
    }
}
