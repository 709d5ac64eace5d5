use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use mqflux_utils::Counter;

use crate::bus::{Packet, PubSubRef, Subscription, SUBJECT_CHANNEL_MESSAGES, SUBJECT_CHANNEL_SUBTOPICS};
use crate::topic::build_mqtt_topic;
use crate::types::{Message, PROTOCOL_MQTT};
use crate::Result;

pub type MqttPublisherRef = Arc<dyn MqttPublisher>;

/// Outbound side of the MQTT broker connection, QoS 0.
#[async_trait]
pub trait MqttPublisher: Sync + Send {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct ForwarderStats {
    pub forwarded: Counter,
    pub skipped: Counter,
    pub failed: Counter,
}

impl ForwarderStats {
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "forwarded": self.forwarded.count(),
            "skipped": self.skipped.count(),
            "failed": self.failed.count(),
        })
    }
}

/// Republishes bus messages from non-MQTT adapters to the MQTT broker.
///
/// Messages minted by the MQTT adapter are skipped, they already reached the broker.
pub struct Forwarder {
    bus: PubSubRef,
    publisher: MqttPublisherRef,
    group: String,
    stats: Arc<ForwarderStats>,
}

impl Forwarder {
    pub fn new(bus: PubSubRef, publisher: MqttPublisherRef, group: &str) -> Self {
        Self { bus, publisher, group: group.to_owned(), stats: Arc::new(ForwarderStats::default()) }
    }

    #[inline]
    pub fn stats(&self) -> Arc<ForwarderStats> {
        self.stats.clone()
    }

    pub async fn forward(&self, msg: &Message) {
        if msg.protocol == PROTOCOL_MQTT {
            self.stats.skipped.inc();
            return;
        }
        let topic = build_mqtt_topic(&msg.channel, &msg.subtopic);
        match self.publisher.publish(&topic, msg.payload.clone()).await {
            Ok(()) => self.stats.forwarded.inc(),
            Err(e) => {
                self.stats.failed.inc();
                log::warn!("failed to forward message to {}, {:?}", topic, e);
            }
        }
    }

    /// Subscribes in the forwarder queue group and forwards until `token` is cancelled.
    pub async fn start(self, token: CancellationToken) -> Result<JoinHandle<()>> {
        let plain = self.bus.subscribe(SUBJECT_CHANNEL_MESSAGES, Some(&self.group)).await?;
        let nested = self.bus.subscribe(SUBJECT_CHANNEL_SUBTOPICS, Some(&self.group)).await?;
        log::info!("forwarder subscribed in group {}", self.group);
        Ok(tokio::spawn(self.run(plain, nested, token)))
    }

    async fn run(self, plain: Subscription, nested: Subscription, token: CancellationToken) {
        loop {
            let d = tokio::select! {
                _ = token.cancelled() => break,
                d = plain.next() => d,
                d = nested.next() => d,
            };
            match d {
                Some(d) => {
                    if let Packet::Message(msg) = d.packet {
                        self.forward(&msg).await;
                    }
                }
                None => break,
            }
        }
        log::info!("forwarder exit");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::bus::{LocalBus, Publisher};

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(String, Bytes)>>,
    }

    #[async_trait]
    impl MqttPublisher for Recorder {
        async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
            self.sent.lock().push((topic.to_owned(), payload));
            Ok(())
        }
    }

    fn message(subtopic: &str, protocol: &str) -> Packet {
        Packet::Message(Arc::new(Message {
            channel: "ch-1".into(),
            subtopic: subtopic.into(),
            publisher: "thing-1".into(),
            protocol: protocol.into(),
            created: 1,
            content_type: None,
            payload: Bytes::from_static(b"22.5"),
        }))
    }

    #[tokio::test]
    async fn forwards_non_mqtt_messages() {
        let bus = Arc::new(LocalBus::new(64, 0));
        let recorder = Arc::new(Recorder::default());
        let fwd = Forwarder::new(bus.clone(), recorder.clone(), "forwarders");
        let stats = fwd.stats();
        let token = CancellationToken::new();
        let h = fwd.start(token.clone()).await.unwrap();

        bus.publish("channels.ch-1.messages.a.b", message("a.b", "http")).await.unwrap();
        bus.publish("channels.ch-1.messages", message("", "coap")).await.unwrap();
        bus.publish("channels.ch-1.messages.a", message("a", "mqtt")).await.unwrap();

        for _ in 0..200 {
            if stats.forwarded.count() + stats.skipped.count() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(stats.skipped.count(), 1);
        let mut sent: Vec<String> = recorder.sent.lock().iter().map(|(t, _)| t.clone()).collect();
        sent.sort();
        assert_eq!(sent, vec!["channels/ch-1/messages", "channels/ch-1/messages/a/b"]);

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), h).await.unwrap().unwrap();
    }
}
