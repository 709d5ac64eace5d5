#![deny(unsafe_code)]

//! MQTT connection used by [`mqflux::forwarder::Forwarder`], QoS 0 and no retain.

use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use mqflux::forwarder::MqttPublisher;
use mqflux::Result;

pub use config::MqttConfig;

mod config;

pub fn mqtt_options(cfg: &MqttConfig) -> Result<MqttOptions> {
    let parsed = Url::parse(&cfg.url).map_err(|e| anyhow!("invalid mqtt url '{}', {}", cfg.url, e))?;
    let host = parsed.host_str().ok_or_else(|| anyhow!("mqtt url must specify host"))?;
    let default_port = match parsed.scheme().to_ascii_lowercase().as_str() {
        "mqtt" | "tcp" => 1883,
        other => return Err(anyhow!("unsupported mqtt url scheme '{}'", other)),
    };
    let port = parsed.port().unwrap_or(default_port);
    let client_id = if cfg.client_id.trim().is_empty() {
        format!("mqflux-forwarder-{}", uuid::Uuid::new_v4())
    } else {
        cfg.client_id.clone()
    };

    let mut options = MqttOptions::new(client_id, host, port);
    options.set_keep_alive(cfg.keep_alive);
    if let Some(user) = cfg.username.as_deref() {
        options.set_credentials(user, cfg.password.as_deref().unwrap_or(""));
    }
    Ok(options)
}

#[derive(Clone)]
pub struct MqttForwarderPublisher {
    client: AsyncClient,
}

impl MqttForwarderPublisher {
    /// Creates the client and spawns its event loop, which runs until `token` is cancelled.
    pub fn connect(cfg: &MqttConfig, token: CancellationToken) -> Result<(Self, JoinHandle<()>)> {
        let (client, eventloop) = AsyncClient::new(mqtt_options(cfg)?, cfg.capacity.max(1));
        log::info!("mqtt forwarder connecting to {}", cfg.url);
        let h = tokio::spawn(Self::drive(eventloop, client.clone(), token));
        Ok((Self { client }, h))
    }

    async fn drive(mut eventloop: EventLoop, client: AsyncClient, token: CancellationToken) {
        loop {
            let ev = tokio::select! {
                _ = token.cancelled() => break,
                ev = eventloop.poll() => ev,
            };
            match ev {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => log::info!("mqtt broker connected, {:?}", ack.code),
                Ok(_) => {}
                Err(e) => {
                    log::warn!("mqtt event loop error, {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        if let Err(e) = client.try_disconnect() {
            log::debug!("mqtt disconnect, {}", e);
        }
        log::info!("mqtt forwarder event loop exit");
    }
}

#[async_trait]
impl MqttPublisher for MqttForwarderPublisher {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        self.client.publish_bytes(topic, QoS::AtMostOnce, false, payload).await?;
        Ok(())
    }
}
