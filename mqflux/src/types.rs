use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use mqflux_utils::TimestampNanos;

pub type ClientId = String;
pub type DeviceId = String;
pub type ChannelId = String;
pub type Secret = String;

pub const PROTOCOL_MQTT: &str = "mqtt";
pub const PROTOCOL_HTTP: &str = "http";
pub const PROTOCOL_COAP: &str = "coap";
pub const PROTOCOL_WS: &str = "ws";

pub type MessageRef = Arc<Message>;

/// The traveling unit, immutable once minted by the session handler.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub channel: ChannelId,
    /// Dot separated, possibly empty
    pub subtopic: String,
    pub publisher: DeviceId,
    pub protocol: String,
    /// Nanoseconds since the Unix epoch
    pub created: TimestampNanos,
    pub content_type: Option<String>,
    pub payload: Bytes,
}

impl Message {
    #[inline]
    pub fn created_secs(&self) -> f64 {
        self.created as f64 / 1e9
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Message {{ channel: {}, subtopic: {:?}, publisher: {}, protocol: {}, created: {}, content_type: {:?}, payload: {} bytes }}",
            self.channel,
            self.subtopic,
            self.publisher,
            self.protocol,
            self.created,
            self.content_type,
            self.payload.len()
        )
    }
}

/// Minimal view of a control-plane entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityBasic {
    pub id: String,
    #[serde(default)]
    pub domain_id: String,
    #[serde(default)]
    pub status: EntityStatus,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityStatus {
    #[default]
    Enabled,
    Disabled,
    Deleted,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntitiesPage {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub limit: u64,
    #[serde(default)]
    pub entities: Vec<EntityBasic>,
}

/// Binding between a device and a channel inside one domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Connection {
    pub thing_id: DeviceId,
    pub channel_id: ChannelId,
    #[serde(default)]
    pub domain_id: String,
}

/// Result of resolving a user token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub user_id: String,
    #[serde(default)]
    pub domain_id: String,
}
