//! Protobuf framing of [`Message`] for buses that cross process boundaries.

use bytes::Bytes;
use prost::Message as _;

use crate::types::Message;

#[derive(Clone, PartialEq, prost::Message)]
pub struct WireMessage {
    #[prost(string, tag = "1")]
    pub channel: String,
    #[prost(string, tag = "2")]
    pub subtopic: String,
    #[prost(string, tag = "3")]
    pub publisher: String,
    #[prost(string, tag = "4")]
    pub protocol: String,
    #[prost(bytes = "bytes", tag = "5")]
    pub payload: Bytes,
    #[prost(int64, tag = "6")]
    pub created: i64,
    #[prost(string, optional, tag = "7")]
    pub content_type: Option<String>,
}

impl From<&Message> for WireMessage {
    fn from(m: &Message) -> Self {
        WireMessage {
            channel: m.channel.clone(),
            subtopic: m.subtopic.clone(),
            publisher: m.publisher.clone(),
            protocol: m.protocol.clone(),
            payload: m.payload.clone(),
            created: m.created,
            content_type: m.content_type.clone(),
        }
    }
}

impl From<WireMessage> for Message {
    fn from(w: WireMessage) -> Self {
        Message {
            channel: w.channel,
            subtopic: w.subtopic,
            publisher: w.publisher,
            protocol: w.protocol,
            created: w.created,
            content_type: w.content_type,
            payload: w.payload,
        }
    }
}

#[inline]
pub fn encode(m: &Message) -> Bytes {
    Bytes::from(WireMessage::from(m).encode_to_vec())
}

#[inline]
pub fn decode(data: &[u8]) -> Result<Message, prost::DecodeError> {
    WireMessage::decode(data).map(Message::from)
}
