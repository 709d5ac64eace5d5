use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::StreamMaxlen;
use redis::AsyncCommands;
use serde_json::Value;

use mqflux::events::{Event, EventSink};
use mqflux::Result;

/// Appends events to one redis stream per event stream id, trimmed approximately.
pub struct RedisEventSink {
    conn: ConnectionManager,
    prefix: String,
    max_len: usize,
}

impl RedisEventSink {
    pub fn new(conn: ConnectionManager, prefix: &str, max_len: usize) -> Self {
        Self { conn, prefix: prefix.trim_end_matches(':').to_owned(), max_len }
    }

    #[inline]
    fn stream_key(&self, stream_id: &str) -> String {
        format!("{}:events:{}", self.prefix, stream_id)
    }
}

/// Stream entry fields, non-string values are kept as JSON text.
pub(crate) fn fields(event: &Event) -> Vec<(String, String)> {
    let mut fields = Vec::with_capacity(event.payload.len() + 2);
    fields.push(("operation".to_owned(), event.op.clone()));
    fields.push(("occurred_at".to_owned(), event.ts.to_string()));
    for (k, v) in event.payload.iter() {
        let v = match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        fields.push((k.clone(), v));
    }
    fields
}

#[async_trait]
impl EventSink for RedisEventSink {
    async fn append(&self, event: &Event) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = self.stream_key(&event.stream_id);
        let _: String = conn.xadd_maxlen(&key, StreamMaxlen::Approx(self.max_len), "*", fields(event).as_slice()).await?;
        Ok(())
    }
}
