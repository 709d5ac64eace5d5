use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use mqflux_utils::TimestampNanos;

use super::WriteError;
use crate::transformer::Batch;

static TABLE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// Longest identifier the document stores accept.
const MAX_TABLE_NAME: usize = 63;

/// One stored JSON record, `table` is the record's format.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Document {
    pub id: Uuid,
    #[serde(skip)]
    pub table: String,
    pub channel: String,
    pub created: TimestampNanos,
    pub subtopic: String,
    pub publisher: String,
    pub protocol: String,
    pub payload: Value,
}

#[inline]
pub fn valid_table_name(name: &str) -> bool {
    name.len() <= MAX_TABLE_NAME && TABLE_RE.is_match(name)
}

/// Documents of a JSON batch, SenML batches are not document shaped.
pub fn documents(batch: &Batch) -> Result<Vec<Document>, WriteError> {
    let records = match batch {
        Batch::Json(records) => records,
        Batch::Senml(_) => return Err(WriteError::Unsupported("senml batches go to the time-series writer".into())),
    };
    records
        .iter()
        .map(|r| {
            if !valid_table_name(&r.format) {
                return Err(WriteError::Schema(format!("invalid table name '{}'", r.format)));
            }
            Ok(Document {
                id: Uuid::new_v4(),
                table: r.format.clone(),
                channel: r.channel.clone(),
                created: r.created,
                subtopic: r.subtopic.clone(),
                publisher: r.publisher.clone(),
                protocol: r.protocol.clone(),
                payload: Value::Object(r.payload.clone()),
            })
        })
        .collect()
}
