//! Paged reads of persisted messages of one channel.
//!
//! Results are ordered newest first. `from` is inclusive and `to` exclusive,
//! both in seconds since the Unix epoch.

use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use mqflux_utils::TimestampNanos;

use crate::transformer::{json, senml, Batch};
use crate::writer::MemoryWriter;

/// Largest page a reader hands out.
pub const MAX_LIMIT: u64 = 1000;

/// Table read when a query names no format.
pub const DEFAULT_FORMAT: &str = "messages";

pub type ReaderRef = Arc<dyn Reader>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReadError {
    #[error("invalid query, {0}")]
    InvalidQuery(String),
    #[error("transport error, {0}")]
    Transport(String),
    #[error("stored message can not be decoded, {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparator {
    #[default]
    Eq,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl Comparator {
    /// Whether `stored <op> wanted` holds.
    fn holds(self, stored: f64, wanted: f64) -> bool {
        match stored.partial_cmp(&wanted) {
            None => false,
            Some(o) => match self {
                Comparator::Eq => o == Ordering::Equal,
                Comparator::Lt => o == Ordering::Less,
                Comparator::Lte => o != Ordering::Greater,
                Comparator::Gt => o == Ordering::Greater,
                Comparator::Gte => o != Ordering::Less,
            },
        }
    }

    #[inline]
    pub fn sql(self) -> &'static str {
        match self {
            Comparator::Eq => "=",
            Comparator::Lt => "<",
            Comparator::Lte => "<=",
            Comparator::Gt => ">",
            Comparator::Gte => ">=",
        }
    }
}

/// Paging and filters of one read. Unset filters match everything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageMetadata {
    pub offset: u64,
    pub limit: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtopic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    /// SenML record name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "v", skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    pub comparator: Comparator,
    #[serde(rename = "vb", skip_serializing_if = "Option::is_none")]
    pub bool_value: Option<bool>,
    #[serde(rename = "vs", skip_serializing_if = "Option::is_none")]
    pub string_value: Option<String>,
    #[serde(rename = "vd", skip_serializing_if = "Option::is_none")]
    pub data_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<f64>,
    /// JSON format, selects the document table
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

impl Default for PageMetadata {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 10,
            subtopic: None,
            publisher: None,
            protocol: None,
            name: None,
            value: None,
            comparator: Comparator::Eq,
            bool_value: None,
            string_value: None,
            data_value: None,
            from: None,
            to: None,
            format: None,
        }
    }
}

impl PageMetadata {
    pub fn validate(&self) -> Result<(), ReadError> {
        if self.limit < 1 || self.limit > MAX_LIMIT {
            return Err(ReadError::InvalidQuery(format!("limit must be within 1..={}", MAX_LIMIT)));
        }
        for (name, t) in [("from", self.from), ("to", self.to)] {
            if t.is_some_and(|t| !t.is_finite()) {
                return Err(ReadError::InvalidQuery(format!("{} is not a finite time", name)));
            }
        }
        Ok(())
    }

    /// Whether a time in seconds falls within `[from, to)`.
    pub fn contains_secs(&self, t: f64) -> bool {
        self.from.map_or(true, |from| t >= from) && self.to.map_or(true, |to| t < to)
    }

    /// `[from, to)` in nanoseconds, saturating at the `i64` range.
    pub fn nanos_range(&self) -> (Option<TimestampNanos>, Option<TimestampNanos>) {
        let nanos = |t: f64| (t * 1e9).ceil() as TimestampNanos;
        (self.from.map(nanos), self.to.map(nanos))
    }

    pub fn contains_nanos(&self, t: TimestampNanos) -> bool {
        let (from, to) = self.nanos_range();
        from.map_or(true, |from| t >= from) && to.map_or(true, |to| t < to)
    }

    #[inline]
    fn has_value_filter(&self) -> bool {
        self.name.is_some()
            || self.value.is_some()
            || self.bool_value.is_some()
            || self.string_value.is_some()
            || self.data_value.is_some()
    }

    fn matches_common(&self, subtopic: &str, publisher: &str, protocol: &str) -> bool {
        let eq = |want: &Option<String>, have: &str| want.as_deref().map_or(true, |w| w == have);
        eq(&self.subtopic, subtopic) && eq(&self.publisher, publisher) && eq(&self.protocol, protocol)
    }

    fn matches_senml(&self, r: &senml::Record) -> bool {
        self.format.is_none()
            && self.matches_common(&r.subtopic, &r.publisher, &r.protocol)
            && self.contains_secs(r.time)
            && self.name.as_deref().map_or(true, |n| n == r.name)
            && self.value.map_or(true, |v| r.value.is_some_and(|rv| self.comparator.holds(rv, v)))
            && self.bool_value.map_or(true, |v| r.bool_value == Some(v))
            && self.string_value.as_deref().map_or(true, |v| r.string_value.as_deref() == Some(v))
            && self.data_value.as_deref().map_or(true, |v| r.data_value.as_deref() == Some(v))
    }

    fn matches_json(&self, r: &json::Record) -> bool {
        !self.has_value_filter()
            && self.format.as_deref().map_or(true, |f| f == r.format)
            && self.matches_common(&r.subtopic, &r.publisher, &r.protocol)
            && self.contains_nanos(r.created)
    }
}

/// One persisted record as read back.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StoredMessage {
    Senml(senml::Record),
    Json(json::Record),
}

impl StoredMessage {
    #[inline]
    pub fn channel(&self) -> &str {
        match self {
            StoredMessage::Senml(r) => &r.channel,
            StoredMessage::Json(r) => &r.channel,
        }
    }

    /// Record time in nanoseconds, used for ordering.
    pub fn time_nanos(&self) -> TimestampNanos {
        match self {
            StoredMessage::Senml(r) => (r.time * 1e9) as TimestampNanos,
            StoredMessage::Json(r) => r.created,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessagesPage {
    #[serde(flatten)]
    pub metadata: PageMetadata,
    pub total: u64,
    pub messages: Vec<StoredMessage>,
}

#[async_trait]
pub trait Reader: Sync + Send {
    /// Skips `offset` matching messages of `channel` and returns at most `limit`.
    async fn read_all(&self, channel: &str, pm: &PageMetadata) -> Result<MessagesPage, ReadError>;
}

#[async_trait]
impl Reader for MemoryWriter {
    async fn read_all(&self, channel: &str, pm: &PageMetadata) -> Result<MessagesPage, ReadError> {
        pm.validate()?;
        let mut matched: Vec<StoredMessage> = Vec::new();
        for batch in self.batches() {
            match batch {
                Batch::Senml(records) => matched.extend(
                    records
                        .into_iter()
                        .filter(|r| r.channel == channel && pm.matches_senml(r))
                        .map(StoredMessage::Senml),
                ),
                Batch::Json(records) => matched.extend(
                    records
                        .into_iter()
                        .filter(|r| r.channel == channel && pm.matches_json(r))
                        .map(StoredMessage::Json),
                ),
            }
        }
        // newest first, ties keep write order
        matched.reverse();
        matched.sort_by_key(|m| std::cmp::Reverse(m.time_nanos()));
        let total = matched.len() as u64;
        let messages = matched.into_iter().skip(pm.offset as usize).take(pm.limit as usize).collect();
        Ok(MessagesPage { metadata: pm.clone(), total, messages })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::writer::Writer;

    fn senml(name: &str, time: f64, value: f64) -> senml::Record {
        senml::Record {
            channel: "ch-1".into(),
            subtopic: "engine".into(),
            publisher: "thing-1".into(),
            protocol: "mqtt".into(),
            name: name.into(),
            time,
            value: Some(value),
            ..Default::default()
        }
    }

    fn doc(format: &str, created: TimestampNanos, publisher: &str) -> json::Record {
        json::Record {
            channel: "ch-1".into(),
            subtopic: format!("building.{}", format),
            publisher: publisher.into(),
            protocol: "http".into(),
            created,
            format: format.into(),
            payload: json!({"v": 1}).as_object().cloned().unwrap(),
        }
    }

    async fn store() -> MemoryWriter {
        let w = MemoryWriter::new();
        w.save(&Batch::Senml(vec![senml("temp", 100.0, 20.0), senml("temp", 101.0, 21.0), senml("hum", 102.0, 40.0)]))
            .await
            .unwrap();
        let mut other = senml("temp", 103.0, 22.0);
        other.channel = "ch-2".into();
        w.save(&Batch::Senml(vec![other])).await.unwrap();
        w.save(&Batch::Json(vec![doc("power", 100_000_000_000, "thing-1"), doc("power", 104_000_000_000, "thing-2")]))
            .await
            .unwrap();
        w
    }

    fn times(page: &MessagesPage) -> Vec<TimestampNanos> {
        page.messages.iter().map(|m| m.time_nanos() / 1_000_000_000).collect()
    }

    #[tokio::test]
    async fn pages_newest_first() {
        let w = store().await;
        let page = w.read_all("ch-1", &PageMetadata { limit: 2, ..Default::default() }).await.unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(times(&page), vec![104, 102]);

        let page = w.read_all("ch-1", &PageMetadata { offset: 2, limit: 2, ..Default::default() }).await.unwrap();
        assert_eq!(times(&page), vec![101, 100]);
        assert!(page.messages.iter().all(|m| m.channel() == "ch-1"));

        let page = w.read_all("ch-1", &PageMetadata { offset: 10, ..Default::default() }).await.unwrap();
        assert_eq!(page.total, 5);
        assert!(page.messages.is_empty());
    }

    #[tokio::test]
    async fn from_is_inclusive_and_to_exclusive() {
        let w = store().await;
        let pm = PageMetadata { from: Some(100.0), to: Some(102.0), ..Default::default() };
        let page = w.read_all("ch-1", &pm).await.unwrap();
        assert_eq!(times(&page), vec![101, 100, 100]);

        let pm = PageMetadata { from: Some(102.0), to: Some(104.0), ..Default::default() };
        assert_eq!(times(&w.read_all("ch-1", &pm).await.unwrap()), vec![102]);
    }

    #[tokio::test]
    async fn filters() {
        let w = store().await;
        let pm = PageMetadata { publisher: Some("thing-2".into()), ..Default::default() };
        assert_eq!(times(&w.read_all("ch-1", &pm).await.unwrap()), vec![104]);

        let pm = PageMetadata { subtopic: Some("engine".into()), name: Some("temp".into()), ..Default::default() };
        assert_eq!(w.read_all("ch-1", &pm).await.unwrap().total, 2);

        let pm = PageMetadata { value: Some(21.0), comparator: Comparator::Gte, ..Default::default() };
        assert_eq!(times(&w.read_all("ch-1", &pm).await.unwrap()), vec![102, 101]);

        let pm = PageMetadata { format: Some("power".into()), protocol: Some("http".into()), ..Default::default() };
        assert_eq!(times(&w.read_all("ch-1", &pm).await.unwrap()), vec![104, 100]);
    }

    #[tokio::test]
    async fn limits_are_checked() {
        let w = store().await;
        for limit in [0, MAX_LIMIT + 1] {
            let pm = PageMetadata { limit, ..Default::default() };
            assert!(matches!(w.read_all("ch-1", &pm).await, Err(ReadError::InvalidQuery(_))));
        }
        let pm = PageMetadata { from: Some(f64::NAN), ..Default::default() };
        assert!(w.read_all("ch-1", &pm).await.is_err());
    }

    #[test]
    fn query_names() {
        let pm: PageMetadata =
            serde_json::from_value(json!({"limit": 5, "v": 3.5, "comparator": "lt", "vb": true})).unwrap();
        assert_eq!(pm.limit, 5);
        assert_eq!(pm.value, Some(3.5));
        assert_eq!(pm.comparator, Comparator::Lt);
        assert_eq!(pm.bool_value, Some(true));
        assert_eq!(pm.offset, 0);
        assert!(Comparator::Lte.holds(1.0, 1.0) && !Comparator::Lt.holds(1.0, 1.0));
        assert_eq!(Comparator::Gte.sql(), ">=");
    }
}
