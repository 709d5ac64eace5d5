//! Columnar points built from transformer batches.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::time::Instant;

use mqflux_utils::TimestampNanos;

use super::WriteError;
use crate::auth::{AuthClientRef, AuthError};
use crate::transformer::json::{self, flatten};
use crate::transformer::{senml, Batch};

pub type Tags = BTreeMap<String, String>;
pub type TagResolverRef = Arc<dyn TagResolver>;

/// Entity metadata keys copied into point tags.
pub const METADATA_TAGS: [&str; 6] = ["system", "building_group", "building", "level", "room", "space"];

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Int(i64),
    Bool(bool),
    Str(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: String,
    pub tags: Tags,
    pub fields: BTreeMap<String, FieldValue>,
    pub timestamp: TimestampNanos,
}

/// Extra tags looked up per publisher.
#[async_trait]
pub trait TagResolver: Sync + Send {
    async fn tags(&self, publisher: &str) -> Arc<Tags>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoTags;

#[async_trait]
impl TagResolver for NoTags {
    async fn tags(&self, _publisher: &str) -> Arc<Tags> {
        Arc::new(Tags::new())
    }
}

/// Reads the metadata tags of the publishing entity from the control plane.
///
/// Results, including entities without metadata, are kept for `ttl`.
/// Failed lookups yield no tags and are not kept.
pub struct EntityTags {
    client: AuthClientRef,
    ttl: Duration,
    cache: DashMap<String, (Instant, Arc<Tags>), ahash::RandomState>,
}

impl EntityTags {
    pub fn new(client: AuthClientRef, ttl: Duration) -> Self {
        Self { client, ttl, cache: DashMap::default() }
    }

    fn extract(metadata: &serde_json::Map<String, Value>) -> Tags {
        METADATA_TAGS
            .iter()
            .filter_map(|key| {
                let v = match metadata.get(*key)? {
                    Value::String(s) if !s.is_empty() => s.clone(),
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    _ => return None,
                };
                Some(((*key).to_owned(), v))
            })
            .collect()
    }
}

#[async_trait]
impl TagResolver for EntityTags {
    async fn tags(&self, publisher: &str) -> Arc<Tags> {
        if let Some(entry) = self.cache.get(publisher) {
            if entry.0 > Instant::now() {
                return entry.1.clone();
            }
        }
        let tags = match self.client.retrieve_entity(publisher).await {
            Ok(entity) => Arc::new(Self::extract(&entity.metadata)),
            Err(AuthError::NotFound) => Arc::new(Tags::new()),
            Err(e) => {
                log::debug!("entity tags of {} unavailable, {}", publisher, e);
                return Arc::new(Tags::new());
            }
        };
        self.cache.insert(publisher.to_owned(), (Instant::now() + self.ttl, tags.clone()));
        tags
    }
}

/// Splits `device:measurement`, a name without a colon is the measurement itself.
pub fn split_name(name: &str) -> (Option<&str>, &str) {
    match name.split_once(':') {
        Some((device, m)) if !m.is_empty() => (Some(device).filter(|d| !d.is_empty()), m),
        _ => (None, name),
    }
}

/// `None` when `t` is not finite or does not fit the nanosecond range.
#[inline]
fn secs_to_nanos(t: f64) -> Option<TimestampNanos> {
    if !t.is_finite() {
        return None;
    }
    let secs = t.trunc();
    if secs < i64::MIN as f64 || secs >= i64::MAX as f64 {
        return None;
    }
    (secs as i64).checked_mul(1_000_000_000)?.checked_add(((t - secs) * 1e9).round() as i64)
}

fn base_tags(channel: &str, subtopic: &str, publisher: &str, extra: &Tags) -> Tags {
    let mut tags = extra.clone();
    tags.insert("channel".into(), channel.to_owned());
    tags.insert("publisher".into(), publisher.to_owned());
    if !subtopic.is_empty() {
        tags.insert("subtopic".into(), subtopic.to_owned());
    }
    tags
}

pub fn senml_point(r: &senml::Record, extra: &Tags) -> Result<Point, WriteError> {
    let timestamp =
        secs_to_nanos(r.time).ok_or_else(|| WriteError::Serialization(format!("time {} of {} is out of range", r.time, r.name)))?;
    let (device, measurement) = split_name(&r.name);
    let mut tags = base_tags(&r.channel, &r.subtopic, &r.publisher, extra);
    if let Some(device) = device {
        tags.insert("device".into(), device.to_owned());
    }
    if !r.unit.is_empty() {
        tags.insert("unit".into(), r.unit.clone());
    }
    let mut fields = BTreeMap::new();
    if let Some(v) = r.value {
        fields.insert("value".into(), FieldValue::Float(v));
    }
    if let Some(v) = &r.string_value {
        fields.insert("string_value".into(), FieldValue::Str(v.clone()));
    }
    if let Some(v) = r.bool_value {
        fields.insert("bool_value".into(), FieldValue::Bool(v));
    }
    if let Some(v) = &r.data_value {
        fields.insert("data_value".into(), FieldValue::Str(v.clone()));
    }
    if let Some(v) = r.sum {
        fields.insert("sum".into(), FieldValue::Float(v));
    }
    Ok(Point { measurement: measurement.to_owned(), tags, fields, timestamp })
}

fn field_value(v: &Value) -> Option<FieldValue> {
    match v {
        Value::Bool(b) => Some(FieldValue::Bool(*b)),
        Value::Number(n) => n.as_i64().map(FieldValue::Int).or_else(|| n.as_f64().map(FieldValue::Float)),
        Value::String(s) => Some(FieldValue::Str(s.clone())),
        Value::Array(_) | Value::Object(_) => Some(FieldValue::Str(v.to_string())),
        Value::Null => None,
    }
}

/// Points of one JSON batch, measurement is the first subtopic segment.
///
/// Timestamps are `created + index` so records of one message stay distinct.
pub fn json_points(records: &[json::Record], extra: &Tags) -> Result<Vec<Point>, WriteError> {
    let mut points = Vec::with_capacity(records.len());
    for (i, r) in records.iter().enumerate() {
        let measurement = r.subtopic.split('.').next().filter(|m| !m.is_empty()).unwrap_or(&r.format);
        let flat = flatten(&r.payload).map_err(|e| WriteError::Serialization(e.to_string()))?;
        let fields: BTreeMap<_, _> = flat.iter().filter_map(|(k, v)| Some((k.clone(), field_value(v)?))).collect();
        if fields.is_empty() {
            log::debug!("record {} of {} has no fields, skipped", i, r.channel);
            continue;
        }
        let mut tags = base_tags(&r.channel, &r.subtopic, &r.publisher, extra);
        tags.insert("protocol".into(), r.protocol.clone());
        points.push(Point { measurement: measurement.to_owned(), tags, fields, timestamp: r.created + i as i64 });
    }
    Ok(points)
}

/// Converts a batch, resolving extra tags once per distinct publisher.
pub async fn to_points(batch: &Batch, resolver: &dyn TagResolver) -> Result<Vec<Point>, WriteError> {
    let mut resolved: HashMap<&str, Arc<Tags>> = HashMap::new();
    match batch {
        Batch::Senml(records) => {
            let mut points = Vec::with_capacity(records.len());
            for r in records {
                let tags = match resolved.get(r.publisher.as_str()) {
                    Some(t) => t.clone(),
                    None => {
                        let t = resolver.tags(&r.publisher).await;
                        resolved.insert(r.publisher.as_str(), t.clone());
                        t
                    }
                };
                points.push(senml_point(r, &tags)?);
            }
            Ok(points)
        }
        Batch::Json(records) => match records.first() {
            Some(first) => {
                let tags = resolver.tags(&first.publisher).await;
                json_points(records, &tags)
            }
            None => Ok(Vec::new()),
        },
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::auth::tests::StaticAuth;

    fn record(name: &str) -> senml::Record {
        senml::Record {
            channel: "ch-1".into(),
            subtopic: "engine.temperature".into(),
            publisher: "thing-1".into(),
            protocol: "mqtt".into(),
            name: name.into(),
            time: 1_700_000_000.5,
            value: Some(22.5),
            ..Default::default()
        }
    }

    #[test]
    fn names_split_on_colon() {
        assert_eq!(split_name("d1:t"), (Some("d1"), "t"));
        assert_eq!(split_name("t"), (None, "t"));
        assert_eq!(split_name("d1:"), (None, "d1:"));
        assert_eq!(split_name(":t"), (None, "t"));
    }

    #[test]
    fn senml_record_to_point() {
        let p = senml_point(&record("d1:t"), &Tags::new()).unwrap();
        assert_eq!(p.measurement, "t");
        assert_eq!(p.tags["device"], "d1");
        assert_eq!(p.tags["channel"], "ch-1");
        assert_eq!(p.tags["subtopic"], "engine.temperature");
        assert_eq!(p.tags["publisher"], "thing-1");
        assert_eq!(p.fields["value"], FieldValue::Float(22.5));
        assert_eq!(p.fields.len(), 1);
        assert_eq!(p.timestamp, 1_700_000_000_500_000_000);
    }

    #[test]
    fn far_future_time_is_rejected() {
        let r = senml::Record { name: "temp".into(), time: 1e12, value: Some(1.0), ..Default::default() };
        assert!(matches!(senml_point(&r, &Tags::new()), Err(WriteError::Serialization(_))));
        let r = senml::Record { time: f64::NAN, ..r };
        assert!(senml_point(&r, &Tags::new()).is_err());
        assert_eq!(secs_to_nanos(9.2e9), Some(9_200_000_000_000_000_000));
        assert_eq!(secs_to_nanos(9.3e9), None);
    }

    #[test]
    fn json_records_to_points() {
        let rec = |payload: serde_json::Value| json::Record {
            channel: "ch-1".into(),
            subtopic: "building.sensors".into(),
            publisher: "thing-1".into(),
            protocol: "http".into(),
            created: 100,
            format: "sensors".into(),
            payload: payload.as_object().cloned().unwrap(),
        };
        let ps = json_points(&[rec(json!({"a": {"b": 1.5}, "on": true})), rec(json!({"n": null})), rec(json!({"c": 3}))], &Tags::new())
            .unwrap();
        assert_eq!(ps.len(), 2);
        assert_eq!(ps[0].measurement, "building");
        assert_eq!(ps[0].fields["a/b"], FieldValue::Float(1.5));
        assert_eq!(ps[0].fields["on"], FieldValue::Bool(true));
        assert_eq!(ps[0].timestamp, 100);
        assert_eq!(ps[1].fields["c"], FieldValue::Int(3));
        assert_eq!(ps[1].timestamp, 102);
    }

    #[tokio::test]
    async fn metadata_tags_are_resolved_once() {
        let auth = Arc::new(StaticAuth::with("s1", "thing-1", "ch-1"));
        auth.set_metadata("thing-1", json!({"building": "b7", "level": 3, "owner": "x"}));
        let resolver = EntityTags::new(auth.clone(), Duration::from_secs(60));
        let batch = Batch::Senml(vec![record("d1:t"), record("d1:h")]);
        let ps = to_points(&batch, &resolver).await.unwrap();
        assert_eq!(ps[0].tags["building"], "b7");
        assert_eq!(ps[1].tags["level"], "3");
        assert!(!ps[0].tags.contains_key("owner"));
        to_points(&batch, &resolver).await.unwrap();
        assert_eq!(auth.entity_calls(), 1);
    }
}
