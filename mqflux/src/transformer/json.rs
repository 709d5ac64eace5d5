use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use mqflux_utils::TimestampNanos;

use super::{Batch, TransformError, Transformer, Timestamps};
use crate::types::Message;

/// Separator of flattened keys.
pub const SEP: &str = "/";

const RESERVED: [&str; 4] = ["publisher", "protocol", "channel", "subtopic"];

/// One JSON object with the message metadata attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub channel: String,
    pub subtopic: String,
    pub publisher: String,
    pub protocol: String,
    pub created: TimestampNanos,
    /// Last dot segment of the subtopic
    pub format: String,
    pub payload: Map<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct JsonTransformer {
    timestamps: Timestamps,
    flatten: bool,
}

impl JsonTransformer {
    pub fn new(timestamps: Timestamps) -> Self {
        Self { timestamps, flatten: false }
    }

    /// Stores `flatten(object)` instead of the object itself.
    #[inline]
    pub fn flatten(mut self, on: bool) -> Self {
        self.flatten = on;
        self
    }

    fn record(&self, msg: &Message, format: &str, obj: Map<String, Value>) -> Result<Record, TransformError> {
        check_separator(&obj)?;
        let created = self.timestamps.resolve(&obj).unwrap_or(msg.created);
        let payload = if self.flatten { flatten(&obj)? } else { obj };
        Ok(Record {
            channel: msg.channel.clone(),
            subtopic: msg.subtopic.clone(),
            publisher: msg.publisher.clone(),
            protocol: msg.protocol.clone(),
            created,
            format: format.to_owned(),
            payload,
        })
    }
}

impl Transformer for JsonTransformer {
    fn transform(&self, msg: &Message) -> Result<Batch, TransformError> {
        let format = msg.subtopic.rsplit('.').next().filter(|f| !f.is_empty()).ok_or(TransformError::MissingFormat)?;
        let value: Value = serde_json::from_slice(&msg.payload).map_err(|e| TransformError::Decode(e.to_string()))?;
        let objects = match value {
            Value::Object(obj) => vec![obj],
            Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::Object(obj) => Ok(obj),
                    _ => Err(TransformError::InvalidFormat),
                })
                .collect::<Result<Vec<_>, _>>()?,
            _ => return Err(TransformError::InvalidFormat),
        };
        let records = objects.into_iter().map(|obj| self.record(msg, format, obj)).collect::<Result<Vec<_>, _>>()?;
        Ok(Batch::Json(records))
    }
}

fn check_separator(m: &Map<String, Value>) -> Result<(), TransformError> {
    for (k, v) in m {
        if k.contains(SEP) {
            return Err(TransformError::InvalidKey(k.clone()));
        }
        check_nested(v)?;
    }
    Ok(())
}

fn check_nested(v: &Value) -> Result<(), TransformError> {
    match v {
        Value::Object(inner) => check_separator(inner),
        Value::Array(items) => items.iter().try_for_each(check_nested),
        _ => Ok(()),
    }
}

#[inline]
fn check_key(k: &str) -> Result<(), TransformError> {
    if k.contains(SEP) || RESERVED.contains(&k) {
        Err(TransformError::InvalidKey(k.to_owned()))
    } else {
        Ok(())
    }
}

/// Converts nested objects into `/` joined keys.
///
/// Empty nested objects are kept as values so [`parse_flat`] restores them.
pub fn flatten(m: &Map<String, Value>) -> Result<Map<String, Value>, TransformError> {
    fn walk(prefix: &str, m: &Map<String, Value>, out: &mut Map<String, Value>) -> Result<(), TransformError> {
        for (k, v) in m {
            check_key(k)?;
            let key = format!("{}{}", prefix, k);
            match v {
                Value::Object(inner) if !inner.is_empty() => walk(&format!("{}{}", key, SEP), inner, out)?,
                _ => {
                    out.insert(key, v.clone());
                }
            }
        }
        Ok(())
    }
    let mut out = Map::new();
    walk("", m, &mut out)?;
    Ok(out)
}

/// Inverse of [`flatten`].
pub fn parse_flat(flat: &Map<String, Value>) -> Result<Map<String, Value>, TransformError> {
    let mut out = Map::new();
    for (key, v) in flat {
        let segs: Vec<&str> = key.split(SEP).collect();
        for seg in &segs {
            if seg.is_empty() || RESERVED.contains(seg) {
                return Err(TransformError::InvalidKey(key.clone()));
            }
        }
        let (last, parents) = segs.split_last().ok_or_else(|| TransformError::InvalidKey(key.clone()))?;
        let mut cur = &mut out;
        for seg in parents {
            let next = cur.entry(seg.to_string()).or_insert_with(|| Value::Object(Map::new()));
            cur = match next {
                Value::Object(m) => m,
                _ => return Err(TransformError::InvalidKey(key.clone())),
            };
        }
        if cur.insert(last.to_string(), v.clone()).is_some() {
            return Err(TransformError::InvalidKey(key.clone()));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use serde_json::json;

    use super::*;

    fn msg(subtopic: &str, payload: Value) -> Message {
        Message {
            channel: "ch-1".into(),
            subtopic: subtopic.into(),
            publisher: "thing-1".into(),
            protocol: "http".into(),
            created: 42,
            content_type: None,
            payload: Bytes::from(payload.to_string()),
        }
    }

    fn records(b: Batch) -> Vec<Record> {
        match b {
            Batch::Json(rs) => rs,
            other => panic!("unexpected batch {:?}", other),
        }
    }

    #[test]
    fn object_and_array() {
        let t = JsonTransformer::default();
        let rs = records(t.transform(&msg("building.sensors", json!({"a": {"b": 1}}))).unwrap());
        assert_eq!(rs.len(), 1);
        assert_eq!(rs[0].format, "sensors");
        assert_eq!(rs[0].created, 42);
        assert_eq!(Value::Object(rs[0].payload.clone()), json!({"a": {"b": 1}}));

        let rs = records(t.transform(&msg("sensors", json!([{"v": 1}, {"v": 2}]))).unwrap());
        assert_eq!(rs.len(), 2);
        assert_eq!(rs[1].payload["v"], 2);
    }

    #[test]
    fn rejected_shapes() {
        let t = JsonTransformer::default();
        assert_eq!(t.transform(&msg("", json!({"v": 1}))), Err(TransformError::MissingFormat));
        assert_eq!(t.transform(&msg("f", json!([{"v": 1}, 2]))), Err(TransformError::InvalidFormat));
        assert_eq!(t.transform(&msg("f", json!("text"))), Err(TransformError::InvalidFormat));
        assert_eq!(t.transform(&msg("f", json!({"a/b": 1}))), Err(TransformError::InvalidKey("a/b".into())));
        assert_eq!(t.transform(&msg("f", json!({"a": [{"b/c": 1}]}))), Err(TransformError::InvalidKey("b/c".into())));
        assert_eq!(t.transform(&msg("f", json!({"a": [[{"x": {"y/z": 1}}]]}))), Err(TransformError::InvalidKey("y/z".into())));
        assert!(t.transform(&msg("f", json!({"a": ["b/c", 1]}))).is_ok());
        // Reserved names pass through verbatim unless flattening.
        assert!(t.transform(&msg("f", json!({"channel": 1}))).is_ok());
        let flat = JsonTransformer::default().flatten(true);
        assert_eq!(flat.transform(&msg("f", json!({"x": {"channel": 1}}))), Err(TransformError::InvalidKey("channel".into())));
    }

    #[test]
    fn flatten_mode_and_timestamps() {
        let t = JsonTransformer::new(Timestamps::new([("meta/ts", "unix_ms")])).flatten(true);
        let rs = records(t.transform(&msg("f", json!({"meta": {"ts": 1500}, "v": 1}))).unwrap());
        assert_eq!(rs[0].created, 1_500_000_000);
        assert_eq!(Value::Object(rs[0].payload.clone()), json!({"meta/ts": 1500, "v": 1}));

        let rs = records(t.transform(&msg("f", json!({"meta": {"ts": "never"}}))).unwrap());
        assert_eq!(rs[0].created, 42);
    }

    #[test]
    fn flatten_round_trip() {
        let m = json!({"a": {"b": {"c": 1}, "d": [1, 2]}, "e": null, "f": {}});
        let m = m.as_object().unwrap();
        let flat = flatten(m).unwrap();
        assert_eq!(Value::Object(flat.clone()), json!({"a/b/c": 1, "a/d": [1, 2], "e": null, "f": {}}));
        assert_eq!(&parse_flat(&flat).unwrap(), m);
    }

    #[test]
    fn parse_flat_rejects_conflicts() {
        let flat = json!({"a": 1, "a/b": 2});
        assert!(matches!(parse_flat(flat.as_object().unwrap()), Err(TransformError::InvalidKey(_))));
        let flat = json!({"x/publisher": 1});
        assert!(parse_flat(flat.as_object().unwrap()).is_err());
        let flat = json!({"a//b": 1});
        assert!(parse_flat(flat.as_object().unwrap()).is_err());
    }
}
