//! SenML (RFC 8428) decoding and normalization.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use mqflux_utils::TimestampNanos;

use super::{Batch, TransformError, Transformer};
use crate::types::Message;

pub const CONTENT_TYPE_JSON: &str = "application/senml+json";
pub const CONTENT_TYPE_CBOR: &str = "application/senml+cbor";

const MAX_VERSION: i64 = 10;
/// Times below 2^28 seconds are relative to the message creation time.
const RELATIVE_TIME_LIMIT: f64 = 268_435_456.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Json,
    Cbor,
}

impl Format {
    pub fn from_content_type(ct: &str) -> Option<Self> {
        match ct.trim().to_ascii_lowercase().as_str() {
            CONTENT_TYPE_JSON => Some(Format::Json),
            CONTENT_TYPE_CBOR => Some(Format::Cbor),
            _ => None,
        }
    }
}

/// One normalized SenML sample with the message metadata attached.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub channel: String,
    pub subtopic: String,
    pub publisher: String,
    pub protocol: String,
    pub created: TimestampNanos,
    pub name: String,
    pub unit: String,
    /// Absolute seconds since the Unix epoch
    pub time: f64,
    pub update_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub string_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bool_value: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sum: Option<f64>,
}

/// Pack entry as it appears on the wire, base fields not yet folded.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
struct Raw {
    bver: Option<i64>,
    bn: Option<String>,
    bt: Option<f64>,
    bu: Option<String>,
    bv: Option<f64>,
    bs: Option<f64>,
    n: Option<String>,
    u: Option<String>,
    v: Option<f64>,
    vs: Option<String>,
    vb: Option<bool>,
    vd: Option<String>,
    s: Option<f64>,
    t: Option<f64>,
    ut: Option<f64>,
}

/// Decodes `application/senml+json` or `application/senml+cbor` payloads.
///
/// The message content type wins over the configured default, an unknown
/// content type falls back to JSON.
pub struct SenmlTransformer {
    format: Format,
}

impl Default for SenmlTransformer {
    fn default() -> Self {
        Self { format: Format::Json }
    }
}

impl SenmlTransformer {
    pub fn new(content_type: &str) -> Self {
        Self { format: Format::from_content_type(content_type).unwrap_or(Format::Json) }
    }

    fn format(&self, msg: &Message) -> Format {
        msg.content_type.as_deref().and_then(Format::from_content_type).unwrap_or(self.format)
    }
}

impl Transformer for SenmlTransformer {
    fn transform(&self, msg: &Message) -> Result<Batch, TransformError> {
        let pack = match self.format(msg) {
            Format::Json => decode_json(&msg.payload)?,
            Format::Cbor => decode_cbor(&msg.payload)?,
        };
        Ok(Batch::Senml(normalize(pack, msg)?))
    }
}

fn decode_json(data: &[u8]) -> Result<Vec<Raw>, TransformError> {
    serde_json::from_slice(data).map_err(|e| TransformError::Decode(e.to_string()))
}

fn cbor_label(label: i128) -> Option<&'static str> {
    Some(match label {
        -1 => "bver",
        -2 => "bn",
        -3 => "bt",
        -4 => "bu",
        -5 => "bv",
        -6 => "bs",
        0 => "n",
        1 => "u",
        2 => "v",
        3 => "vs",
        4 => "vb",
        5 => "s",
        6 => "t",
        7 => "ut",
        8 => "vd",
        _ => return None,
    })
}

fn cbor_value(v: ciborium::Value) -> Result<Value, TransformError> {
    use ciborium::Value as Cbor;
    Ok(match v {
        Cbor::Integer(i) => {
            let i = i128::from(i);
            match i64::try_from(i) {
                Ok(i) => Value::from(i),
                Err(_) => Number::from_f64(i as f64).map(Value::Number).unwrap_or(Value::Null),
            }
        }
        Cbor::Float(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        Cbor::Text(s) => Value::String(s),
        Cbor::Bool(b) => Value::Bool(b),
        Cbor::Bytes(b) => Value::String(URL_SAFE_NO_PAD.encode(b)),
        Cbor::Null => Value::Null,
        other => return Err(TransformError::Decode(format!("unexpected cbor value {:?}", other))),
    })
}

fn decode_cbor(data: &[u8]) -> Result<Vec<Raw>, TransformError> {
    use ciborium::Value as Cbor;
    let v: Cbor = ciborium::de::from_reader(data).map_err(|e| TransformError::Decode(e.to_string()))?;
    let items = match v {
        Cbor::Array(items) => items,
        _ => return Err(TransformError::Decode("senml pack must be an array".into())),
    };
    items
        .into_iter()
        .map(|item| {
            let entries = match item {
                Cbor::Map(entries) => entries,
                _ => return Err(TransformError::Decode("senml record must be a map".into())),
            };
            let mut obj = Map::new();
            for (k, v) in entries {
                let key = match k {
                    Cbor::Integer(i) => match cbor_label(i128::from(i)) {
                        Some(label) => label.to_owned(),
                        None => continue,
                    },
                    Cbor::Text(s) => s,
                    _ => continue,
                };
                obj.insert(key, cbor_value(v)?);
            }
            serde_json::from_value(Value::Object(obj)).map_err(|e| TransformError::Decode(e.to_string()))
        })
        .collect()
}

#[inline]
fn valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | ':' | '.' | '/' | '_'))
}

/// Folds base fields into each record, resolves times and validates values.
fn normalize(pack: Vec<Raw>, msg: &Message) -> Result<Vec<Record>, TransformError> {
    let created = msg.created_secs();
    let mut bname = String::new();
    let mut btime = 0.0;
    let mut bunit = String::new();
    let mut bvalue: Option<f64> = None;
    let mut bsum: Option<f64> = None;

    let mut records = Vec::with_capacity(pack.len());
    for (i, r) in pack.into_iter().enumerate() {
        if let Some(ver) = r.bver {
            if ver > MAX_VERSION {
                return Err(TransformError::Normalize(format!("unsupported version {} at record {}", ver, i)));
            }
        }
        if let Some(bn) = r.bn {
            bname = bn;
        }
        if let Some(bt) = r.bt {
            btime = bt;
        }
        if let Some(bu) = r.bu {
            bunit = bu;
        }
        if r.bv.is_some() {
            bvalue = r.bv;
        }
        if r.bs.is_some() {
            bsum = r.bs;
        }

        let name = format!("{}{}", bname, r.n.unwrap_or_default());
        if name.is_empty() || !valid_name(&name) {
            return Err(TransformError::Normalize(format!("invalid name '{}' at record {}", name, i)));
        }

        let value = match (r.v, bvalue) {
            (Some(v), Some(bv)) => Some(bv + v),
            (Some(v), None) => Some(v),
            (None, Some(bv)) if r.vs.is_none() && r.vb.is_none() && r.vd.is_none() && r.s.is_none() => Some(bv),
            (None, _) => None,
        };
        let sum = match (r.s, bsum) {
            (Some(s), Some(bs)) => Some(bs + s),
            (s, _) => s,
        };
        let values = [value.is_some(), r.vs.is_some(), r.vb.is_some(), r.vd.is_some()].iter().filter(|v| **v).count();
        if values > 1 {
            return Err(TransformError::Normalize(format!("too many values at record {}", i)));
        }
        if values == 0 && sum.is_none() {
            return Err(TransformError::Normalize(format!("no value or sum at record {}", i)));
        }

        let mut time = btime + r.t.unwrap_or(0.0);
        if time == 0.0 {
            time = created;
        } else if time.abs() < RELATIVE_TIME_LIMIT {
            time += created;
        }

        records.push(Record {
            channel: msg.channel.clone(),
            subtopic: msg.subtopic.clone(),
            publisher: msg.publisher.clone(),
            protocol: msg.protocol.clone(),
            created: msg.created,
            name,
            unit: r.u.filter(|u| !u.is_empty()).unwrap_or_else(|| bunit.clone()),
            time,
            update_time: r.ut.unwrap_or(0.0),
            value,
            string_value: r.vs,
            bool_value: r.vb,
            data_value: r.vd,
            sum,
        });
    }
    Ok(records)
}
