//! Payload transformers.
//!
//! A transformer turns one [`Message`] into a typed [`Batch`], the writers
//! dispatch on the batch variant.

use std::sync::Arc;

use serde::Serialize;

use crate::types::Message;

pub mod json;
pub mod senml;
pub mod timestamp;

pub use self::json::JsonTransformer;
pub use self::senml::SenmlTransformer;
pub use self::timestamp::{TimeFormat, Timestamps};

pub type TransformerRef = Arc<dyn Transformer>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransformError {
    #[error("failed to decode payload, {0}")]
    Decode(String),
    #[error("failed to normalize senml, {0}")]
    Normalize(String),
    #[error("invalid format, payload must be a JSON object or an array of objects")]
    InvalidFormat,
    #[error("invalid object key '{0}'")]
    InvalidKey(String),
    #[error("missing format, the subtopic is empty")]
    MissingFormat,
}

/// Transformer output.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "records", rename_all = "lowercase")]
pub enum Batch {
    Senml(Vec<senml::Record>),
    Json(Vec<json::Record>),
}

impl Batch {
    #[inline]
    pub fn len(&self) -> usize {
        match self {
            Batch::Senml(rs) => rs.len(),
            Batch::Json(rs) => rs.len(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn kind(&self) -> &'static str {
        match self {
            Batch::Senml(_) => "senml",
            Batch::Json(_) => "json",
        }
    }
}

pub trait Transformer: Sync + Send {
    fn transform(&self, msg: &Message) -> Result<Batch, TransformError>;
}
