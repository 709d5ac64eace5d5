//! Persistence contract shared by the storage backends.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::future::retry;
use backoff::ExponentialBackoffBuilder;
use parking_lot::Mutex;

use crate::transformer::Batch;

pub mod document;
pub mod point;

pub use self::document::{documents, valid_table_name, Document};
pub use self::point::{to_points, EntityTags, FieldValue, NoTags, Point, TagResolver, TagResolverRef, Tags};

pub type WriterRef = Arc<dyn Writer>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WriteError {
    #[error("transport error, {0}")]
    Transport(String),
    #[error("serialization error, {0}")]
    Serialization(String),
    #[error("schema error, {0}")]
    Schema(String),
    #[error("unsupported batch, {0}")]
    Unsupported(String),
    #[error("partial write, {written} of {total} written, {reason}")]
    Partial { written: usize, total: usize, reason: String },
}

impl WriteError {
    /// Transport failures and partial writes may succeed on a later attempt,
    /// bad data never does.
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(self, WriteError::Transport(_) | WriteError::Partial { .. })
    }
}

#[async_trait]
pub trait Writer: Sync + Send {
    async fn save(&self, batch: &Batch) -> Result<(), WriteError>;

    #[inline]
    fn name(&self) -> &str {
        "writer"
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub max_elapsed_time: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&mqflux_conf::Writer::default())
    }
}

impl From<&mqflux_conf::Writer> for RetryPolicy {
    fn from(cfg: &mqflux_conf::Writer) -> Self {
        Self {
            initial_interval: cfg.retry_initial_interval,
            max_elapsed_time: cfg.retry_max_elapsed_time,
            multiplier: cfg.retry_multiplier,
        }
    }
}

/// Retries transient failures of the inner writer with exponential backoff.
pub struct Retrying<W> {
    inner: W,
    policy: RetryPolicy,
}

impl<W: Writer> Retrying<W> {
    pub fn new(inner: W, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    #[inline]
    pub fn inner(&self) -> &W {
        &self.inner
    }
}

#[async_trait]
impl<W: Writer> Writer for Retrying<W> {
    async fn save(&self, batch: &Batch) -> Result<(), WriteError> {
        let strategy = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.policy.initial_interval)
            .with_multiplier(self.policy.multiplier)
            .with_max_elapsed_time(Some(self.policy.max_elapsed_time))
            .build();
        retry(strategy, || async {
            self.inner.save(batch).await.map_err(|e| {
                if e.is_retryable() {
                    log::warn!("{} save failed, will retry, {}", self.inner.name(), e);
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        })
        .await
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

#[async_trait]
impl Writer for WriterRef {
    async fn save(&self, batch: &Batch) -> Result<(), WriteError> {
        (**self).save(batch).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Keeps saved batches in memory, failures can be scripted.
#[derive(Default)]
pub struct MemoryWriter {
    saved: Mutex<Vec<Batch>>,
    failures: Mutex<VecDeque<WriteError>>,
}

impl MemoryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `save` calls fail with these errors, in order.
    pub fn fail_with<I: IntoIterator<Item = WriteError>>(&self, errs: I) {
        self.failures.lock().extend(errs);
    }

    #[inline]
    pub fn batches(&self) -> Vec<Batch> {
        self.saved.lock().clone()
    }

    #[inline]
    pub fn records(&self) -> usize {
        self.saved.lock().iter().map(|b| b.len()).sum()
    }
}

#[async_trait]
impl Writer for MemoryWriter {
    async fn save(&self, batch: &Batch) -> Result<(), WriteError> {
        if let Some(e) = self.failures.lock().pop_front() {
            return Err(e);
        }
        self.saved.lock().push(batch.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            initial_interval: Duration::from_millis(1),
            max_elapsed_time: Duration::from_millis(500),
            multiplier: 1.5,
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let w = Retrying::new(MemoryWriter::new(), policy());
        w.inner().fail_with([
            WriteError::Transport("down".into()),
            WriteError::Partial { written: 1, total: 2, reason: "timeout".into() },
        ]);
        w.save(&Batch::Json(vec![])).await.unwrap();
        assert_eq!(w.inner().batches().len(), 1);
    }

    #[tokio::test]
    async fn terminal_errors_are_not_retried() {
        let w = Retrying::new(MemoryWriter::new(), policy());
        w.inner().fail_with([WriteError::Schema("bad table".into())]);
        assert_eq!(w.save(&Batch::Json(vec![])).await, Err(WriteError::Schema("bad table".into())));
        assert!(w.inner().batches().is_empty());
        w.save(&Batch::Json(vec![])).await.unwrap();
        assert_eq!(w.inner().batches().len(), 1);
    }

    #[tokio::test]
    async fn retries_stop_after_max_elapsed_time() {
        let w = Retrying::new(
            MemoryWriter::new(),
            RetryPolicy {
                initial_interval: Duration::from_millis(5),
                max_elapsed_time: Duration::from_millis(20),
                multiplier: 1.0,
            },
        );
        w.inner().fail_with(std::iter::repeat(WriteError::Transport("down".into())).take(1000));
        assert!(matches!(w.save(&Batch::Json(vec![])).await, Err(WriteError::Transport(_))));
    }
}
