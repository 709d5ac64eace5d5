//! Consumer runtime: bus subscription, transformation and persistence.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rust_box::task_exec_queue::{Builder, SpawnExt, TaskExecQueue};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use mqflux_conf::WriterMode;
use mqflux_utils::Counter;

use crate::bus::{Delivery, Packet, PubSubRef, Subscription, SUBJECT_ALL_CHANNELS};
use crate::transformer::senml::CONTENT_TYPE_JSON;
use crate::transformer::{JsonTransformer, SenmlTransformer, Timestamps, TransformError, TransformerRef};
use crate::writer::{WriteError, WriterRef};
use crate::Result;

/// Per-writer consumer file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default)]
    pub subscriber: SubscriberConfig,
    #[serde(default)]
    pub transformer: TransformerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriberConfig {
    #[serde(default = "SubscriberConfig::subjects_default")]
    pub subjects: Vec<String>,
    #[serde(default = "SubscriberConfig::queue_group_default")]
    pub queue_group: String,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self { subjects: Self::subjects_default(), queue_group: Self::queue_group_default() }
    }
}

impl SubscriberConfig {
    fn subjects_default() -> Vec<String> {
        vec![SUBJECT_ALL_CHANNELS.into()]
    }
    fn queue_group_default() -> String {
        "writers".into()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransformerConfig {
    #[serde(default = "TransformerConfig::format_default")]
    pub format: String,
    #[serde(default = "TransformerConfig::content_type_default")]
    pub content_type: String,
    #[serde(default)]
    pub flatten: bool,
    #[serde(default)]
    pub timestamps: Timestamps,
}

impl Default for TransformerConfig {
    fn default() -> Self {
        Self {
            format: Self::format_default(),
            content_type: Self::content_type_default(),
            flatten: false,
            timestamps: Timestamps::default(),
        }
    }
}

impl TransformerConfig {
    fn format_default() -> String {
        "senml".into()
    }
    fn content_type_default() -> String {
        CONTENT_TYPE_JSON.into()
    }

    /// Builds the configured transformer, the format name is case-insensitive.
    pub fn build(&self) -> Result<TransformerRef> {
        match self.format.to_ascii_lowercase().as_str() {
            "senml" => Ok(Arc::new(SenmlTransformer::new(&self.content_type))),
            "json" => Ok(Arc::new(JsonTransformer::new(self.timestamps.clone()).flatten(self.flatten))),
            other => Err(anyhow::anyhow!("unknown transformer format '{}'", other)),
        }
    }
}

impl ConsumerConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Reads the consumer file, falling back to the defaults when it is missing or broken.
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                log::warn!("consumer config {:?} not readable, using defaults, {}", path, e);
                return Self::default();
            }
        };
        match Self::from_toml(&text) {
            Ok(cfg) => cfg,
            Err(e) => {
                log::warn!("consumer config {:?} not parsable, using defaults, {}", path, e);
                Self::default()
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConsumeError {
    #[error("transform failed on {subject}, {source}")]
    Transform { subject: String, source: TransformError },
    #[error("save failed on {subject}, {source}")]
    Save { subject: String, source: WriteError },
}

#[derive(Debug, Default)]
pub struct ConsumerStats {
    pub received: Counter,
    pub saved: Counter,
    pub transform_failed: Counter,
    pub save_failed: Counter,
    pub redelivered: Counter,
    pub errors_dropped: Counter,
}

impl ConsumerStats {
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "received": self.received.count(),
            "saved": self.saved.count(),
            "transform_failed": self.transform_failed.count(),
            "save_failed": self.save_failed.count(),
            "redelivered": self.redelivered.count(),
            "errors_dropped": self.errors_dropped.count(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub mode: WriterMode,
    pub workers: usize,
    pub queue_max: usize,
    pub errors_capacity: usize,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self::from(&mqflux_conf::Writer::default())
    }
}

impl From<&mqflux_conf::Writer> for ConsumerOptions {
    fn from(cfg: &mqflux_conf::Writer) -> Self {
        Self { mode: cfg.mode, workers: cfg.workers, queue_max: cfg.queue_max, errors_capacity: cfg.errors_capacity }
    }
}

/// Binds bus subjects to a transformer and a writer.
pub struct Consumer {
    bus: PubSubRef,
    subscriber: SubscriberConfig,
    transformer: TransformerRef,
    writer: WriterRef,
    opts: ConsumerOptions,
}

struct Shared {
    transformer: TransformerRef,
    writer: WriterRef,
    exec: Option<TaskExecQueue>,
    errors: mpsc::Sender<ConsumeError>,
    stats: Arc<ConsumerStats>,
}

impl Shared {
    fn report(&self, e: ConsumeError) {
        if self.errors.try_send(e).is_err() {
            self.stats.errors_dropped.inc();
        }
    }
}

impl Consumer {
    pub fn new(bus: PubSubRef, cfg: &ConsumerConfig, writer: WriterRef) -> Result<Self> {
        Ok(Self {
            bus,
            subscriber: cfg.subscriber.clone(),
            transformer: cfg.transformer.build()?,
            writer,
            opts: ConsumerOptions::default(),
        })
    }

    #[inline]
    pub fn options(mut self, opts: ConsumerOptions) -> Self {
        self.opts = opts;
        self
    }

    /// Subscribes every configured subject in the queue group and starts consuming.
    pub async fn start(self) -> Result<ConsumerHandle> {
        let mut subs = Vec::with_capacity(self.subscriber.subjects.len());
        for subject in &self.subscriber.subjects {
            subs.push(self.bus.subscribe(subject, Some(&self.subscriber.queue_group)).await?);
            log::info!("{} consumer subscribed to {} in group {}", self.writer.name(), subject, self.subscriber.queue_group);
        }

        let exec = match self.opts.mode {
            WriterMode::Blocking => None,
            WriterMode::Async => {
                let (exec, task_runner) =
                    Builder::default().workers(self.opts.workers.max(1)).queue_max(self.opts.queue_max.max(1)).build();
                tokio::spawn(async move {
                    task_runner.await;
                });
                Some(exec)
            }
        };
        let (errors_tx, errors_rx) = mpsc::channel(self.opts.errors_capacity.max(1));
        let stats = Arc::new(ConsumerStats::default());
        let shared = Arc::new(Shared {
            transformer: self.transformer,
            writer: self.writer,
            exec: exec.clone(),
            errors: errors_tx,
            stats: stats.clone(),
        });

        let token = CancellationToken::new();
        let tasks = subs.into_iter().map(|sub| tokio::spawn(consume(sub, shared.clone(), token.clone()))).collect();
        Ok(ConsumerHandle { token, tasks, exec, errors: Some(errors_rx), stats })
    }
}

async fn consume(sub: Subscription, shared: Arc<Shared>, token: CancellationToken) {
    loop {
        let d = tokio::select! {
            _ = token.cancelled() => break,
            d = sub.next() => match d {
                Some(d) => d,
                None => break,
            },
        };
        handle(&sub, &shared, d).await;
    }
    log::debug!("consumer of {} exit", sub.subject());
}

async fn handle(sub: &Subscription, shared: &Arc<Shared>, d: Delivery) {
    let msg = match &d.packet {
        Packet::Message(msg) => msg.clone(),
        Packet::Event(_) => return,
    };
    if d.attempt == 0 {
        shared.stats.received.inc();
    }
    let batch = match shared.transformer.transform(&msg) {
        Ok(batch) => batch,
        Err(e) => {
            shared.stats.transform_failed.inc();
            log::warn!("failed to transform message on {}, {}", d.subject, e);
            shared.report(ConsumeError::Transform { subject: d.subject, source: e });
            return;
        }
    };

    match &shared.exec {
        None => match shared.writer.save(&batch).await {
            Ok(()) => {
                shared.stats.saved.inc();
            }
            Err(e) if e.is_retryable() => {
                let subject = d.subject.clone();
                if sub.redeliver(d) {
                    shared.stats.redelivered.inc();
                    log::warn!("save failed on {}, redelivering, {}", subject, e);
                } else {
                    shared.stats.save_failed.inc();
                    log::error!("save failed on {}, redeliveries exhausted, {}", subject, e);
                    shared.report(ConsumeError::Save { subject, source: e });
                }
            }
            Err(e) => {
                shared.stats.save_failed.inc();
                log::warn!("save failed on {}, {}", d.subject, e);
                shared.report(ConsumeError::Save { subject: d.subject, source: e });
            }
        },
        Some(exec) => {
            let shared1 = shared.clone();
            let subject = d.subject;
            if let Err(e) = async move {
                match shared1.writer.save(&batch).await {
                    Ok(()) => {
                        shared1.stats.saved.inc();
                    }
                    Err(e) => {
                        shared1.stats.save_failed.inc();
                        shared1.report(ConsumeError::Save { subject, source: e });
                    }
                }
            }
            .spawn(exec)
            .await
            {
                shared.stats.save_failed.inc();
                log::error!("save task not queued, {:?}", e.to_string());
            }
        }
    }
}

/// Running consumer.
pub struct ConsumerHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    exec: Option<TaskExecQueue>,
    errors: Option<mpsc::Receiver<ConsumeError>>,
    stats: Arc<ConsumerStats>,
}

impl ConsumerHandle {
    /// Terminal failures for the operator to drain, available once.
    #[inline]
    pub fn errors(&mut self) -> Option<mpsc::Receiver<ConsumeError>> {
        self.errors.take()
    }

    #[inline]
    pub fn stats(&self) -> Arc<ConsumerStats> {
        self.stats.clone()
    }

    /// Closes all subscriptions and waits for in-flight saves up to `deadline`.
    ///
    /// Returns `false` when work was still pending at the deadline.
    pub async fn shutdown(self, deadline: Duration) -> bool {
        let until = Instant::now() + deadline;
        self.token.cancel();
        for task in self.tasks {
            if tokio::time::timeout_at(until, task).await.is_err() {
                log::warn!("consumer task did not stop before the drain deadline");
                return false;
            }
        }
        if let Some(exec) = self.exec {
            while exec.active_count() + exec.waiting_count() > 0 {
                if Instant::now() >= until {
                    log::warn!(
                        "drain deadline reached, active: {}, waiting: {}",
                        exec.active_count(),
                        exec.waiting_count()
                    );
                    return false;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
        true
    }
}
