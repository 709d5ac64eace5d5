#![deny(unsafe_code)]

//! Columnar time-series writer.
//!
//! Batches become points (see [`mqflux::writer::point`]), points are sent as
//! line protocol to `POST /api/v2/write` in chunks of `batch_size`.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{header, StatusCode};
use url::Url;

use mqflux::auth::AuthClientRef;
use mqflux::transformer::Batch;
use mqflux::writer::{to_points, EntityTags, NoTags, TagResolverRef, WriteError, Writer};
use mqflux::Result;

pub use config::InfluxConfig;

mod config;
pub mod line;

pub struct InfluxWriter {
    client: reqwest::Client,
    write_url: Url,
    token: String,
    batch_size: usize,
    tags: TagResolverRef,
}

impl InfluxWriter {
    pub fn new(cfg: &InfluxConfig) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(cfg.timeout).build()?;
        Ok(Self {
            client,
            write_url: Self::write_url(cfg)?,
            token: cfg.token.clone(),
            batch_size: cfg.batch_size.max(1),
            tags: Arc::new(NoTags),
        })
    }

    /// Adds entity metadata tags looked up through the control plane.
    pub fn entity_tags(mut self, client: AuthClientRef, cfg: &InfluxConfig) -> Self {
        self.tags = Arc::new(EntityTags::new(client, cfg.tags_ttl));
        self
    }

    fn write_url(cfg: &InfluxConfig) -> Result<Url> {
        let mut url = Url::parse(&cfg.url)?.join("api/v2/write")?;
        url.query_pairs_mut().append_pair("org", &cfg.org).append_pair("bucket", &cfg.bucket).append_pair("precision", "ns");
        Ok(url)
    }

    async fn send(&self, body: String) -> Result<(), WriteError> {
        let resp = self
            .client
            .post(self.write_url.clone())
            .header(header::AUTHORIZATION, format!("Token {}", self.token))
            .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await
            .map_err(|e| WriteError::Transport(e.to_string()))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let reason = format!("{}, {}", status, resp.text().await.unwrap_or_default());
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Err(WriteError::Transport(reason))
        } else {
            Err(WriteError::Schema(reason))
        }
    }
}

#[async_trait]
impl Writer for InfluxWriter {
    async fn save(&self, batch: &Batch) -> Result<(), WriteError> {
        let points = to_points(batch, self.tags.as_ref()).await?;
        let total = points.len();
        let mut written = 0;
        for chunk in points.chunks(self.batch_size) {
            match self.send(line::encode(chunk)).await {
                Ok(()) => written += chunk.len(),
                Err(e) if written == 0 => return Err(e),
                Err(e) => return Err(WriteError::Partial { written, total, reason: e.to_string() }),
            }
        }
        log::debug!("{} points written", written);
        Ok(())
    }

    fn name(&self) -> &str {
        "influxdb"
    }
}
