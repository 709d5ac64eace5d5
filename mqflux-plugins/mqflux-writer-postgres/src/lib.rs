#![deny(unsafe_code)]

//! Document writer, every JSON format gets its own table.
//!
//! Tables are created on first use. The records of one batch are inserted in
//! one transaction. SenML batches are rejected as unsupported. [`PostgresReader`]
//! pages through the same tables.

use async_trait::async_trait;
use dashmap::DashSet;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;

use mqflux::transformer::Batch;
use mqflux::writer::{documents, valid_table_name, WriteError, Writer};
use mqflux::Result;

pub use config::PostgresConfig;
pub use reader::PostgresReader;

mod config;
mod reader;

pub async fn pool(cfg: &PostgresConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(cfg.max_connections)
        .acquire_timeout(cfg.acquire_timeout)
        .connect(&cfg.url)
        .await?;
    log::info!("connected to postgres");
    Ok(pool)
}

/// `class 42` is syntax error or access rule violation, `class 22` is data exception.
fn classify(e: sqlx::Error) -> WriteError {
    match &e {
        sqlx::Error::Database(db) => match db.code() {
            Some(code) if code.starts_with("42") => WriteError::Schema(e.to_string()),
            Some(code) if code.starts_with("22") || code.starts_with("23") => WriteError::Serialization(e.to_string()),
            _ => WriteError::Transport(e.to_string()),
        },
        sqlx::Error::Encode(_) | sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            WriteError::Serialization(e.to_string())
        }
        _ => WriteError::Transport(e.to_string()),
    }
}

fn create_table_sql(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\
         id UUID PRIMARY KEY, \
         channel TEXT NOT NULL, \
         created BIGINT NOT NULL, \
         subtopic TEXT NOT NULL, \
         publisher TEXT NOT NULL, \
         protocol TEXT NOT NULL, \
         payload JSONB NOT NULL)",
        table
    )
}

fn insert_sql(table: &str) -> String {
    format!(
        "INSERT INTO {} (id, channel, created, subtopic, publisher, protocol, payload) \
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
        table
    )
}

pub struct PostgresWriter {
    pool: PgPool,
    tables: DashSet<String, ahash::RandomState>,
}

impl PostgresWriter {
    pub async fn connect(cfg: &PostgresConfig) -> Result<Self> {
        Ok(Self::new(pool(cfg).await?))
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool, tables: DashSet::default() }
    }

    /// A reader over the tables this writer fills, sharing its pool.
    #[inline]
    pub fn reader(&self) -> PostgresReader {
        PostgresReader::new(self.pool.clone())
    }

    async fn ensure_table(&self, table: &str) -> Result<(), WriteError> {
        if self.tables.contains(table) {
            return Ok(());
        }
        if !valid_table_name(table) {
            return Err(WriteError::Schema(format!("invalid table name '{}'", table)));
        }
        sqlx::query(&create_table_sql(table)).execute(&self.pool).await.map_err(classify)?;
        log::info!("table {} is ready", table);
        self.tables.insert(table.to_owned());
        Ok(())
    }
}

#[async_trait]
impl Writer for PostgresWriter {
    async fn save(&self, batch: &Batch) -> Result<(), WriteError> {
        let docs = documents(batch)?;
        if docs.is_empty() {
            return Ok(());
        }
        for doc in &docs {
            self.ensure_table(&doc.table).await?;
        }
        let mut tx = self.pool.begin().await.map_err(classify)?;
        for doc in &docs {
            sqlx::query(&insert_sql(&doc.table))
                .bind(doc.id)
                .bind(&doc.channel)
                .bind(doc.created)
                .bind(&doc.subtopic)
                .bind(&doc.publisher)
                .bind(&doc.protocol)
                .bind(Json(&doc.payload))
                .execute(&mut *tx)
                .await
                .map_err(classify)?;
        }
        tx.commit().await.map_err(classify)?;
        log::debug!("{} documents written", docs.len());
        Ok(())
    }

    fn name(&self) -> &str {
        "postgres"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statements_name_the_format_table() {
        let create = create_table_sql("vehicles");
        assert!(create.starts_with("CREATE TABLE IF NOT EXISTS vehicles ("));
        assert!(create.contains("payload JSONB NOT NULL"));
        assert!(insert_sql("vehicles").starts_with("INSERT INTO vehicles (id, channel, created,"));
    }

    #[test]
    fn pool_failures_are_retryable() {
        assert!(classify(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(classify(sqlx::Error::PoolClosed).is_retryable());
        assert!(!classify(sqlx::Error::Decode("bad".into())).is_retryable());
    }

    #[test]
    fn section_defaults() {
        let s = mqflux_conf::Settings::from_toml("[postgres]\nmax_connections = 4").unwrap();
        let cfg: PostgresConfig = s.section(PostgresConfig::SECTION).unwrap();
        assert_eq!(cfg.max_connections, 4);
        assert_eq!(cfg.acquire_timeout, std::time::Duration::from_secs(5));
    }
}
