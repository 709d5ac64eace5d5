#![deny(unsafe_code)]

//! Redis backends: the auth cache and the lifecycle event stream.

use redis::aio::ConnectionManager;

use mqflux::Result;

pub use cache::RedisCache;
pub use config::RedisConfig;
pub use events::RedisEventSink;

mod cache;
mod config;
mod events;

/// Opens a managed connection, it reconnects on its own after failures.
pub async fn connect(cfg: &RedisConfig) -> Result<ConnectionManager> {
    let client = redis::Client::open(cfg.url.as_str())?;
    let conn = client.get_connection_manager().await?;
    log::info!("connected to redis {}", cfg.url);
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn section_defaults() {
        let s = mqflux_conf::Settings::from_toml("[redis]\nprefix = \"iot\"").unwrap();
        let cfg: RedisConfig = s.section(RedisConfig::SECTION).unwrap();
        assert_eq!(cfg.url, "redis://127.0.0.1:6379");
        assert_eq!(cfg.prefix, "iot");
        assert_eq!(cfg.stream_max_len, 1_000_000);
    }
}
