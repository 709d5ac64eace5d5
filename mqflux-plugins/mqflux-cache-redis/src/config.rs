use serde::Deserialize;

/// The `[redis]` section, shared by the cache and the event stream.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "RedisConfig::url_default")]
    pub url: String,
    #[serde(default = "RedisConfig::prefix_default")]
    pub prefix: String,
    //Approximate length each event stream is trimmed to
    #[serde(default = "RedisConfig::stream_max_len_default")]
    pub stream_max_len: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self { url: Self::url_default(), prefix: Self::prefix_default(), stream_max_len: Self::stream_max_len_default() }
    }
}

impl RedisConfig {
    pub const SECTION: &'static str = "redis";

    fn url_default() -> String {
        "redis://127.0.0.1:6379".into()
    }
    fn prefix_default() -> String {
        "mqflux".into()
    }
    fn stream_max_len_default() -> usize {
        1_000_000
    }
}
