use std::time::Duration;

use serde::Deserialize;

use mqflux_utils::deserialize_duration;

/// The `[influxdb]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct InfluxConfig {
    #[serde(default = "InfluxConfig::url_default")]
    pub url: String,
    #[serde(default)]
    pub org: String,
    #[serde(default = "InfluxConfig::bucket_default")]
    pub bucket: String,
    #[serde(default)]
    pub token: String,
    #[serde(default = "InfluxConfig::timeout_default", deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
    //Points per write request
    #[serde(default = "InfluxConfig::batch_size_default")]
    pub batch_size: usize,
    //How long entity metadata tags are kept per publisher
    #[serde(default = "InfluxConfig::tags_ttl_default", deserialize_with = "deserialize_duration")]
    pub tags_ttl: Duration,
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            url: Self::url_default(),
            org: String::new(),
            bucket: Self::bucket_default(),
            token: String::new(),
            timeout: Self::timeout_default(),
            batch_size: Self::batch_size_default(),
            tags_ttl: Self::tags_ttl_default(),
        }
    }
}

impl InfluxConfig {
    pub const SECTION: &'static str = "influxdb";

    fn url_default() -> String {
        "http://127.0.0.1:8086".into()
    }
    fn bucket_default() -> String {
        "mqflux".into()
    }
    fn timeout_default() -> Duration {
        Duration::from_secs(5)
    }
    fn batch_size_default() -> usize {
        5000
    }
    fn tags_ttl_default() -> Duration {
        Duration::from_secs(300)
    }
}
