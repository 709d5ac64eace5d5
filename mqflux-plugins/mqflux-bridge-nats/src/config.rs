use std::time::Duration;

use serde::Deserialize;

use mqflux_utils::{deserialize_duration, deserialize_duration_option};

/// The `[nats]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct NatsConfig {
    //Comma separated server urls
    #[serde(default = "NatsConfig::servers_default")]
    pub servers: String,
    #[serde(default = "NatsConfig::name_default")]
    pub name: String,
    #[serde(default = "NatsConfig::connection_timeout_default", deserialize_with = "deserialize_duration")]
    pub connection_timeout: Duration,
    #[serde(default, deserialize_with = "deserialize_duration_option")]
    pub ping_interval: Option<Duration>,
    #[serde(default)]
    pub max_reconnects: Option<usize>,
    #[serde(default)]
    pub retry_on_initial_connect: bool,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            servers: Self::servers_default(),
            name: Self::name_default(),
            connection_timeout: Self::connection_timeout_default(),
            ping_interval: None,
            max_reconnects: None,
            retry_on_initial_connect: false,
            token: None,
            username: None,
            password: None,
        }
    }
}

impl NatsConfig {
    pub const SECTION: &'static str = "nats";

    fn servers_default() -> String {
        "nats://127.0.0.1:4222".into()
    }
    fn name_default() -> String {
        "mqflux".into()
    }
    fn connection_timeout_default() -> Duration {
        Duration::from_secs(5)
    }
}
