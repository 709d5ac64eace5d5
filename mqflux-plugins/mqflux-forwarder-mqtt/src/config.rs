use std::time::Duration;

use serde::Deserialize;

use mqflux_utils::deserialize_duration;

/// The `[mqtt]` section, the broker the forwarder publishes to.
#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "MqttConfig::url_default")]
    pub url: String,
    //Random `mqflux-forwarder-<uuid>` when empty
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "MqttConfig::keep_alive_default", deserialize_with = "deserialize_duration")]
    pub keep_alive: Duration,
    //Requests buffered between the client and its event loop
    #[serde(default = "MqttConfig::capacity_default")]
    pub capacity: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            url: Self::url_default(),
            client_id: String::new(),
            username: None,
            password: None,
            keep_alive: Self::keep_alive_default(),
            capacity: Self::capacity_default(),
        }
    }
}

impl MqttConfig {
    pub const SECTION: &'static str = "mqtt";

    fn url_default() -> String {
        "mqtt://127.0.0.1:1883".into()
    }
    fn keep_alive_default() -> Duration {
        Duration::from_secs(30)
    }
    fn capacity_default() -> usize {
        1024
    }
}
