#![deny(unsafe_code)]

use std::fmt;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use config::{Config, ConfigError, Environment, File};
use serde::de::{DeserializeOwned, Deserializer};
use serde::Deserialize;

use mqflux_utils::deserialize_duration;

use self::logging::Log;

pub use self::options::{Command, Options};

pub mod logging;
pub mod options;

pub type Result<T, E = anyhow::Error> = anyhow::Result<T, E>;

/// Process settings.
///
/// Sources, later ones override earlier ones: `/etc/mqflux/mqflux.toml`,
/// `./mqflux.toml`, the `--config` file, then `MQFLUX_` environment variables
/// with `__` separating nested keys (`MQFLUX_AUTH__URL`).
#[derive(Clone)]
pub struct Settings {
    inner: Arc<Inner>,
    raw: Arc<Config>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Inner {
    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    pub http: Http,
    #[serde(default)]
    pub auth: Auth,
    #[serde(default)]
    pub cache: Cache,
    #[serde(default)]
    pub bus: Bus,
    #[serde(default)]
    pub events: Events,
    #[serde(default)]
    pub writer: Writer,
    #[serde(default)]
    pub forwarder: Forwarder,
    #[serde(default, skip)]
    pub opts: Options,
}

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl Settings {
    pub fn new(opts: Options) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::with_name("/etc/mqflux/mqflux").required(false))
            .add_source(File::with_name("mqflux").required(false));

        if let Some(cfg) = opts.cfg_name.as_ref() {
            builder = builder.add_source(File::with_name(cfg).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("mqflux").prefix_separator("_").separator("__").try_parsing(true),
        );

        Self::from_config(builder.build()?, opts)
    }

    /// Builds settings from an in-memory TOML document, no files or environment involved.
    pub fn from_toml(text: &str) -> Result<Self> {
        let raw = Config::builder().add_source(File::from_str(text, config::FileFormat::Toml)).build()?;
        Self::from_config(raw, Options::default())
    }

    fn from_config(raw: Config, opts: Options) -> Result<Self> {
        let mut inner: Inner = raw.clone().try_deserialize()?;
        if let Some(consumer_cfg) = opts.consumer_cfg_name.as_ref() {
            inner.writer.consumer_config.clone_from(consumer_cfg);
        }
        inner.opts = opts;
        Ok(Self { inner: Arc::new(inner), raw: Arc::new(raw) })
    }

    /// Deserializes the named section, an absent section yields the type's serde defaults.
    pub fn section<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        match self.raw.get::<T>(name) {
            Ok(v) => Ok(v),
            Err(ConfigError::NotFound(_)) => serde_json::from_value(serde_json::json!({}))
                .map_err(|e| anyhow!("section '{}' has required keys, {}", name, e)),
            Err(e) => Err(anyhow!("section '{}' is invalid, {}", name, e)),
        }
    }

    pub fn logs(&self) {
        log::debug!("Config info is {:?}", self.inner);
        log::info!("command is {:?}", self.opts.command());
        log::info!("http.laddr is {}", self.http.laddr);
        log::info!("auth.url is {}, timeout: {:?}", self.auth.url, self.auth.timeout);
        log::info!("cache is {:?}", self.cache);
        log::info!("bus is {:?}", self.bus);
        log::info!("events is {:?}", self.events);
        log::info!("writer is {:?}", self.writer);
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Settings ...")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Http {
    #[serde(default = "Http::laddr_default", deserialize_with = "Http::deserialize_addr")]
    pub laddr: SocketAddr,
    #[serde(default)]
    pub request_log: bool,
}

impl Default for Http {
    fn default() -> Self {
        Self { laddr: Self::laddr_default(), request_log: false }
    }
}

impl Http {
    fn laddr_default() -> SocketAddr {
        ([0, 0, 0, 0], 8090).into()
    }

    fn deserialize_addr<'de, D>(deserializer: D) -> std::result::Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer)?.parse::<SocketAddr>().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Auth {
    #[serde(default = "Auth::url_default")]
    pub url: String,
    //Deadline of each control-plane call
    #[serde(default = "Auth::timeout_default", deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
    #[serde(default = "Auth::startup_retry_default", deserialize_with = "deserialize_duration")]
    pub startup_retry: Duration,
}

impl Default for Auth {
    fn default() -> Self {
        Self {
            url: Self::url_default(),
            timeout: Self::timeout_default(),
            startup_retry: Self::startup_retry_default(),
        }
    }
}

impl Auth {
    fn url_default() -> String {
        "http://127.0.0.1:9000".into()
    }
    fn timeout_default() -> Duration {
        Duration::from_secs(1)
    }
    fn startup_retry_default() -> Duration {
        Duration::from_secs(30)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    None,
    Memory,
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Cache {
    #[serde(default = "Cache::kind_default")]
    pub kind: CacheKind,
    #[serde(default = "Cache::ttl_default", deserialize_with = "deserialize_duration")]
    pub ttl: Duration,
    #[serde(default = "Cache::negative_ttl_default", deserialize_with = "deserialize_duration")]
    pub negative_ttl: Duration,
}

impl Default for Cache {
    fn default() -> Self {
        Self { kind: Self::kind_default(), ttl: Self::ttl_default(), negative_ttl: Self::negative_ttl_default() }
    }
}

impl Cache {
    fn kind_default() -> CacheKind {
        CacheKind::Memory
    }
    fn ttl_default() -> Duration {
        Duration::from_secs(600)
    }
    fn negative_ttl_default() -> Duration {
        Duration::from_secs(30)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Local,
    Nats,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Bus {
    #[serde(default = "Bus::kind_default")]
    pub kind: BusKind,
    //Per-subscription queue capacity, the oldest messages are dropped on overflow
    #[serde(default = "Bus::queue_capacity_default")]
    pub queue_capacity: usize,
    #[serde(default = "Bus::max_redeliveries_default")]
    pub max_redeliveries: u32,
}

impl Default for Bus {
    fn default() -> Self {
        Self {
            kind: Self::kind_default(),
            queue_capacity: Self::queue_capacity_default(),
            max_redeliveries: Self::max_redeliveries_default(),
        }
    }
}

impl Bus {
    fn kind_default() -> BusKind {
        BusKind::Local
    }
    fn queue_capacity_default() -> usize {
        65_536
    }
    fn max_redeliveries_default() -> u32 {
        3
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventsKind {
    None,
    Bus,
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Events {
    #[serde(default = "Events::kind_default")]
    pub kind: EventsKind,
    #[serde(default = "Events::queue_capacity_default")]
    pub queue_capacity: usize,
    #[serde(default = "Events::stream_default")]
    pub stream: String,
}

impl Default for Events {
    fn default() -> Self {
        Self {
            kind: Self::kind_default(),
            queue_capacity: Self::queue_capacity_default(),
            stream: Self::stream_default(),
        }
    }
}

impl Events {
    fn kind_default() -> EventsKind {
        EventsKind::Bus
    }
    fn queue_capacity_default() -> usize {
        10_000
    }
    fn stream_default() -> String {
        "core".into()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriterKind {
    Memory,
    Influxdb,
    Postgres,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriterMode {
    Blocking,
    Async,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Writer {
    #[serde(default = "Writer::kind_default")]
    pub kind: WriterKind,
    #[serde(default = "Writer::consumer_config_default")]
    pub consumer_config: String,
    #[serde(default = "Writer::mode_default")]
    pub mode: WriterMode,
    //Concurrent saves in async mode
    #[serde(default = "Writer::workers_default")]
    pub workers: usize,
    #[serde(default = "Writer::queue_max_default")]
    pub queue_max: usize,
    #[serde(default = "Writer::errors_capacity_default")]
    pub errors_capacity: usize,
    #[serde(default = "Writer::retry_initial_interval_default", deserialize_with = "deserialize_duration")]
    pub retry_initial_interval: Duration,
    #[serde(default = "Writer::retry_max_elapsed_time_default", deserialize_with = "deserialize_duration")]
    pub retry_max_elapsed_time: Duration,
    #[serde(default = "Writer::retry_multiplier_default")]
    pub retry_multiplier: f64,
    #[serde(default = "Writer::drain_deadline_default", deserialize_with = "deserialize_duration")]
    pub drain_deadline: Duration,
}

impl Default for Writer {
    fn default() -> Self {
        Self {
            kind: Self::kind_default(),
            consumer_config: Self::consumer_config_default(),
            mode: Self::mode_default(),
            workers: Self::workers_default(),
            queue_max: Self::queue_max_default(),
            errors_capacity: Self::errors_capacity_default(),
            retry_initial_interval: Self::retry_initial_interval_default(),
            retry_max_elapsed_time: Self::retry_max_elapsed_time_default(),
            retry_multiplier: Self::retry_multiplier_default(),
            drain_deadline: Self::drain_deadline_default(),
        }
    }
}

impl Writer {
    fn kind_default() -> WriterKind {
        WriterKind::Memory
    }
    fn consumer_config_default() -> String {
        "consumer.toml".into()
    }
    fn mode_default() -> WriterMode {
        WriterMode::Blocking
    }
    fn workers_default() -> usize {
        16
    }
    fn queue_max_default() -> usize {
        100_000
    }
    fn errors_capacity_default() -> usize {
        1024
    }
    fn retry_initial_interval_default() -> Duration {
        Duration::from_millis(100)
    }
    fn retry_max_elapsed_time_default() -> Duration {
        Duration::from_secs(30)
    }
    fn retry_multiplier_default() -> f64 {
        2.0
    }
    fn drain_deadline_default() -> Duration {
        Duration::from_secs(5)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Forwarder {
    #[serde(default = "Forwarder::queue_group_default")]
    pub queue_group: String,
}

impl Default for Forwarder {
    fn default() -> Self {
        Self { queue_group: Self::queue_group_default() }
    }
}

impl Forwarder {
    fn queue_group_default() -> String {
        "forwarders".into()
    }
}
