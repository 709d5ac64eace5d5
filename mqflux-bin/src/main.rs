#![deny(unsafe_code)]

use std::process;
use std::sync::Arc;

use anyhow::anyhow;
use structopt::StructOpt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use mqflux::auth::{wait_ready, AuthClientRef, HttpAuthClient};
use mqflux::bus::{LocalBus, PubSub, PubSubRef};
use mqflux::consumer::{Consumer, ConsumerConfig, ConsumerHandle, ConsumerOptions};
use mqflux::context::ServerContext;
use mqflux::events::QueuedEventStore;
use mqflux::forwarder::Forwarder;
use mqflux::writer::{MemoryWriter, RetryPolicy, Retrying, Writer, WriterRef};
use mqflux::Result;
use mqflux_bridge_nats::{NatsBus, NatsConfig};
use mqflux_cache_redis::{RedisCache, RedisConfig, RedisEventSink};
use mqflux_conf::{BusKind, CacheKind, Command, EventsKind, Options, Settings, WriterKind};
use mqflux_forwarder_mqtt::{MqttConfig, MqttForwarderPublisher};
use mqflux_writer_influxdb::{InfluxConfig, InfluxWriter};
use mqflux_writer_postgres::{PostgresConfig, PostgresWriter};

use logger::logger_init;

mod hook_api;
mod logger;

#[tokio::main]
async fn main() {
    //init config
    let settings = match Settings::new(Options::from_args()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("settings init failed, {:?}", e);
            process::exit(1);
        }
    };

    //init log
    let guard = match logger_init(&settings.log) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("logger init failed, {:?}", e);
            process::exit(1);
        }
    };

    settings.logs();

    let code = match run(settings).await {
        Ok(()) => 0,
        Err(e) => {
            log::error!("mqflux exit with error, {:?}", e);
            1
        }
    };
    drop(guard);
    process::exit(code);
}

#[derive(Default)]
struct Running {
    tasks: Vec<JoinHandle<()>>,
    consumer: Option<ConsumerHandle>,
}

async fn run(settings: Settings) -> Result<()> {
    let command = settings.opts.command();
    let token = CancellationToken::new();
    let bus = build_bus(&settings, command).await?;
    let auth: AuthClientRef = Arc::new(HttpAuthClient::new(&settings.auth.url, settings.auth.timeout)?);

    let mut running = Running::default();
    let started = start(&settings, command, &bus, &auth, &token, &mut running).await;
    if started.is_ok() {
        log::info!("mqflux {:?} started", command);
        shutdown_signal().await;
        log::info!("shutting down");
    }

    token.cancel();
    if let Some(consumer) = running.consumer.take() {
        if !consumer.shutdown(settings.writer.drain_deadline).await {
            log::warn!("writer did not drain within {:?}", settings.writer.drain_deadline);
        }
    }
    for task in running.tasks {
        if let Err(e) = task.await {
            log::warn!("task join failed, {:?}", e);
        }
    }
    if let Err(e) = bus.close().await {
        log::warn!("bus close failed, {}", e);
    }
    started
}

async fn start(
    settings: &Settings,
    command: Command,
    bus: &PubSubRef,
    auth: &AuthClientRef,
    token: &CancellationToken,
    running: &mut Running,
) -> Result<()> {
    if matches!(command, Command::Adapter | Command::Standalone) {
        running.tasks.extend(start_adapter(settings, bus.clone(), auth.clone(), token.clone()).await?);
    }
    if matches!(command, Command::Writer | Command::Standalone) {
        let (consumer, reporter) = start_writer(settings, bus.clone(), auth.clone(), token.clone()).await?;
        running.consumer = Some(consumer);
        running.tasks.push(reporter);
    }
    if matches!(command, Command::Forwarder | Command::Standalone) {
        running.tasks.extend(start_forwarder(settings, bus.clone(), token.clone()).await?);
    }
    Ok(())
}

async fn build_bus(settings: &Settings, command: Command) -> Result<PubSubRef> {
    let local = || -> PubSubRef { Arc::new(LocalBus::new(settings.bus.queue_capacity, settings.bus.max_redeliveries)) };
    match (command, settings.bus.kind) {
        (Command::Standalone, BusKind::Nats) => {
            log::warn!("standalone runs on the in-memory bus, bus.kind nats is ignored");
            Ok(local())
        }
        (_, BusKind::Local) => Ok(local()),
        (_, BusKind::Nats) => {
            let cfg: NatsConfig = settings.section(NatsConfig::SECTION)?;
            let bus = NatsBus::connect(&cfg, settings.bus.queue_capacity, settings.bus.max_redeliveries).await?;
            Ok(Arc::new(bus))
        }
    }
}

async fn start_adapter(
    settings: &Settings,
    bus: PubSubRef,
    auth: AuthClientRef,
    token: CancellationToken,
) -> Result<Vec<JoinHandle<()>>> {
    wait_ready(auth.as_ref(), settings.auth.startup_retry)
        .await
        .map_err(|e| anyhow!("auth service {} is not reachable, {}", settings.auth.url, e))?;

    let mut builder = ServerContext::builder(settings.clone()).bus(bus).auth(auth);
    let redis_cache = settings.cache.kind == CacheKind::Redis;
    let redis_events = settings.events.kind == EventsKind::Redis;
    if redis_cache || redis_events {
        let cfg: RedisConfig = settings.section(RedisConfig::SECTION)?;
        let conn = mqflux_cache_redis::connect(&cfg).await?;
        if redis_cache {
            builder = builder.cache(Arc::new(RedisCache::new(conn.clone(), &cfg.prefix)));
        }
        if redis_events {
            let sink = Arc::new(RedisEventSink::new(conn, &cfg.prefix, cfg.stream_max_len));
            builder = builder.events(Arc::new(QueuedEventStore::new(
                sink,
                settings.events.queue_capacity,
                &settings.events.stream,
            )));
        }
    }
    let scx = builder.build()?;

    let invalidator = scx.start_invalidator(token.clone()).await?;
    let incoming = hook_api::listen(settings.http.laddr).await?;
    let api = tokio::spawn(async move {
        if let Err(e) = hook_api::serve(incoming, scx, token).await {
            log::error!("HTTP hook API failed, {:?}", e);
        }
    });
    Ok(vec![invalidator, api])
}

async fn start_writer(
    settings: &Settings,
    bus: PubSubRef,
    auth: AuthClientRef,
    token: CancellationToken,
) -> Result<(ConsumerHandle, JoinHandle<()>)> {
    let cfg = ConsumerConfig::load(&settings.writer.consumer_config);
    let writer: WriterRef = match settings.writer.kind {
        WriterKind::Memory => Arc::new(MemoryWriter::new()),
        WriterKind::Influxdb => {
            let cfg: InfluxConfig = settings.section(InfluxConfig::SECTION)?;
            Arc::new(InfluxWriter::new(&cfg)?.entity_tags(auth, &cfg))
        }
        WriterKind::Postgres => {
            let cfg: PostgresConfig = settings.section(PostgresConfig::SECTION)?;
            Arc::new(PostgresWriter::connect(&cfg).await?)
        }
    };
    log::info!("writer is {}, subscribed to {:?}", writer.name(), cfg.subscriber.subjects);
    let writer: WriterRef = Arc::new(Retrying::new(writer, RetryPolicy::from(&settings.writer)));

    let mut consumer =
        Consumer::new(bus, &cfg, writer)?.options(ConsumerOptions::from(&settings.writer)).start().await?;
    let errors = consumer.errors();
    let reporter = tokio::spawn(async move {
        let mut errors = match errors {
            Some(errors) => errors,
            None => return,
        };
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                e = errors.recv() => match e {
                    Some(e) => log::error!("consume failed, {}", e),
                    None => break,
                },
            }
        }
    });
    Ok((consumer, reporter))
}

async fn start_forwarder(
    settings: &Settings,
    bus: PubSubRef,
    token: CancellationToken,
) -> Result<Vec<JoinHandle<()>>> {
    let cfg: MqttConfig = settings.section(MqttConfig::SECTION)?;
    let (publisher, driver) = MqttForwarderPublisher::connect(&cfg, token.clone())?;
    let forwarder = Forwarder::new(bus, Arc::new(publisher), &settings.forwarder.queue_group).start(token).await?;
    Ok(vec![driver, forwarder])
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
                return;
            }
            Err(e) => log::warn!("SIGTERM handler install failed, {}", e),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("ctrl-c handler failed, {}", e);
    }
}
