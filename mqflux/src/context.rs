use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use anyhow::anyhow;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use mqflux_conf::{CacheKind, EventsKind, Settings};

use crate::auth::{AuthClientRef, Authorizer, HttpAuthClient};
use crate::bus::{publisher, LocalBus, PubSubRef};
use crate::cache::{AuthCacheRef, MemoryCache, NoopCache};
use crate::events::{BusSink, CacheInvalidator, EventStoreRef, NoopEventStore, QueuedEventStore};
use crate::handler::{HookStats, Hooks, LogLayer, SessionHandler, Stack, StatsLayer};
use crate::session::SessionRegistry;
use crate::Result;

/// Shared services of one process.
#[derive(Clone)]
pub struct ServerContext {
    inner: Arc<ServerContextInner>,
}

pub struct ServerContextInner {
    pub settings: Settings,
    pub bus: PubSubRef,
    pub cache: AuthCacheRef,
    pub auth: AuthClientRef,
    pub events: EventStoreRef,
    pub hooks: Hooks,
    pub hook_stats: Arc<HookStats>,
    pub sessions: SessionRegistry,
}

impl Deref for ServerContext {
    type Target = ServerContextInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl ServerContext {
    #[inline]
    pub fn builder(settings: Settings) -> ServerContextBuilder {
        ServerContextBuilder::new(settings)
    }

    /// Starts evicting cache entries on lifecycle events.
    pub async fn start_invalidator(&self, token: CancellationToken) -> Result<JoinHandle<()>> {
        CacheInvalidator::new(self.cache.clone()).start(self.bus.clone(), token).await
    }

    pub fn stats(&self) -> serde_json::Value {
        json!({
            "hooks": self.hook_stats.to_json(),
            "bus": self.bus.stats(),
            "events": {"dropped": self.events.dropped()},
            "sessions": self.sessions.len(),
        })
    }
}

impl fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ServerContext ...")?;
        Ok(())
    }
}

/// Wires the services from settings, backends that live in plugins are injected.
pub struct ServerContextBuilder {
    settings: Settings,
    bus: Option<PubSubRef>,
    cache: Option<AuthCacheRef>,
    auth: Option<AuthClientRef>,
    events: Option<EventStoreRef>,
}

impl ServerContextBuilder {
    pub fn new(settings: Settings) -> Self {
        Self { settings, bus: None, cache: None, auth: None, events: None }
    }

    #[inline]
    pub fn bus(mut self, bus: PubSubRef) -> Self {
        self.bus = Some(bus);
        self
    }

    #[inline]
    pub fn cache(mut self, cache: AuthCacheRef) -> Self {
        self.cache = Some(cache);
        self
    }

    #[inline]
    pub fn auth(mut self, auth: AuthClientRef) -> Self {
        self.auth = Some(auth);
        self
    }

    #[inline]
    pub fn events(mut self, events: EventStoreRef) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> Result<ServerContext> {
        let settings = self.settings;
        let bus: PubSubRef = match self.bus {
            Some(bus) => bus,
            None => Arc::new(LocalBus::new(settings.bus.queue_capacity, settings.bus.max_redeliveries)),
        };
        let cache: AuthCacheRef = match (self.cache, settings.cache.kind) {
            (Some(cache), _) => cache,
            (None, CacheKind::Memory) => Arc::new(MemoryCache::new()),
            (None, CacheKind::None) => Arc::new(NoopCache),
            (None, CacheKind::Redis) => return Err(anyhow!("cache kind is redis but no redis cache was provided")),
        };
        let auth: AuthClientRef = match self.auth {
            Some(auth) => auth,
            None => Arc::new(HttpAuthClient::new(&settings.auth.url, settings.auth.timeout)?),
        };
        let events: EventStoreRef = match (self.events, settings.events.kind) {
            (Some(events), _) => events,
            (None, EventsKind::None) => Arc::new(NoopEventStore),
            (None, EventsKind::Bus) => Arc::new(QueuedEventStore::new(
                Arc::new(BusSink::new(publisher(&bus))),
                settings.events.queue_capacity,
                &settings.events.stream,
            )),
            (None, EventsKind::Redis) => return Err(anyhow!("events kind is redis but no redis sink was provided")),
        };

        let authorizer =
            Authorizer::new(cache.clone(), auth.clone(), settings.cache.ttl, settings.cache.negative_ttl);
        let core = Arc::new(SessionHandler::new(authorizer, publisher(&bus), events.clone()));
        let stats_layer = StatsLayer::new();
        let hook_stats = stats_layer.stats();
        let handler = Stack::new().push(LogLayer).push(stats_layer).build(core);

        Ok(ServerContext {
            inner: Arc::new(ServerContextInner {
                settings,
                bus,
                cache,
                auth,
                events,
                hooks: Hooks::new(handler),
                hook_stats,
                sessions: SessionRegistry::new(),
            }),
        })
    }
}
