//! Control-plane RPC and the cache-backed authorizer in front of it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoffBuilder};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::cache::AuthCacheRef;
use crate::types::{Connection, DeviceId, EntitiesPage, EntityBasic, UserIdentity};

pub type AuthClientRef = Arc<dyn AuthClient>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("entity not found")]
    NotFound,
    #[error("authentication failed")]
    Unauthenticated,
    #[error("control plane unavailable, {0}")]
    Unavailable(String),
    #[error("invalid control plane response, {0}")]
    InvalidResponse(String),
}

impl AuthError {
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, AuthError::Unavailable(_))
    }
}

/// RPC surface of the authoritative control plane.
///
/// Every call carries its own deadline, an elapsed deadline is [`AuthError::Unavailable`].
#[async_trait]
pub trait AuthClient: Sync + Send {
    ///Device secret to device id
    async fn identify(&self, secret: &str) -> Result<DeviceId, AuthError>;

    ///Whether `device` may use `channel`, unknown pairs are `NotFound`
    async fn authorize(&self, channel: &str, device: &str) -> Result<bool, AuthError>;

    ///User token to user and domain
    async fn identify_token(&self, token: &str) -> Result<UserIdentity, AuthError>;

    async fn retrieve_entity(&self, id: &str) -> Result<EntityBasic, AuthError>;

    async fn retrieve_entities(&self, ids: &[String]) -> Result<EntitiesPage, AuthError>;

    async fn add_connections(&self, conns: &[Connection]) -> Result<(), AuthError>;

    async fn remove_connections(&self, conns: &[Connection]) -> Result<(), AuthError>;

    async fn remove_channel_connections(&self, channel: &str) -> Result<(), AuthError>;

    async fn unset_parent_group_from_things(&self, group: &str) -> Result<(), AuthError>;

    async fn unset_parent_group_from_client(&self, group: &str) -> Result<(), AuthError>;

    ///Health check used at startup
    async fn ping(&self) -> Result<(), AuthError> {
        Ok(())
    }
}

#[derive(Serialize)]
struct SecretReq<'a> {
    secret: &'a str,
}

#[derive(Serialize)]
struct TokenReq<'a> {
    token: &'a str,
}

#[derive(Serialize)]
struct AuthzReq<'a> {
    channel_id: &'a str,
    thing_id: &'a str,
}

#[derive(Serialize)]
struct IdsReq<'a> {
    ids: &'a [String],
}

#[derive(Serialize)]
struct ConnectionsReq<'a> {
    connections: &'a [Connection],
}

#[derive(Deserialize)]
struct IdResp {
    id: String,
}

#[derive(Deserialize)]
struct AuthzResp {
    authorized: bool,
}

/// JSON-over-HTTP control-plane client.
#[derive(Clone)]
pub struct HttpAuthClient {
    base: Url,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpAuthClient {
    pub fn new(base: &str, timeout: Duration) -> crate::Result<Self> {
        let mut base = Url::parse(base)?;
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        let client = reqwest::Client::builder().connect_timeout(timeout).timeout(timeout).build()?;
        Ok(Self { base, timeout, client })
    }

    #[inline]
    fn url(&self, path: &str) -> Result<Url, AuthError> {
        self.base.join(path).map_err(|e| AuthError::InvalidResponse(e.to_string()))
    }

    async fn send<B>(&self, method: Method, path: &str, body: Option<&B>) -> Result<reqwest::Response, AuthError>
    where
        B: Serialize + ?Sized + Sync,
    {
        let url = self.url(path)?;
        log::debug!("auth request, method: {:?}, timeout: {:?}, url: {}", method, self.timeout, url);
        let mut req = self.client.request(method, url).timeout(self.timeout);
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req.send().await.map_err(|e| AuthError::Unavailable(e.to_string()))?;
        match resp.status() {
            s if s.is_success() => Ok(resp),
            StatusCode::NOT_FOUND => Err(AuthError::NotFound),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(AuthError::Unauthenticated),
            s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
                Err(AuthError::Unavailable(format!("status {}", s)))
            }
            s => Err(AuthError::InvalidResponse(format!("status {}", s))),
        }
    }

    async fn call<B, R>(&self, method: Method, path: &str, body: Option<&B>) -> Result<R, AuthError>
    where
        B: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        let resp = self.send(method, path, body).await?;
        resp.json::<R>().await.map_err(|e| AuthError::InvalidResponse(e.to_string()))
    }

    async fn call_unit<B>(&self, method: Method, path: &str, body: Option<&B>) -> Result<(), AuthError>
    where
        B: Serialize + ?Sized + Sync,
    {
        self.send(method, path, body).await.map(|_| ())
    }
}

#[async_trait]
impl AuthClient for HttpAuthClient {
    async fn identify(&self, secret: &str) -> Result<DeviceId, AuthError> {
        let resp: IdResp = self.call(Method::POST, "authn/things", Some(&SecretReq { secret })).await?;
        Ok(resp.id)
    }

    async fn authorize(&self, channel: &str, device: &str) -> Result<bool, AuthError> {
        let req = AuthzReq { channel_id: channel, thing_id: device };
        let resp: AuthzResp = self.call(Method::POST, "authz/things", Some(&req)).await?;
        Ok(resp.authorized)
    }

    async fn identify_token(&self, token: &str) -> Result<UserIdentity, AuthError> {
        self.call(Method::POST, "authn/users", Some(&TokenReq { token })).await
    }

    async fn retrieve_entity(&self, id: &str) -> Result<EntityBasic, AuthError> {
        self.call::<(), _>(Method::GET, &format!("entities/{}", id), None).await
    }

    async fn retrieve_entities(&self, ids: &[String]) -> Result<EntitiesPage, AuthError> {
        self.call(Method::POST, "entities/search", Some(&IdsReq { ids })).await
    }

    async fn add_connections(&self, conns: &[Connection]) -> Result<(), AuthError> {
        self.call_unit(Method::POST, "connections", Some(&ConnectionsReq { connections: conns })).await
    }

    async fn remove_connections(&self, conns: &[Connection]) -> Result<(), AuthError> {
        self.call_unit(Method::POST, "connections/remove", Some(&ConnectionsReq { connections: conns })).await
    }

    async fn remove_channel_connections(&self, channel: &str) -> Result<(), AuthError> {
        self.call_unit::<()>(Method::DELETE, &format!("channels/{}/connections", channel), None).await
    }

    async fn unset_parent_group_from_things(&self, group: &str) -> Result<(), AuthError> {
        self.call_unit::<()>(Method::DELETE, &format!("groups/{}/things/parent", group), None).await
    }

    async fn unset_parent_group_from_client(&self, group: &str) -> Result<(), AuthError> {
        self.call_unit::<()>(Method::DELETE, &format!("groups/{}/clients/parent", group), None).await
    }

    async fn ping(&self) -> Result<(), AuthError> {
        self.call_unit::<()>(Method::GET, "health", None).await
    }
}

/// Retries [`AuthClient::ping`] with exponential backoff until it succeeds or `max_elapsed` passes.
pub async fn wait_ready(client: &dyn AuthClient, max_elapsed: Duration) -> Result<(), AuthError> {
    let strategy = ExponentialBackoffBuilder::new()
        .with_max_elapsed_time(Some(max_elapsed))
        .with_multiplier(2.0)
        .build();
    retry(strategy, || async {
        client.ping().await.map_err(|e| {
            if e.is_transient() {
                log::warn!("control plane not ready, {}", e);
                backoff::Error::transient(e)
            } else {
                backoff::Error::permanent(e)
            }
        })
    })
    .await
}

/// Cache-backed identify and authorize.
///
/// Negative answers are cached for the shorter TTL, transport failures are never cached.
#[derive(Clone)]
pub struct Authorizer {
    cache: AuthCacheRef,
    client: AuthClientRef,
    ttl: Duration,
    negative_ttl: Duration,
}

impl Authorizer {
    pub fn new(cache: AuthCacheRef, client: AuthClientRef, ttl: Duration, negative_ttl: Duration) -> Self {
        Self { cache, client, ttl, negative_ttl: negative_ttl.min(ttl) }
    }

    #[inline]
    pub fn client(&self) -> &AuthClientRef {
        &self.client
    }

    #[inline]
    pub fn cache(&self) -> &AuthCacheRef {
        &self.cache
    }

    pub async fn identify(&self, secret: &str) -> Result<DeviceId, AuthError> {
        match self.cache.get_identity(secret).await {
            Ok(Some(id)) => return Ok(id),
            Ok(None) => {}
            Err(e) => log::warn!("identity cache read failed, {:?}", e),
        }
        let id = self.client.identify(secret).await?;
        if let Err(e) = self.cache.put_identity(secret, &id, self.ttl).await {
            log::warn!("identity cache write failed, {:?}", e);
        }
        Ok(id)
    }

    /// `Ok(false)` for denied or unknown pairs.
    pub async fn authorize(&self, channel: &str, device: &str) -> Result<bool, AuthError> {
        match self.cache.get_authz(channel, device).await {
            Ok(Some(allow)) => return Ok(allow),
            Ok(None) => {}
            Err(e) => log::warn!("authz cache read failed, {:?}", e),
        }
        let allow = match self.client.authorize(channel, device).await {
            Ok(allow) => allow,
            Err(AuthError::NotFound) => false,
            Err(e) => return Err(e),
        };
        let ttl = if allow { self.ttl } else { self.negative_ttl };
        if let Err(e) = self.cache.put_authz(channel, device, allow, ttl).await {
            log::warn!("authz cache write failed, {:?}", e);
        }
        Ok(allow)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::RwLock;

    use super::*;
    use crate::cache::MemoryCache;

    /// Scripted control plane.
    #[derive(Default)]
    pub(crate) struct StaticAuth {
        pub secrets: RwLock<HashMap<String, String>>,
        pub allowed: RwLock<HashSet<(String, String)>>,
        pub denied: RwLock<HashSet<(String, String)>>,
        pub metadata: RwLock<HashMap<String, serde_json::Value>>,
        pub down: std::sync::atomic::AtomicBool,
        pub calls: AtomicUsize,
        pub entity_calls: AtomicUsize,
    }

    impl StaticAuth {
        pub(crate) fn with(secret: &str, device: &str, channel: &str) -> Self {
            let a = Self::default();
            a.secrets.write().insert(secret.into(), device.into());
            a.allowed.write().insert((channel.into(), device.into()));
            a
        }

        pub(crate) fn set_metadata(&self, id: &str, metadata: serde_json::Value) {
            self.metadata.write().insert(id.into(), metadata);
        }

        pub(crate) fn entity_calls(&self) -> usize {
            self.entity_calls.load(Ordering::SeqCst)
        }

        fn check(&self) -> Result<(), AuthError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.down.load(Ordering::SeqCst) {
                Err(AuthError::Unavailable("down".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl AuthClient for StaticAuth {
        async fn identify(&self, secret: &str) -> Result<DeviceId, AuthError> {
            self.check()?;
            self.secrets.read().get(secret).cloned().ok_or(AuthError::NotFound)
        }

        async fn authorize(&self, channel: &str, device: &str) -> Result<bool, AuthError> {
            self.check()?;
            let key = (channel.to_owned(), device.to_owned());
            if self.allowed.read().contains(&key) {
                Ok(true)
            } else if self.denied.read().contains(&key) {
                Ok(false)
            } else {
                Err(AuthError::NotFound)
            }
        }

        async fn identify_token(&self, _token: &str) -> Result<UserIdentity, AuthError> {
            Err(AuthError::NotFound)
        }

        async fn retrieve_entity(&self, id: &str) -> Result<EntityBasic, AuthError> {
            self.check()?;
            self.entity_calls.fetch_add(1, Ordering::SeqCst);
            let metadata = match self.metadata.read().get(id) {
                Some(serde_json::Value::Object(m)) => m.clone(),
                _ => serde_json::Map::new(),
            };
            Ok(EntityBasic { id: id.into(), domain_id: "domain-1".into(), metadata, ..Default::default() })
        }

        async fn retrieve_entities(&self, _ids: &[String]) -> Result<EntitiesPage, AuthError> {
            Ok(EntitiesPage::default())
        }

        async fn add_connections(&self, _conns: &[Connection]) -> Result<(), AuthError> {
            Ok(())
        }

        async fn remove_connections(&self, _conns: &[Connection]) -> Result<(), AuthError> {
            Ok(())
        }

        async fn remove_channel_connections(&self, _channel: &str) -> Result<(), AuthError> {
            Ok(())
        }

        async fn unset_parent_group_from_things(&self, _group: &str) -> Result<(), AuthError> {
            Ok(())
        }

        async fn unset_parent_group_from_client(&self, _group: &str) -> Result<(), AuthError> {
            Ok(())
        }
    }

    fn authorizer(client: Arc<StaticAuth>) -> Authorizer {
        Authorizer::new(Arc::new(MemoryCache::new()), client, Duration::from_secs(600), Duration::from_secs(30))
    }

    #[tokio::test]
    async fn identify_hits_cache_second_time() {
        let client = Arc::new(StaticAuth::with("s1", "thing-1", "ch-1"));
        let a = authorizer(client.clone());
        assert_eq!(a.identify("s1").await.unwrap(), "thing-1");
        assert_eq!(a.identify("s1").await.unwrap(), "thing-1");
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.identify("nope").await, Err(AuthError::NotFound));
    }

    #[tokio::test(start_paused = true)]
    async fn denials_use_the_negative_ttl() {
        let client = Arc::new(StaticAuth::with("s1", "thing-1", "ch-1"));
        let a = authorizer(client.clone());

        assert!(!a.authorize("ch-2", "thing-1").await.unwrap());
        client.allowed.write().insert(("ch-2".into(), "thing-1".into()));
        assert!(!a.authorize("ch-2", "thing-1").await.unwrap());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(a.authorize("ch-2", "thing-1").await.unwrap());
    }

    #[tokio::test]
    async fn unavailable_is_not_cached() {
        let client = Arc::new(StaticAuth::with("s1", "thing-1", "ch-1"));
        let a = authorizer(client.clone());
        client.down.store(true, Ordering::SeqCst);
        assert!(matches!(a.authorize("ch-1", "thing-1").await, Err(AuthError::Unavailable(_))));
        client.down.store(false, Ordering::SeqCst);
        assert!(a.authorize("ch-1", "thing-1").await.unwrap());
    }

    #[test]
    fn base_url_gets_trailing_slash() {
        let c = HttpAuthClient::new("http://127.0.0.1:9000/api", Duration::from_secs(1)).unwrap();
        assert_eq!(c.url("authn/things").unwrap().as_str(), "http://127.0.0.1:9000/api/authn/things");
    }
}
