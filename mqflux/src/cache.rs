use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use crate::types::{ChannelId, DeviceId};
use crate::Result;

pub type AuthCacheRef = Arc<dyn AuthCache>;

/// Short-lived mapping of device secrets and channel authorizations.
///
/// A miss is never an error, callers fall through to the control plane.
/// Implementations must never return an expired entry.
#[async_trait]
pub trait AuthCache: Sync + Send {
    async fn get_identity(&self, secret: &str) -> Result<Option<DeviceId>>;

    async fn put_identity(&self, secret: &str, device: &str, ttl: Duration) -> Result<()>;

    ///Three-valued: `Some(true)` allow, `Some(false)` deny, `None` not cached
    async fn get_authz(&self, channel: &str, device: &str) -> Result<Option<bool>>;

    async fn put_authz(&self, channel: &str, device: &str, allow: bool, ttl: Duration) -> Result<()>;

    async fn evict_identity(&self, secret: &str) -> Result<()>;

    ///Removes every identity that maps to `device`
    async fn evict_device_identities(&self, device: &str) -> Result<()>;

    async fn evict_device_authorizations(&self, device: &str) -> Result<()>;

    async fn evict_channel_authorizations(&self, channel: &str) -> Result<()>;

    async fn evict_authz(&self, channel: &str, device: &str) -> Result<()>;

    async fn evict_device(&self, device: &str) -> Result<()> {
        self.evict_device_identities(device).await?;
        self.evict_device_authorizations(device).await
    }
}

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    expires_at: Instant,
}

impl<V: Clone> Entry<V> {
    #[inline]
    fn new(value: V, ttl: Duration) -> Self {
        Self { value, expires_at: Instant::now() + ttl }
    }

    #[inline]
    fn live(&self) -> Option<V> {
        if Instant::now() < self.expires_at {
            Some(self.value.clone())
        } else {
            None
        }
    }
}

/// In-process cache, reads take a shard read lock only.
#[derive(Default)]
pub struct MemoryCache {
    identities: DashMap<String, Entry<DeviceId>, ahash::RandomState>,
    authzs: DashMap<(ChannelId, DeviceId), Entry<bool>, ahash::RandomState>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops expired entries, the lookups ignore them regardless.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.identities.retain(|_, e| e.expires_at > now);
        self.authzs.retain(|_, e| e.expires_at > now);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.identities.len() + self.authzs.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AuthCache for MemoryCache {
    async fn get_identity(&self, secret: &str) -> Result<Option<DeviceId>> {
        Ok(self.identities.get(secret).and_then(|e| e.live()))
    }

    async fn put_identity(&self, secret: &str, device: &str, ttl: Duration) -> Result<()> {
        self.identities.insert(secret.to_owned(), Entry::new(device.to_owned(), ttl));
        Ok(())
    }

    async fn get_authz(&self, channel: &str, device: &str) -> Result<Option<bool>> {
        Ok(self.authzs.get(&(channel.to_owned(), device.to_owned())).and_then(|e| e.live()))
    }

    async fn put_authz(&self, channel: &str, device: &str, allow: bool, ttl: Duration) -> Result<()> {
        self.authzs.insert((channel.to_owned(), device.to_owned()), Entry::new(allow, ttl));
        Ok(())
    }

    async fn evict_identity(&self, secret: &str) -> Result<()> {
        self.identities.remove(secret);
        Ok(())
    }

    async fn evict_device_identities(&self, device: &str) -> Result<()> {
        self.identities.retain(|_, e| e.value != device);
        Ok(())
    }

    async fn evict_device_authorizations(&self, device: &str) -> Result<()> {
        self.authzs.retain(|(_, d), _| d != device);
        Ok(())
    }

    async fn evict_channel_authorizations(&self, channel: &str) -> Result<()> {
        self.authzs.retain(|(c, _), _| c != channel);
        Ok(())
    }

    async fn evict_authz(&self, channel: &str, device: &str) -> Result<()> {
        self.authzs.remove(&(channel.to_owned(), device.to_owned()));
        Ok(())
    }
}

/// Always misses, used when caching is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCache;

#[async_trait]
impl AuthCache for NoopCache {
    async fn get_identity(&self, _secret: &str) -> Result<Option<DeviceId>> {
        Ok(None)
    }

    async fn put_identity(&self, _secret: &str, _device: &str, _ttl: Duration) -> Result<()> {
        Ok(())
    }

    async fn get_authz(&self, _channel: &str, _device: &str) -> Result<Option<bool>> {
        Ok(None)
    }

    async fn put_authz(&self, _channel: &str, _device: &str, _allow: bool, _ttl: Duration) -> Result<()> {
        Ok(())
    }

    async fn evict_identity(&self, _secret: &str) -> Result<()> {
        Ok(())
    }

    async fn evict_device_identities(&self, _device: &str) -> Result<()> {
        Ok(())
    }

    async fn evict_device_authorizations(&self, _device: &str) -> Result<()> {
        Ok(())
    }

    async fn evict_channel_authorizations(&self, _channel: &str) -> Result<()> {
        Ok(())
    }

    async fn evict_authz(&self, _channel: &str, _device: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn authz_entries_expire_after_ttl() {
        let cache = MemoryCache::new();
        let ttl = Duration::from_secs(10);
        cache.put_authz("ch-1", "thing-1", true, ttl).await.unwrap();

        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(cache.get_authz("ch-1", "thing-1").await.unwrap(), Some(true));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get_authz("ch-1", "thing-1").await.unwrap(), None);

        cache.put_authz("ch-1", "thing-1", false, ttl).await.unwrap();
        assert_eq!(cache.get_authz("ch-1", "thing-1").await.unwrap(), Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn purge_removes_only_expired() {
        let cache = MemoryCache::new();
        cache.put_identity("s1", "thing-1", Duration::from_secs(1)).await.unwrap();
        cache.put_identity("s2", "thing-2", Duration::from_secs(60)).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        cache.purge_expired();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get_identity("s2").await.unwrap().as_deref(), Some("thing-2"));
    }

    #[tokio::test]
    async fn evictions() {
        let cache = MemoryCache::new();
        let ttl = Duration::from_secs(60);
        cache.put_identity("s1", "thing-1", ttl).await.unwrap();
        cache.put_identity("s2", "thing-2", ttl).await.unwrap();
        cache.put_authz("ch-1", "thing-1", true, ttl).await.unwrap();
        cache.put_authz("ch-2", "thing-1", true, ttl).await.unwrap();
        cache.put_authz("ch-1", "thing-2", true, ttl).await.unwrap();

        cache.evict_device("thing-1").await.unwrap();
        assert_eq!(cache.get_identity("s1").await.unwrap(), None);
        assert_eq!(cache.get_authz("ch-1", "thing-1").await.unwrap(), None);
        assert_eq!(cache.get_authz("ch-2", "thing-1").await.unwrap(), None);
        assert_eq!(cache.get_authz("ch-1", "thing-2").await.unwrap(), Some(true));

        cache.evict_channel_authorizations("ch-1").await.unwrap();
        assert_eq!(cache.get_authz("ch-1", "thing-2").await.unwrap(), None);
        assert_eq!(cache.get_identity("s2").await.unwrap().as_deref(), Some("thing-2"));

        cache.evict_identity("s2").await.unwrap();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn noop_always_misses() {
        let cache = NoopCache;
        cache.put_identity("s1", "thing-1", Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get_identity("s1").await.unwrap(), None);
        assert_eq!(cache.get_authz("ch", "thing-1").await.unwrap(), None);
    }
}
