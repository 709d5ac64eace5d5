use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use mqflux::cache::AuthCache;
use mqflux::types::DeviceId;
use mqflux::Result;

const ALLOW: &str = "1";
const DENY: &str = "0";

/// Key layout under one prefix.
///
/// Entries expire through redis TTLs. The reverse-index sets let a device or
/// channel be evicted without scanning.
#[derive(Debug, Clone)]
pub(crate) struct Keys {
    prefix: String,
}

impl Keys {
    pub(crate) fn new(prefix: &str) -> Self {
        Self { prefix: prefix.trim_end_matches(':').to_owned() }
    }

    #[inline]
    pub(crate) fn identity(&self, secret: &str) -> String {
        format!("{}:identity:{}", self.prefix, secret)
    }

    #[inline]
    pub(crate) fn authz(&self, channel: &str, device: &str) -> String {
        format!("{}:authz:{}:{}", self.prefix, channel, device)
    }

    ///Secrets that resolve to `device`
    #[inline]
    pub(crate) fn device_secrets(&self, device: &str) -> String {
        format!("{}:device-secrets:{}", self.prefix, device)
    }

    ///Channels with a cached decision for `device`
    #[inline]
    pub(crate) fn device_channels(&self, device: &str) -> String {
        format!("{}:device-channels:{}", self.prefix, device)
    }

    ///Devices with a cached decision on `channel`
    #[inline]
    pub(crate) fn channel_devices(&self, channel: &str) -> String {
        format!("{}:channel-devices:{}", self.prefix, channel)
    }
}

#[inline]
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Gives an index set a TTL of `ms` when it has none, or raises the one it has.
///
/// Index sets are shared by entries with different TTLs and must outlive all of
/// them, so a short-lived entry never shortens the index. Needs redis 7.
fn extend_index_ttl(pipe: &mut redis::Pipeline, index: &str, ms: u64) {
    pipe.add_command(redis::cmd("PEXPIRE").arg(index).arg(ms).arg("NX").to_owned()).ignore();
    pipe.add_command(redis::cmd("PEXPIRE").arg(index).arg(ms).arg("GT").to_owned()).ignore();
}

fn identity_pipeline(keys: &Keys, secret: &str, device: &str, ttl: Duration) -> redis::Pipeline {
    let ms = ttl_millis(ttl);
    let index = keys.device_secrets(device);
    let mut pipe = redis::pipe();
    pipe.atomic().pset_ex(keys.identity(secret), device, ms).ignore().sadd(&index, secret).ignore();
    extend_index_ttl(&mut pipe, &index, ms);
    pipe
}

fn authz_pipeline(keys: &Keys, channel: &str, device: &str, allow: bool, ttl: Duration) -> redis::Pipeline {
    let ms = ttl_millis(ttl);
    let by_device = keys.device_channels(device);
    let by_channel = keys.channel_devices(channel);
    let mut pipe = redis::pipe();
    pipe.atomic()
        .pset_ex(keys.authz(channel, device), if allow { ALLOW } else { DENY }, ms)
        .ignore()
        .sadd(&by_device, channel)
        .ignore()
        .sadd(&by_channel, device)
        .ignore();
    extend_index_ttl(&mut pipe, &by_device, ms);
    extend_index_ttl(&mut pipe, &by_channel, ms);
    pipe
}

pub struct RedisCache {
    conn: ConnectionManager,
    keys: Keys,
}

impl RedisCache {
    pub fn new(conn: ConnectionManager, prefix: &str) -> Self {
        Self { conn, keys: Keys::new(prefix) }
    }
}

#[async_trait]
impl AuthCache for RedisCache {
    async fn get_identity(&self, secret: &str) -> Result<Option<DeviceId>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(self.keys.identity(secret)).await?)
    }

    async fn put_identity(&self, secret: &str, device: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = identity_pipeline(&self.keys, secret, device, ttl).query_async(&mut conn).await?;
        Ok(())
    }

    async fn get_authz(&self, channel: &str, device: &str) -> Result<Option<bool>> {
        let mut conn = self.conn.clone();
        let v: Option<String> = conn.get(self.keys.authz(channel, device)).await?;
        Ok(v.map(|v| v == ALLOW))
    }

    async fn put_authz(&self, channel: &str, device: &str, allow: bool, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = authz_pipeline(&self.keys, channel, device, allow, ttl).query_async(&mut conn).await?;
        Ok(())
    }

    async fn evict_identity(&self, secret: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = self.keys.identity(secret);
        let device: Option<String> = conn.get(&key).await?;
        let mut pipe = redis::pipe();
        pipe.atomic().del(&key).ignore();
        if let Some(device) = device {
            pipe.srem(self.keys.device_secrets(&device), secret).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn evict_device_identities(&self, device: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let index = self.keys.device_secrets(device);
        let secrets: Vec<String> = conn.smembers(&index).await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        for secret in &secrets {
            pipe.del(self.keys.identity(secret)).ignore();
        }
        pipe.del(&index).ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        log::debug!("evicted {} identities of {}", secrets.len(), device);
        Ok(())
    }

    async fn evict_device_authorizations(&self, device: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let index = self.keys.device_channels(device);
        let channels: Vec<String> = conn.smembers(&index).await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        for channel in &channels {
            pipe.del(self.keys.authz(channel, device)).ignore();
            pipe.srem(self.keys.channel_devices(channel), device).ignore();
        }
        pipe.del(&index).ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn evict_channel_authorizations(&self, channel: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let index = self.keys.channel_devices(channel);
        let devices: Vec<String> = conn.smembers(&index).await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        for device in &devices {
            pipe.del(self.keys.authz(channel, device)).ignore();
            pipe.srem(self.keys.device_channels(device), channel).ignore();
        }
        pipe.del(&index).ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn evict_authz(&self, channel: &str, device: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .del(self.keys.authz(channel, device))
            .ignore()
            .srem(self.keys.device_channels(device), channel)
            .ignore()
            .srem(self.keys.channel_devices(channel), device)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}
