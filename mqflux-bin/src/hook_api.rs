//! HTTP surface an MQTT broker calls for authentication, ACL checks and web hooks.

use std::net::SocketAddr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use salvo::affix;
use salvo::hyper::server::conn::AddrIncoming;
use salvo::prelude::*;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use mqflux::context::ServerContext;
use mqflux::handler::{ConnackReason, HandlerError, HookResult};
use mqflux::Result;

const ACCESS_SUBSCRIBE: u8 = 1;
const ACCESS_PUBLISH: u8 = 2;

#[derive(Debug, Deserialize)]
pub(crate) struct AuthParams {
    pub clientid: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AclParams {
    pub access: u8,
    pub clientid: String,
    pub topic: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WebhookParams {
    pub action: String,
    pub clientid: String,
    #[serde(default)]
    pub topic: Option<String>,
    ///Base64 encoded
    #[serde(default)]
    pub payload: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Verdict {
    Allow,
    Deny,
    Ok,
    Ignore,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct Reply {
    pub result: Verdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<ConnackReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Reply {
    fn from_hook(r: HookResult, ok: Verdict) -> Self {
        match r {
            Ok(()) => Self { result: ok, reason: None, error: None },
            Err(e) => Self { result: Verdict::Deny, reason: Some(e.connack_reason()), error: Some(e.to_string()) },
        }
    }

    #[inline]
    fn ignore(why: &str) -> Self {
        Self { result: Verdict::Ignore, reason: None, error: Some(why.to_owned()) }
    }
}

/// Creates the session and runs AuthConnect, a refused session is dropped again.
pub(crate) async fn auth(scx: &ServerContext, p: AuthParams) -> Reply {
    let session = scx.sessions.create(&p.clientid, &p.username, &p.password);
    let r = {
        let mut s = session.lock().await;
        scx.hooks.auth_connect(Some(&mut *s)).await
    };
    if r.is_err() {
        scx.sessions.remove(&p.clientid, &session);
    }
    Reply::from_hook(r, Verdict::Allow)
}

pub(crate) async fn acl(scx: &ServerContext, p: AclParams) -> Reply {
    let r = match scx.sessions.get(&p.clientid) {
        None => Err(HandlerError::ClientNotInitialized),
        Some(session) => {
            let mut s = session.lock().await;
            match p.access {
                ACCESS_SUBSCRIBE => {
                    scx.hooks.auth_subscribe(Some(&mut *s), Some(std::slice::from_ref(&p.topic))).await
                }
                ACCESS_PUBLISH => scx.hooks.auth_publish(Some(&mut *s), Some(&p.topic), &[]).await,
                other => return Reply::ignore(&format!("unknown access {}", other)),
            }
        }
    };
    Reply::from_hook(r, Verdict::Allow)
}

pub(crate) async fn webhook(scx: &ServerContext, p: WebhookParams) -> Reply {
    let session = match scx.sessions.get(&p.clientid) {
        Some(s) => s,
        // a refused connect leaves no session behind, its disconnect has nothing to do
        None if p.action == "client_disconnected" => return Reply::from_hook(Ok(()), Verdict::Ok),
        None => return Reply::from_hook(Err(HandlerError::ClientNotInitialized), Verdict::Ok),
    };
    let mut s = session.lock().await;
    let topics = || p.topic.iter().cloned().collect::<Vec<_>>();
    let r = match p.action.as_str() {
        "client_connected" => scx.hooks.connect(Some(&mut *s)).await,
        "client_disconnected" => {
            let r = scx.hooks.disconnect(Some(&mut *s)).await;
            scx.sessions.remove(&p.clientid, &session);
            r
        }
        "message_publish" => {
            let topic = match p.topic.as_deref() {
                Some(t) => t,
                None => return Reply::from_hook(Err(HandlerError::MissingTopic), Verdict::Ok),
            };
            let payload = match p.payload.as_deref().map(|b| STANDARD.decode(b)).transpose() {
                Ok(payload) => Bytes::from(payload.unwrap_or_default()),
                Err(e) => return Reply::ignore(&format!("payload is not base64, {}", e)),
            };
            scx.hooks.publish(Some(&mut *s), topic, payload).await
        }
        "session_subscribed" => scx.hooks.subscribe(Some(&mut *s), &topics()).await,
        "session_unsubscribed" => scx.hooks.unsubscribe(Some(&mut *s), &topics()).await,
        other => return Reply::ignore(&format!("unknown action {}", other)),
    };
    Reply::from_hook(r, Verdict::Ok)
}

fn route(scx: ServerContext) -> Router {
    Router::new()
        .hoop(affix::inject(scx))
        .push(
            Router::with_path("mqtt")
                .push(Router::with_path("auth").post(auth_handler))
                .push(Router::with_path("acl").post(acl_handler))
                .push(Router::with_path("webhook").post(webhook_handler)),
        )
        .push(Router::with_path("stats").get(stats_handler))
}

/// Binding happens before serving so a taken address fails startup.
pub(crate) async fn listen(laddr: SocketAddr) -> Result<AddrIncoming> {
    let listener = tokio::net::TcpListener::bind(laddr).await?;
    let incoming = AddrIncoming::from_listener(listener).map_err(anyhow::Error::new)?;
    log::info!("HTTP hook API listening on {}", laddr);
    Ok(incoming)
}

/// Serves until `token` is cancelled.
pub(crate) async fn serve(incoming: AddrIncoming, scx: ServerContext, token: CancellationToken) -> Result<()> {
    Server::new(TcpListener::bind(incoming))
        .try_serve_with_graceful_shutdown(route(scx), async move {
            token.cancelled().await;
        })
        .await
        .map_err(anyhow::Error::new)?;
    log::info!("HTTP hook API exit");
    Ok(())
}

fn context(depot: &Depot) -> Option<ServerContext> {
    depot.obtain::<ServerContext>().cloned()
}

#[handler]
async fn auth_handler(req: &mut Request, depot: &mut Depot, res: &mut Response) {
    let scx = match context(depot) {
        Some(scx) => scx,
        None => return res.set_status_code(StatusCode::INTERNAL_SERVER_ERROR),
    };
    match req.parse_json::<AuthParams>().await {
        Ok(p) => res.render(Json(auth(&scx, p).await)),
        Err(e) => {
            res.set_status_error(StatusError::bad_request().with_detail(e.to_string()));
        }
    }
}

#[handler]
async fn acl_handler(req: &mut Request, depot: &mut Depot, res: &mut Response) {
    let scx = match context(depot) {
        Some(scx) => scx,
        None => return res.set_status_code(StatusCode::INTERNAL_SERVER_ERROR),
    };
    match req.parse_json::<AclParams>().await {
        Ok(p) => res.render(Json(acl(&scx, p).await)),
        Err(e) => {
            res.set_status_error(StatusError::bad_request().with_detail(e.to_string()));
        }
    }
}

#[handler]
async fn webhook_handler(req: &mut Request, depot: &mut Depot, res: &mut Response) {
    let scx = match context(depot) {
        Some(scx) => scx,
        None => return res.set_status_code(StatusCode::INTERNAL_SERVER_ERROR),
    };
    match req.parse_json::<WebhookParams>().await {
        Ok(p) => res.render(Json(webhook(&scx, p).await)),
        Err(e) => {
            res.set_status_error(StatusError::bad_request().with_detail(e.to_string()));
        }
    }
}

#[handler]
async fn stats_handler(depot: &mut Depot, res: &mut Response) {
    match context(depot) {
        Some(scx) => res.render(Json(scx.stats())),
        None => res.set_status_code(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use mqflux::auth::{AuthClient, AuthError};
    use mqflux::bus::PubSub;
    use mqflux::conf::Settings;
    use mqflux::types::{Connection, DeviceId, EntitiesPage, EntityBasic, UserIdentity};

    use super::*;

    struct OneDevice;

    #[async_trait]
    impl AuthClient for OneDevice {
        async fn identify(&self, secret: &str) -> Result<DeviceId, AuthError> {
            if secret == "s1" {
                Ok("thing-1".into())
            } else {
                Err(AuthError::NotFound)
            }
        }
        async fn authorize(&self, channel: &str, device: &str) -> Result<bool, AuthError> {
            Ok(channel == "ch-1" && device == "thing-1")
        }
        async fn identify_token(&self, _token: &str) -> Result<UserIdentity, AuthError> {
            Err(AuthError::Unauthenticated)
        }
        async fn retrieve_entity(&self, _id: &str) -> Result<EntityBasic, AuthError> {
            Err(AuthError::NotFound)
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

    fn scx() -> ServerContext {
        ServerContext::builder(Settings::from_toml("").unwrap()).auth(Arc::new(OneDevice)).build().unwrap()
    }

    fn auth_params(password: &str) -> AuthParams {
        AuthParams { clientid: "c1".into(), username: "thing-1".into(), password: password.into() }
    }

    #[tokio::test]
    async fn refused_sessions_are_not_kept() {
        let scx = scx();
        let reply = auth(&scx, auth_params("wrong")).await;
        assert_eq!(reply.result, Verdict::Deny);
        assert_eq!(reply.reason, Some(ConnackReason::NotAuthorized));
        assert!(scx.sessions.get("c1").is_none());

        assert_eq!(auth(&scx, auth_params("s1")).await.result, Verdict::Allow);
        assert!(scx.sessions.get("c1").is_some());
    }

    #[tokio::test]
    async fn acl_then_publish_reaches_the_bus() {
        let scx = scx();
        let sub = scx.bus.subscribe("channels.ch-1.messages.>", None).await.unwrap();
        auth(&scx, auth_params("s1")).await;

        let acl_reply =
            acl(&scx, AclParams { access: ACCESS_PUBLISH, clientid: "c1".into(), topic: "channels/ch-1/messages/t".into() })
                .await;
        assert_eq!(acl_reply.result, Verdict::Allow);

        let reply = webhook(
            &scx,
            WebhookParams {
                action: "message_publish".into(),
                clientid: "c1".into(),
                topic: Some("channels/ch-1/messages/t".into()),
                payload: Some(STANDARD.encode(b"22.5")),
            },
        )
        .await;
        assert_eq!(reply.result, Verdict::Ok);
        let d = tokio::time::timeout(std::time::Duration::from_secs(1), sub.next()).await.unwrap().unwrap();
        assert_eq!(d.subject, "channels.ch-1.messages.t");
    }

    #[tokio::test]
    async fn subscribe_acl_and_disconnect() {
        let scx = scx();
        auth(&scx, auth_params("s1")).await;
        let sub = |topic: &str| AclParams { access: ACCESS_SUBSCRIBE, clientid: "c1".into(), topic: topic.into() };
        assert_eq!(acl(&scx, sub("channels/ch-1/messages/#")).await.result, Verdict::Allow);
        assert_eq!(acl(&scx, sub("channels/ch-2/messages")).await.result, Verdict::Deny);

        let bye = WebhookParams { action: "client_disconnected".into(), clientid: "c1".into(), topic: None, payload: None };
        assert_eq!(webhook(&scx, bye).await.result, Verdict::Ok);
        assert!(scx.sessions.is_empty());
    }

    #[tokio::test]
    async fn disconnect_without_session_is_ok() {
        let scx = scx();
        assert_eq!(auth(&scx, auth_params("wrong")).await.result, Verdict::Deny);
        let bye = WebhookParams { action: "client_disconnected".into(), clientid: "c1".into(), topic: None, payload: None };
        let reply = webhook(&scx, bye).await;
        assert_eq!(reply.result, Verdict::Ok);
        assert_eq!(reply.error, None);

        let connected = WebhookParams { action: "client_connected".into(), clientid: "c1".into(), topic: None, payload: None };
        assert_eq!(webhook(&scx, connected).await.result, Verdict::Deny);
    }

    #[test]
    fn reply_shape() {
        let allow = serde_json::to_value(Reply::from_hook(Ok(()), Verdict::Allow)).unwrap();
        assert_eq!(allow, serde_json::json!({"result": "allow"}));
        let deny = serde_json::to_value(Reply::from_hook(Err(HandlerError::Unavailable("down".into())), Verdict::Allow))
            .unwrap();
        assert_eq!(deny["result"], "deny");
        assert_eq!(deny["reason"], "ServerUnavailable");
    }
}
