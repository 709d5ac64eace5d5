use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;

use mqflux_utils::{timestamp_millis, TimestampMillis};

use crate::types::ClientId;

pub type SessionRef = Arc<Mutex<Session>>;

const MAX_AUTHORIZED_TOPICS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum State {
    New,
    Authenticated,
    Connected,
    Disconnected,
}

/// Per-connection state, created on AuthConnect and dropped on Disconnect.
#[derive(Debug, Clone)]
pub struct Session {
    pub client_id: ClientId,
    pub username: String,
    pub password: String,
    pub state: State,
    pub authenticated_at: Option<TimestampMillis>,
    authorized_topics: HashSet<String>,
}

impl Session {
    pub fn new(client_id: &str, username: &str, password: &str) -> Self {
        Self {
            client_id: client_id.to_owned(),
            username: username.to_owned(),
            password: password.to_owned(),
            state: State::New,
            authenticated_at: None,
            authorized_topics: HashSet::new(),
        }
    }

    #[inline]
    pub fn is_authenticated(&self) -> bool {
        self.authenticated_at.is_some() && matches!(self.state, State::Authenticated | State::Connected)
    }

    #[inline]
    pub(crate) fn authenticated(&mut self) {
        self.state = State::Authenticated;
        self.authenticated_at = Some(timestamp_millis());
    }

    /// Records a topic that passed AuthPublish, the set is reset when it grows past its cap.
    pub(crate) fn authorize_topic(&mut self, topic: &str) {
        if self.authorized_topics.len() >= MAX_AUTHORIZED_TOPICS {
            self.authorized_topics.clear();
        }
        self.authorized_topics.insert(topic.to_owned());
    }

    #[inline]
    pub fn is_topic_authorized(&self, topic: &str) -> bool {
        self.authorized_topics.contains(topic)
    }

    pub(crate) fn terminate(&mut self) {
        self.state = State::Disconnected;
        self.authenticated_at = None;
        self.authorized_topics.clear();
    }
}

/// Sessions of one adapter process keyed by client id.
///
/// Each entry has its own lock, hooks for the same client are therefore serial.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<ClientId, SessionRef, ahash::RandomState>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a fresh session, replacing any previous one with the same client id.
    pub fn create(&self, client_id: &str, username: &str, password: &str) -> SessionRef {
        let s = Arc::new(Mutex::new(Session::new(client_id, username, password)));
        if self.sessions.insert(client_id.to_owned(), s.clone()).is_some() {
            log::debug!("{} session replaced", client_id);
        }
        s
    }

    #[inline]
    pub fn get(&self, client_id: &str) -> Option<SessionRef> {
        self.sessions.get(client_id).map(|s| s.value().clone())
    }

    /// Removes the entry only if it still refers to `s`.
    pub fn remove(&self, client_id: &str, s: &SessionRef) -> bool {
        self.sessions.remove_if(client_id, |_, v| Arc::ptr_eq(v, s)).is_some()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
