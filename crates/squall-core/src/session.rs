//! The session collaborator interface.
//!
//! The core opens a session when a request or websocket context is pushed
//! and saves it at finalize. Storage and cookie signing live behind the
//! [`SessionInterface`] trait; the core only depends on the `modified` /
//! `permanent` flags and the null-session marker.

use std::collections::BTreeMap;

use async_trait::async_trait;
use squall_http::{RequestHead, Response};

/// A per-request session: string keys, JSON values, and the flags the
/// finalize step consults.
#[derive(Debug, Clone, Default)]
pub struct Session {
    data: BTreeMap<String, serde_json::Value>,
    modified: bool,
    permanent: bool,
    null: bool,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// The sentinel session used when no storage is configured or the
    /// interface yields nothing. Never saved.
    pub fn null() -> Self {
        Self {
            null: true,
            ..Self::default()
        }
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    /// Insert a value; marks the session modified.
    pub fn insert(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.modified = true;
        self.data.insert(key.into(), value);
    }

    /// Remove a key; marks the session modified when the key existed.
    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        let removed = self.data.remove(key);
        if removed.is_some() {
            self.modified = true;
        }
        removed
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn is_permanent(&self) -> bool {
        self.permanent
    }

    pub fn set_permanent(&mut self, permanent: bool) {
        self.modified = true;
        self.permanent = permanent;
    }

    pub fn is_null(&self) -> bool {
        self.null
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Session storage collaborator.
#[async_trait]
pub trait SessionInterface: Send + Sync {
    /// Open the session for an incoming request or websocket. Returning
    /// `None` makes the core substitute the null session.
    async fn open_session(&self, head: &RequestHead) -> Option<Session>;

    /// Persist the session, attaching whatever the storage needs (e.g.
    /// cookies) to `response`. The response is absent for websockets that
    /// completed without an HTTP-style rejection.
    async fn save_session(&self, session: &Session, response: Option<&mut Response>);

    /// Whether this interface can only persist into a response. When true
    /// and no response exists, a modified session's changes are dropped
    /// with a warning instead of calling [`save_session`](Self::save_session).
    fn needs_response_to_save(&self) -> bool {
        true
    }

    fn is_null_session(&self, session: &Session) -> bool {
        session.is_null()
    }
}

/// Cookie-shaped stand-in used until a real storage backend is
/// configured: opens a fresh session per request and records the save as
/// an unsigned marker cookie. Signing is a storage concern, not ours.
pub struct CookieSessionStub;

#[async_trait]
impl SessionInterface for CookieSessionStub {
    async fn open_session(&self, _head: &RequestHead) -> Option<Session> {
        Some(Session::new())
    }

    async fn save_session(&self, session: &Session, response: Option<&mut Response>) {
        if let Some(response) = response
            && session.is_modified()
        {
            response
                .headers_mut()
                .insert("Set-Cookie", format!("session-entries={}", session.len()));
        }
    }
}
