//! Per-connection session state.
//!
//! A [`Session`] exists for every live connection and records who is logged
//! in on it and which stream, if any, currently owns its outbound half. The
//! registry also guarantees an account is logged in on at most one
//! connection at a time.

use std::collections::HashMap;
use std::fmt;

use crate::stream::{StreamHandle, StreamId};

/// Identity of one client connection, unique for the server's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Session rule violations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("You are already logged in as user {0}")]
    AlreadyLoggedIn(String),

    #[error("User {0} is already logged in from another session")]
    AccountInUse(String),

    #[error("No user is logged in. Cannot log out")]
    NotLoggedIn,

    #[error("A song is already playing. Stop it before playing another one")]
    AlreadyStreaming,

    #[error("There is currently no song playing. Nothing to stop")]
    NotStreaming,
}

/// State of one connection.
#[derive(Debug, Default)]
pub struct Session {
    user: Option<String>,
    stream: Option<StreamHandle>,
}

impl Session {
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn stream_id(&self) -> Option<StreamId> {
        self.stream.as_ref().map(StreamHandle::id)
    }
}

/// All live sessions.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<ConnId, Session>,
    /// email → connection holding that login
    logins: HashMap<String, ConnId>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the session for `conn` if it doesn't exist yet.
    pub fn bind(&mut self, conn: ConnId) -> &mut Session {
        self.sessions.entry(conn).or_default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn login(&mut self, conn: ConnId, email: &str) -> Result<(), SessionError> {
        if let Some(current) = self.username_of(conn) {
            return Err(SessionError::AlreadyLoggedIn(current.to_string()));
        }
        if self.logins.get(email).is_some_and(|holder| *holder != conn) {
            return Err(SessionError::AccountInUse(email.to_string()));
        }
        self.bind(conn).user = Some(email.to_string());
        self.logins.insert(email.to_string(), conn);
        tracing::debug!(target: "session", conn = %conn, user = %email, "Logged in");
        Ok(())
    }

    /// Forget the login on `conn`, returning the email it held.
    pub fn logout(&mut self, conn: ConnId) -> Result<String, SessionError> {
        let email = self
            .sessions
            .get_mut(&conn)
            .and_then(|s| s.user.take())
            .ok_or(SessionError::NotLoggedIn)?;
        self.logins.remove(&email);
        tracing::debug!(target: "session", conn = %conn, user = %email, "Logged out");
        Ok(email)
    }

    pub fn is_logged_in(&self, conn: ConnId) -> bool {
        self.username_of(conn).is_some()
    }

    pub fn username_of(&self, conn: ConnId) -> Option<&str> {
        self.sessions.get(&conn).and_then(Session::user)
    }

    pub fn is_streaming(&self, conn: ConnId) -> bool {
        self.stream_id(conn).is_some()
    }

    pub fn stream_id(&self, conn: ConnId) -> Option<StreamId> {
        self.sessions.get(&conn).and_then(Session::stream_id)
    }

    /// Record `handle` as the stream of `conn`.
    ///
    /// On [`SessionError::AlreadyStreaming`] the handle is given back so the
    /// caller can shut it down.
    pub fn attach_stream(
        &mut self,
        conn: ConnId,
        handle: StreamHandle,
    ) -> Result<(), (SessionError, StreamHandle)> {
        let session = self.bind(conn);
        if session.stream.is_some() {
            return Err((SessionError::AlreadyStreaming, handle));
        }
        tracing::debug!(target: "session", conn = %conn, stream = %handle.id(), "Stream attached");
        session.stream = Some(handle);
        Ok(())
    }

    /// Take the stream of `conn` out of the registry.
    pub fn detach_stream(&mut self, conn: ConnId) -> Result<StreamHandle, SessionError> {
        self.sessions
            .get_mut(&conn)
            .and_then(|s| s.stream.take())
            .ok_or(SessionError::NotStreaming)
    }

    /// Detach only if the active stream is `id`.
    pub fn detach_stream_if(&mut self, conn: ConnId, id: StreamId) -> Option<StreamHandle> {
        let session = self.sessions.get_mut(&conn)?;
        if session.stream_id() != Some(id) {
            return None;
        }
        session.stream.take()
    }

    /// Drop the session of `conn`, releasing its login. Any stream handle is
    /// returned so the caller can stop it.
    pub fn remove(&mut self, conn: ConnId) -> Option<StreamHandle> {
        let session = self.sessions.remove(&conn)?;
        if let Some(email) = &session.user {
            self.logins.remove(email);
        }
        session.stream
    }

    /// Detach every stream, for shutdown.
    pub fn drain_streams(&mut self) -> Vec<(ConnId, StreamHandle)> {
        self.sessions
            .iter_mut()
            .filter_map(|(conn, s)| s.stream.take().map(|h| (*conn, h)))
            .collect()
    }
}
