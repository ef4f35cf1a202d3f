//! In-memory auth provider for the terminal harness and tests.

use std::sync::Mutex;

use async_trait::async_trait;
use tracing::info;

use crate::error::{Result, SyncError};
use crate::model::{now_ms, Session};
use crate::transport::AuthProvider;

/// Holds one session. `refresh_session` bumps its activity timestamp;
/// after `logout` there is nothing left to refresh.
#[derive(Debug)]
pub struct StaticAuth {
    session: Mutex<Option<Session>>,
}

impl StaticAuth {
    pub fn new(session: Session) -> Self {
        Self { session: Mutex::new(Some(session)) }
    }

    /// Build a session for `user_id` with a fresh random session id.
    pub fn for_user(user_id: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self::new(Session {
            user_id: user_id.into(),
            auth_token: auth_token.into(),
            session_id: uuid::Uuid::new_v4().to_string(),
            last_activity_at: now_ms(),
        })
    }

    pub fn is_logged_in(&self) -> bool {
        self.session.lock().map(|s| s.is_some()).unwrap_or(false)
    }
}

#[async_trait]
impl AuthProvider for StaticAuth {
    async fn current_session(&self) -> Option<Session> {
        self.session.lock().ok().and_then(|s| s.clone())
    }

    async fn refresh_session(&self) -> Result<Session> {
        let mut guard = self
            .session
            .lock()
            .map_err(|_| SyncError::Auth("session store poisoned".into()))?;
        let session = guard.as_mut().ok_or_else(|| SyncError::Auth("logged out".into()))?;
        session.last_activity_at = now_ms();
        Ok(session.clone())
    }

    async fn logout(&self) {
        if let Ok(mut s) = self.session.lock() {
            if let Some(old) = s.take() {
                info!(target: "roomsync::auth", user = %old.user_id, "logged out");
            }
        }
    }
}
