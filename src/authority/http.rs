//! HTTP session authority adapter.
//!
//! Talks to a session REST surface:
//! - `GET  /api/auth/me`                 200 → session, 401/403 → signed out
//! - `GET  /api/users/{id}/profile`      200 → profile, 404 → none
//! - `POST /api/auth/logout?scope=...`   invalidate the session
//!
//! HTTP has no push channel, so `spawn_poller` diffs successive session reads
//! and turns the differences into change events.

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::{AuthorityError, Session, SessionAuthority, SessionEvent, SessionEventKind, SignOutScope};
use crate::config::{DEFAULT_AUTHORITY_TIMEOUT_MS, DEFAULT_EVENT_BUFFER, env_duration_ms};
use crate::state::Profile;

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 3000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpAuthorityConfig {
    pub base_url: String,
    pub poll_interval: Duration,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl HttpAuthorityConfig {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            request_timeout: Duration::from_millis(DEFAULT_AUTHORITY_TIMEOUT_MS),
        }
    }

    /// Build from environment variables; `None` when `AUTH_AUTHORITY_URL` is unset.
    ///
    /// Optional:
    /// - `AUTH_POLL_INTERVAL_MS`: default 30000
    /// - `AUTH_CONNECT_TIMEOUT_MS`: default 3000
    /// - `AUTH_AUTHORITY_TIMEOUT_MS`: default 8000
    #[must_use]
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("AUTH_AUTHORITY_URL").ok()?;
        Some(Self {
            poll_interval: env_duration_ms("AUTH_POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS),
            connect_timeout: env_duration_ms("AUTH_CONNECT_TIMEOUT_MS", DEFAULT_CONNECT_TIMEOUT_MS),
            request_timeout: env_duration_ms("AUTH_AUTHORITY_TIMEOUT_MS", DEFAULT_AUTHORITY_TIMEOUT_MS),
            ..Self::new(base_url)
        })
    }
}

pub struct HttpAuthority {
    client: reqwest::Client,
    base_url: String,
    poll_interval: Duration,
    events: broadcast::Sender<SessionEvent>,
}

impl HttpAuthority {
    /// # Errors
    ///
    /// Returns `Network` if the HTTP client cannot be constructed.
    pub fn new(config: &HttpAuthorityConfig) -> Result<Self, AuthorityError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| AuthorityError::Network(e.to_string()))?;
        let (events, _rx) = broadcast::channel(DEFAULT_EVENT_BUFFER);
        Ok(Self { client, base_url: config.base_url.clone(), poll_interval: config.poll_interval, events })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn emit(&self, kind: SessionEventKind, session: Option<Session>) {
        if self.events.send(SessionEvent::new(kind, session)).is_err() {
            debug!(kind = kind.as_str(), "session event emitted with no subscribers");
        }
    }

    /// Poll the session surface and emit events for observed changes.
    /// The first successful poll emits `initial`.
    pub fn spawn_poller(self: &Arc<Self>) -> JoinHandle<()> {
        let authority = Arc::clone(self);
        let period = self.poll_interval;
        info!(poll_interval_ms = period.as_millis(), base_url = %self.base_url, "session poller started");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut last: Option<Option<Session>> = None;
            loop {
                ticker.tick().await;
                match authority.get_session().await {
                    Ok(current) => {
                        if let Some(kind) = diff_sessions(last.as_ref(), current.as_ref()) {
                            authority.emit(kind, current.clone());
                        }
                        last = Some(current);
                    }
                    Err(e) => warn!(error = %e, "session poll failed"),
                }
            }
        })
    }
}

/// Event kind implied by moving from `previous` to `current`.
///
/// `previous == None` means nothing has been observed yet.
pub(crate) fn diff_sessions(previous: Option<&Option<Session>>, current: Option<&Session>) -> Option<SessionEventKind> {
    let Some(previous) = previous else {
        return Some(SessionEventKind::Initial);
    };
    match (previous.as_ref(), current) {
        (None, None) => None,
        (None, Some(_)) => Some(SessionEventKind::SignedIn),
        (Some(_), None) => Some(SessionEventKind::SignedOut),
        (Some(before), Some(after)) if before.user.id != after.user.id => Some(SessionEventKind::SignedIn),
        (Some(before), Some(after)) if before.user != after.user => Some(SessionEventKind::UserUpdated),
        (Some(before), Some(after)) if before.expires_at != after.expires_at => Some(SessionEventKind::TokenRefreshed),
        (Some(_), Some(_)) => None,
    }
}

#[async_trait::async_trait]
impl SessionAuthority for HttpAuthority {
    async fn get_session(&self) -> Result<Option<Session>, AuthorityError> {
        let resp = self
            .client
            .get(self.url("/api/auth/me"))
            .send()
            .await
            .map_err(|e| AuthorityError::Network(e.to_string()))?;
        match resp.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Ok(None),
            status if status.is_success() => resp
                .json::<Session>()
                .await
                .map(Some)
                .map_err(|e| AuthorityError::Parse(e.to_string())),
            status => Err(AuthorityError::Status { status: status.as_u16() }),
        }
    }

    async fn fetch_profile(&self, user_id: &str) -> Result<Option<Profile>, AuthorityError> {
        let path = format!("/api/users/{}/profile", urlencoding::encode(user_id));
        let resp = self
            .client
            .get(self.url(&path))
            .send()
            .await
            .map_err(|e| AuthorityError::Network(e.to_string()))?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => resp
                .json::<Profile>()
                .await
                .map(Some)
                .map_err(|e| AuthorityError::Parse(e.to_string())),
            status => Err(AuthorityError::Status { status: status.as_u16() }),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn sign_out(&self, scope: SignOutScope) -> Result<(), AuthorityError> {
        let resp = self
            .client
            .post(self.url(&format!("/api/auth/logout?scope={}", scope.as_str())))
            .send()
            .await
            .map_err(|e| AuthorityError::Network(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() && status != StatusCode::UNAUTHORIZED {
            return Err(AuthorityError::Status { status: status.as_u16() });
        }
        self.emit(SessionEventKind::SignedOut, None);
        Ok(())
    }
}

#[cfg(test)]
#[path = "http_test.rs"]
mod http_test;
