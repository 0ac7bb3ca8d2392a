//! Session authority boundary.
//!
//! ARCHITECTURE
//! ============
//! The authority owns the durable session (tokens, identity) and performs
//! network refresh. The core consumes it through `SessionAuthority` only:
//! read the current session, read a profile, subscribe to change events, and
//! sign out. `memory` is an in-process implementation for tests and
//! simulation; `http` talks to a session REST surface.

pub mod http;
pub mod memory;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::state::{Profile, User};

// =============================================================================
// ERROR
// =============================================================================

/// Errors produced by authority adapters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthorityError {
    /// Transport failed before a response arrived.
    #[error("authority request failed: {0}")]
    Network(String),

    /// The authority answered with an unexpected HTTP status.
    #[error("authority response error: status {status}")]
    Status { status: u16 },

    /// The response body could not be decoded.
    #[error("authority response parse failed: {0}")]
    Parse(String),
}

// =============================================================================
// SESSION + EVENTS
// =============================================================================

/// Current session as reported by the authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user: User,
    /// Access-token expiry, seconds since the Unix epoch, when known.
    #[serde(default)]
    pub expires_at: Option<i64>,
}

impl Session {
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionEventKind {
    Initial,
    SignedIn,
    SignedOut,
    TokenRefreshed,
    UserUpdated,
}

impl SessionEventKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::SignedIn => "signed-in",
            Self::SignedOut => "signed-out",
            Self::TokenRefreshed => "token-refreshed",
            Self::UserUpdated => "user-updated",
        }
    }
}

/// Change notification. Consumed once by the listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub kind: SessionEventKind,
    pub session: Option<Session>,
}

impl SessionEvent {
    #[must_use]
    pub fn new(kind: SessionEventKind, session: Option<Session>) -> Self {
        Self { kind, session }
    }
}

/// How far a sign-out reaches at the authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignOutScope {
    /// This origin's session only. Other devices keep theirs.
    Local,
    /// Every session for the user.
    Global,
}

impl SignOutScope {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Global => "global",
        }
    }
}

// =============================================================================
// TRAIT
// =============================================================================

/// Provider-neutral session authority interface.
///
/// Calls may stall; callers in this crate always wrap them in a timeout.
#[async_trait::async_trait]
pub trait SessionAuthority: Send + Sync {
    /// Read the current session, `None` when signed out.
    async fn get_session(&self) -> Result<Option<Session>, AuthorityError>;

    /// Read extended attributes for `user_id`, `None` when absent.
    async fn fetch_profile(&self, user_id: &str) -> Result<Option<Profile>, AuthorityError>;

    /// Subscribe to change notifications.
    fn subscribe(&self) -> broadcast::Receiver<SessionEvent>;

    /// Invalidate the session at the authority.
    async fn sign_out(&self, scope: SignOutScope) -> Result<(), AuthorityError>;
}
