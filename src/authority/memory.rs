//! In-process session authority.
//!
//! `SessionVault` stands in for the origin-shared durable session (the
//! browser's token storage). Each tab gets its own `MemoryAuthority` over the
//! same vault, so a sign-out in one tab is visible to every other tab's
//! `get_session`, while change events are only emitted to the tab that
//! performed the action. Read latency, stalls and failures are injectable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::debug;

use super::{AuthorityError, Session, SessionAuthority, SessionEvent, SessionEventKind, SignOutScope};
use crate::config::DEFAULT_EVENT_BUFFER;
use crate::state::{Profile, User};

// =============================================================================
// VAULT
// =============================================================================

/// Durable session shared by every tab of one origin.
#[derive(Default)]
pub struct SessionVault {
    session: Mutex<Option<Session>>,
    profiles: Mutex<HashMap<String, Profile>>,
}

impl SessionVault {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[must_use]
    pub fn session(&self) -> Option<Session> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_session(&self, session: Option<Session>) {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = session;
    }

    pub fn put_profile(&self, profile: Profile) {
        self.profiles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(profile.user_id.clone(), profile);
    }

    fn profile(&self, user_id: &str) -> Option<Profile> {
        self.profiles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)
            .cloned()
    }
}

// =============================================================================
// READ BEHAVIOR
// =============================================================================

/// How `get_session` responds.
#[derive(Debug, Clone, Default)]
pub enum ReadBehavior {
    #[default]
    Immediate,
    /// Answer after the given delay.
    Delay(Duration),
    /// Never answer.
    Stall,
    /// Fail with the given error.
    Fail(AuthorityError),
}

// =============================================================================
// AUTHORITY
// =============================================================================

pub struct MemoryAuthority {
    vault: Arc<SessionVault>,
    events: broadcast::Sender<SessionEvent>,
    behavior: Mutex<ReadBehavior>,
    session_reads: AtomicUsize,
    sign_outs: Mutex<Vec<SignOutScope>>,
}

impl MemoryAuthority {
    #[must_use]
    pub fn new(vault: Arc<SessionVault>) -> Self {
        Self::with_capacity(vault, DEFAULT_EVENT_BUFFER)
    }

    #[must_use]
    pub fn with_capacity(vault: Arc<SessionVault>, capacity: usize) -> Self {
        let (events, _rx) = broadcast::channel(capacity.max(1));
        Self {
            vault,
            events,
            behavior: Mutex::new(ReadBehavior::Immediate),
            session_reads: AtomicUsize::new(0),
            sign_outs: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn vault(&self) -> &Arc<SessionVault> {
        &self.vault
    }

    /// Store a session for `user` and notify this tab.
    pub fn sign_in(&self, user: User, expires_at: Option<i64>) -> Session {
        let session = Session { user, expires_at };
        self.vault.set_session(Some(session.clone()));
        self.emit(SessionEventKind::SignedIn, Some(session.clone()));
        session
    }

    /// Extend the current session and notify this tab. `None` when signed out.
    pub fn refresh_token(&self, extend_secs: i64) -> Option<Session> {
        let mut session = self.vault.session()?;
        session.expires_at = Some(session.expires_at.unwrap_or(0) + extend_secs);
        self.vault.set_session(Some(session.clone()));
        self.emit(SessionEventKind::TokenRefreshed, Some(session.clone()));
        Some(session)
    }

    /// Edit the signed-in user and notify this tab.
    pub fn update_user(&self, f: impl FnOnce(&mut User)) -> Option<Session> {
        let mut session = self.vault.session()?;
        f(&mut session.user);
        self.vault.set_session(Some(session.clone()));
        self.emit(SessionEventKind::UserUpdated, Some(session.clone()));
        Some(session)
    }

    /// Deliver an arbitrary event to this tab's subscribers.
    pub fn emit(&self, kind: SessionEventKind, session: Option<Session>) {
        if self.events.send(SessionEvent::new(kind, session)).is_err() {
            debug!(kind = kind.as_str(), "session event emitted with no subscribers");
        }
    }

    pub fn set_read_behavior(&self, behavior: ReadBehavior) {
        *self.behavior.lock().unwrap_or_else(PoisonError::into_inner) = behavior;
    }

    /// Number of `get_session` calls started so far.
    #[must_use]
    pub fn session_reads(&self) -> usize {
        self.session_reads.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn sign_outs(&self) -> Vec<SignOutScope> {
        self.sign_outs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait::async_trait]
impl SessionAuthority for MemoryAuthority {
    async fn get_session(&self) -> Result<Option<Session>, AuthorityError> {
        self.session_reads.fetch_add(1, Ordering::SeqCst);
        let behavior = self
            .behavior
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match behavior {
            ReadBehavior::Immediate => {}
            ReadBehavior::Delay(delay) => tokio::time::sleep(delay).await,
            ReadBehavior::Stall => std::future::pending::<()>().await,
            ReadBehavior::Fail(e) => return Err(e),
        }
        Ok(self.vault.session())
    }

    async fn fetch_profile(&self, user_id: &str) -> Result<Option<Profile>, AuthorityError> {
        Ok(self.vault.profile(user_id))
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn sign_out(&self, scope: SignOutScope) -> Result<(), AuthorityError> {
        self.sign_outs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(scope);
        self.vault.set_session(None);
        self.emit(SessionEventKind::SignedOut, None);
        Ok(())
    }
}

#[cfg(test)]
#[path = "memory_test.rs"]
mod memory_test;
