//! Shared fixtures for unit tests.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::authority::Session;
use crate::authority::memory::{MemoryAuthority, SessionVault};
use crate::config::SyncConfig;
use crate::gate::Navigator;
use crate::state::{Profile, User};

pub const READY_TIMEOUT: Duration = Duration::from_secs(5);
pub const AUTHORITY_TIMEOUT: Duration = Duration::from_secs(8);

#[must_use]
pub fn test_config() -> SyncConfig {
    SyncConfig { ready_timeout: READY_TIMEOUT, authority_timeout: AUTHORITY_TIMEOUT, ..SyncConfig::default() }
}

#[must_use]
pub fn alice() -> User {
    User { id: "u-alice".into(), name: "Alice".into(), email: Some("alice@example.com".into()), role: None }
}

#[must_use]
pub fn admin_user() -> User {
    User { id: "u-root".into(), name: "Root".into(), email: None, role: Some("admin".into()) }
}

#[must_use]
pub fn alice_profile() -> Profile {
    Profile { user_id: "u-alice".into(), display_name: "Alice A.".into(), is_admin: false }
}

#[must_use]
pub fn session_for(user: User) -> Session {
    Session { user, expires_at: Some(1_700_000_000) }
}

/// Authority whose vault already holds a session for `user`.
#[must_use]
pub fn authority_with(user: Option<User>) -> Arc<MemoryAuthority> {
    let vault = SessionVault::new();
    vault.set_session(user.map(session_for));
    Arc::new(MemoryAuthority::new(vault))
}

/// Navigator that records every redirect.
#[derive(Clone, Default)]
pub struct RecordingNavigator {
    redirects: Arc<Mutex<Vec<String>>>,
}

impl RecordingNavigator {
    #[must_use]
    pub fn redirects(&self) -> Vec<String> {
        self.redirects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Navigator for RecordingNavigator {
    fn redirect(&self, to: &str) {
        self.redirects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(to.to_owned());
    }
}
