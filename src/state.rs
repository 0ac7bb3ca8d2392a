//! Local auth state and its single commit point.
//!
//! DESIGN
//! ======
//! `AuthStore` wraps a `watch` channel: a commit is one synchronous critical
//! section, subscribers are the watch receivers, and `snapshot()` is a cheap
//! clone of the latest value. Every commit path funnels through one function
//! that checks invariants. A changed commit is then mirrored into the
//! persistent record outside the generation lock, so a slow storage never
//! holds up ticketing.
//!
//! Commits that race (two resyncs, a resync against a sign-out) are ordered
//! by generation tickets. A ticket is taken before an authority read; the
//! result is applied only if no commit with a later ticket landed first.


use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::AuthError;
use crate::record::PersistentAuthRecord;

// =============================================================================
// IDENTITY
// =============================================================================

/// Identity record issued by the session authority.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    /// Authority-assigned role claim (e.g. `"admin"`).
    #[serde(default)]
    pub role: Option<String>,
}

impl User {
    /// Identity known only by id, as recovered from the persistent record.
    #[must_use]
    pub fn placeholder(id: impl Into<String>) -> Self {
        Self { id: id.into(), name: String::new(), email: None, role: None }
    }
}

/// Extended user attributes. May lag `User` briefly while loading.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: String,
    pub display_name: String,
    #[serde(default)]
    pub is_admin: bool,
}

// =============================================================================
// AUTH STATE
// =============================================================================

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AuthState {
    pub user: Option<User>,
    pub profile: Option<Profile>,
    pub is_authenticated: bool,
    pub is_admin: bool,
    pub is_ready: bool,
    pub error: Option<AuthError>,
}

impl AuthState {
    /// Application-start shape: nothing known yet.
    #[must_use]
    pub fn initial() -> Self {
        Self::default()
    }

    /// Signed-out shape. Ready, because "signed out" is itself an answer.
    #[must_use]
    pub fn signed_out() -> Self {
        Self { is_ready: true, ..Self::default() }
    }

    /// Optimistic bootstrap shape from a persisted user id. Not ready: the
    /// authority has not confirmed it.
    #[must_use]
    pub fn hinted(user_id: impl Into<String>) -> Self {
        Self { user: Some(User::placeholder(user_id)), is_authenticated: true, ..Self::default() }
    }

    /// Ready, authenticated shape derived from an authority session.
    ///
    /// A profile belonging to another user is dropped rather than attached.
    #[must_use]
    pub fn resolved(user: User, profile: Option<Profile>, admin_role: &str) -> Self {
        let profile = profile.filter(|p| p.user_id == user.id);
        let is_admin = profile.as_ref().is_some_and(|p| p.is_admin) || user.role.as_deref() == Some(admin_role);
        Self { user: Some(user), profile, is_authenticated: true, is_admin, is_ready: true, error: None }
    }

    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.id.as_str())
    }

    /// Structural invariants every committed state must satisfy.
    #[must_use]
    pub fn invariants_hold(&self) -> bool {
        let auth_matches_user = self.is_authenticated == self.user.is_some();
        let profile_has_user = match (&self.profile, &self.user) {
            (None, _) => true,
            (Some(p), Some(u)) => p.user_id == u.id,
            (Some(_), None) => false,
        };
        let admin_needs_auth = !self.is_admin || self.is_authenticated;
        auth_matches_user && profile_has_user && admin_needs_auth
    }

    /// Collapse to the signed-out shape in place.
    pub fn reset_signed_out(&mut self) {
        *self = Self::signed_out();
    }
}

// =============================================================================
// STORE
// =============================================================================

/// Ordering token for a commit that depends on an asynchronous read.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Ticket(u64);

impl Ticket {
    #[must_use]
    pub fn generation(self) -> u64 {
        self.0
    }
}

struct Generations {
    issued: u64,
    applied: u64,
}

struct StoreInner {
    tx: watch::Sender<AuthState>,
    generations: Mutex<Generations>,
    record: Option<PersistentAuthRecord>,
    // Serializes record writes; each write takes the latest snapshot.
    persisting: Mutex<()>,
}

/// Single source of local truth. Clones share state.
#[derive(Clone)]
pub struct AuthStore {
    inner: Arc<StoreInner>,
}

impl AuthStore {
    #[must_use]
    pub fn new(initial: AuthState) -> Self {
        Self::build(initial, None)
    }

    /// Store that mirrors every commit into `record`.
    #[must_use]
    pub fn with_record(initial: AuthState, record: PersistentAuthRecord) -> Self {
        Self::build(initial, Some(record))
    }

    fn build(initial: AuthState, record: Option<PersistentAuthRecord>) -> Self {
        debug_assert!(initial.invariants_hold(), "initial auth state violates invariants: {initial:?}");
        let (tx, _rx) = watch::channel(initial);
        Self {
            inner: Arc::new(StoreInner {
                tx,
                generations: Mutex::new(Generations { issued: 0, applied: 0 }),
                record,
                persisting: Mutex::new(()),
            }),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> AuthState {
        self.inner.tx.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.inner.tx.subscribe()
    }

    /// Atomic merge that does not participate in generation ordering.
    pub fn update(&self, f: impl FnOnce(&mut AuthState)) {
        let guard = self.lock_generations();
        let changed = self.apply(f);
        drop(guard);
        if changed {
            self.mirror();
        }
    }

    /// Reserve a generation for a commit that will land later.
    #[must_use]
    pub fn ticket(&self) -> Ticket {
        let mut generations = self.lock_generations();
        generations.issued += 1;
        Ticket(generations.issued)
    }

    /// Apply `f` only if no later ticket has committed. Returns whether it applied.
    pub fn commit_ticketed(&self, ticket: Ticket, f: impl FnOnce(&mut AuthState)) -> bool {
        let mut generations = self.lock_generations();
        if ticket.0 <= generations.applied {
            return false;
        }
        generations.applied = ticket.0;
        let changed = self.apply(f);
        drop(generations);
        if changed {
            self.mirror();
        }
        true
    }

    /// Commit with a fresh ticket, invalidating every older pending result.
    pub fn force(&self, f: impl FnOnce(&mut AuthState)) -> Ticket {
        let mut generations = self.lock_generations();
        generations.issued += 1;
        generations.applied = generations.issued;
        let ticket = Ticket(generations.issued);
        let changed = self.apply(f);
        drop(generations);
        if changed {
            self.mirror();
        }
        ticket
    }

    #[must_use]
    pub fn applied_generation(&self) -> u64 {
        self.lock_generations().applied
    }

    fn lock_generations(&self) -> std::sync::MutexGuard<'_, Generations> {
        self.inner
            .generations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // Caller must hold the generations lock.
    fn apply(&self, f: impl FnOnce(&mut AuthState)) -> bool {
        self.inner.tx.send_if_modified(|state| {
            let before = state.clone();
            f(state);
            debug_assert!(state.invariants_hold(), "auth state invariant violated: {state:?}");
            *state != before
        })
    }

    /// Write the latest snapshot to the record. The last writer always sees
    /// the newest commit, so racing commits cannot leave a stale record.
    fn mirror(&self) {
        let Some(record) = &self.inner.record else {
            return;
        };
        let _writing = self
            .inner
            .persisting
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        record.persist(&self.snapshot());
    }
}

#[cfg(test)]
#[path = "state_test.rs"]
mod state_test;
