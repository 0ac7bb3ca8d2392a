//! Serialized resync against the session authority.
//!
//! DESIGN
//! ======
//! A resync reads the authority's current session, derives user, profile and
//! admin flag, and commits the result under a generation ticket taken before
//! the read. At most one resync is tracked as in flight: `Join` callers await
//! the existing handle, `Supersede` callers start a newer one that replaces
//! it. Whichever result carries the newest ticket wins; older results are
//! dropped at commit time.
//!
//! ERROR HANDLING
//! ==============
//! A failed or timed-out read records `error` and sets `is_ready`, leaving
//! `user` and `is_authenticated` at their last known values. A failed check
//! is still a resolved check.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::authority::SessionAuthority;
use crate::config::SyncConfig;
use crate::error::AuthError;
use crate::state::{AuthState, AuthStore, Profile, Ticket};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncMode {
    /// Reuse the in-flight resync if there is one.
    Join,
    /// Start a fresh resync whose result outranks any in-flight one.
    Supersede,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResyncOutcome {
    /// The authority answered and the result was committed.
    Applied { authenticated: bool },
    /// A newer commit landed first; this result was discarded.
    Dropped,
    /// The authority failed or timed out; `error` and `is_ready` were committed.
    Failed(AuthError),
}

/// Cloneable handle to one resync attempt.
#[derive(Clone)]
pub struct ResyncHandle {
    generation: u64,
    shared: Shared<BoxFuture<'static, ResyncOutcome>>,
}

impl ResyncHandle {
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub async fn outcome(self) -> ResyncOutcome {
        self.shared.await
    }
}

struct ResyncInner {
    authority: Arc<dyn SessionAuthority>,
    store: AuthStore,
    call_timeout: Duration,
    admin_role: String,
    in_flight: Mutex<Option<ResyncHandle>>,
    started: AtomicUsize,
}

#[derive(Clone)]
pub struct Resyncer {
    inner: Arc<ResyncInner>,
}

impl Resyncer {
    #[must_use]
    pub fn new(authority: Arc<dyn SessionAuthority>, store: AuthStore, config: &SyncConfig) -> Self {
        Self {
            inner: Arc::new(ResyncInner {
                authority,
                store,
                call_timeout: config.authority_timeout,
                admin_role: config.admin_role.clone(),
                in_flight: Mutex::new(None),
                started: AtomicUsize::new(0),
            }),
        }
    }

    /// Start or join a resync and return its handle without waiting.
    pub fn trigger(&self, mode: ResyncMode, reason: &'static str) -> ResyncHandle {
        let mut slot = self.lock_in_flight();
        if mode == ResyncMode::Join {
            // A forced commit after the handle's ticket makes its result stale.
            let applied = self.inner.store.applied_generation();
            if let Some(handle) = slot.as_ref().filter(|h| h.generation > applied) {
                debug!(generation = handle.generation, reason, "joined in-flight resync");
                return handle.clone();
            }
        }

        let ticket = self.inner.store.ticket();
        // The slot stays locked until the handle is stored, so the task's own
        // cleanup cannot run ahead of it.
        let task = tokio::spawn(run(Arc::clone(&self.inner), ticket, reason));
        let shared = async move {
            task.await.unwrap_or_else(|e| {
                ResyncOutcome::Failed(AuthError::AuthorityUnavailable { reason: format!("resync task failed: {e}") })
            })
        }
        .boxed()
        .shared();
        let handle = ResyncHandle { generation: ticket.generation(), shared };
        *slot = Some(handle.clone());
        self.inner.started.fetch_add(1, Ordering::SeqCst);
        handle
    }

    pub async fn resync(&self, mode: ResyncMode, reason: &'static str) -> ResyncOutcome {
        self.trigger(mode, reason).outcome().await
    }

    #[must_use]
    pub fn in_flight(&self) -> bool {
        self.lock_in_flight().is_some()
    }

    /// Number of resyncs actually started (joins not counted).
    #[must_use]
    pub fn started(&self) -> usize {
        self.inner.started.load(Ordering::SeqCst)
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, Option<ResyncHandle>> {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl ResyncInner {
    async fn load_profile(&self, user_id: &str) -> Option<Profile> {
        match timeout(self.call_timeout, self.authority.fetch_profile(user_id)).await {
            Ok(Ok(profile)) => profile,
            Ok(Err(e)) => {
                warn!(user_id, error = %e, "profile fetch failed; continuing without profile");
                None
            }
            Err(_) => {
                warn!(user_id, "profile fetch timed out; continuing without profile");
                None
            }
        }
    }

    fn fail(&self, ticket: Ticket, error: AuthError) -> ResyncOutcome {
        warn!(generation = ticket.generation(), error = %error, "resync failed; keeping last known identity");
        let recorded = error.clone();
        let applied = self.store.commit_ticketed(ticket, move |s| {
            s.error = Some(recorded);
            s.is_ready = true;
        });
        if applied { ResyncOutcome::Failed(error) } else { ResyncOutcome::Dropped }
    }

    fn clear(&self, generation: u64) {
        let mut slot = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|h| h.generation == generation) {
            *slot = None;
        }
    }
}

async fn run(inner: Arc<ResyncInner>, ticket: Ticket, reason: &'static str) -> ResyncOutcome {
    let generation = ticket.generation();
    debug!(generation, reason, "resync started");

    let outcome = match timeout(inner.call_timeout, inner.authority.get_session()).await {
        Ok(Ok(Some(session))) => {
            let profile = inner.load_profile(session.user_id()).await;
            let user_id = session.user.id.clone();
            let next = AuthState::resolved(session.user, profile, &inner.admin_role);
            if inner.store.commit_ticketed(ticket, move |s| *s = next) {
                info!(generation, %user_id, reason, "session resynced");
                ResyncOutcome::Applied { authenticated: true }
            } else {
                debug!(generation, "resync result superseded");
                ResyncOutcome::Dropped
            }
        }
        Ok(Ok(None)) => {
            if inner.store.commit_ticketed(ticket, AuthState::reset_signed_out) {
                info!(generation, reason, "authority reports no session");
                ResyncOutcome::Applied { authenticated: false }
            } else {
                debug!(generation, "resync result superseded");
                ResyncOutcome::Dropped
            }
        }
        Ok(Err(e)) => inner.fail(ticket, AuthError::AuthorityUnavailable { reason: e.to_string() }),
        Err(_) => inner.fail(ticket, AuthError::timeout(inner.call_timeout)),
    };

    inner.clear(generation);
    outcome
}

#[cfg(test)]
#[path = "resync_test.rs"]
mod resync_test;
