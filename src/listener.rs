//! Session event listener: turns authority events into store commits.
//!
//! Rules:
//! - `token-refreshed` may skip the commit only when the store already holds
//!   the same user, is authenticated, and its user is present. The explicit
//!   user check matters: a store cleared out-of-band while the authority
//!   still holds a session must resync, or the tab stays signed out forever.
//! - `signed-in` and `user-updated` always resync, superseding any in-flight
//!   resync.
//! - `initial` joins the in-flight resync.
//! - `signed-out` commits the signed-out shape and announces it to other tabs.
//!
//! Events are dispatched in delivery order. Resyncs run as their own tasks so
//! a slow authority read never blocks a later sign-out from being applied.

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::authority::{Session, SessionEvent, SessionEventKind};
use crate::broadcast::CrossTabCoordinator;
use crate::resync::{ResyncHandle, ResyncMode, Resyncer};
use crate::state::{AuthState, AuthStore};

/// What the listener did with one event.
pub enum ListenerAction {
    Skipped,
    Resync(ResyncHandle),
    SignedOut,
}

/// Whether a `token-refreshed` event may leave the store untouched.
#[must_use]
pub fn should_skip_refresh(state: &AuthState, session: Option<&Session>) -> bool {
    let Some(session) = session else {
        return false;
    };
    let Some(user) = state.user.as_ref() else {
        return false;
    };
    state.is_authenticated && user.id == session.user_id()
}

#[derive(Clone)]
pub struct AuthEventListener {
    store: AuthStore,
    resyncer: Resyncer,
    coordinator: CrossTabCoordinator,
    tab_id: Uuid,
}

impl AuthEventListener {
    #[must_use]
    pub fn new(store: AuthStore, resyncer: Resyncer, coordinator: CrossTabCoordinator, tab_id: Uuid) -> Self {
        Self { store, resyncer, coordinator, tab_id }
    }

    pub fn handle(&self, event: &SessionEvent) -> ListenerAction {
        let kind = event.kind.as_str();
        match event.kind {
            SessionEventKind::TokenRefreshed => {
                let state = self.store.snapshot();
                if should_skip_refresh(&state, event.session.as_ref()) {
                    debug!(tab_id = %self.tab_id, kind, "refresh matches store; commit skipped");
                    return ListenerAction::Skipped;
                }
                if state.user.is_none() && event.session.is_some() {
                    warn!(tab_id = %self.tab_id, kind, "store empty while authority holds a session; resyncing");
                }
                ListenerAction::Resync(self.resyncer.trigger(ResyncMode::Join, kind))
            }
            SessionEventKind::Initial => ListenerAction::Resync(self.resyncer.trigger(ResyncMode::Join, kind)),
            SessionEventKind::SignedIn | SessionEventKind::UserUpdated => {
                ListenerAction::Resync(self.resyncer.trigger(ResyncMode::Supersede, kind))
            }
            SessionEventKind::SignedOut => {
                self.store.force(AuthState::reset_signed_out);
                info!(tab_id = %self.tab_id, "signed out");
                // Failure is logged by the coordinator; the next authority
                // event reconciles other tabs.
                let _ = self.coordinator.announce_logout();
                ListenerAction::SignedOut
            }
        }
    }

    /// Consume events until the authority's channel closes.
    pub fn spawn(&self, mut events: broadcast::Receiver<SessionEvent>) -> JoinHandle<()> {
        let listener = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        listener.handle(&event);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(tab_id = %listener.tab_id, skipped, "session events dropped; resyncing");
                        listener.resyncer.trigger(ResyncMode::Join, "lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
#[path = "listener_test.rs"]
mod listener_test;
