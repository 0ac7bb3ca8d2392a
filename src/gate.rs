//! Protected route gate.
//!
//! DESIGN
//! ======
//! Three views, derived from the store alone:
//! - `Checking` while `is_ready` is false. Nothing may fetch.
//! - `Denied` once ready without the required access. The caller is sent to
//!   the sign-in route with the requested path as the return target.
//! - `Allowed` otherwise.
//!
//! While the store is ready and unauthenticated, the gate also reads the
//! authority. If the authority holds a session the store missed, the gate
//! logs a desync and runs a superseding resync instead of trusting the stale
//! verdict. A not-ready store is never a desync: its resync is already owed.
//!
//! ARCHITECTURE
//! ============
//! `evaluate` is pure. `ProtectedRouteGate::check` adds the authority read.
//! `ProtectedRouteGate::mount` publishes and redirects from the store alone,
//! before it returns and again on every store change. The authority read runs
//! beside that loop and only ever reaches the view through the store.

use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, OptionFuture};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::authority::SessionAuthority;
use crate::config::SyncConfig;
use crate::error::AuthError;
use crate::resync::{ResyncMode, ResyncOutcome, Resyncer};
use crate::state::{AuthState, AuthStore};

/// Routing layer hook used on denial.
pub trait Navigator: Send + Sync {
    fn redirect(&self, to: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteAccess {
    Authenticated,
    Admin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateView {
    Checking,
    Denied { redirect_to: String },
    Allowed,
}

impl GateView {
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Sign-in URL carrying `requested_path` as the return target.
#[must_use]
pub fn sign_in_redirect(config: &SyncConfig, requested_path: &str) -> String {
    format!(
        "{}?{}={}",
        config.sign_in_path,
        config.return_param,
        urlencoding::encode(requested_path)
    )
}

#[must_use]
pub fn evaluate(state: &AuthState, access: RouteAccess, requested_path: &str, config: &SyncConfig) -> GateView {
    if !state.is_ready {
        return GateView::Checking;
    }
    let permitted = match access {
        RouteAccess::Authenticated => state.is_authenticated,
        RouteAccess::Admin => state.is_authenticated && state.is_admin,
    };
    if permitted {
        GateView::Allowed
    } else {
        GateView::Denied { redirect_to: sign_in_redirect(config, requested_path) }
    }
}

// =============================================================================
// GATE
// =============================================================================

#[derive(Clone)]
pub struct ProtectedRouteGate {
    store: AuthStore,
    authority: Arc<dyn SessionAuthority>,
    resyncer: Resyncer,
    config: SyncConfig,
    access: RouteAccess,
    path: String,
}

impl ProtectedRouteGate {
    #[must_use]
    pub fn new(
        store: AuthStore,
        authority: Arc<dyn SessionAuthority>,
        resyncer: Resyncer,
        config: SyncConfig,
        access: RouteAccess,
        path: impl Into<String>,
    ) -> Self {
        Self { store, authority, resyncer, config, access, path: path.into() }
    }

    #[must_use]
    pub fn access(&self) -> RouteAccess {
        self.access
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// View from the store alone.
    #[must_use]
    pub fn view(&self) -> GateView {
        evaluate(&self.store.snapshot(), self.access, &self.path, &self.config)
    }

    /// View after reconciling a ready, unauthenticated store with the authority.
    pub async fn check(&self) -> GateView {
        let state = self.store.snapshot();
        if !needs_reconcile(&state) {
            return evaluate(&state, self.access, &self.path, &self.config);
        }
        self.reconcile().await;
        self.view()
    }

    async fn reconcile(&self) {
        match timeout(self.config.authority_timeout, self.authority.get_session()).await {
            Ok(Ok(Some(session))) => {
                let desync = AuthError::Desync {
                    detail: format!("authority holds a session for {} but store is signed out", session.user_id()),
                };
                warn!(path = %self.path, user_id = session.user_id(), error = %desync, "gate found desync; resyncing");
                if let ResyncOutcome::Failed(e) = self.resyncer.resync(ResyncMode::Supersede, "gate-desync").await {
                    warn!(path = %self.path, error = %e, "desync recovery failed");
                }
            }
            Ok(Ok(None)) => {}
            Ok(Err(e)) => debug!(path = %self.path, error = %e, "gate session read failed; trusting store"),
            Err(_) => debug!(path = %self.path, "gate session read timed out; trusting store"),
        }
    }

    /// Follow the store until the handle is dropped.
    ///
    /// The first view is published, and a denial redirected, before this
    /// returns.
    #[must_use]
    pub fn mount(self, navigator: Arc<dyn Navigator>) -> GateHandle {
        let mut rx = self.store.subscribe();
        let state = rx.borrow_and_update().clone();
        let first = evaluate(&state, self.access, &self.path, &self.config);
        let mut denied = self.follow(&first, navigator.as_ref(), false);
        let (tx, views) = watch::channel(first);

        let task = tokio::spawn(async move {
            let mut pending = self.start_reconcile(&state, None);
            loop {
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    Some(()) = OptionFuture::from(pending.as_mut()), if pending.is_some() => {
                        pending = None;
                        continue;
                    }
                }

                let state = rx.borrow_and_update().clone();
                let view = evaluate(&state, self.access, &self.path, &self.config);
                denied = self.follow(&view, navigator.as_ref(), denied);
                tx.send_if_modified(|current| {
                    if *current == view {
                        return false;
                    }
                    *current = view;
                    true
                });
                pending = self.start_reconcile(&state, pending);
            }
        });
        GateHandle { views, task }
    }

    /// Redirect on entry into `Denied`. Returns the new denied flag.
    fn follow(&self, view: &GateView, navigator: &dyn Navigator, denied: bool) -> bool {
        match view {
            GateView::Denied { redirect_to } if !denied => {
                info!(path = %self.path, redirect_to = %redirect_to, "route denied");
                navigator.redirect(redirect_to);
                true
            }
            GateView::Denied { .. } => true,
            GateView::Checking | GateView::Allowed => false,
        }
    }

    /// At most one authority read at a time; a running one is kept.
    fn start_reconcile(
        &self,
        state: &AuthState,
        pending: Option<BoxFuture<'static, ()>>,
    ) -> Option<BoxFuture<'static, ()>> {
        if pending.is_some() || !needs_reconcile(state) {
            return pending;
        }
        let gate = self.clone();
        Some(async move { gate.reconcile().await }.boxed())
    }
}

fn needs_reconcile(state: &AuthState) -> bool {
    state.is_ready && !state.is_authenticated
}

/// Mounted gate. Unmounts on drop.
pub struct GateHandle {
    views: watch::Receiver<GateView>,
    task: JoinHandle<()>,
}

impl GateHandle {
    #[must_use]
    pub fn current(&self) -> GateView {
        self.views.borrow().clone()
    }

    /// Stream of published views.
    #[must_use]
    pub fn views(&self) -> watch::Receiver<GateView> {
        self.views.clone()
    }
}

impl Drop for GateHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
#[path = "gate_test.rs"]
mod gate_test;
