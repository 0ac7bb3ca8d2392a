//! Data load guard: page fetches wait for auth readiness and are discarded
//! if the user identity changes while they are in flight.
//!
//! Auth waiting and data loading are reported as separate phases
//! (`LoadPhase::AwaitingAuth` vs `LoadPhase::Fetching`), so a stall in one is
//! never mistaken for the other.

use std::future::Future;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::gate::{GateView, ProtectedRouteGate};
use crate::state::{AuthState, AuthStore};

/// Cancellation token tied to the identity a fetch was started for.
#[derive(Clone)]
pub struct IdentityToken {
    rx: watch::Receiver<AuthState>,
    user_id: Option<String>,
}

impl IdentityToken {
    fn new(rx: watch::Receiver<AuthState>) -> Self {
        let user_id = rx.borrow().user_id().map(str::to_owned);
        Self { rx, user_id }
    }

    /// User the fetch runs for, `None` when signed out.
    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.rx.borrow().user_id() != self.user_id.as_deref()
    }

    /// Resolves once the store's identity differs from this token's.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let expected = self.user_id.as_deref();
        if rx.wait_for(|s| s.user_id() != expected).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome<T> {
    Loaded(T),
    /// Identity changed mid-flight; the result was dropped.
    Discarded,
    /// The fetch never ran: the route was denied or the store went away.
    Blocked,
}

#[derive(Clone)]
pub struct DataLoadGuard {
    store: AuthStore,
}

impl DataLoadGuard {
    #[must_use]
    pub fn new(store: AuthStore) -> Self {
        Self { store }
    }

    /// Run `fetch` once the store is ready and keep its result only if the
    /// identity is unchanged when it resolves.
    pub async fn when_ready<T, F, Fut>(&self, fetch: F) -> LoadOutcome<T>
    where
        F: FnOnce(IdentityToken) -> Fut,
        Fut: Future<Output = T>,
    {
        let mut rx = self.store.subscribe();
        if rx.wait_for(|s| s.is_ready).await.is_err() {
            return LoadOutcome::Blocked;
        }
        let token = IdentityToken::new(rx);
        let result = tokio::select! {
            result = fetch(token.clone()) => result,
            () = token.cancelled() => {
                debug!(user_id = ?token.user_id(), "identity changed; fetch abandoned");
                return LoadOutcome::Discarded;
            }
        };
        if token.is_cancelled() {
            debug!(user_id = ?token.user_id(), "identity changed; result discarded");
            return LoadOutcome::Discarded;
        }
        LoadOutcome::Loaded(result)
    }

    /// Like [`Self::when_ready`], but only if `gate` allows the route.
    pub async fn when_allowed<T, F, Fut>(&self, gate: &ProtectedRouteGate, fetch: F) -> LoadOutcome<T>
    where
        F: FnOnce(IdentityToken) -> Fut,
        Fut: Future<Output = T>,
    {
        let mut rx = self.store.subscribe();
        if rx.wait_for(|s| s.is_ready).await.is_err() {
            return LoadOutcome::Blocked;
        }
        match gate.check().await {
            GateView::Allowed => self.when_ready(fetch).await,
            GateView::Checking | GateView::Denied { .. } => {
                debug!(path = gate.path(), "route not allowed; fetch skipped");
                LoadOutcome::Blocked
            }
        }
    }

    /// Keep a page's data in step with auth: fetch once each time the store
    /// becomes ready and again whenever the identity changes.
    pub fn spawn_loader<T, F, Fut>(&self, fetch: F) -> Loader<T>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
        F: Fn(IdentityToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, String>> + Send + 'static,
    {
        let (tx, phases) = watch::channel(LoadPhase::AwaitingAuth);
        let mut rx = self.store.subscribe();
        let task = tokio::spawn(async move {
            // Identity of the last fetch in the current ready period.
            let mut fetched_for: Option<Option<String>> = None;
            loop {
                let state = rx.borrow_and_update().clone();
                if !state.is_ready {
                    fetched_for = None;
                    publish(&tx, LoadPhase::AwaitingAuth);
                } else if fetched_for.as_ref().map(Option::as_deref) != Some(state.user_id()) {
                    let token = IdentityToken::new(rx.clone());
                    fetched_for = Some(token.user_id.clone());
                    publish(&tx, LoadPhase::Fetching);
                    let phase = tokio::select! {
                        result = fetch(token.clone()) => match result {
                            Ok(data) if !token.is_cancelled() => LoadPhase::Loaded(data),
                            Ok(_) => LoadPhase::Discarded,
                            Err(reason) => {
                                warn!(user_id = ?token.user_id(), reason = %reason, "page data fetch failed");
                                LoadPhase::Failed(reason)
                            }
                        },
                        () = token.cancelled() => LoadPhase::Discarded,
                        () = readiness_lost(rx.clone()) => {
                            debug!(user_id = ?token.user_id(), "readiness lost mid-fetch; result dropped");
                            fetched_for = None;
                            publish(&tx, LoadPhase::AwaitingAuth);
                            continue;
                        }
                    };
                    let discarded = matches!(phase, LoadPhase::Discarded);
                    publish(&tx, phase);
                    if discarded {
                        // Identity moved on; re-evaluate without waiting.
                        continue;
                    }
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        });
        Loader { phases, task }
    }
}

async fn readiness_lost(mut rx: watch::Receiver<AuthState>) {
    if rx.wait_for(|s| !s.is_ready).await.is_err() {
        std::future::pending::<()>().await;
    }
}

// =============================================================================
// LOADER
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadPhase<T> {
    /// Waiting for auth readiness. No request issued.
    AwaitingAuth,
    /// Auth is ready; the data request is in flight.
    Fetching,
    Loaded(T),
    Failed(String),
    /// The identity changed before the result could be applied.
    Discarded,
}

fn publish<T: PartialEq>(tx: &watch::Sender<LoadPhase<T>>, phase: LoadPhase<T>) {
    tx.send_if_modified(|current| {
        if *current == phase {
            return false;
        }
        *current = phase;
        true
    });
}

/// Running loader. Stops on drop.
pub struct Loader<T> {
    phases: watch::Receiver<LoadPhase<T>>,
    task: JoinHandle<()>,
}

impl<T: Clone> Loader<T> {
    #[must_use]
    pub fn phase(&self) -> LoadPhase<T> {
        self.phases.borrow().clone()
    }

    #[must_use]
    pub fn phases(&self) -> watch::Receiver<LoadPhase<T>> {
        self.phases.clone()
    }
}

impl<T> Drop for Loader<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
#[path = "guard_test.rs"]
mod guard_test;
