//! One browser tab's auth synchronization core.
//!
//! DESIGN
//! ======
//! `AuthSync::start` wires a tab together:
//! 1. Bootstrap from the persistent record. A valid record yields an
//!    optimistic, not-ready hint; a tampered one is cleared.
//! 2. Subscribe to the authority and to the tab channel before anything can
//!    commit, so no event lands unobserved.
//! 3. Arm the watchdog with `Mount`, which starts the first resync and
//!    guarantees `is_ready` resolves within the ready timeout.
//!
//! Sign-out announces LOGOUT first, then clears local state and the record,
//! then invalidates the session at the authority. Other tabs follow from the
//! announcement alone.
//!
//! Dropping an `AuthSync` aborts its background tasks.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};
use uuid::Uuid;

use crate::authority::{SessionAuthority, SignOutScope};
use crate::broadcast::{CrossTabCoordinator, TabChannel};
use crate::config::SyncConfig;
use crate::gate::{ProtectedRouteGate, RouteAccess};
use crate::guard::DataLoadGuard;
use crate::listener::AuthEventListener;
use crate::record::{PersistentAuthRecord, RecordStorage};
use crate::resync::Resyncer;
use crate::state::{AuthState, AuthStore};
use crate::watchdog::{LifecycleSignal, ReadinessWatchdog, WatchdogOutcome};

pub struct AuthSync {
    tab_id: Uuid,
    config: SyncConfig,
    authority: Arc<dyn SessionAuthority>,
    store: AuthStore,
    resyncer: Resyncer,
    coordinator: CrossTabCoordinator,
    watchdog: ReadinessWatchdog,
    tasks: Vec<JoinHandle<()>>,
}

impl AuthSync {
    /// Bootstrap a tab and start its background tasks.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn start(
        authority: Arc<dyn SessionAuthority>,
        channel: Arc<dyn TabChannel>,
        storage: Arc<dyn RecordStorage>,
        config: SyncConfig,
    ) -> Self {
        let tab_id = Uuid::new_v4();
        let record = PersistentAuthRecord::new(storage, config.record_key.clone());
        let initial = match record.bootstrap() {
            Some(snapshot) if snapshot.is_authenticated => match snapshot.user_id {
                Some(user_id) => {
                    info!(%tab_id, %user_id, "bootstrapping from persistent record");
                    AuthState::hinted(user_id)
                }
                None => AuthState::initial(),
            },
            _ => AuthState::initial(),
        };

        let store = AuthStore::with_record(initial, record);
        let resyncer = Resyncer::new(Arc::clone(&authority), store.clone(), &config);
        let coordinator = CrossTabCoordinator::new(channel, store.clone(), tab_id);
        let listener = AuthEventListener::new(store.clone(), resyncer.clone(), coordinator.clone(), tab_id);
        let watchdog = ReadinessWatchdog::new(store.clone(), resyncer.clone(), config.ready_timeout);

        let tasks = vec![listener.spawn(authority.subscribe()), coordinator.spawn()];
        watchdog.notify(LifecycleSignal::Mount);
        info!(%tab_id, "auth sync started");

        Self { tab_id, config, authority, store, resyncer, coordinator, watchdog, tasks }
    }

    #[must_use]
    pub fn tab_id(&self) -> Uuid {
        self.tab_id
    }

    #[must_use]
    pub fn store(&self) -> &AuthStore {
        &self.store
    }

    #[must_use]
    pub fn state(&self) -> AuthState {
        self.store.snapshot()
    }

    #[must_use]
    pub fn resyncer(&self) -> &Resyncer {
        &self.resyncer
    }

    #[must_use]
    pub fn watchdog(&self) -> &ReadinessWatchdog {
        &self.watchdog
    }

    /// Forward a lifecycle signal and wait for readiness to settle.
    pub async fn signal(&self, signal: LifecycleSignal) -> WatchdogOutcome {
        self.watchdog.on_signal(signal).await
    }

    #[must_use]
    pub fn gate(&self, access: RouteAccess, path: impl Into<String>) -> ProtectedRouteGate {
        ProtectedRouteGate::new(
            self.store.clone(),
            Arc::clone(&self.authority),
            self.resyncer.clone(),
            self.config.clone(),
            access,
            path,
        )
    }

    #[must_use]
    pub fn data_guard(&self) -> DataLoadGuard {
        DataLoadGuard::new(self.store.clone())
    }

    /// Sign this tab out and tell every other tab of the origin to follow.
    pub async fn sign_out(&self, scope: SignOutScope) {
        // Failure is logged by the coordinator and not retried.
        let _ = self.coordinator.announce_logout();
        self.store.force(AuthState::reset_signed_out);
        info!(tab_id = %self.tab_id, scope = scope.as_str(), "signed out locally");

        match timeout(self.config.authority_timeout, self.authority.sign_out(scope)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(tab_id = %self.tab_id, error = %e, "authority sign-out failed"),
            Err(_) => warn!(tab_id = %self.tab_id, "authority sign-out timed out"),
        }
    }
}

impl Drop for AuthSync {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
#[path = "tab_test.rs"]
mod tab_test;
