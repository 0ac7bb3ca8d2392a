//! Readiness watchdog.
//!
//! DESIGN
//! ======
//! Lifecycle signals (mount, visibility, focus, network restored) arrive in
//! bursts. When the store is already ready a signal does nothing. Otherwise
//! the first signal starts one bounded attempt: join the in-flight resync and
//! race it against the ready timeout. Later signals await that same attempt.
//!
//! Any commit that makes the store ready ends the attempt and drops its
//! timer, whether it came from this attempt's resync or from a newer one
//! (sign-in, LOGOUT). On timeout the store is patched to `is_ready = true`
//! with a timeout error, keeping the last known identity.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::AuthError;
use crate::resync::{ResyncMode, Resyncer};
use crate::state::{AuthState, AuthStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleSignal {
    Mount,
    Visible,
    Focus,
    Online,
}

impl LifecycleSignal {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mount => "mount",
            Self::Visible => "visible",
            Self::Focus => "focus",
            Self::Online => "online",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogOutcome {
    /// Store was ready when the signal arrived; nothing started.
    AlreadyReady,
    /// Store became ready before the bound.
    Resolved,
    /// Bound elapsed; readiness was forced with a timeout error.
    TimedOut,
}

type Attempt = Shared<BoxFuture<'static, WatchdogOutcome>>;

struct WatchdogInner {
    store: AuthStore,
    resyncer: Resyncer,
    ready_timeout: Duration,
    attempt: Mutex<Option<Attempt>>,
    attempts: AtomicUsize,
}

#[derive(Clone)]
pub struct ReadinessWatchdog {
    inner: Arc<WatchdogInner>,
}

impl ReadinessWatchdog {
    #[must_use]
    pub fn new(store: AuthStore, resyncer: Resyncer, ready_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(WatchdogInner {
                store,
                resyncer,
                ready_timeout,
                attempt: Mutex::new(None),
                attempts: AtomicUsize::new(0),
            }),
        }
    }

    /// Handle one lifecycle signal and wait for readiness to settle.
    pub async fn on_signal(&self, signal: LifecycleSignal) -> WatchdogOutcome {
        match self.arm(signal) {
            Some(attempt) => attempt.await,
            None => WatchdogOutcome::AlreadyReady,
        }
    }

    /// Fire-and-forget variant of [`Self::on_signal`].
    pub fn notify(&self, signal: LifecycleSignal) {
        drop(self.arm(signal));
    }

    /// Number of bounded attempts started so far.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    fn arm(&self, signal: LifecycleSignal) -> Option<Attempt> {
        let signal_name = signal.as_str();
        if self.inner.store.snapshot().is_ready {
            debug!(signal = signal_name, "store ready; signal ignored");
            return None;
        }

        let mut slot = self
            .inner
            .attempt
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(attempt) = slot.as_ref() {
            debug!(signal = signal_name, "joined running readiness attempt");
            return Some(attempt.clone());
        }

        // Slot stays locked until the attempt is stored; the task clears it.
        let task = tokio::spawn(run(Arc::clone(&self.inner), signal));
        let attempt = async move { task.await.unwrap_or(WatchdogOutcome::TimedOut) }
            .boxed()
            .shared();
        *slot = Some(attempt.clone());
        self.inner.attempts.fetch_add(1, Ordering::SeqCst);
        Some(attempt)
    }
}

async fn run(inner: Arc<WatchdogInner>, signal: LifecycleSignal) -> WatchdogOutcome {
    let signal_name = signal.as_str();
    let rx = inner.store.subscribe();
    // The resync task runs on its own; readiness is observed through the store
    // so a superseding resync ends this attempt too.
    drop(inner.resyncer.trigger(ResyncMode::Join, signal_name));

    let outcome = tokio::select! {
        () = became_ready(rx) => {
            debug!(signal = signal_name, "readiness resolved");
            WatchdogOutcome::Resolved
        }
        () = tokio::time::sleep(inner.ready_timeout) => {
            let error = AuthError::timeout(inner.ready_timeout);
            let mut forced = false;
            inner.store.update(|s| {
                if !s.is_ready {
                    s.is_ready = true;
                    s.error = Some(error.clone());
                    forced = true;
                }
            });
            if forced {
                warn!(signal = signal_name, error = %error, "readiness check timed out; showing last known state");
                WatchdogOutcome::TimedOut
            } else {
                WatchdogOutcome::Resolved
            }
        }
    };

    inner
        .attempt
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    if outcome == WatchdogOutcome::Resolved {
        let state = inner.store.snapshot();
        info!(signal = signal_name, authenticated = state.is_authenticated, "auth ready");
    }
    outcome
}

async fn became_ready(mut rx: watch::Receiver<AuthState>) {
    if rx.wait_for(|s| s.is_ready).await.is_err() {
        // Store dropped; only the timer can finish the attempt now.
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
#[path = "watchdog_test.rs"]
mod watchdog_test;
