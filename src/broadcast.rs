//! Cross-tab sign-out propagation.
//!
//! ARCHITECTURE
//! ============
//! Tabs of one origin share no memory. The only synchronization primitive is
//! a best-effort broadcast channel carrying JSON payloads. A local sign-out
//! posts `LOGOUT`; every receiver (including the sender) force-commits the
//! signed-out shape without asking its own authority, so no tab stays
//! authenticated until its next refresh timer fires.
//!
//! Receiving `LOGOUT` twice is harmless: the second commit changes nothing.
//! A receiver that lagged behind the channel treats the gap as a `LOGOUT`.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::AuthError;
use crate::state::{AuthState, AuthStore};

// =============================================================================
// MESSAGE
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BroadcastMessage {
    Logout {
        /// Milliseconds since the Unix epoch at announcement time.
        timestamp: u64,
    },
}

impl BroadcastMessage {
    #[must_use]
    pub fn logout_now() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        Self::Logout { timestamp }
    }
}

// =============================================================================
// CHANNEL
// =============================================================================

/// Same-origin announcement channel.
pub trait TabChannel: Send + Sync {
    /// # Errors
    ///
    /// Returns `BroadcastDelivery` when the payload could not be handed off.
    fn post(&self, payload: &str) -> Result<(), AuthError>;

    fn subscribe(&self) -> broadcast::Receiver<String>;
}

/// In-process channel. Clones are the same channel, one clone per tab.
#[derive(Clone)]
pub struct LocalChannel {
    tx: broadcast::Sender<String>,
}

impl LocalChannel {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }
}

impl TabChannel for LocalChannel {
    fn post(&self, payload: &str) -> Result<(), AuthError> {
        self.tx
            .send(payload.to_owned())
            .map(|_| ())
            .map_err(|_| AuthError::BroadcastDelivery { reason: "no tab is listening".to_owned() })
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

// =============================================================================
// COORDINATOR
// =============================================================================

#[derive(Clone)]
pub struct CrossTabCoordinator {
    channel: std::sync::Arc<dyn TabChannel>,
    store: AuthStore,
    tab_id: Uuid,
}

impl CrossTabCoordinator {
    #[must_use]
    pub fn new(channel: std::sync::Arc<dyn TabChannel>, store: AuthStore, tab_id: Uuid) -> Self {
        Self { channel, store, tab_id }
    }

    /// Tell every tab of this origin to give up its session.
    ///
    /// # Errors
    ///
    /// Returns `BroadcastDelivery` on failure. Delivery is not retried; the
    /// next authority event reconciles instead.
    pub fn announce_logout(&self) -> Result<(), AuthError> {
        let message = BroadcastMessage::logout_now();
        let payload = serde_json::to_string(&message)
            .map_err(|e| AuthError::BroadcastDelivery { reason: e.to_string() })?;
        self.channel.post(&payload).inspect_err(|e| {
            warn!(tab_id = %self.tab_id, error = %e, "logout broadcast not delivered");
        })?;
        debug!(tab_id = %self.tab_id, "logout broadcast posted");
        Ok(())
    }

    /// Apply a received message. Bypasses any in-flight resync.
    pub fn receive(&self, message: &BroadcastMessage) {
        match message {
            BroadcastMessage::Logout { timestamp } => {
                let was_authenticated = self.store.snapshot().is_authenticated;
                self.store.force(AuthState::reset_signed_out);
                if was_authenticated {
                    info!(tab_id = %self.tab_id, timestamp, "signed out by another tab");
                }
            }
        }
    }

    /// Decode and apply a raw payload. Unknown payloads are ignored.
    pub fn receive_payload(&self, payload: &str) {
        match serde_json::from_str::<BroadcastMessage>(payload) {
            Ok(message) => self.receive(&message),
            Err(e) => debug!(tab_id = %self.tab_id, error = %e, "ignoring unrecognized broadcast"),
        }
    }

    /// Listen for announcements until the channel closes.
    pub fn spawn(&self) -> JoinHandle<()> {
        let coordinator = self.clone();
        let mut rx = self.channel.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => coordinator.receive_payload(&payload),
                    Err(RecvError::Lagged(skipped)) => {
                        // LOGOUT is the only message, so a gap may have held one.
                        warn!(tab_id = %coordinator.tab_id, skipped, "broadcast receiver lagged; signing out");
                        coordinator.receive(&BroadcastMessage::logout_now());
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
#[path = "broadcast_test.rs"]
mod broadcast_test;
