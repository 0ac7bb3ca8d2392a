//! Client-side auth state synchronization.
//!
//! Keeps each tab's view of "who is signed in" consistent with an external
//! session authority, with the other tabs of the same origin, and with a
//! persisted bootstrap record. Pages only ever observe
//! `{is_ready, is_authenticated, error}`; every failure is handled here.
//!
//! ARCHITECTURE
//! ============
//! - `state`: the store and its generation-ordered commits
//! - `listener`: authority events to store commits
//! - `resync`: serialized, deduplicated authority reads
//! - `broadcast`: cross-tab LOGOUT propagation
//! - `watchdog`: bounded readiness on lifecycle signals
//! - `gate` / `guard`: route access and page data loading
//! - `record`: persisted bootstrap hint
//! - `tab`: one tab wired together

pub mod authority;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod gate;
pub mod guard;
pub mod listener;
pub mod record;
pub mod resync;
pub mod state;
pub mod tab;
pub mod watchdog;

#[cfg(test)]
pub mod test_helpers;

pub use authority::{Session, SessionAuthority, SessionEvent, SessionEventKind, SignOutScope};
pub use broadcast::{CrossTabCoordinator, LocalChannel, TabChannel};
pub use config::SyncConfig;
pub use error::AuthError;
pub use gate::{GateView, Navigator, ProtectedRouteGate, RouteAccess};
pub use guard::{DataLoadGuard, LoadOutcome, LoadPhase};
pub use record::{FileStorage, MemoryStorage, PersistentAuthRecord, RecordStorage};
pub use state::{AuthState, AuthStore, Profile, User};
pub use tab::AuthSync;
pub use watchdog::{LifecycleSignal, ReadinessWatchdog, WatchdogOutcome};
