//! Error taxonomy for the auth synchronization core.
//!
//! ERROR HANDLING
//! ==============
//! Every failure is handled inside the core. Pages only ever observe the
//! `error` field of `AuthState`, which is why `AuthError` is `Clone + Eq`:
//! it is stored, compared, and rendered, never propagated as a panic.

/// Failures recognized by the synchronization core.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// Network or transport failure while reading the session authority.
    #[error("session authority unavailable: {reason}")]
    AuthorityUnavailable { reason: String },

    /// A bounded check ran out of time. Also used as the watchdog's
    /// timeout marker when it forces readiness.
    #[error("authentication check timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    /// Local state and the authority disagree.
    #[error("local auth state disagrees with session authority: {detail}")]
    Desync { detail: String },

    /// The persistent record held a value that could not be parsed.
    #[error("persistent auth record is malformed: {reason}")]
    MalformedRecord { reason: String },

    /// A cross-tab announcement could not be delivered.
    #[error("cross-tab broadcast failed: {reason}")]
    BroadcastDelivery { reason: String },
}

impl AuthError {
    /// Stable machine-readable code for logs and UI mapping.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::AuthorityUnavailable { .. } => "E_AUTHORITY_UNAVAILABLE",
            Self::Timeout { .. } => "E_AUTH_TIMEOUT",
            Self::Desync { .. } => "E_AUTH_DESYNC",
            Self::MalformedRecord { .. } => "E_MALFORMED_RECORD",
            Self::BroadcastDelivery { .. } => "E_BROADCAST_DELIVERY",
        }
    }

    /// Whether a later resync may clear this condition on its own.
    ///
    /// Broadcast failures are never retried; the next authority event
    /// reconciles instead. A malformed record is cleared, not retried.
    #[must_use]
    pub fn retryable(&self) -> bool {
        matches!(self, Self::AuthorityUnavailable { .. } | Self::Timeout { .. } | Self::Desync { .. })
    }

    pub(crate) fn timeout(after: std::time::Duration) -> Self {
        Self::Timeout { after_ms: u64::try_from(after.as_millis()).unwrap_or(u64::MAX) }
    }
}

#[cfg(test)]
#[path = "error_test.rs"]
mod error_test;
