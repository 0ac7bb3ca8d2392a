use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use authsync::authority::http::{HttpAuthority, HttpAuthorityConfig};
use authsync::authority::memory::{MemoryAuthority, SessionVault};
use authsync::{AuthState, AuthSync, LocalChannel, MemoryStorage, SessionEventKind, SignOutScope, SyncConfig, User};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let config = SyncConfig::from_env();
    match HttpAuthorityConfig::from_env() {
        Some(http) => run_http(config, &http).await,
        None => {
            run_simulation(config).await;
            ExitCode::SUCCESS
        }
    }
}

/// One tab against a live session endpoint: report the resolved state.
async fn run_http(config: SyncConfig, http: &HttpAuthorityConfig) -> ExitCode {
    let authority = match HttpAuthority::new(http) {
        Ok(authority) => Arc::new(authority),
        Err(e) => {
            tracing::error!(error = %e, "http authority init failed");
            return ExitCode::FAILURE;
        }
    };
    let _poller = authority.spawn_poller();
    let channel = LocalChannel::new(config.event_buffer);
    let bound = config.ready_timeout * 2;
    let tab = AuthSync::start(authority, Arc::new(channel), Arc::new(MemoryStorage::new()), config);

    let state = settle(&tab, "http", bound, |s| s.is_ready).await;
    tracing::info!(
        authenticated = state.is_authenticated,
        user_id = ?state.user_id(),
        error = ?state.error.as_ref().map(authsync::AuthError::code),
        "http tab ready"
    );
    ExitCode::SUCCESS
}

/// Two tabs of one origin sharing a session vault, channel and storage.
async fn run_simulation(config: SyncConfig) {
    let vault = SessionVault::new();
    let channel = LocalChannel::new(config.event_buffer);
    let storage = MemoryStorage::new();
    let bound = config.ready_timeout * 2;

    let authority_a = Arc::new(MemoryAuthority::with_capacity(Arc::clone(&vault), config.event_buffer));
    let authority_b = Arc::new(MemoryAuthority::with_capacity(Arc::clone(&vault), config.event_buffer));
    let tab_a = AuthSync::start(
        authority_a.clone(),
        Arc::new(channel.clone()),
        Arc::new(storage.clone()),
        config.clone(),
    );
    let tab_b = AuthSync::start(authority_b.clone(), Arc::new(channel), Arc::new(storage), config);

    settle(&tab_a, "a", bound, |s| s.is_ready).await;
    settle(&tab_b, "b", bound, |s| s.is_ready).await;

    let user = User {
        id: "u-demo".into(),
        name: "Demo User".into(),
        email: Some("demo@example.com".into()),
        role: None,
    };
    authority_a.sign_in(user, Some(3600));
    // Tab B's own authority client notices the new session.
    authority_b.emit(SessionEventKind::SignedIn, vault.session());
    settle(&tab_a, "a", bound, |s| s.is_authenticated).await;
    settle(&tab_b, "b", bound, |s| s.is_authenticated).await;

    authority_a.refresh_token(3600);
    tokio::time::sleep(Duration::from_millis(50)).await;

    tab_a.sign_out(SignOutScope::Local).await;
    let state = settle(&tab_b, "b", bound, |s| s.is_ready && !s.is_authenticated).await;
    tracing::info!(
        converged = state == AuthState::signed_out(),
        authority_reads_b = authority_b.session_reads(),
        "tab b followed sign-out"
    );
}

async fn settle(tab: &AuthSync, label: &str, bound: Duration, done: impl Fn(&AuthState) -> bool) -> AuthState {
    let mut rx = tab.store().subscribe();
    if tokio::time::timeout(bound, rx.wait_for(|s| done(s))).await.is_err() {
        tracing::warn!(tab = label, "state did not settle in time");
    }
    let state = tab.state();
    tracing::info!(
        tab = label,
        tab_id = %tab.tab_id(),
        ready = state.is_ready,
        authenticated = state.is_authenticated,
        user_id = ?state.user_id(),
        "tab state"
    );
    state
}
