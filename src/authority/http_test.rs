use super::*;
use crate::state::User;

use std::sync::Mutex;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode as AxumStatus;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use tokio::time::timeout;

// =============================================================================
// FAKE AUTHORITY SERVER
// =============================================================================

#[derive(Default)]
struct FakeAuthority {
    session: Option<Session>,
    profiles: Vec<Profile>,
    me_status: Option<u16>,
    logouts: Vec<String>,
}

type Fake = Arc<Mutex<FakeAuthority>>;

#[derive(Deserialize)]
struct LogoutQuery {
    scope: String,
}

async fn me(State(fake): State<Fake>) -> Response {
    let fake = fake.lock().unwrap();
    if let Some(code) = fake.me_status {
        return AxumStatus::from_u16(code).unwrap().into_response();
    }
    match &fake.session {
        Some(session) => Json(session.clone()).into_response(),
        None => AxumStatus::UNAUTHORIZED.into_response(),
    }
}

async fn profile(State(fake): State<Fake>, Path(user_id): Path<String>) -> Response {
    let fake = fake.lock().unwrap();
    match fake.profiles.iter().find(|p| p.user_id == user_id) {
        Some(p) => Json(p.clone()).into_response(),
        None => AxumStatus::NOT_FOUND.into_response(),
    }
}

async fn logout(State(fake): State<Fake>, Query(query): Query<LogoutQuery>) -> Response {
    let mut fake = fake.lock().unwrap();
    fake.logouts.push(query.scope);
    fake.session = None;
    AxumStatus::NO_CONTENT.into_response()
}

async fn serve(fake: Fake) -> String {
    let app = Router::new()
        .route("/api/auth/me", get(me))
        .route("/api/users/{user_id}/profile", get(profile))
        .route("/api/auth/logout", post(logout))
        .with_state(fake);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn carol_session(expires_at: i64) -> Session {
    Session {
        user: User { id: "u-carol".into(), name: "Carol".into(), email: None, role: Some("admin".into()) },
        expires_at: Some(expires_at),
    }
}

async fn authority_for(fake: &Fake) -> Arc<HttpAuthority> {
    let base = serve(fake.clone()).await;
    let mut config = HttpAuthorityConfig::new(format!("{base}/"));
    config.poll_interval = Duration::from_millis(20);
    Arc::new(HttpAuthority::new(&config).unwrap())
}

// =============================================================================
// REQUESTS
// =============================================================================

#[test]
fn config_trims_trailing_slash() {
    let config = HttpAuthorityConfig::new("http://auth.local///");
    assert_eq!(config.base_url, "http://auth.local");
}

#[tokio::test]
async fn get_session_reads_current_user() {
    let fake = Fake::default();
    fake.lock().unwrap().session = Some(carol_session(100));
    let authority = authority_for(&fake).await;
    let session = authority.get_session().await.unwrap().unwrap();
    assert_eq!(session.user_id(), "u-carol");
    assert_eq!(session.expires_at, Some(100));
}

#[tokio::test]
async fn unauthorized_means_signed_out() {
    let fake = Fake::default();
    let authority = authority_for(&fake).await;
    assert_eq!(authority.get_session().await, Ok(None));
}

#[tokio::test]
async fn server_error_is_reported() {
    let fake = Fake::default();
    fake.lock().unwrap().me_status = Some(503);
    let authority = authority_for(&fake).await;
    assert_eq!(authority.get_session().await, Err(AuthorityError::Status { status: 503 }));
}

#[tokio::test]
async fn missing_profile_is_none() {
    let fake = Fake::default();
    fake.lock().unwrap().profiles.push(Profile {
        user_id: "u-carol".into(),
        display_name: "Carol C.".into(),
        is_admin: true,
    });
    let authority = authority_for(&fake).await;
    assert!(authority.fetch_profile("u-carol").await.unwrap().unwrap().is_admin);
    assert_eq!(authority.fetch_profile("u-dave").await, Ok(None));
}

#[tokio::test]
async fn sign_out_posts_scope_and_emits() {
    let fake = Fake::default();
    fake.lock().unwrap().session = Some(carol_session(100));
    let authority = authority_for(&fake).await;
    let mut rx = authority.subscribe();

    authority.sign_out(SignOutScope::Local).await.unwrap();

    assert_eq!(fake.lock().unwrap().logouts, vec!["local".to_owned()]);
    assert_eq!(rx.recv().await.unwrap().kind, SessionEventKind::SignedOut);
}

#[tokio::test]
async fn unreachable_authority_is_network_error() {
    let config = HttpAuthorityConfig::new("http://127.0.0.1:9");
    let authority = HttpAuthority::new(&config).unwrap();
    assert!(matches!(authority.get_session().await, Err(AuthorityError::Network(_))));
}

// =============================================================================
// POLLER
// =============================================================================

#[test]
fn diff_first_observation_is_initial() {
    assert_eq!(diff_sessions(None, None), Some(SessionEventKind::Initial));
}

#[test]
fn diff_detects_sign_in_and_out() {
    let session = carol_session(1);
    assert_eq!(diff_sessions(Some(&None), Some(&session)), Some(SessionEventKind::SignedIn));
    assert_eq!(diff_sessions(Some(&Some(session)), None), Some(SessionEventKind::SignedOut));
}

#[test]
fn diff_detects_refresh_and_user_update() {
    let before = carol_session(1);
    let refreshed = carol_session(2);
    assert_eq!(diff_sessions(Some(&Some(before.clone())), Some(&refreshed)), Some(SessionEventKind::TokenRefreshed));

    let mut renamed = before.clone();
    renamed.user.name = "Caroline".into();
    assert_eq!(diff_sessions(Some(&Some(before.clone())), Some(&renamed)), Some(SessionEventKind::UserUpdated));
    assert_eq!(diff_sessions(Some(&Some(before.clone())), Some(&before)), None);
}

#[test]
fn diff_treats_identity_switch_as_sign_in() {
    let before = carol_session(1);
    let mut other = carol_session(1);
    other.user.id = "u-erin".into();
    assert_eq!(diff_sessions(Some(&Some(before)), Some(&other)), Some(SessionEventKind::SignedIn));
}

#[tokio::test]
async fn poller_emits_initial_then_changes() {
    let fake = Fake::default();
    let authority = authority_for(&fake).await;
    let mut rx = authority.subscribe();
    let poller = authority.spawn_poller();

    let first = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(first.kind, SessionEventKind::Initial);
    assert!(first.session.is_none());

    fake.lock().unwrap().session = Some(carol_session(100));
    let second = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(second.kind, SessionEventKind::SignedIn);

    fake.lock().unwrap().session = Some(carol_session(200));
    let third = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(third.kind, SessionEventKind::TokenRefreshed);

    poller.abort();
}
