use super::*;
use crate::authority::SessionAuthority;
use crate::authority::memory::{MemoryAuthority, ReadBehavior};
use crate::broadcast::{LocalChannel, TabChannel};
use crate::resync::ResyncOutcome;
use crate::state::User;
use crate::test_helpers::{self, alice, authority_with, session_for};
use std::sync::Arc;
use std::time::Duration;

struct Fixture {
    authority: Arc<MemoryAuthority>,
    store: AuthStore,
    resyncer: Resyncer,
    listener: AuthEventListener,
    channel: LocalChannel,
}

fn fixture(authority: Arc<MemoryAuthority>, initial: AuthState) -> Fixture {
    let store = AuthStore::new(initial);
    let resyncer = Resyncer::new(authority.clone(), store.clone(), &test_helpers::test_config());
    let channel = LocalChannel::new(8);
    let tab_id = Uuid::new_v4();
    let coordinator = CrossTabCoordinator::new(Arc::new(channel.clone()), store.clone(), tab_id);
    let listener = AuthEventListener::new(store.clone(), resyncer.clone(), coordinator, tab_id);
    Fixture { authority, store, resyncer, listener, channel }
}

fn refresh_for(user: User) -> SessionEvent {
    SessionEvent::new(SessionEventKind::TokenRefreshed, Some(session_for(user)))
}

async fn expect_resync(action: ListenerAction) -> ResyncOutcome {
    match action {
        ListenerAction::Resync(handle) => handle.outcome().await,
        ListenerAction::Skipped => panic!("expected resync, got skip"),
        ListenerAction::SignedOut => panic!("expected resync, got sign-out"),
    }
}

// =============================================================================
// should_skip_refresh
// =============================================================================

#[test]
fn skip_when_all_three_conditions_hold() {
    let state = AuthState::resolved(alice(), None, "admin");
    assert!(should_skip_refresh(&state, Some(&session_for(alice()))));
}

#[test]
fn no_skip_for_different_user() {
    let state = AuthState::resolved(alice(), None, "admin");
    let other = User { id: "u-mallory".into(), ..alice() };
    assert!(!should_skip_refresh(&state, Some(&session_for(other))));
}

#[test]
fn no_skip_when_not_authenticated() {
    assert!(!should_skip_refresh(&AuthState::signed_out(), Some(&session_for(alice()))));
}

#[test]
fn no_skip_when_user_missing_even_if_flag_claims_authenticated() {
    // Out-of-band clear: the flag survived but the user did not.
    let state = AuthState { is_authenticated: true, is_ready: true, ..AuthState::default() };
    assert!(!should_skip_refresh(&state, Some(&session_for(alice()))));
}

#[test]
fn no_skip_without_event_session() {
    let state = AuthState::resolved(alice(), None, "admin");
    assert!(!should_skip_refresh(&state, None));
}

// =============================================================================
// handle
// =============================================================================

#[tokio::test]
async fn matching_refresh_is_skipped_without_authority_call() {
    let f = fixture(authority_with(Some(alice())), AuthState::resolved(alice(), None, "admin"));
    let action = f.listener.handle(&refresh_for(alice()));
    assert!(matches!(action, ListenerAction::Skipped));
    assert_eq!(f.authority.session_reads(), 0);
}

#[tokio::test]
async fn refresh_after_out_of_band_clear_resyncs() {
    // Regression: the store was reset while the authority kept a live session.
    let f = fixture(authority_with(Some(alice())), AuthState::signed_out());

    let outcome = expect_resync(f.listener.handle(&refresh_for(alice()))).await;

    assert_eq!(outcome, ResyncOutcome::Applied { authenticated: true });
    assert_eq!(f.store.snapshot().user_id(), Some("u-alice"));
}

#[tokio::test(start_paused = true)]
async fn refresh_after_clear_does_not_join_stale_resync() {
    let authority = authority_with(Some(alice()));
    authority.set_read_behavior(ReadBehavior::Delay(Duration::from_secs(2)));
    let f = fixture(authority, AuthState::resolved(alice(), None, "admin"));

    // In flight when the store is cleared out of band; its ticket is now stale.
    let stale = f.resyncer.trigger(ResyncMode::Join, "visible");
    f.store.force(AuthState::reset_signed_out);

    let outcome = expect_resync(f.listener.handle(&refresh_for(alice()))).await;

    assert_eq!(outcome, ResyncOutcome::Applied { authenticated: true });
    assert_eq!(stale.outcome().await, ResyncOutcome::Dropped);
    assert!(f.store.snapshot().is_authenticated);
    assert_eq!(f.authority.session_reads(), 2);
}

#[tokio::test]
async fn signed_in_always_resyncs() {
    let f = fixture(authority_with(Some(alice())), AuthState::resolved(alice(), None, "admin"));
    let event = SessionEvent::new(SessionEventKind::SignedIn, Some(session_for(alice())));
    expect_resync(f.listener.handle(&event)).await;
    assert_eq!(f.authority.session_reads(), 1);
}

#[tokio::test]
async fn user_updated_picks_up_new_attributes() {
    let authority = authority_with(Some(alice()));
    let f = fixture(authority.clone(), AuthState::resolved(alice(), None, "admin"));
    let session = authority.update_user(|u| u.name = "Alice Renamed".into()).unwrap();

    let event = SessionEvent::new(SessionEventKind::UserUpdated, Some(session));
    expect_resync(f.listener.handle(&event)).await;

    assert_eq!(f.store.snapshot().user.unwrap().name, "Alice Renamed");
}

#[tokio::test]
async fn signed_out_commits_and_announces() {
    let f = fixture(authority_with(None), AuthState::resolved(alice(), None, "admin"));
    let mut tabs = f.channel.subscribe();

    let action = f.listener.handle(&SessionEvent::new(SessionEventKind::SignedOut, None));

    assert!(matches!(action, ListenerAction::SignedOut));
    assert_eq!(f.store.snapshot(), AuthState::signed_out());
    let payload = tabs.try_recv().unwrap();
    assert!(payload.contains("LOGOUT"));
}

#[tokio::test(start_paused = true)]
async fn signed_out_bypasses_in_flight_resync() {
    let authority = authority_with(Some(alice()));
    authority.set_read_behavior(ReadBehavior::Delay(Duration::from_secs(2)));
    let f = fixture(authority, AuthState::initial());

    let ListenerAction::Resync(pending) = f.listener.handle(&SessionEvent::new(SessionEventKind::Initial, None)) else {
        panic!("initial should resync");
    };
    f.listener.handle(&SessionEvent::new(SessionEventKind::SignedOut, None));

    assert_eq!(pending.outcome().await, ResyncOutcome::Dropped);
    assert_eq!(f.store.snapshot(), AuthState::signed_out());
}

#[tokio::test(start_paused = true)]
async fn initial_events_share_one_resync() {
    let authority = authority_with(Some(alice()));
    authority.set_read_behavior(ReadBehavior::Delay(Duration::from_millis(500)));
    let f = fixture(authority, AuthState::initial());
    let initial = SessionEvent::new(SessionEventKind::Initial, None);

    let a = expect_resync(f.listener.handle(&initial));
    let b = expect_resync(f.listener.handle(&initial));
    let (a, b) = tokio::join!(a, b);

    assert_eq!(a, b);
    assert_eq!(f.resyncer.started(), 1);
}

// =============================================================================
// spawned loop
// =============================================================================

#[tokio::test]
async fn spawned_listener_follows_authority_events() {
    let f = fixture(authority_with(None), AuthState::initial());
    let task = f.listener.spawn(f.authority.subscribe());
    let mut rx = f.store.subscribe();

    f.authority.sign_in(alice(), Some(10));
    tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|s| s.is_authenticated))
        .await
        .unwrap()
        .unwrap();

    f.authority.sign_out(crate::authority::SignOutScope::Local).await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|s| s.is_ready && !s.is_authenticated))
        .await
        .unwrap()
        .unwrap();
    task.abort();
}

#[test]
fn authenticated_invariant_holds_across_event_sequences() {
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
    runtime.block_on(async {
        let authority = authority_with(None);
        let f = fixture(authority.clone(), AuthState::initial());
        let mut rx = f.store.subscribe();
        let kinds = [
            SessionEventKind::Initial,
            SessionEventKind::SignedIn,
            SessionEventKind::TokenRefreshed,
            SessionEventKind::UserUpdated,
            SessionEventKind::SignedOut,
            SessionEventKind::TokenRefreshed,
            SessionEventKind::SignedIn,
        ];
        for (step, kind) in kinds.into_iter().enumerate() {
            if matches!(kind, SessionEventKind::SignedIn) {
                authority.vault().set_session(Some(session_for(alice())));
            }
            if matches!(kind, SessionEventKind::SignedOut) {
                authority.vault().set_session(None);
            }
            let event = SessionEvent::new(kind, authority.vault().session());
            if let ListenerAction::Resync(handle) = f.listener.handle(&event) {
                handle.outcome().await;
            }
            let state = rx.borrow_and_update().clone();
            assert!(state.invariants_hold(), "step {step} ({kind:?}) broke invariants: {state:?}");
            assert_eq!(state.is_authenticated, state.user.is_some());
        }
    });
}
