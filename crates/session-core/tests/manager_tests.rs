//! Manager-level behavior: incoming request arbitration, ringtone
//! planning, active-session tracking, auto-answer.

mod common;

use std::time::Duration;

use common::*;
use softcall_engine_api::{EngineEvent, EngineSessionId, MediaKind, SipUri, StreamSpec};
use softcall_session_core::{HoldTone, RingTone, SessionEvent};

fn incoming(account: &str, from: &str, kinds: &[MediaKind]) -> EngineEvent {
    EngineEvent::IncomingSession {
        session: EngineSessionId::new(),
        account: account.to_string(),
        from: SipUri::parse(from),
        proposed_streams: kinds.iter().map(|k| StreamSpec::new(*k)).collect(),
        remote_instance_id: None,
    }
}

#[tokio::test]
async fn incoming_requests_are_priority_ordered_and_focused() {
    let h = harness().await;
    let mut rx = h.manager.subscribe();

    h.manager
        .handle_engine_event(incoming(ALICE, "carol@example.com", &[MediaKind::Chat]))
        .await;
    h.manager
        .handle_engine_event(incoming(ALICE, "dave@example.com", &[MediaKind::Audio]))
        .await;
    h.manager
        .handle_engine_event(incoming(
            ALICE,
            "erin@example.com",
            &[MediaKind::ScreenSharing],
        ))
        .await;

    let requests = h.manager.pending_requests().await;
    let priorities: Vec<u8> = requests.iter().map(|r| r.priority()).collect();
    assert_eq!(priorities, vec![0, 2, 3]);

    // The audio request outranks the earlier chat request and owns the
    // focus; nothing else does.
    assert!(requests[0].focused);
    assert!(requests.iter().skip(1).all(|r| !r.focused));

    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::IncomingRequestFocused { .. })));
}

#[tokio::test]
async fn unknown_account_is_rejected_outright() {
    let h = harness().await;
    h.manager
        .handle_engine_event(incoming("mallory@evil.example", BOB, &[MediaKind::Audio]))
        .await;
    assert!(h.engine.has_call("reject_session 480"));
    assert!(h.manager.pending_requests().await.is_empty());
    assert_eq!(h.manager.session_count().await, 0);
}

#[tokio::test]
async fn accepting_an_incoming_request_starts_the_session() {
    let h = harness().await;
    h.manager
        .handle_engine_event(incoming(ALICE, BOB, &[MediaKind::Audio]))
        .await;
    let request = h.manager.pending_requests().await.remove(0);

    h.manager.accept_request(request.id).await.unwrap();
    assert!(h.engine.has_call("accept_session"));
    assert!(h.manager.pending_requests().await.is_empty());
}

#[tokio::test]
async fn rejecting_busy_sends_486() {
    let h = harness().await;
    let mut rx = h.manager.subscribe();
    h.manager
        .handle_engine_event(incoming(ALICE, BOB, &[MediaKind::Audio]))
        .await;
    let request = h.manager.pending_requests().await.remove(0);

    h.manager.reject_request(request.id, true).await.unwrap();
    assert!(h.engine.has_call("reject_session 486"));
    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::SessionDidEnd { reason, error: false, .. } if reason == "Busy here"
    )));
}

#[tokio::test]
async fn auto_answer_fires_for_pending_requests() {
    let h = harness_with(|s| s.auto_answer_delay = Some(Duration::from_millis(20))).await;
    h.manager
        .handle_engine_event(incoming(ALICE, BOB, &[MediaKind::Audio]))
        .await;
    assert_eq!(h.manager.pending_requests().await.len(), 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(h.engine.has_call("accept_session"));
    assert!(h.manager.pending_requests().await.is_empty());
}

#[tokio::test]
async fn ringtone_plan_is_deterministic() {
    let h = harness().await;

    // One outgoing ringing call plus one pending incoming request.
    h.manager
        .create_session(ALICE, BOB, audio(), true)
        .await
        .unwrap();
    let lookup = h.engine.last_lookup();
    h.manager
        .handle_engine_event(EngineEvent::LookupSucceeded {
            lookup,
            routes: vec![route()],
        })
        .await;
    let session = h.engine.last_session();
    h.manager
        .handle_engine_event(EngineEvent::NewOutgoing { session })
        .await;
    h.manager
        .handle_engine_event(EngineEvent::GotRinging { session })
        .await;
    h.manager
        .handle_engine_event(incoming(ALICE, "carol@example.com", &[MediaKind::Audio]))
        .await;

    let applied_before = h.tones.plans.lock().unwrap().len();
    let first = h.manager.update_ringtone().await;
    let second = h.manager.update_ringtone().await;
    assert_eq!(first, second);
    // Nothing changed between the calls, so nothing was re-applied.
    assert_eq!(h.tones.plans.lock().unwrap().len(), applied_before);

    assert_eq!(first.outbound, Some(RingTone::Primary));
    // An outbound tone is already playing: the incoming request only
    // gets the secondary beep.
    assert_eq!(first.inbound, Some(RingTone::Secondary));
    assert_eq!(first.hold, None);
}

#[tokio::test]
async fn inbound_ringtone_downgrades_next_to_a_connected_call() {
    let h = harness().await;
    establish_outgoing(&h, BOB, audio()).await;

    h.manager
        .handle_engine_event(incoming(ALICE, "carol@example.com", &[MediaKind::Audio]))
        .await;
    let plan = h.manager.ringtone().await;
    assert_eq!(plan.outbound, None);
    assert_eq!(plan.inbound, Some(RingTone::Secondary));
}

#[tokio::test]
async fn inbound_ringtone_is_primary_when_idle() {
    let h = harness().await;
    h.manager
        .handle_engine_event(incoming(ALICE, BOB, &[MediaKind::Audio]))
        .await;
    let plan = h.manager.ringtone().await;
    assert_eq!(plan.inbound, Some(RingTone::Primary));
}

#[tokio::test]
async fn held_sessions_silence_the_ringback() {
    let h = harness().await;
    h.manager
        .create_session(ALICE, BOB, audio(), true)
        .await
        .unwrap();
    let lookup = h.engine.last_lookup();
    h.manager
        .handle_engine_event(EngineEvent::LookupSucceeded {
            lookup,
            routes: vec![route()],
        })
        .await;
    let session = h.engine.last_session();
    h.manager
        .handle_engine_event(EngineEvent::NewOutgoing { session })
        .await;
    h.manager
        .handle_engine_event(EngineEvent::GotRinging { session })
        .await;
    assert_eq!(
        h.manager.ringtone().await.outbound,
        Some(RingTone::Primary)
    );

    // Holding the ringing session silences the ringback.
    let id = h.manager.session_ids().await[0];
    h.manager.hold_session(id).await.unwrap();
    assert_eq!(h.manager.ringtone().await.outbound, None);
}

#[tokio::test]
async fn hold_tone_distinguishes_all_from_some() {
    let h = harness().await;
    let first = establish_outgoing(&h, BOB, audio()).await;
    let second = establish_outgoing(&h, "carol@example.com", audio()).await;

    h.manager.hold_session(first).await.unwrap();
    assert_eq!(h.manager.ringtone().await.hold, Some(HoldTone::SomeHeld));

    h.manager.hold_session(second).await.unwrap();
    assert_eq!(h.manager.ringtone().await.hold, Some(HoldTone::AllHeld));

    h.manager.unhold_session(first).await.unwrap();
    h.manager.unhold_session(second).await.unwrap();
    assert_eq!(h.manager.ringtone().await.hold, None);
}

#[tokio::test]
async fn switching_the_active_session_swaps_holds() {
    let h = harness().await;
    let first = establish_outgoing(&h, BOB, audio()).await;
    let second = establish_outgoing(&h, "carol@example.com", audio()).await;

    h.manager.set_active_session(Some(first)).await.unwrap();
    assert_eq!(h.manager.active_session().await, Some(first));

    h.manager.set_active_session(Some(second)).await.unwrap();
    let first_held = h
        .manager
        .with_session(first, |s| s.local_hold)
        .await
        .unwrap();
    let second_held = h
        .manager
        .with_session(second, |s| s.local_hold)
        .await
        .unwrap();
    assert!(first_held);
    assert!(!second_held);
    assert_eq!(h.manager.active_session().await, Some(second));
}
