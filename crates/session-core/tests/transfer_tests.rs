//! File transfer lifecycle: push, retry, PGP gating, history.

mod common;

use std::time::Duration;

use common::*;
use softcall_engine_api::{EngineEvent, EngineSessionId, Originator, SipUri, TransferKind};
use softcall_session_core::{SessionError, TransferId, TransferPhase};

async fn write_test_file(h: &TestHarness, name: &str, contents: &[u8]) -> std::path::PathBuf {
    let path = h.dir.path().join(name);
    tokio::fs::write(&path, contents).await.unwrap();
    path
}

async fn wait_for_phase(h: &TestHarness, id: TransferId, phase: TransferPhase) {
    for _ in 0..100 {
        if h.manager.transfer_state(id).await.map(|s| s.phase) == Some(phase) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "transfer never reached {phase:?}, still {:?}",
        h.manager.transfer_state(id).await
    );
}

#[tokio::test]
async fn outgoing_push_completes_and_is_recorded() {
    let h = harness().await;
    let path = write_test_file(&h, "photo.jpg", b"jpeg bytes").await;

    let id = h.manager.send_file(ALICE, BOB, &path).await.unwrap();
    assert_eq!(
        h.manager.transfer_state(id).await.unwrap().to_string(),
        "connecting/dns_lookup"
    );

    let lookup = h.engine.last_lookup();
    h.manager
        .handle_engine_event(EngineEvent::LookupSucceeded {
            lookup,
            routes: vec![route()],
        })
        .await;
    assert!(h.engine.has_call("start_transfer"));
    let session = h.engine.last_session();

    h.manager
        .handle_engine_event(EngineEvent::DidStart {
            session,
            streams: Vec::new(),
        })
        .await;
    assert_eq!(
        h.manager.transfer_state(id).await.unwrap().to_string(),
        "connected"
    );

    h.manager
        .handle_engine_event(EngineEvent::TransferProgress {
            session,
            transferred: 10,
            total: 10,
        })
        .await;
    h.manager
        .handle_engine_event(EngineEvent::DidEnd {
            session,
            originator: Originator::Remote,
        })
        .await;

    let (reason, error) = h
        .manager
        .with_transfer(id, |t| (t.end_reason.clone(), t.end_error))
        .await
        .unwrap();
    assert_eq!(reason.as_deref(), Some("Transfer completed"));
    assert!(!error);

    let history = h.manager.transfer_history().await;
    assert_eq!(history.len(), 1);
    assert!(!history[0].error);
    assert_eq!(history[0].size, 10);
}

#[tokio::test]
async fn failed_transfer_retries_with_cached_hash() {
    let h = harness().await;
    let path = write_test_file(&h, "report.pdf", b"pdf bytes").await;

    let id = h.manager.send_file(ALICE, BOB, &path).await.unwrap();
    let original_hash = h
        .manager
        .with_transfer(id, |t| t.selector.as_ref().unwrap().hash.clone())
        .await
        .unwrap();
    assert!(original_hash.is_some());

    let lookup = h.engine.last_lookup();
    h.manager
        .handle_engine_event(EngineEvent::LookupFailed { lookup })
        .await;
    let (phase, error) = h
        .manager
        .with_transfer(id, |t| (t.state().phase, t.end_error))
        .await
        .unwrap();
    assert_eq!(phase, TransferPhase::Ended);
    assert!(error);

    // connect() from ended: re-initializes and goes straight back to
    // the lookup, reusing the hash because the file is unchanged.
    h.manager.connect_transfer(id).await.unwrap();
    assert_eq!(
        h.manager.transfer_state(id).await.unwrap().to_string(),
        "connecting/dns_lookup"
    );
    let retry_hash = h
        .manager
        .with_transfer(id, |t| t.selector.as_ref().unwrap().hash.clone())
        .await
        .unwrap();
    assert_eq!(retry_hash, original_hash);
}

#[tokio::test]
async fn pgp_encryption_gates_connect() {
    let h = harness_with(|s| s.pgp_enabled = true).await;
    let path = write_test_file(&h, "secret.txt", b"top secret").await;

    let id = h.manager.send_file(ALICE, BOB, &path).await.unwrap();
    // While the helper runs, connect is refused.
    match h.manager.transfer_state(id).await.unwrap().phase {
        TransferPhase::Encrypting => {
            let err = h.manager.connect_transfer(id).await.unwrap_err();
            assert!(matches!(err, SessionError::EncryptionPending));
        }
        // The helper may already have finished on a fast runner.
        TransferPhase::Encrypted | TransferPhase::Connecting => {}
        other => panic!("unexpected phase {other:?}"),
    }

    // Encryption completion re-enters connect by itself.
    wait_for_phase(&h, id, TransferPhase::Connecting).await;
    let armored = h
        .manager
        .with_transfer(id, |t| t.selector.as_ref().unwrap().path.clone())
        .await
        .unwrap();
    assert_eq!(armored.extension().and_then(|e| e.to_str()), Some("asc"));
}

#[tokio::test]
async fn oversized_files_skip_pgp() {
    let h = harness_with(|s| {
        s.pgp_enabled = true;
        s.pgp_max_size = 4;
    })
    .await;
    let path = write_test_file(&h, "big.bin", b"way more than four bytes").await;

    let id = h.manager.send_file(ALICE, BOB, &path).await.unwrap();
    // No encryption detour: straight to the lookup.
    assert_eq!(
        h.manager.transfer_state(id).await.unwrap().to_string(),
        "connecting/dns_lookup"
    );
}

#[tokio::test]
async fn incoming_armored_transfer_decrypts_after_the_wire_session() {
    let h = harness().await;
    // The "downloaded" armored payload.
    write_test_file(&h, "notes.txt.asc", b"armored").await;

    let engine_session = EngineSessionId::new();
    h.manager
        .handle_engine_event(EngineEvent::IncomingTransfer {
            session: engine_session,
            account: ALICE.to_string(),
            from: SipUri::parse(BOB),
            filename: "notes.txt.asc".to_string(),
            size: 7,
            kind: TransferKind::Push,
        })
        .await;
    let request = h.manager.pending_requests().await.remove(0);
    assert_eq!(request.priority(), 4);

    h.manager.accept_request(request.id).await.unwrap();
    assert!(h.engine.has_call("accept_session"));

    h.manager
        .handle_engine_event(EngineEvent::DidStart {
            session: engine_session,
            streams: Vec::new(),
        })
        .await;
    h.manager
        .handle_engine_event(EngineEvent::TransferProgress {
            session: engine_session,
            transferred: 7,
            total: 7,
        })
        .await;
    h.manager
        .handle_engine_event(EngineEvent::DidEnd {
            session: engine_session,
            originator: Originator::Remote,
        })
        .await;

    let id = match request.target {
        softcall_session_core::RequestTarget::Transfer(id) => id,
        other => panic!("unexpected target {other:?}"),
    };
    wait_for_phase(&h, id, TransferPhase::Ended).await;
    let (path, error) = h
        .manager
        .with_transfer(id, |t| {
            (t.selector.as_ref().unwrap().path.clone(), t.end_error)
        })
        .await
        .unwrap();
    assert!(!error);
    assert_eq!(path.extension().and_then(|e| e.to_str()), Some("txt"));
}

#[tokio::test]
async fn interrupted_transfer_is_recorded_as_error() {
    let h = harness().await;
    let path = write_test_file(&h, "big.iso", &[0u8; 64]).await;

    let id = h.manager.send_file(ALICE, BOB, &path).await.unwrap();
    let lookup = h.engine.last_lookup();
    h.manager
        .handle_engine_event(EngineEvent::LookupSucceeded {
            lookup,
            routes: vec![route()],
        })
        .await;
    let session = h.engine.last_session();
    h.manager
        .handle_engine_event(EngineEvent::DidStart {
            session,
            streams: Vec::new(),
        })
        .await;
    h.manager
        .handle_engine_event(EngineEvent::TransferProgress {
            session,
            transferred: 16,
            total: 64,
        })
        .await;
    h.manager
        .handle_engine_event(EngineEvent::DidEnd {
            session,
            originator: Originator::Remote,
        })
        .await;

    let error = h.manager.with_transfer(id, |t| t.end_error).await.unwrap();
    assert!(error);
    let history = h.manager.transfer_history().await;
    assert_eq!(history.len(), 1);
    assert!(history[0].error);
}
