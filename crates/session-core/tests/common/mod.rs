//! Shared test doubles: a recording engine, bridge, tone sink, and
//! static collaborators.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use softcall_engine_api::{
    Account, AudioBridge, Contact, ContactResolver, EngineResult, EngineSessionId, LookupId,
    MediaKind, PgpEngine, Route, Settings, SettingsStore, SignalingEngine, SipUri, StreamSpec,
    TransferKind, Transport,
};
use softcall_session_core::{RingtonePlan, SessionManager, ToneSink};

pub const ALICE: &str = "alice@example.com";
pub const BOB: &str = "bob@example.com";

pub fn account() -> Account {
    Account {
        id: ALICE.to_string(),
        uri: SipUri::parse(ALICE),
        display_name: Some("Alice".to_string()),
        outbound_proxy: None,
    }
}

pub fn route() -> Route {
    Route {
        address: "proxy.example.com".to_string(),
        port: 5060,
        transport: Transport::Udp,
    }
}

pub fn audio() -> Vec<StreamSpec> {
    vec![StreamSpec::new(MediaKind::Audio)]
}

/// Engine double: accepts everything, records call names, and remembers
/// the ids it handed out so tests can feed matching events back in.
#[derive(Default)]
pub struct MockEngine {
    calls: Mutex<Vec<String>>,
    lookups: Mutex<Vec<LookupId>>,
    sessions: Mutex<Vec<EngineSessionId>>,
    pub bridge: Arc<MockBridge>,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn has_call(&self, prefix: &str) -> bool {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .any(|c| c.starts_with(prefix))
    }

    pub fn last_lookup(&self) -> LookupId {
        *self.lookups.lock().unwrap().last().expect("no lookup started")
    }

    pub fn last_session(&self) -> EngineSessionId {
        *self
            .sessions
            .lock()
            .unwrap()
            .last()
            .expect("no engine session created")
    }
}

#[async_trait]
impl SignalingEngine for MockEngine {
    async fn start_lookup(
        &self,
        target: &SipUri,
        _outbound_proxy: Option<&SipUri>,
    ) -> EngineResult<LookupId> {
        self.record(format!("start_lookup {target}"));
        let lookup = LookupId::new();
        self.lookups.lock().unwrap().push(lookup);
        Ok(lookup)
    }

    async fn create_session(
        &self,
        _account: &Account,
        target: &SipUri,
        _routes: &[Route],
        _streams: &[StreamSpec],
    ) -> EngineResult<EngineSessionId> {
        self.record(format!("create_session {target}"));
        let session = EngineSessionId::new();
        self.sessions.lock().unwrap().push(session);
        Ok(session)
    }

    async fn accept_session(
        &self,
        _session: EngineSessionId,
        _streams: &[StreamSpec],
    ) -> EngineResult<()> {
        self.record("accept_session");
        Ok(())
    }

    async fn reject_session(&self, _session: EngineSessionId, code: u16) -> EngineResult<()> {
        self.record(format!("reject_session {code}"));
        Ok(())
    }

    async fn end_session(&self, _session: EngineSessionId) -> EngineResult<()> {
        self.record("end_session");
        Ok(())
    }

    async fn transfer_session(
        &self,
        _session: EngineSessionId,
        target: &SipUri,
        _replaced: Option<EngineSessionId>,
    ) -> EngineResult<()> {
        self.record(format!("transfer_session {target}"));
        Ok(())
    }

    async fn add_streams(
        &self,
        _session: EngineSessionId,
        streams: &[StreamSpec],
    ) -> EngineResult<()> {
        self.record(format!("add_streams {}", streams.len()));
        Ok(())
    }

    async fn remove_streams(
        &self,
        _session: EngineSessionId,
        kinds: &[MediaKind],
    ) -> EngineResult<()> {
        self.record(format!("remove_streams {}", kinds.len()));
        Ok(())
    }

    async fn accept_proposal(
        &self,
        _session: EngineSessionId,
        _kinds: &[MediaKind],
    ) -> EngineResult<()> {
        self.record("accept_proposal");
        Ok(())
    }

    async fn reject_proposal(&self, _session: EngineSessionId) -> EngineResult<()> {
        self.record("reject_proposal");
        Ok(())
    }

    async fn hold_session(&self, _session: EngineSessionId, on_hold: bool) -> EngineResult<()> {
        self.record(format!("hold_session {on_hold}"));
        Ok(())
    }

    async fn mute_stream(
        &self,
        _session: EngineSessionId,
        kind: MediaKind,
        muted: bool,
    ) -> EngineResult<()> {
        self.record(format!("mute_stream {kind} {muted}"));
        Ok(())
    }

    async fn send_dtmf(&self, _session: EngineSessionId, digit: char) -> EngineResult<()> {
        self.record(format!("send_dtmf {digit}"));
        Ok(())
    }

    async fn start_recording(&self, _session: EngineSessionId) -> EngineResult<()> {
        self.record("start_recording");
        Ok(())
    }

    async fn stop_recording(&self, _session: EngineSessionId) -> EngineResult<()> {
        self.record("stop_recording");
        Ok(())
    }

    async fn create_audio_bridge(&self) -> EngineResult<Arc<dyn AudioBridge>> {
        self.record("create_audio_bridge");
        Ok(self.bridge.clone())
    }

    async fn add_conference_participant(
        &self,
        _session: EngineSessionId,
        participant: &SipUri,
    ) -> EngineResult<()> {
        self.record(format!("add_participant {participant}"));
        Ok(())
    }

    async fn remove_conference_participant(
        &self,
        _session: EngineSessionId,
        participant: &SipUri,
    ) -> EngineResult<()> {
        self.record(format!("remove_participant {participant}"));
        Ok(())
    }

    async fn start_transfer(
        &self,
        _account: &Account,
        peer: &SipUri,
        _routes: &[Route],
        _file: &Path,
        _size: u64,
        _hash: Option<&str>,
        _kind: TransferKind,
    ) -> EngineResult<EngineSessionId> {
        self.record(format!("start_transfer {peer}"));
        let session = EngineSessionId::new();
        self.sessions.lock().unwrap().push(session);
        Ok(session)
    }
}

/// Bridge double counting membership changes.
#[derive(Default)]
pub struct MockBridge {
    pub adds: AtomicUsize,
    pub removes: AtomicUsize,
    pub holds: AtomicUsize,
    pub unholds: AtomicUsize,
}

#[async_trait]
impl AudioBridge for MockBridge {
    async fn add_stream(&self, _session: EngineSessionId) -> EngineResult<()> {
        self.adds.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove_stream(&self, _session: EngineSessionId) -> EngineResult<()> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn hold(&self) -> EngineResult<()> {
        self.holds.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn unhold(&self) -> EngineResult<()> {
        self.unholds.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stream_count(&self) -> usize {
        self.adds.load(Ordering::SeqCst) - self.removes.load(Ordering::SeqCst)
    }
}

/// Contact resolution double: identity mapping, no address book.
pub struct EchoContacts;

impl ContactResolver for EchoContacts {
    fn resolve(&self, uri: &SipUri) -> Contact {
        Contact::unknown(uri.clone())
    }
}

/// Fixed settings snapshot.
pub struct StaticSettings(pub Settings);

impl SettingsStore for StaticSettings {
    fn settings(&self) -> Settings {
        self.0.clone()
    }
}

pub fn default_settings(history_dir: &Path) -> Settings {
    Settings {
        accounts: vec![account()],
        history_directory: history_dir.to_path_buf(),
        download_directory: history_dir.to_path_buf(),
        ..Settings::default()
    }
}

/// Tone sink recording every applied plan.
#[derive(Default)]
pub struct RecordingTones {
    pub plans: Mutex<Vec<RingtonePlan>>,
}

impl ToneSink for RecordingTones {
    fn apply(&self, plan: &RingtonePlan) {
        self.plans.lock().unwrap().push(*plan);
    }
}

/// PGP double: "encrypts" by copying to `<file>.asc`, decrypts by
/// stripping the extension.
pub struct MockPgp;

#[async_trait]
impl PgpEngine for MockPgp {
    async fn encrypt_file(&self, path: &Path, _recipient: &SipUri) -> EngineResult<PathBuf> {
        let out = PathBuf::from(format!("{}.asc", path.display()));
        tokio::fs::copy(path, &out)
            .await
            .map_err(|e| softcall_engine_api::EngineError::helper(e.to_string()))?;
        Ok(out)
    }

    async fn decrypt_file(&self, path: &Path) -> EngineResult<PathBuf> {
        let out = path.with_extension("");
        tokio::fs::copy(path, &out)
            .await
            .map_err(|e| softcall_engine_api::EngineError::helper(e.to_string()))?;
        Ok(out)
    }
}

pub struct TestHarness {
    pub manager: Arc<SessionManager>,
    pub engine: Arc<MockEngine>,
    pub tones: Arc<RecordingTones>,
    pub dir: tempfile::TempDir,
}

/// Build a manager with recording doubles and a temp directory for
/// files and history.
pub async fn harness_with(settings: impl FnOnce(&mut Settings)) -> TestHarness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = default_settings(dir.path());
    settings(&mut config);
    let engine = MockEngine::new();
    let tones = Arc::new(RecordingTones::default());
    let manager = SessionManager::new(
        engine.clone(),
        Arc::new(EchoContacts),
        Arc::new(StaticSettings(config)),
        tones.clone(),
        Some(Arc::new(MockPgp)),
    );
    manager.start().await;
    TestHarness {
        manager,
        engine,
        tones,
        dir,
    }
}

pub async fn harness() -> TestHarness {
    harness_with(|_| {}).await
}

/// Drive an outgoing call all the way to `connected` with the given
/// streams.
pub async fn establish_outgoing(
    h: &TestHarness,
    target: &str,
    streams: Vec<StreamSpec>,
) -> softcall_session_core::SessionId {
    use softcall_engine_api::EngineEvent;

    let id = h
        .manager
        .create_session(ALICE, target, streams.clone(), true)
        .await
        .expect("create_session");
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
        .handle_engine_event(EngineEvent::DidStart { session, streams })
        .await;
    assert_eq!(
        h.manager.session_state(id).await.map(|s| s.to_string()),
        Some("connected".to_string())
    );
    id
}

/// Drain every event currently buffered on a broadcast receiver.
pub fn drain(
    rx: &mut tokio::sync::broadcast::Receiver<softcall_session_core::SessionEvent>,
) -> Vec<softcall_session_core::SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
