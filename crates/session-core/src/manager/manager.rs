//! The process-wide session coordinator.
//!
//! [`SessionManager`] owns every [`Session`] and [`FileTransfer`] for
//! the process lifetime, the incoming-request queue, the local
//! conferences, and the ringtone decision. It is an explicitly
//! constructed context object: collaborators are injected, nothing is
//! global.
//!
//! All state lives behind one `RwLock`. Engine callbacks arrive over an
//! `mpsc` channel drained by [`SessionManager::run`], and background
//! completions (PGP helper, auto-answer timers) re-enter through
//! ordinary methods, so every mutation is serialized through the same
//! write lock — the single-writer discipline the original GUI thread
//! provided.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use tokio::sync::{broadcast, mpsc, RwLock};

use softcall_engine_api::{
    ContactResolver, EngineEvent, EngineResult, EngineSessionId, LookupId, MediaKind, Originator,
    PgpEngine, SettingsStore, SignalingEngine, SipUri, StreamSpec, TransferKind,
};

use crate::conference::{ClientConference, ConferenceId, ServerConference};
use crate::errors::{Result, SessionError};
use crate::events::{ProposalOutcome, SessionEvent};
use crate::manager::requests::{IncomingRequest, RequestId, RequestQueue, RequestTarget};
use crate::manager::ringtone::{plan_ringtone, RingtonePlan, ToneSink};
use crate::session::{Direction, Session, SessionId};
use crate::state::{Phase, SessionState, Substate};
use crate::streams::StreamSet;
use crate::transfer::{
    FileSelector, FileTransfer, TransferHistory, TransferId, TransferPhase, TransferRecord,
    TransferState,
};

/// Who an engine session or lookup belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Session(SessionId),
    Transfer(TransferId),
}

#[derive(Default)]
struct ManagerState {
    sessions: HashMap<SessionId, Session>,
    transfers: HashMap<TransferId, FileTransfer>,
    conferences: HashMap<ConferenceId, ClientConference>,
    requests: RequestQueue,
    active: Option<SessionId>,
    ringtone: RingtonePlan,
    by_engine: HashMap<EngineSessionId, Owner>,
    by_lookup: HashMap<LookupId, Owner>,
    history: Option<TransferHistory>,
}

/// Process-wide coordinator for sessions, transfers and conferences.
pub struct SessionManager {
    engine: Arc<dyn SignalingEngine>,
    contacts: Arc<dyn ContactResolver>,
    settings: Arc<dyn SettingsStore>,
    tones: Arc<dyn ToneSink>,
    pgp: Option<Arc<dyn PgpEngine>>,
    event_tx: broadcast::Sender<SessionEvent>,
    state: RwLock<ManagerState>,
    weak_self: Weak<SessionManager>,
}

impl SessionManager {
    pub fn new(
        engine: Arc<dyn SignalingEngine>,
        contacts: Arc<dyn ContactResolver>,
        settings: Arc<dyn SettingsStore>,
        tones: Arc<dyn ToneSink>,
        pgp: Option<Arc<dyn PgpEngine>>,
    ) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(256);
        Arc::new_cyclic(|weak| Self {
            engine,
            contacts,
            settings,
            tones,
            pgp,
            event_tx,
            state: RwLock::new(ManagerState::default()),
            weak_self: weak.clone(),
        })
    }

    /// Load persisted state (the transfer history blob).
    pub async fn start(&self) {
        let directory = self.settings.settings().history_directory;
        let history = TransferHistory::load(&directory).await;
        self.state.write().await.history = Some(history);
    }

    /// Subscribe to the notification stream.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// Drain engine events until the channel closes. Spawn this once
    /// next to the engine.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<EngineEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_engine_event(event).await;
        }
        tracing::info!("engine event channel closed, session manager stopping");
    }

    fn publish(&self, events: Vec<SessionEvent>) {
        for event in events {
            let _ = self.event_tx.send(event);
        }
    }

    // ------ snapshots ------

    pub async fn session_state(&self, id: SessionId) -> Option<SessionState> {
        self.state.read().await.sessions.get(&id).map(|s| s.state())
    }

    pub async fn transfer_state(&self, id: TransferId) -> Option<TransferState> {
        self.state.read().await.transfers.get(&id).map(|t| t.state())
    }

    /// Inspect a session under the lock.
    pub async fn with_session<R>(
        &self,
        id: SessionId,
        f: impl FnOnce(&Session) -> R,
    ) -> Option<R> {
        self.state.read().await.sessions.get(&id).map(f)
    }

    /// Inspect a transfer under the lock.
    pub async fn with_transfer<R>(
        &self,
        id: TransferId,
        f: impl FnOnce(&FileTransfer) -> R,
    ) -> Option<R> {
        self.state.read().await.transfers.get(&id).map(f)
    }

    pub async fn session_count(&self) -> usize {
        self.state.read().await.sessions.len()
    }

    pub async fn session_ids(&self) -> Vec<SessionId> {
        self.state.read().await.sessions.keys().copied().collect()
    }

    pub async fn active_session(&self) -> Option<SessionId> {
        self.state.read().await.active
    }

    pub async fn pending_requests(&self) -> Vec<IncomingRequest> {
        self.state.read().await.requests.iter().cloned().collect()
    }

    pub async fn conference_of(&self, id: SessionId) -> Option<ConferenceId> {
        self.state
            .read()
            .await
            .sessions
            .get(&id)
            .and_then(|s| s.client_conference)
    }

    pub async fn ringtone(&self) -> RingtonePlan {
        self.state.read().await.ringtone
    }

    pub async fn transfer_history(&self) -> Vec<TransferRecord> {
        self.state
            .read()
            .await
            .history
            .as_ref()
            .map(|h| h.records().to_vec())
            .unwrap_or_default()
    }

    // ------ outgoing sessions ------

    /// Create (or reuse) a session toward `target` and optionally
    /// connect it right away.
    ///
    /// Reuse: an idle session for the same contact (state in
    /// `{none, initialized, ended}` and not pending deletion) is
    /// re-initialized instead of allocating a new object.
    pub async fn create_session(
        &self,
        account_id: &str,
        target: &str,
        streams: Vec<StreamSpec>,
        connect: bool,
    ) -> Result<SessionId> {
        let settings = self.settings.settings();
        let account = settings
            .account(account_id)
            .cloned()
            .ok_or_else(|| SessionError::AccountNotFound {
                account: account_id.to_string(),
            })?;
        let uri = SipUri::parse(target);
        let contact = self.contacts.resolve(&uri);
        let streams = StreamSet::from_specs(streams)?;

        let mut state = self.state.write().await;
        let id = match state
            .sessions
            .iter()
            .find(|(_, s)| {
                s.is_reusable() && s.contact.as_ref().map(|c| &c.uri) == Some(&contact.uri)
            })
            .map(|(id, _)| *id)
        {
            Some(id) => {
                tracing::debug!(session = %id, "reusing idle session for {}", contact.uri);
                id
            }
            None => {
                let session = Session::new();
                let id = session.id();
                state.sessions.insert(id, session);
                id
            }
        };
        let mut events = match state.sessions.get_mut(&id) {
            Some(session) => session.init_outgoing(account, contact, uri, streams)?,
            None => return Err(SessionError::SessionNotFound { session: id }),
        };
        if connect {
            self.connect_session_locked(&mut state, id, &mut events)
                .await?;
        }
        self.finish(&mut state, &mut events).await;
        drop(state);
        self.publish(events);
        Ok(id)
    }

    /// Start connecting an initialized outgoing session.
    pub async fn connect_session(&self, id: SessionId) -> Result<()> {
        let mut state = self.state.write().await;
        let mut events = Vec::new();
        let result = self
            .connect_session_locked(&mut state, id, &mut events)
            .await;
        self.finish(&mut state, &mut events).await;
        drop(state);
        self.publish(events);
        result
    }

    async fn connect_session_locked(
        &self,
        state: &mut ManagerState,
        id: SessionId,
        events: &mut Vec<SessionEvent>,
    ) -> Result<()> {
        let (uri, proxy) = {
            let session = state
                .sessions
                .get(&id)
                .ok_or(SessionError::SessionNotFound { session: id })?;
            session.can_connect()?;
            let uri = session
                .uri
                .clone()
                .ok_or_else(|| SessionError::invalid_state("connect", session.state()))?;
            let proxy = session
                .account
                .as_ref()
                .and_then(|a| a.outbound_proxy.clone());
            (uri, proxy)
        };
        let lookup = self.engine.start_lookup(&uri, proxy.as_ref()).await?;
        state.by_lookup.insert(lookup, Owner::Session(id));
        if let Some(session) = state.sessions.get_mut(&id) {
            events.extend(session.start_connect(lookup)?);
        }
        Ok(())
    }

    /// End a session. Fire-and-forget: completion arrives as events.
    pub async fn end_session(&self, id: SessionId) -> Result<()> {
        let mut state = self.state.write().await;
        let mut events = Vec::new();
        let result = self.end_session_locked(&mut state, id, &mut events).await;
        self.finish(&mut state, &mut events).await;
        drop(state);
        self.publish(events);
        result
    }

    async fn end_session_locked(
        &self,
        state: &mut ManagerState,
        id: SessionId,
        events: &mut Vec<SessionEvent>,
    ) -> Result<()> {
        let session = state
            .sessions
            .get_mut(&id)
            .ok_or(SessionError::SessionNotFound { session: id })?;
        let engine_session = session.engine_session;
        let (session_events, needs_engine_end) = session.end();
        events.extend(session_events);
        if needs_engine_end {
            if let Some(engine_session) = engine_session {
                if let Err(e) = self.engine.end_session(engine_session).await {
                    tracing::warn!(session = %id, "engine end failed: {e}");
                }
            }
        }
        Ok(())
    }

    /// Explicitly delete a session (ending it first when live).
    pub async fn delete_session(&self, id: SessionId) -> Result<()> {
        let mut state = self.state.write().await;
        let session = state
            .sessions
            .get_mut(&id)
            .ok_or(SessionError::SessionNotFound { session: id })?;
        let engine_session = session.engine_session;
        let (mut events, needs_engine_end) = session.delete();
        if needs_engine_end {
            if let Some(engine_session) = engine_session {
                if let Err(e) = self.engine.end_session(engine_session).await {
                    tracing::warn!(session = %id, "engine end failed: {e}");
                }
            }
        }
        self.finish(&mut state, &mut events).await;
        drop(state);
        self.publish(events);
        Ok(())
    }

    // ------ mid-call operations ------

    /// Propose adding streams to a connected session.
    pub async fn add_streams(&self, id: SessionId, specs: Vec<StreamSpec>) -> Result<()> {
        let mut state = self.state.write().await;
        let mut events = Vec::new();
        let result = async {
            let session = state
                .sessions
                .get_mut(&id)
                .ok_or(SessionError::SessionNotFound { session: id })?;
            let engine_session = session
                .engine_session
                .ok_or_else(|| SessionError::invalid_state("add_stream", session.state()))?;
            events.extend(session.propose_add_streams(specs.clone())?);
            if let Err(e) = self.engine.add_streams(engine_session, &specs).await {
                tracing::warn!(session = %id, "stream proposal failed at the engine: {e}");
                events.extend(session.handle_proposal_rejected(ProposalOutcome::Failed));
            }
            Ok(())
        }
        .await;
        self.finish(&mut state, &mut events).await;
        drop(state);
        self.publish(events);
        result
    }

    /// Propose removing streams from a connected session.
    pub async fn remove_streams(&self, id: SessionId, kinds: Vec<MediaKind>) -> Result<()> {
        let mut state = self.state.write().await;
        let mut events = Vec::new();
        let result = async {
            let session = state
                .sessions
                .get_mut(&id)
                .ok_or(SessionError::SessionNotFound { session: id })?;
            let engine_session = session
                .engine_session
                .ok_or_else(|| SessionError::invalid_state("remove_stream", session.state()))?;
            events.extend(session.propose_remove_streams(&kinds)?);
            if let Err(e) = self.engine.remove_streams(engine_session, &kinds).await {
                tracing::warn!(session = %id, "stream removal failed at the engine: {e}");
                events.extend(session.handle_proposal_rejected(ProposalOutcome::Failed));
            }
            Ok(())
        }
        .await;
        self.finish(&mut state, &mut events).await;
        drop(state);
        self.publish(events);
        result
    }

    /// Hold one session.
    pub async fn hold_session(&self, id: SessionId) -> Result<()> {
        self.set_session_hold(id, true).await
    }

    /// Resume one session.
    pub async fn unhold_session(&self, id: SessionId) -> Result<()> {
        self.set_session_hold(id, false).await
    }

    async fn set_session_hold(&self, id: SessionId, hold: bool) -> Result<()> {
        let mut state = self.state.write().await;
        let mut events = Vec::new();
        let result = self
            .set_session_hold_locked(&mut state, id, hold, &mut events)
            .await;
        self.finish(&mut state, &mut events).await;
        drop(state);
        self.publish(events);
        result
    }

    async fn set_session_hold_locked(
        &self,
        state: &mut ManagerState,
        id: SessionId,
        hold: bool,
        events: &mut Vec<SessionEvent>,
    ) -> Result<()> {
        let session = state
            .sessions
            .get_mut(&id)
            .ok_or(SessionError::SessionNotFound { session: id })?;
        let engine_session = session.engine_session;
        let (session_events, tell_engine) = session.set_local_hold(hold);
        events.extend(session_events);
        if tell_engine {
            if let Some(engine_session) = engine_session {
                if let Err(e) = self.engine.hold_session(engine_session, hold).await {
                    tracing::warn!(session = %id, "engine hold failed: {e}");
                }
            }
        }
        Ok(())
    }

    /// Blind or attended transfer of a connected session. Fire and
    /// forget: illegal states are logged, never raised.
    pub async fn transfer_call(
        &self,
        id: SessionId,
        target: &str,
        replaced: Option<SessionId>,
    ) {
        let state = self.state.read().await;
        let Some(session) = state.sessions.get(&id) else {
            tracing::warn!(session = %id, "transfer requested for unknown session");
            return;
        };
        if !session.can_transfer() {
            tracing::warn!(session = %id, state = %session.state(), "transfer ignored in this state");
            return;
        }
        let Some(engine_session) = session.engine_session else {
            tracing::warn!(session = %id, "transfer ignored, no engine session");
            return;
        };
        let replaced_engine = replaced
            .and_then(|r| state.sessions.get(&r))
            .and_then(|s| s.engine_session);
        let uri = SipUri::parse(target);
        drop(state);
        if let Err(e) = self
            .engine
            .transfer_session(engine_session, &uri, replaced_engine)
            .await
        {
            tracing::warn!(session = %id, "transfer rejected by the engine: {e}");
        }
    }

    /// Send a DTMF digit. No-op without an engine session.
    pub async fn send_dtmf(&self, id: SessionId, digit: char) {
        let engine_session = {
            let state = self.state.read().await;
            state.sessions.get(&id).and_then(|s| s.engine_session)
        };
        match engine_session {
            Some(engine_session) => {
                if let Err(e) = self.engine.send_dtmf(engine_session, digit).await {
                    tracing::warn!(session = %id, "dtmf failed: {e}");
                }
            }
            None => tracing::debug!(session = %id, "dtmf ignored, no engine session"),
        }
    }

    /// Mute or unmute one stream. Idempotent.
    pub async fn set_stream_muted(
        &self,
        id: SessionId,
        kind: MediaKind,
        muted: bool,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let session = state
            .sessions
            .get_mut(&id)
            .ok_or(SessionError::SessionNotFound { session: id })?;
        let engine_session = session
            .engine_session
            .ok_or_else(|| SessionError::invalid_state("mute", session.state()))?;
        let stream = session
            .streams
            .get_mut(kind)
            .ok_or(SessionError::StreamNotFound { kind })?;
        if stream.muted == muted {
            return Ok(());
        }
        stream.muted = muted;
        drop(state);
        if let Err(e) = self.engine.mute_stream(engine_session, kind, muted).await {
            tracing::warn!(session = %id, "mute failed: {e}");
        }
        Ok(())
    }

    /// Toggle audio recording for a session.
    pub async fn set_recording(&self, id: SessionId, recording: bool) -> Result<()> {
        let mut state = self.state.write().await;
        let session = state
            .sessions
            .get_mut(&id)
            .ok_or(SessionError::SessionNotFound { session: id })?;
        let engine_session = session
            .engine_session
            .ok_or_else(|| SessionError::invalid_state("recording", session.state()))?;
        if session.recording == recording {
            return Ok(());
        }
        session.recording = recording;
        drop(state);
        let result = if recording {
            self.engine.start_recording(engine_session).await
        } else {
            self.engine.stop_recording(engine_session).await
        };
        if let Err(e) = result {
            tracing::warn!(session = %id, "recording toggle failed: {e}");
        }
        Ok(())
    }

    // ------ active session tracking ------

    /// Select the foreground session. The previous active session (or
    /// its whole conference) goes on hold, the new one is resumed —
    /// unless both share the same conference.
    pub async fn set_active_session(&self, new: Option<SessionId>) -> Result<()> {
        let mut state = self.state.write().await;
        let mut events = Vec::new();
        let previous = state.active;
        if previous == new {
            return Ok(());
        }
        if let Some(id) = new {
            if !state.sessions.contains_key(&id) {
                return Err(SessionError::SessionNotFound { session: id });
            }
        }
        let conference_of = |state: &ManagerState, id: SessionId| {
            state.sessions.get(&id).and_then(|s| s.client_conference)
        };
        let same_conference = match (previous, new) {
            (Some(p), Some(n)) => {
                let cp = conference_of(&state, p);
                cp.is_some() && cp == conference_of(&state, n)
            }
            _ => false,
        };
        if !same_conference {
            if let Some(previous) = previous {
                self.set_hold_target_locked(&mut state, previous, true, &mut events)
                    .await;
            }
            if let Some(new) = new {
                self.set_hold_target_locked(&mut state, new, false, &mut events)
                    .await;
            }
        }
        state.active = new;
        events.push(SessionEvent::ActiveSessionChanged { session: new });
        self.finish(&mut state, &mut events).await;
        drop(state);
        self.publish(events);
        Ok(())
    }

    /// Hold or resume a session, widening to its whole conference when
    /// it has one.
    async fn set_hold_target_locked(
        &self,
        state: &mut ManagerState,
        id: SessionId,
        hold: bool,
        events: &mut Vec<SessionEvent>,
    ) {
        let conference = state.sessions.get(&id).and_then(|s| s.client_conference);
        match conference {
            Some(conference) => {
                if let Err(e) = self
                    .set_conference_hold_locked(state, conference, hold, events)
                    .await
                {
                    tracing::warn!(%conference, "conference hold failed: {e}");
                }
            }
            None => {
                if let Err(e) = self.set_session_hold_locked(state, id, hold, events).await {
                    tracing::debug!(session = %id, "hold skipped: {e}");
                }
            }
        }
    }

    // ------ local conferences ------

    /// Put two sessions (or a session and an existing conference) into
    /// one locally mixed conversation.
    pub async fn join_conference(
        &self,
        first: SessionId,
        second: SessionId,
    ) -> Result<ConferenceId> {
        let mut state = self.state.write().await;
        let mut events = Vec::new();
        for id in [first, second] {
            if !state.sessions.contains_key(&id) {
                return Err(SessionError::SessionNotFound { session: id });
            }
        }
        let existing = [first, second]
            .iter()
            .find_map(|id| state.sessions.get(id).and_then(|s| s.client_conference));
        let conference_id = match existing {
            Some(id) => id,
            None => {
                let bridge = self.engine.create_audio_bridge().await?;
                let conference = ClientConference::new(bridge);
                let id = conference.id();
                state.conferences.insert(id, conference);
                events.push(SessionEvent::ConferenceCreated { conference: id });
                id
            }
        };
        for id in [first, second] {
            let (engine_session, already_member) = {
                let session = state
                    .sessions
                    .get(&id)
                    .ok_or(SessionError::SessionNotFound { session: id })?;
                let audio_engine = session
                    .streams
                    .contains(MediaKind::Audio)
                    .then_some(session.engine_session)
                    .flatten();
                (audio_engine, session.client_conference == Some(conference_id))
            };
            if already_member {
                continue;
            }
            if let Some(conference) = state.conferences.get_mut(&conference_id) {
                conference.add_session(id, engine_session).await?;
            }
            if let Some(session) = state.sessions.get_mut(&id) {
                session.client_conference = Some(conference_id);
            }
            events.push(SessionEvent::ConferenceJoined {
                conference: conference_id,
                session: id,
            });
        }
        self.finish(&mut state, &mut events).await;
        drop(state);
        self.publish(events);
        Ok(conference_id)
    }

    /// Take a session out of its conference; a conference left with
    /// fewer than two members dissolves.
    pub async fn leave_conference(&self, id: SessionId) -> Result<()> {
        let mut state = self.state.write().await;
        let session = state
            .sessions
            .get(&id)
            .ok_or(SessionError::SessionNotFound { session: id })?;
        if session.client_conference.is_none() {
            return Err(SessionError::conference("session is not in a conference"));
        }
        let mut events = self.remove_from_conference_locked(&mut state, id).await;
        self.finish(&mut state, &mut events).await;
        drop(state);
        self.publish(events);
        Ok(())
    }

    /// Hold a whole conference: the bridge and every member in
    /// lockstep.
    pub async fn hold_conference(&self, id: ConferenceId) -> Result<()> {
        self.set_conference_hold(id, true).await
    }

    /// Resume a whole conference.
    pub async fn unhold_conference(&self, id: ConferenceId) -> Result<()> {
        self.set_conference_hold(id, false).await
    }

    async fn set_conference_hold(&self, id: ConferenceId, hold: bool) -> Result<()> {
        let mut state = self.state.write().await;
        let mut events = Vec::new();
        let result = self
            .set_conference_hold_locked(&mut state, id, hold, &mut events)
            .await;
        self.finish(&mut state, &mut events).await;
        drop(state);
        self.publish(events);
        result
    }

    async fn set_conference_hold_locked(
        &self,
        state: &mut ManagerState,
        id: ConferenceId,
        hold: bool,
        events: &mut Vec<SessionEvent>,
    ) -> Result<()> {
        let members = {
            let conference = state
                .conferences
                .get_mut(&id)
                .ok_or_else(|| SessionError::conference(format!("unknown conference {id}")))?;
            if hold {
                conference.hold().await?;
            } else {
                conference.unhold().await?;
            }
            conference.sessions().to_vec()
        };
        for member in members {
            if let Err(e) = self
                .set_session_hold_locked(state, member, hold, events)
                .await
            {
                tracing::debug!(session = %member, "conference member hold skipped: {e}");
            }
        }
        Ok(())
    }

    /// Remove a session from its conference, dissolving the conference
    /// when it would be left with fewer than two members.
    async fn remove_from_conference_locked(
        &self,
        state: &mut ManagerState,
        id: SessionId,
    ) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        let Some(conference_id) = state.sessions.get(&id).and_then(|s| s.client_conference)
        else {
            return events;
        };
        if let Some(session) = state.sessions.get_mut(&id) {
            session.client_conference = None;
        }
        if let Some(conference) = state.conferences.get_mut(&conference_id) {
            if let Err(e) = conference.remove_session(id).await {
                tracing::warn!(%conference_id, "bridge removal failed: {e}");
            }
            events.push(SessionEvent::ConferenceLeft {
                conference: conference_id,
                session: id,
            });
            if conference.len() < 2 {
                let remaining = match conference.dissolve().await {
                    Ok(remaining) => remaining,
                    Err(e) => {
                        tracing::warn!(%conference_id, "bridge teardown failed: {e}");
                        Vec::new()
                    }
                };
                for member in remaining {
                    if let Some(session) = state.sessions.get_mut(&member) {
                        session.client_conference = None;
                    }
                    events.push(SessionEvent::ConferenceLeft {
                        conference: conference_id,
                        session: member,
                    });
                }
                state.conferences.remove(&conference_id);
                events.push(SessionEvent::ConferenceDissolved {
                    conference: conference_id,
                });
            }
        }
        events
    }

    // ------ server conferences ------

    /// Optimistically add a participant to a focus-hosted session.
    pub async fn add_conference_participant(&self, id: SessionId, uri: &str) -> Result<()> {
        let uri = SipUri::parse(uri);
        let contact = self.contacts.resolve(&uri);
        let mut state = self.state.write().await;
        let mut events = Vec::new();
        let session = state
            .sessions
            .get_mut(&id)
            .ok_or(SessionError::SessionNotFound { session: id })?;
        let engine_session = session
            .engine_session
            .ok_or_else(|| SessionError::invalid_state("add_participant", session.state()))?;
        let conference = session
            .server_conference
            .get_or_insert_with(ServerConference::new);
        if !conference.add_pending(uri.clone(), contact.display_name) {
            return Ok(());
        }
        if let Err(e) = self
            .engine
            .add_conference_participant(engine_session, &uri)
            .await
        {
            tracing::warn!(session = %id, %uri, "participant add rejected: {e}");
            conference.drop_pending(&uri);
            events.push(SessionEvent::ParticipantAddFailed { session: id, uri });
        }
        self.finish(&mut state, &mut events).await;
        drop(state);
        self.publish(events);
        Ok(())
    }

    /// Ask the focus server to remove a participant; the roster entry
    /// stays until a snapshot confirms the removal.
    pub async fn remove_conference_participant(&self, id: SessionId, uri: &str) -> Result<()> {
        let uri = SipUri::parse(uri);
        let mut state = self.state.write().await;
        let session = state
            .sessions
            .get_mut(&id)
            .ok_or(SessionError::SessionNotFound { session: id })?;
        let engine_session = session
            .engine_session
            .ok_or_else(|| SessionError::invalid_state("remove_participant", session.state()))?;
        let Some(conference) = session.server_conference.as_mut() else {
            return Err(SessionError::conference("no server conference on session"));
        };
        if !conference.mark_removal(&uri) {
            return Err(SessionError::conference(format!("unknown participant {uri}")));
        }
        drop(state);
        if let Err(e) = self
            .engine
            .remove_conference_participant(engine_session, &uri)
            .await
        {
            tracing::warn!(session = %id, %uri, "participant removal rejected: {e}");
        }
        Ok(())
    }

    // ------ incoming requests ------

    /// Accept a pending incoming request.
    pub async fn accept_request(&self, id: RequestId) -> Result<()> {
        let mut state = self.state.write().await;
        let mut events = Vec::new();
        let request = state
            .requests
            .remove(id)
            .ok_or(SessionError::RequestNotFound)?;
        events.push(SessionEvent::IncomingRequestRemoved { request: request.id });
        let result = match request.target {
            RequestTarget::Session(session_id) => {
                self.accept_session_request_locked(&mut state, &request, session_id, &mut events)
                    .await
            }
            RequestTarget::Transfer(transfer_id) => {
                self.accept_transfer_request_locked(&mut state, transfer_id, &mut events)
                    .await
            }
        };
        self.finish(&mut state, &mut events).await;
        drop(state);
        self.publish(events);
        result
    }

    async fn accept_session_request_locked(
        &self,
        state: &mut ManagerState,
        request: &IncomingRequest,
        id: SessionId,
        events: &mut Vec<SessionEvent>,
    ) -> Result<()> {
        let session = state
            .sessions
            .get_mut(&id)
            .ok_or(SessionError::SessionNotFound { session: id })?;
        let engine_session = session
            .engine_session
            .ok_or_else(|| SessionError::invalid_state("accept", session.state()))?;
        if request.is_proposal {
            let kinds = session.proposed.kinds();
            if let Err(e) = self.engine.accept_proposal(engine_session, &kinds).await {
                tracing::warn!(session = %id, "proposal accept failed: {e}");
                events.extend(session.handle_proposal_rejected(ProposalOutcome::Failed));
            }
            return Ok(());
        }
        events.extend(session.start_accept()?);
        let specs = session.requested_streams();
        if let Err(e) = self.engine.accept_session(engine_session, &specs).await {
            tracing::warn!(session = %id, "accept failed at the engine: {e}");
            events.extend(session.terminate(format!("Accept failed: {e}"), true, None));
        }
        Ok(())
    }

    async fn accept_transfer_request_locked(
        &self,
        state: &mut ManagerState,
        id: TransferId,
        events: &mut Vec<SessionEvent>,
    ) -> Result<()> {
        let transfer = state
            .transfers
            .get_mut(&id)
            .ok_or(SessionError::TransferNotFound { transfer: id })?;
        let engine_session = transfer
            .engine_session
            .ok_or_else(|| SessionError::invalid_state("accept", transfer.state()))?;
        if let Err(e) = self.engine.accept_session(engine_session, &[]).await {
            tracing::warn!(transfer = %id, "transfer accept failed: {e}");
            events.extend(transfer.handle_did_fail(500, e.to_string()));
        }
        Ok(())
    }

    /// Reject (or answer busy to) a pending incoming request.
    pub async fn reject_request(&self, id: RequestId, busy: bool) -> Result<()> {
        let mut state = self.state.write().await;
        let mut events = Vec::new();
        let request = state
            .requests
            .remove(id)
            .ok_or(SessionError::RequestNotFound)?;
        events.push(SessionEvent::IncomingRequestRemoved { request: request.id });
        match request.target {
            RequestTarget::Session(session_id) => {
                if let Some(session) = state.sessions.get_mut(&session_id) {
                    let engine_session = session.engine_session;
                    if request.is_proposal {
                        if let Some(engine_session) = engine_session {
                            if let Err(e) = self.engine.reject_proposal(engine_session).await {
                                tracing::warn!(session = %session_id, "proposal reject failed: {e}");
                            }
                        }
                        events.extend(
                            session.handle_proposal_rejected(ProposalOutcome::Rejected),
                        );
                    } else {
                        let code = if busy { 486 } else { 603 };
                        if let Some(engine_session) = engine_session {
                            if let Err(e) =
                                self.engine.reject_session(engine_session, code).await
                            {
                                tracing::warn!(session = %session_id, "reject failed: {e}");
                            }
                        }
                        let reason = if busy { "Busy here" } else { "Call rejected" };
                        events.extend(session.terminate(
                            reason.to_string(),
                            false,
                            Some(Originator::Local),
                        ));
                    }
                }
            }
            RequestTarget::Transfer(transfer_id) => {
                if let Some(transfer) = state.transfers.get_mut(&transfer_id) {
                    if let Some(engine_session) = transfer.engine_session {
                        if let Err(e) = self.engine.reject_session(engine_session, 603).await {
                            tracing::warn!(transfer = %transfer_id, "reject failed: {e}");
                        }
                    }
                    events.extend(transfer.terminate("Transfer refused".to_string(), false));
                }
            }
        }
        self.finish(&mut state, &mut events).await;
        drop(state);
        self.publish(events);
        Ok(())
    }

    /// Auto-answer timer target: accept iff the request is still
    /// pending.
    async fn auto_answer(&self, id: RequestId) {
        let still_pending = self.state.read().await.requests.get(id).is_some();
        if !still_pending {
            return;
        }
        tracing::info!(request = %id, "auto-answering");
        if let Err(e) = self.accept_request(id).await {
            tracing::warn!(request = %id, "auto-answer failed: {e}");
        }
    }

    fn queue_request_locked(
        &self,
        state: &mut ManagerState,
        request: IncomingRequest,
        events: &mut Vec<SessionEvent>,
    ) {
        let id = request.id;
        let target = request.target;
        let kinds = request.kinds.clone();
        state.requests.insert(request);
        let focus_moved = state.requests.refresh_focus();
        let focused = state.requests.get(id).map(|r| r.focused).unwrap_or(false);
        events.push(SessionEvent::IncomingRequestQueued {
            request: id,
            target,
            kinds,
            focused,
        });
        if let Some(moved) = focus_moved {
            if moved != id {
                events.push(SessionEvent::IncomingRequestFocused { request: moved });
            }
        }
        if let Some(delay) = self.settings.settings().auto_answer_delay {
            if let Some(manager) = self.weak_self.upgrade() {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    manager.auto_answer(id).await;
                });
            }
        }
    }

    // ------ file transfers ------

    /// Offer a local file to `target`. PGP-eligible files pass through
    /// the encryption sub-phase first; connect happens from the
    /// completion callback.
    pub async fn send_file(
        &self,
        account_id: &str,
        target: &str,
        path: impl AsRef<Path>,
    ) -> Result<TransferId> {
        let settings = self.settings.settings();
        let account = settings
            .account(account_id)
            .cloned()
            .ok_or_else(|| SessionError::AccountNotFound {
                account: account_id.to_string(),
            })?;
        let uri = SipUri::parse(target);
        let contact = self.contacts.resolve(&uri);
        let selector = FileSelector::for_file(path.as_ref()).await?;
        let use_pgp =
            settings.pgp_enabled && selector.size <= settings.pgp_max_size && self.pgp.is_some();

        let mut state = self.state.write().await;
        let transfer = FileTransfer::new();
        let id = transfer.id();
        state.transfers.insert(id, transfer);
        let mut events = Vec::new();
        let result = async {
            let transfer = state
                .transfers
                .get_mut(&id)
                .ok_or(SessionError::TransferNotFound { transfer: id })?;
            events.extend(transfer.init_outgoing(
                account,
                contact,
                uri.clone(),
                selector,
                TransferKind::Push,
            )?);
            if use_pgp {
                events.extend(transfer.begin_encrypting()?);
                let source = transfer
                    .selector
                    .as_ref()
                    .map(|s| s.path.clone())
                    .ok_or_else(|| SessionError::file("transfer has no file"))?;
                if let (Some(pgp), Some(manager)) =
                    (self.pgp.clone(), self.weak_self.upgrade())
                {
                    let recipient = uri.clone();
                    tokio::spawn(async move {
                        let result = pgp.encrypt_file(&source, &recipient).await;
                        manager.encryption_finished(id, result).await;
                    });
                }
            } else {
                self.connect_transfer_locked(&mut state, id, &mut events)
                    .await?;
            }
            Ok(())
        }
        .await;
        self.finish(&mut state, &mut events).await;
        drop(state);
        self.publish(events);
        result.map(|_| id)
    }

    /// Connect (or retry) a transfer. From `ended` the selector is
    /// refreshed first — the hash is recomputed only when the file's
    /// mtime changed — and the transfer re-enters `initialized`.
    pub async fn connect_transfer(&self, id: TransferId) -> Result<()> {
        let mut state = self.state.write().await;
        let mut events = Vec::new();
        let result = async {
            {
                let transfer = state
                    .transfers
                    .get_mut(&id)
                    .ok_or(SessionError::TransferNotFound { transfer: id })?;
                if transfer.state().phase == TransferPhase::Ended {
                    if let Some(mut selector) = transfer.selector.take() {
                        let refreshed = selector.refresh().await;
                        transfer.selector = Some(selector);
                        refreshed?;
                    }
                    events.extend(transfer.reinit_for_retry()?);
                }
            }
            self.connect_transfer_locked(&mut state, id, &mut events)
                .await
        }
        .await;
        self.finish(&mut state, &mut events).await;
        drop(state);
        self.publish(events);
        result
    }

    async fn connect_transfer_locked(
        &self,
        state: &mut ManagerState,
        id: TransferId,
        events: &mut Vec<SessionEvent>,
    ) -> Result<()> {
        let (uri, proxy) = {
            let transfer = state
                .transfers
                .get(&id)
                .ok_or(SessionError::TransferNotFound { transfer: id })?;
            transfer.can_connect()?;
            let uri = transfer
                .uri
                .clone()
                .ok_or_else(|| SessionError::invalid_state("connect", transfer.state()))?;
            let proxy = transfer
                .account
                .as_ref()
                .and_then(|a| a.outbound_proxy.clone());
            (uri, proxy)
        };
        let lookup = self.engine.start_lookup(&uri, proxy.as_ref()).await?;
        state.by_lookup.insert(lookup, Owner::Transfer(id));
        if let Some(transfer) = state.transfers.get_mut(&id) {
            events.extend(transfer.start_connect(lookup)?);
        }
        Ok(())
    }

    /// PGP helper completion, marshalled back onto the manager.
    async fn encryption_finished(&self, id: TransferId, result: EngineResult<PathBuf>) {
        let mut state = self.state.write().await;
        let mut events = Vec::new();
        match result {
            Ok(armored) => {
                let size = tokio::fs::metadata(&armored)
                    .await
                    .map(|m| m.len())
                    .unwrap_or(0);
                let proceed = {
                    let Some(transfer) = state.transfers.get_mut(&id) else {
                        return;
                    };
                    events.extend(transfer.handle_encrypted(armored, size));
                    transfer.state().phase == TransferPhase::Encrypted
                };
                if proceed {
                    if let Err(e) = self
                        .connect_transfer_locked(&mut state, id, &mut events)
                        .await
                    {
                        tracing::warn!(transfer = %id, "connect after encryption failed: {e}");
                        if let Some(transfer) = state.transfers.get_mut(&id) {
                            events.extend(transfer.terminate(e.to_string(), true));
                        }
                    }
                }
            }
            Err(e) => {
                if let Some(transfer) = state.transfers.get_mut(&id) {
                    events.extend(transfer.handle_encrypt_failed(e.to_string()));
                }
            }
        }
        self.finish(&mut state, &mut events).await;
        drop(state);
        self.publish(events);
    }

    /// PGP decryption completion for a finished incoming transfer.
    async fn decryption_finished(
        &self,
        id: TransferId,
        result: EngineResult<PathBuf>,
    ) {
        let mut state = self.state.write().await;
        let mut events = Vec::new();
        if let Some(transfer) = state.transfers.get_mut(&id) {
            match result {
                Ok(plaintext) => events.extend(transfer.handle_decrypted(plaintext)),
                Err(e) => events.extend(transfer.handle_decrypt_failed(e.to_string())),
            }
        }
        self.finish(&mut state, &mut events).await;
        drop(state);
        self.publish(events);
    }

    /// Cancel or finish a transfer locally.
    pub async fn end_transfer(&self, id: TransferId) -> Result<()> {
        let mut state = self.state.write().await;
        let mut events = Vec::new();
        let transfer = state
            .transfers
            .get_mut(&id)
            .ok_or(SessionError::TransferNotFound { transfer: id })?;
        let engine_session = transfer.engine_session;
        let (transfer_events, needs_engine_end) = transfer.end();
        events.extend(transfer_events);
        if needs_engine_end {
            if let Some(engine_session) = engine_session {
                if let Err(e) = self.engine.end_session(engine_session).await {
                    tracing::warn!(transfer = %id, "engine end failed: {e}");
                }
            }
        }
        self.finish(&mut state, &mut events).await;
        drop(state);
        self.publish(events);
        Ok(())
    }

    // ------ ringtone arbitration ------

    /// Recompute the tone plan from scratch and apply it when changed.
    /// Pure given the current sessions/requests snapshot; calling it
    /// twice without an intervening change yields the same plan and
    /// applies nothing the second time.
    pub async fn update_ringtone(&self) -> RingtonePlan {
        let mut state = self.state.write().await;
        let plan = plan_ringtone(&state.sessions, &state.requests);
        if plan != state.ringtone {
            state.ringtone = plan;
            self.tones.apply(&plan);
            let _ = self.event_tx.send(SessionEvent::RingtoneChanged { plan });
        }
        plan
    }

    // ------ engine event pump ------

    /// Dispatch one engine event. Events for unknown sessions are
    /// logged and dropped; completions for sessions already winding
    /// down are ignored by the state machines themselves.
    pub async fn handle_engine_event(&self, event: EngineEvent) {
        let mut state = self.state.write().await;
        let mut events = Vec::new();
        match event {
            EngineEvent::LookupSucceeded { lookup, routes } => {
                self.on_lookup_done(&mut state, lookup, Some(routes), &mut events)
                    .await;
            }
            EngineEvent::LookupFailed { lookup } => {
                self.on_lookup_done(&mut state, lookup, None, &mut events)
                    .await;
            }
            EngineEvent::IncomingSession {
                session,
                account,
                from,
                proposed_streams,
                remote_instance_id,
            } => {
                self.on_incoming_session(
                    &mut state,
                    session,
                    account,
                    from,
                    proposed_streams,
                    remote_instance_id,
                    &mut events,
                )
                .await;
            }
            EngineEvent::IncomingTransfer {
                session,
                account,
                from,
                filename,
                size,
                kind,
            } => {
                self.on_incoming_transfer(
                    &mut state, session, account, from, filename, size, kind, &mut events,
                )
                .await;
            }
            EngineEvent::NewOutgoing { session } => {
                if let Some(Owner::Session(id)) = state.by_engine.get(&session).copied() {
                    if let Some(s) = state.sessions.get_mut(&id) {
                        events.extend(s.handle_new_outgoing(session));
                    }
                }
            }
            EngineEvent::GotRinging { session } => match state.by_engine.get(&session).copied() {
                Some(Owner::Session(id)) => {
                    if let Some(s) = state.sessions.get_mut(&id) {
                        events.extend(s.handle_ringing());
                    }
                }
                Some(Owner::Transfer(id)) => {
                    if let Some(t) = state.transfers.get_mut(&id) {
                        events.extend(t.handle_ringing());
                    }
                }
                None => tracing::debug!(%session, "ringing for unknown session"),
            },
            EngineEvent::GotEarlyMedia { session } => {
                if let Some(Owner::Session(id)) = state.by_engine.get(&session).copied() {
                    if let Some(s) = state.sessions.get_mut(&id) {
                        events.extend(s.handle_early_media());
                    }
                }
            }
            EngineEvent::WillStart { session } => match state.by_engine.get(&session).copied() {
                Some(Owner::Session(id)) => {
                    if let Some(s) = state.sessions.get_mut(&id) {
                        events.extend(s.handle_will_start());
                    }
                }
                Some(Owner::Transfer(id)) => {
                    if let Some(t) = state.transfers.get_mut(&id) {
                        events.extend(t.handle_will_start());
                    }
                }
                None => {}
            },
            EngineEvent::DidStart { session, streams } => {
                self.on_did_start(&mut state, session, streams, &mut events)
                    .await;
            }
            EngineEvent::DidFail {
                session,
                code,
                reason,
                originator,
            } => match state.by_engine.get(&session).copied() {
                Some(Owner::Session(id)) => {
                    if let Some(s) = state.sessions.get_mut(&id) {
                        events.extend(s.handle_did_fail(code, reason, originator));
                    }
                }
                Some(Owner::Transfer(id)) => {
                    if let Some(t) = state.transfers.get_mut(&id) {
                        events.extend(t.handle_did_fail(code, reason));
                    }
                }
                None => tracing::debug!(%session, "failure for unknown session"),
            },
            EngineEvent::DidEnd {
                session,
                originator,
            } => {
                self.on_did_end(&mut state, session, originator, &mut events)
                    .await;
            }
            EngineEvent::HoldChanged {
                session,
                originator,
                on_hold,
            } => {
                if let Some(Owner::Session(id)) = state.by_engine.get(&session).copied() {
                    if let Some(s) = state.sessions.get_mut(&id) {
                        events.extend(s.handle_hold_changed(originator, on_hold));
                    }
                }
            }
            EngineEvent::ProposalReceived { session, streams } => {
                if let Some(Owner::Session(id)) = state.by_engine.get(&session).copied() {
                    let kinds: Vec<MediaKind> = streams.iter().map(|s| s.kind).collect();
                    let handled = match state.sessions.get_mut(&id) {
                        Some(s) => {
                            let evs = s.handle_proposal_received(streams);
                            let handled = !evs.is_empty();
                            events.extend(evs);
                            handled
                        }
                        None => false,
                    };
                    if handled {
                        self.queue_request_locked(
                            &mut state,
                            IncomingRequest::proposal(id, kinds),
                            &mut events,
                        );
                    }
                }
            }
            EngineEvent::ProposalAccepted { session, streams } => {
                if let Some(Owner::Session(id)) = state.by_engine.get(&session).copied() {
                    self.drop_proposal_requests(&mut state, id, &mut events);
                    let auto_end = match state.sessions.get_mut(&id) {
                        Some(s) => {
                            let (evs, auto_end) = s.handle_proposal_accepted(streams);
                            events.extend(evs);
                            auto_end
                        }
                        None => false,
                    };
                    if auto_end {
                        tracing::info!(session = %id, "all streams removed, ending session");
                        let _ = self.end_session_locked(&mut state, id, &mut events).await;
                    }
                }
            }
            EngineEvent::ProposalRejected { session, .. } => {
                if let Some(Owner::Session(id)) = state.by_engine.get(&session).copied() {
                    self.drop_proposal_requests(&mut state, id, &mut events);
                    if let Some(s) = state.sessions.get_mut(&id) {
                        events.extend(s.handle_proposal_rejected(ProposalOutcome::Rejected));
                    }
                }
            }
            EngineEvent::ProposalFailed { session, .. } => {
                if let Some(Owner::Session(id)) = state.by_engine.get(&session).copied() {
                    self.drop_proposal_requests(&mut state, id, &mut events);
                    if let Some(s) = state.sessions.get_mut(&id) {
                        events.extend(s.handle_proposal_rejected(ProposalOutcome::Failed));
                    }
                }
            }
            EngineEvent::StreamStatsTick {
                session,
                kind,
                stats,
            } => {
                if let Some(Owner::Session(id)) = state.by_engine.get(&session).copied() {
                    if let Some(stream) = state
                        .sessions
                        .get_mut(&id)
                        .and_then(|s| s.streams.get_mut(kind))
                    {
                        stream.info.stats = Some(stats);
                    }
                }
            }
            EngineEvent::IceStateChanged {
                session,
                kind,
                state: ice,
            } => {
                if let Some(Owner::Session(id)) = state.by_engine.get(&session).copied() {
                    if let Some(stream) = state
                        .sessions
                        .get_mut(&id)
                        .and_then(|s| s.streams.get_mut(kind))
                    {
                        stream.info.ice = Some(ice);
                    }
                }
            }
            EngineEvent::EncryptionChanged {
                session,
                kind,
                state: encryption,
                codec,
            } => {
                if let Some(Owner::Session(id)) = state.by_engine.get(&session).copied() {
                    if let Some(stream) = state
                        .sessions
                        .get_mut(&id)
                        .and_then(|s| s.streams.get_mut(kind))
                    {
                        stream.info.encryption = encryption;
                        if codec.is_some() {
                            stream.info.codec = codec;
                        }
                    }
                }
            }
            EngineEvent::ConferenceRoster { session, entries } => {
                if let Some(Owner::Session(id)) = state.by_engine.get(&session).copied() {
                    if let Some(s) = state.sessions.get_mut(&id) {
                        let conference = s
                            .server_conference
                            .get_or_insert_with(ServerConference::new);
                        events.extend(conference.apply_snapshot(id, &entries));
                    }
                }
            }
            EngineEvent::TransferProgress {
                session,
                transferred,
                total,
            } => {
                if let Some(Owner::Transfer(id)) = state.by_engine.get(&session).copied() {
                    if let Some(t) = state.transfers.get_mut(&id) {
                        events.extend(t.handle_progress(transferred, total));
                    }
                }
            }
        }
        self.finish(&mut state, &mut events).await;
        drop(state);
        self.publish(events);
    }

    async fn on_lookup_done(
        &self,
        state: &mut ManagerState,
        lookup: LookupId,
        routes: Option<Vec<softcall_engine_api::Route>>,
        events: &mut Vec<SessionEvent>,
    ) {
        let Some(owner) = state.by_lookup.remove(&lookup) else {
            tracing::debug!(%lookup, "result for unknown lookup");
            return;
        };
        match owner {
            Owner::Session(id) => {
                let routes = routes.unwrap_or_default();
                let proceed = {
                    let Some(session) = state.sessions.get_mut(&id) else {
                        return;
                    };
                    events.extend(if routes.is_empty() {
                        session.handle_lookup_failed()
                    } else {
                        session.handle_lookup_succeeded(routes.clone())
                    });
                    session.state()
                        == SessionState::with_substate(
                            Phase::Connecting,
                            Substate::DnsLookupSucceeded,
                        )
                };
                if !proceed {
                    return;
                }
                let Some((account, uri, specs)) = state.sessions.get(&id).and_then(|s| {
                    Some((s.account.clone()?, s.uri.clone()?, s.requested_streams()))
                }) else {
                    return;
                };
                match self
                    .engine
                    .create_session(&account, &uri, &routes, &specs)
                    .await
                {
                    Ok(engine_session) => {
                        state.by_engine.insert(engine_session, Owner::Session(id));
                        if let Some(session) = state.sessions.get_mut(&id) {
                            session.engine_session = Some(engine_session);
                        }
                    }
                    Err(e) => {
                        if let Some(session) = state.sessions.get_mut(&id) {
                            events.extend(session.handle_did_fail(
                                500,
                                e.to_string(),
                                Originator::Local,
                            ));
                        }
                    }
                }
            }
            Owner::Transfer(id) => {
                let routes = routes.unwrap_or_default();
                let proceed = {
                    let Some(transfer) = state.transfers.get_mut(&id) else {
                        return;
                    };
                    events.extend(if routes.is_empty() {
                        transfer.handle_lookup_failed()
                    } else {
                        transfer.handle_lookup_succeeded(routes.clone())
                    });
                    transfer.state().phase == TransferPhase::Connecting
                        && transfer.engine_session.is_none()
                };
                if !proceed {
                    return;
                }
                let Some((account, uri, path, size, hash, kind)) =
                    state.transfers.get(&id).and_then(|t| {
                        let selector = t.selector.as_ref()?;
                        Some((
                            t.account.clone()?,
                            t.uri.clone()?,
                            selector.path.clone(),
                            selector.size,
                            selector.hash.clone(),
                            t.kind.unwrap_or(TransferKind::Push),
                        ))
                    })
                else {
                    return;
                };
                match self
                    .engine
                    .start_transfer(&account, &uri, &routes, &path, size, hash.as_deref(), kind)
                    .await
                {
                    Ok(engine_session) => {
                        state.by_engine.insert(engine_session, Owner::Transfer(id));
                        if let Some(transfer) = state.transfers.get_mut(&id) {
                            events.extend(transfer.handle_started_session(engine_session));
                        }
                    }
                    Err(e) => {
                        if let Some(transfer) = state.transfers.get_mut(&id) {
                            events.extend(transfer.handle_did_fail(500, e.to_string()));
                        }
                    }
                }
            }
        }
    }

    async fn on_incoming_session(
        &self,
        state: &mut ManagerState,
        engine_session: EngineSessionId,
        account_id: String,
        from: SipUri,
        proposed_streams: Vec<StreamSpec>,
        remote_instance_id: Option<String>,
        events: &mut Vec<SessionEvent>,
    ) {
        let settings = self.settings.settings();
        let Some(account) = settings.account(&account_id).cloned() else {
            tracing::warn!(%engine_session, account = %account_id, "incoming session for unknown account");
            let _ = self.engine.reject_session(engine_session, 480).await;
            return;
        };
        let streams = match StreamSet::from_specs(proposed_streams) {
            Ok(streams) if !streams.is_empty() => streams,
            _ => {
                tracing::warn!(%engine_session, "incoming session with unusable stream set");
                let _ = self.engine.reject_session(engine_session, 488).await;
                return;
            }
        };
        let contact = self.contacts.resolve(&from);
        let id = match state
            .sessions
            .iter()
            .find(|(_, s)| {
                s.is_reusable() && s.contact.as_ref().map(|c| &c.uri) == Some(&contact.uri)
            })
            .map(|(id, _)| *id)
        {
            Some(id) => id,
            None => {
                let session = Session::new();
                let id = session.id();
                state.sessions.insert(id, session);
                id
            }
        };
        let kinds: Vec<MediaKind> = streams.kinds().collect();
        let init = match state.sessions.get_mut(&id) {
            Some(session) => session.init_incoming(
                account,
                contact,
                from,
                engine_session,
                streams,
                remote_instance_id,
            ),
            None => return,
        };
        match init {
            Ok(evs) => events.extend(evs),
            Err(e) => {
                tracing::warn!(session = %id, "incoming init failed: {e}");
                let _ = self.engine.reject_session(engine_session, 486).await;
                return;
            }
        }
        state.by_engine.insert(engine_session, Owner::Session(id));
        self.queue_request_locked(state, IncomingRequest::new_session(id, kinds), events);
    }

    async fn on_incoming_transfer(
        &self,
        state: &mut ManagerState,
        engine_session: EngineSessionId,
        account_id: String,
        from: SipUri,
        filename: String,
        size: u64,
        kind: TransferKind,
        events: &mut Vec<SessionEvent>,
    ) {
        let settings = self.settings.settings();
        let Some(account) = settings.account(&account_id).cloned() else {
            tracing::warn!(%engine_session, account = %account_id, "incoming transfer for unknown account");
            let _ = self.engine.reject_session(engine_session, 480).await;
            return;
        };
        let contact = self.contacts.resolve(&from);
        let destination = settings.download_directory.join(&filename);
        let selector = FileSelector::for_remote(destination, size);
        let transfer = FileTransfer::new();
        let id = transfer.id();
        state.transfers.insert(id, transfer);
        let init = match state.transfers.get_mut(&id) {
            Some(transfer) => {
                transfer.init_incoming(account, contact, from, engine_session, selector, kind)
            }
            None => return,
        };
        match init {
            Ok(evs) => events.extend(evs),
            Err(e) => {
                tracing::warn!(transfer = %id, "incoming transfer init failed: {e}");
                return;
            }
        }
        state.by_engine.insert(engine_session, Owner::Transfer(id));
        self.queue_request_locked(state, IncomingRequest::transfer(id), events);
    }

    async fn on_did_start(
        &self,
        state: &mut ManagerState,
        engine_session: EngineSessionId,
        streams: Vec<StreamSpec>,
        events: &mut Vec<SessionEvent>,
    ) {
        match state.by_engine.get(&engine_session).copied() {
            Some(Owner::Session(id)) => {
                let conference = {
                    let Some(session) = state.sessions.get_mut(&id) else {
                        return;
                    };
                    events.extend(session.handle_did_start(streams));
                    session
                        .streams
                        .contains(MediaKind::Audio)
                        .then_some(session.client_conference)
                        .flatten()
                };
                // A conference member connecting late gets its audio
                // mirrored into the bridge now.
                if let Some(conference_id) = conference {
                    if let Some(conference) = state.conferences.get_mut(&conference_id) {
                        if let Err(e) = conference.mirror(id, engine_session).await {
                            tracing::warn!(%conference_id, "bridge mirror failed: {e}");
                        }
                    }
                }
            }
            Some(Owner::Transfer(id)) => {
                if let Some(transfer) = state.transfers.get_mut(&id) {
                    events.extend(transfer.handle_did_start());
                }
            }
            None => tracing::debug!(%engine_session, "start for unknown session"),
        }
    }

    async fn on_did_end(
        &self,
        state: &mut ManagerState,
        engine_session: EngineSessionId,
        originator: Originator,
        events: &mut Vec<SessionEvent>,
    ) {
        match state.by_engine.remove(&engine_session) {
            Some(Owner::Session(id)) => {
                if let Some(session) = state.sessions.get_mut(&id) {
                    events.extend(session.handle_did_end(originator));
                }
            }
            Some(Owner::Transfer(id)) => {
                let needs_decrypt = match state.transfers.get_mut(&id) {
                    Some(transfer) => {
                        let (evs, needs_decrypt) = transfer.handle_did_end(originator);
                        events.extend(evs);
                        needs_decrypt
                    }
                    None => false,
                };
                if needs_decrypt {
                    self.start_decryption(state, id, events);
                }
            }
            None => tracing::debug!(%engine_session, "end for unknown session"),
        }
    }

    fn start_decryption(
        &self,
        state: &mut ManagerState,
        id: TransferId,
        events: &mut Vec<SessionEvent>,
    ) {
        let Some(transfer) = state.transfers.get_mut(&id) else {
            return;
        };
        let Some(source) = transfer.selector.as_ref().map(|s| s.path.clone()) else {
            events.extend(transfer.handle_decrypt_failed("transfer has no file".into()));
            return;
        };
        match (self.pgp.clone(), self.weak_self.upgrade()) {
            (Some(pgp), Some(manager)) => {
                tokio::spawn(async move {
                    let result = pgp.decrypt_file(&source).await;
                    manager.decryption_finished(id, result).await;
                });
            }
            _ => {
                tracing::warn!(transfer = %id, "no PGP engine, leaving payload armored");
                events.extend(transfer.handle_decrypted(source));
            }
        }
    }

    fn drop_proposal_requests(
        &self,
        state: &mut ManagerState,
        id: SessionId,
        events: &mut Vec<SessionEvent>,
    ) {
        for dropped in state
            .requests
            .remove_where(|r| r.is_proposal && r.target == RequestTarget::Session(id))
        {
            events.push(SessionEvent::IncomingRequestRemoved {
                request: dropped.id,
            });
        }
    }

    /// Post-processing shared by every mutation path: react to terminal
    /// events (cleanup, history), fix request focus, re-arbitrate the
    /// ringtone.
    async fn finish(&self, state: &mut ManagerState, events: &mut Vec<SessionEvent>) {
        let mut index = 0;
        while index < events.len() {
            let event = events[index].clone();
            index += 1;
            match event {
                SessionEvent::SessionDidEnd { session, .. } => {
                    for dropped in state.requests.remove_for_session(session) {
                        events.push(SessionEvent::IncomingRequestRemoved {
                            request: dropped.id,
                        });
                    }
                    let conference_events =
                        self.remove_from_conference_locked(state, session).await;
                    events.extend(conference_events);
                    state
                        .by_engine
                        .retain(|_, owner| *owner != Owner::Session(session));
                    state
                        .by_lookup
                        .retain(|_, owner| *owner != Owner::Session(session));
                    if state.active == Some(session) {
                        state.active = None;
                        events.push(SessionEvent::ActiveSessionChanged { session: None });
                    }
                }
                SessionEvent::SessionDeleted { session } => {
                    state.sessions.remove(&session);
                }
                SessionEvent::TransferDidEnd {
                    transfer,
                    ref reason,
                    error,
                } => {
                    for dropped in state.requests.remove_for_transfer(transfer) {
                        events.push(SessionEvent::IncomingRequestRemoved {
                            request: dropped.id,
                        });
                    }
                    state
                        .by_engine
                        .retain(|_, owner| *owner != Owner::Transfer(transfer));
                    state
                        .by_lookup
                        .retain(|_, owner| *owner != Owner::Transfer(transfer));
                    let record = state.transfers.get(&transfer).map(|t| TransferRecord {
                        id: transfer,
                        direction: t.direction.unwrap_or(Direction::Outgoing),
                        kind: t.kind.unwrap_or(TransferKind::Push),
                        peer: t
                            .contact
                            .as_ref()
                            .map(|c| c.uri.to_string())
                            .unwrap_or_default(),
                        filename: t
                            .selector
                            .as_ref()
                            .map(|s| s.path.clone())
                            .unwrap_or_default(),
                        size: t.total,
                        started: t.created,
                        ended: t.ended_at,
                        reason: reason.clone(),
                        error,
                    });
                    if let (Some(record), Some(history)) = (record, state.history.as_mut()) {
                        if let Err(e) = history.add(record).await {
                            tracing::warn!("transfer history write failed: {e}");
                        }
                    }
                }
                _ => {}
            }
        }
        if let Some(focused) = state.requests.refresh_focus() {
            events.push(SessionEvent::IncomingRequestFocused { request: focused });
        }
        let plan = plan_ringtone(&state.sessions, &state.requests);
        if plan != state.ringtone {
            state.ringtone = plan;
            self.tones.apply(&plan);
            events.push(SessionEvent::RingtoneChanged { plan });
        }
    }
}
