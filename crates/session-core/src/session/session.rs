//! Session state machine.
//!
//! A [`Session`] is one logical conversation with a remote party. The
//! struct holds only state; every method is a synchronous transition
//! that mutates the session and returns the [`SessionEvent`]s to
//! publish. Engine I/O happens in the manager, which calls these
//! transitions before or after the corresponding engine request and
//! routes engine callbacks into the `handle_*` methods.
//!
//! Lifecycle graph (substates in parentheses):
//!
//! ```text
//! none -> initialized
//!      -> connecting (dns_lookup, dns_lookup_succeeded, ringing,
//!                     early_media, starting)
//!      -> connected (sent_proposal, received_proposal)
//!      -> ending -> ended -> deleted
//! ```
//!
//! `init_*` re-entry from `ended` re-initializes the object for reuse.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use softcall_engine_api::{
    Account, Contact, EngineSessionId, LookupId, MediaKind, Originator, Route, SipUri, StreamSpec,
};

use crate::conference::{ConferenceId, ServerConference};
use crate::errors::{Result, SessionError};
use crate::events::{ProposalOutcome, SessionEvent};
use crate::info::SessionInfo;
use crate::state::{Phase, SessionState, StatePattern, Substate};
use crate::streams::{StreamMap, StreamSet};

/// Session identifier assigned by the session core.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct SessionId(pub uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who initiated the conversation.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// States from which an `init_*` entry point is legal.
const REUSABLE: &[StatePattern] = &[
    StatePattern::bare(Phase::New),
    StatePattern::bare(Phase::Initialized),
    StatePattern::bare(Phase::Ended),
];

/// States `end()` acts from.
const ENDABLE: &[StatePattern] = &[
    StatePattern::bare(Phase::Initialized),
    StatePattern::any(Phase::Connecting),
    StatePattern::any(Phase::Connected),
];

/// One logical conversation with a remote party.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    state: SessionState,

    pub account: Option<Account>,
    pub contact: Option<Contact>,
    pub uri: Option<SipUri>,
    pub direction: Option<Direction>,
    pub remote_instance_id: Option<String>,

    /// Streams negotiated and active on the session.
    pub streams: StreamMap,
    /// Streams pending in an unresolved proposal.
    pub proposed: StreamMap,
    /// The stream set the session was initialized with.
    requested: StreamSet,

    pub local_hold: bool,
    pub remote_hold: bool,
    pub recording: bool,

    pub engine_session: Option<EngineSessionId>,
    pub lookup: Option<LookupId>,
    pub routes: Vec<Route>,
    /// Engine session this one replaces (attended-transfer entry).
    pub replaced_session: Option<EngineSessionId>,

    pub client_conference: Option<ConferenceId>,
    pub server_conference: Option<ServerConference>,

    pub info: SessionInfo,
    pub end_reason: Option<String>,
    pub end_error: bool,

    delete_when_done: bool,
    delete_requested: bool,
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: SessionId::new(),
            state: SessionState::new(Phase::New),
            account: None,
            contact: None,
            uri: None,
            direction: None,
            remote_instance_id: None,
            streams: StreamMap::new(),
            proposed: StreamMap::new(),
            requested: StreamSet::new(),
            local_hold: false,
            remote_hold: false,
            recording: false,
            engine_session: None,
            lookup: None,
            routes: Vec::new(),
            replaced_session: None,
            client_conference: None,
            server_conference: None,
            info: SessionInfo::default(),
            end_reason: None,
            end_error: false,
            delete_when_done: false,
            delete_requested: false,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn on_hold(&self) -> bool {
        self.local_hold || self.remote_hold
    }

    pub fn delete_when_done(&self) -> bool {
        self.delete_when_done || self.delete_requested
    }

    /// Idle and reusable for a new conversation.
    pub fn is_reusable(&self) -> bool {
        self.state.matches_any(REUSABLE) && !self.delete_requested
    }

    /// State transition funnel: records the new state and pushes the
    /// change event when the state actually changed.
    fn set_state(&mut self, new: SessionState, events: &mut Vec<SessionEvent>) {
        if self.state == new {
            return;
        }
        let old = self.state;
        self.state = new;
        tracing::debug!(session = %self.id, "state {} -> {}", old, new);
        events.push(SessionEvent::SessionStateChanged {
            session: self.id,
            old,
            new,
        });
    }

    /// Reset every mutable field except identity-independent config.
    /// Used by the `init_*` entry points when the object is reused.
    fn reinitialize(&mut self) {
        self.streams.clear();
        self.proposed.clear();
        self.requested = StreamSet::new();
        self.local_hold = false;
        self.remote_hold = false;
        self.recording = false;
        self.engine_session = None;
        self.lookup = None;
        self.routes.clear();
        self.replaced_session = None;
        self.remote_instance_id = None;
        self.client_conference = None;
        self.server_conference = None;
        self.info.reset();
        self.end_reason = None;
        self.end_error = false;
        self.delete_when_done = false;
        self.delete_requested = false;
    }

    fn guard_init(&self, operation: &str) -> Result<()> {
        if self.state.matches_any(REUSABLE) {
            Ok(())
        } else {
            Err(SessionError::invalid_state(operation, self.state))
        }
    }

    /// The persistence rule: a session requested with exactly one
    /// disposable stream (audio, or anything marked best-effort) is not
    /// worth keeping around once it ends.
    fn compute_delete_when_done(streams: &StreamSet) -> bool {
        if streams.len() != 1 {
            return false;
        }
        streams
            .specs()
            .next()
            .map(|spec| spec.best_effort || spec.kind == MediaKind::Audio)
            .unwrap_or(false)
    }

    /// Entry point for an outgoing conversation.
    pub fn init_outgoing(
        &mut self,
        account: Account,
        contact: Contact,
        uri: SipUri,
        streams: StreamSet,
    ) -> Result<Vec<SessionEvent>> {
        self.guard_init("init_outgoing")?;
        self.reinitialize();
        let mut events = Vec::new();
        self.delete_when_done = Self::compute_delete_when_done(&streams);
        self.info.created = Some(Utc::now());
        self.info.remote_identity = Some(contact.identity());
        self.account = Some(account);
        self.contact = Some(contact);
        self.uri = Some(uri);
        self.direction = Some(Direction::Outgoing);
        self.requested = streams;
        self.set_state(SessionState::new(Phase::Initialized), &mut events);
        Ok(events)
    }

    /// Entry point for an incoming conversation reported by the engine.
    pub fn init_incoming(
        &mut self,
        account: Account,
        contact: Contact,
        uri: SipUri,
        engine_session: EngineSessionId,
        proposed_streams: StreamSet,
        remote_instance_id: Option<String>,
    ) -> Result<Vec<SessionEvent>> {
        self.guard_init("init_incoming")?;
        self.reinitialize();
        let mut events = Vec::new();
        self.delete_when_done = Self::compute_delete_when_done(&proposed_streams);
        self.info.created = Some(Utc::now());
        self.info.remote_identity = Some(contact.identity());
        self.account = Some(account);
        self.contact = Some(contact);
        self.uri = Some(uri);
        self.direction = Some(Direction::Incoming);
        self.engine_session = Some(engine_session);
        self.remote_instance_id = remote_instance_id;
        self.requested = proposed_streams;
        self.set_state(SessionState::new(Phase::Initialized), &mut events);
        Ok(events)
    }

    /// Entry point for an outgoing conversation that replaces an
    /// existing one (attended transfer).
    pub fn init_transfer(
        &mut self,
        account: Account,
        contact: Contact,
        uri: SipUri,
        streams: StreamSet,
        replaced_session: Option<EngineSessionId>,
    ) -> Result<Vec<SessionEvent>> {
        let events = self.init_outgoing(account, contact, uri, streams)?;
        self.replaced_session = replaced_session;
        Ok(events)
    }

    /// Whether `connect()` is legal right now: outgoing and
    /// initialized, nothing else.
    pub fn can_connect(&self) -> Result<()> {
        if self.direction == Some(Direction::Outgoing)
            && self.state.matches(&StatePattern::bare(Phase::Initialized))
        {
            Ok(())
        } else {
            Err(SessionError::invalid_state("connect", self.state))
        }
    }

    /// The stream set the session was initialized with.
    pub fn requested_streams(&self) -> Vec<StreamSpec> {
        self.requested.to_vec()
    }

    /// Begin connecting: the manager starts the route lookup and hands
    /// the id in. Only valid for an initialized outgoing session.
    pub fn start_connect(&mut self, lookup: LookupId) -> Result<Vec<SessionEvent>> {
        self.can_connect()?;
        let mut events = Vec::new();
        self.lookup = Some(lookup);
        self.set_state(
            SessionState::with_substate(Phase::Connecting, Substate::DnsLookup),
            &mut events,
        );
        Ok(events)
    }

    /// Begin accepting an incoming session; the manager then asks the
    /// engine to accept with the given streams.
    pub fn start_accept(&mut self) -> Result<Vec<SessionEvent>> {
        if self.direction != Some(Direction::Incoming)
            || !self.state.matches(&StatePattern::bare(Phase::Initialized))
        {
            return Err(SessionError::invalid_state("accept", self.state));
        }
        let mut events = Vec::new();
        self.set_state(SessionState::new(Phase::Connecting), &mut events);
        Ok(events)
    }

    /// `end()`: from any endable state, move toward termination.
    ///
    /// Returns `(events, needs_engine_end)`. When there is no engine
    /// session and no lookup in flight the session terminates locally
    /// right away; otherwise it parks in `ending` until the engine
    /// reports the end. A no-op outside the endable states.
    pub fn end(&mut self) -> (Vec<SessionEvent>, bool) {
        if !self.state.matches_any(ENDABLE) {
            return (Vec::new(), false);
        }
        self.lookup = None;
        if self.engine_session.is_none() {
            let events = self.terminate("Call ended".into(), false, Some(Originator::Local));
            return (events, false);
        }
        let mut events = Vec::new();
        self.set_state(SessionState::new(Phase::Ending), &mut events);
        (events, true)
    }

    /// Explicit deletion request. Idle sessions are deleted at once;
    /// live ones are ended first and deleted from the terminate funnel.
    pub fn delete(&mut self) -> (Vec<SessionEvent>, bool) {
        self.delete_requested = true;
        match self.state.phase {
            Phase::Deleted => (Vec::new(), false),
            Phase::Ended | Phase::New => {
                let mut events = Vec::new();
                self.mark_deleted(&mut events);
                (events, false)
            }
            _ => self.end(),
        }
    }

    /// The single funnel to `ended`. Every path out of the session goes
    /// through here exactly once; repeated calls are no-ops.
    pub fn terminate(
        &mut self,
        reason: String,
        error: bool,
        originator: Option<Originator>,
    ) -> Vec<SessionEvent> {
        if matches!(self.state.phase, Phase::Ended | Phase::Deleted) {
            return Vec::new();
        }
        let mut events = Vec::new();
        let removed = self.streams.kinds();
        self.lookup = None;
        self.engine_session = None;
        self.replaced_session = None;
        self.routes.clear();
        self.streams.clear();
        self.proposed.clear();
        self.server_conference = None;
        if !removed.is_empty() {
            events.push(SessionEvent::StreamsRemoved {
                session: self.id,
                kinds: removed,
            });
        }
        self.end_reason = Some(reason.clone());
        self.end_error = error;
        self.info.ended = Some(Utc::now());
        self.set_state(SessionState::new(Phase::Ended), &mut events);
        events.push(SessionEvent::SessionDidEnd {
            session: self.id,
            reason,
            error,
            originator,
        });
        if self.delete_when_done || self.delete_requested {
            self.mark_deleted(&mut events);
        }
        events
    }

    fn mark_deleted(&mut self, events: &mut Vec<SessionEvent>) {
        self.set_state(SessionState::new(Phase::Deleted), events);
        events.push(SessionEvent::SessionDeleted { session: self.id });
    }

    // ------ mid-call operations ------

    /// Validate a local stream add; moves the streams into `proposed`
    /// and the session into `connected/sent_proposal`. The manager then
    /// sends the proposal to the engine.
    pub fn propose_add_streams(&mut self, specs: Vec<StreamSpec>) -> Result<Vec<SessionEvent>> {
        if !self.state.matches(&StatePattern::bare(Phase::Connected)) {
            return Err(SessionError::invalid_state("add_stream", self.state));
        }
        for spec in &specs {
            if self.streams.contains(spec.kind) || self.proposed.contains(spec.kind) {
                return Err(SessionError::DuplicateStream { kind: spec.kind });
            }
        }
        let mut events = Vec::new();
        for spec in specs {
            self.proposed.insert(spec)?;
        }
        self.set_state(
            SessionState::with_substate(Phase::Connected, Substate::SentProposal),
            &mut events,
        );
        Ok(events)
    }

    /// Validate a local stream removal and mark the renegotiation
    /// pending.
    pub fn propose_remove_streams(&mut self, kinds: &[MediaKind]) -> Result<Vec<SessionEvent>> {
        if !self.state.matches(&StatePattern::bare(Phase::Connected)) {
            return Err(SessionError::invalid_state("remove_stream", self.state));
        }
        for kind in kinds {
            if !self.streams.contains(*kind) {
                return Err(SessionError::StreamNotFound { kind: *kind });
            }
        }
        let mut events = Vec::new();
        self.set_state(
            SessionState::with_substate(Phase::Connected, Substate::SentProposal),
            &mut events,
        );
        Ok(events)
    }

    /// Local hold/unhold. Idempotent; only effective once an engine
    /// session exists. Returns whether the engine must be told.
    pub fn set_local_hold(&mut self, hold: bool) -> (Vec<SessionEvent>, bool) {
        if self.engine_session.is_none() {
            tracing::debug!(session = %self.id, "hold ignored, no engine session");
            return (Vec::new(), false);
        }
        if self.local_hold == hold {
            return (Vec::new(), false);
        }
        self.local_hold = hold;
        let events = vec![SessionEvent::HoldChanged {
            session: self.id,
            local_hold: self.local_hold,
            remote_hold: self.remote_hold,
            on_hold: self.on_hold(),
        }];
        (events, true)
    }

    /// Whether `transfer()` is legal right now. The operation itself is
    /// fire-and-forget in the manager; an illegal state is logged and
    /// swallowed there.
    pub fn can_transfer(&self) -> bool {
        self.state.matches(&StatePattern::bare(Phase::Connected))
    }

    // ------ engine event handlers ------

    /// Completion guard shared by callbacks that must not resurrect a
    /// session already on its way out.
    fn is_winding_down(&self) -> bool {
        matches!(self.state.phase, Phase::Ending | Phase::Ended | Phase::Deleted)
    }

    /// Route lookup succeeded. Empty route sets are a resolution
    /// failure by contract.
    pub fn handle_lookup_succeeded(&mut self, routes: Vec<Route>) -> Vec<SessionEvent> {
        if self.is_winding_down() || self.lookup.is_none() {
            return Vec::new();
        }
        self.lookup = None;
        if routes.is_empty() {
            return self.terminate("Domain not found in DNS".into(), true, None);
        }
        let mut events = Vec::new();
        self.routes = routes;
        self.set_state(
            SessionState::with_substate(Phase::Connecting, Substate::DnsLookupSucceeded),
            &mut events,
        );
        events
    }

    pub fn handle_lookup_failed(&mut self) -> Vec<SessionEvent> {
        if self.is_winding_down() || self.lookup.is_none() {
            return Vec::new();
        }
        self.lookup = None;
        self.terminate("Domain not found in DNS".into(), true, None)
    }

    /// The engine created our outgoing protocol session.
    pub fn handle_new_outgoing(&mut self, engine_session: EngineSessionId) -> Vec<SessionEvent> {
        if self.is_winding_down() {
            return Vec::new();
        }
        let mut events = Vec::new();
        self.engine_session = Some(engine_session);
        self.set_state(SessionState::new(Phase::Connecting), &mut events);
        events
    }

    pub fn handle_ringing(&mut self) -> Vec<SessionEvent> {
        if !self.state.matches(&StatePattern::any(Phase::Connecting)) {
            return Vec::new();
        }
        let mut events = Vec::new();
        self.set_state(
            SessionState::with_substate(Phase::Connecting, Substate::Ringing),
            &mut events,
        );
        events
    }

    pub fn handle_early_media(&mut self) -> Vec<SessionEvent> {
        if !self.state.matches(&StatePattern::any(Phase::Connecting)) {
            return Vec::new();
        }
        let mut events = Vec::new();
        self.set_state(
            SessionState::with_substate(Phase::Connecting, Substate::EarlyMedia),
            &mut events,
        );
        events
    }

    pub fn handle_will_start(&mut self) -> Vec<SessionEvent> {
        if !self.state.matches(&StatePattern::any(Phase::Connecting)) {
            return Vec::new();
        }
        let mut events = Vec::new();
        self.set_state(
            SessionState::with_substate(Phase::Connecting, Substate::Starting),
            &mut events,
        );
        events
    }

    /// Session established with the final negotiated stream list.
    pub fn handle_did_start(&mut self, streams: Vec<StreamSpec>) -> Vec<SessionEvent> {
        if self.is_winding_down() {
            return Vec::new();
        }
        let mut events = Vec::new();
        self.streams.reset_from_specs(&streams);
        self.info.connected = Some(Utc::now());
        self.set_state(SessionState::new(Phase::Connected), &mut events);
        events.push(SessionEvent::SessionDidStart { session: self.id });
        if !self.streams.is_empty() {
            events.push(SessionEvent::StreamsAdded {
                session: self.id,
                kinds: self.streams.kinds(),
            });
        }
        events
    }

    /// Session setup or the established session failed.
    pub fn handle_did_fail(
        &mut self,
        code: u16,
        reason: String,
        originator: Originator,
    ) -> Vec<SessionEvent> {
        let (reason, error) = failure_reason(code, reason, originator);
        self.terminate(reason, error, Some(originator))
    }

    pub fn handle_did_end(&mut self, originator: Originator) -> Vec<SessionEvent> {
        let reason = match originator {
            Originator::Local => "Call ended".to_string(),
            Originator::Remote => "Call ended by remote party".to_string(),
        };
        self.terminate(reason, false, Some(originator))
    }

    /// Protocol-level hold confirmation / remote hold notification.
    pub fn handle_hold_changed(&mut self, originator: Originator, on_hold: bool) -> Vec<SessionEvent> {
        if self.is_winding_down() {
            return Vec::new();
        }
        match originator {
            Originator::Remote => {
                if self.remote_hold == on_hold {
                    return Vec::new();
                }
                self.remote_hold = on_hold;
            }
            // Local holds are already reflected by set_local_hold; the
            // engine confirmation carries no new information.
            Originator::Local => return Vec::new(),
        }
        vec![SessionEvent::HoldChanged {
            session: self.id,
            local_hold: self.local_hold,
            remote_hold: self.remote_hold,
            on_hold: self.on_hold(),
        }]
    }

    /// Remote party proposed adding streams.
    pub fn handle_proposal_received(&mut self, streams: Vec<StreamSpec>) -> Vec<SessionEvent> {
        if !self.state.matches(&StatePattern::bare(Phase::Connected)) {
            return Vec::new();
        }
        let mut events = Vec::new();
        for spec in streams {
            if !self.streams.contains(spec.kind) && !self.proposed.contains(spec.kind) {
                // Contract holds on the engine side; duplicates here
                // would mean a desynced engine, so keep the first.
                let _ = self.proposed.insert(spec);
            }
        }
        self.set_state(
            SessionState::with_substate(Phase::Connected, Substate::ReceivedProposal),
            &mut events,
        );
        events.push(SessionEvent::ProposalReceived {
            session: self.id,
            kinds: self.proposed.kinds(),
        });
        events
    }

    /// A proposal concluded successfully; `streams` is the full new
    /// negotiated list. Returns the events plus whether the session
    /// auto-ends because renegotiation removed its last stream.
    pub fn handle_proposal_accepted(&mut self, streams: Vec<StreamSpec>) -> (Vec<SessionEvent>, bool) {
        if self.is_winding_down() {
            return (Vec::new(), false);
        }
        let mut events = Vec::new();
        let before = self.streams.kinds();
        self.streams.reset_from_specs(&streams);
        self.proposed.clear();
        let after = self.streams.kinds();
        let added: Vec<MediaKind> = after.iter().filter(|k| !before.contains(k)).copied().collect();
        let removed: Vec<MediaKind> = before.iter().filter(|k| !after.contains(k)).copied().collect();
        if !added.is_empty() {
            events.push(SessionEvent::StreamsAdded {
                session: self.id,
                kinds: added,
            });
        }
        if !removed.is_empty() {
            events.push(SessionEvent::StreamsRemoved {
                session: self.id,
                kinds: removed,
            });
        }
        self.set_state(SessionState::new(Phase::Connected), &mut events);
        events.push(SessionEvent::ProposalConcluded {
            session: self.id,
            outcome: ProposalOutcome::Accepted,
        });
        let auto_end = self.streams.is_empty();
        (events, auto_end)
    }

    pub fn handle_proposal_rejected(&mut self, outcome: ProposalOutcome) -> Vec<SessionEvent> {
        if self.is_winding_down() {
            return Vec::new();
        }
        let mut events = Vec::new();
        self.proposed.clear();
        self.set_state(SessionState::new(Phase::Connected), &mut events);
        events.push(SessionEvent::ProposalConcluded {
            session: self.id,
            outcome,
        });
        events
    }
}

/// Map an engine failure to the user-visible `(reason, error)` pair.
fn failure_reason(code: u16, reason: String, originator: Originator) -> (String, bool) {
    match code {
        // Request terminated: our own cancel, not an error.
        487 if originator == Originator::Local => ("Call cancelled".into(), false),
        487 => ("Call cancelled".into(), true),
        486 => ("Busy here".into(), true),
        603 => ("Call declined".into(), true),
        408 => ("Remote party timed out".into(), true),
        _ if reason.is_empty() => (format!("Call failed ({code})"), true),
        _ => (reason, true),
    }
}
