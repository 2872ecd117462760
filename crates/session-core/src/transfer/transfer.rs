//! File transfer state machine.
//!
//! Structurally a smaller sibling of the session machine: no
//! conferencing, no hold, but two extra sub-phases for PGP. Outgoing
//! PGP-enabled transfers pass through `encrypting -> encrypted` before
//! they may connect; incoming `.asc` payloads pass through `decrypting`
//! after the wire session ends. `connect()` from `ended` is the one
//! legal backward transition, used for retries.

use std::path::PathBuf;
use std::time::SystemTime;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use softcall_engine_api::{
    Account, Contact, EngineSessionId, LookupId, Originator, Route, SipUri, TransferKind,
};

use crate::errors::{Result, SessionError};
use crate::events::SessionEvent;
use crate::session::Direction;
use crate::state::Substate;

/// File transfer identifier assigned by the session core.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct TransferId(pub uuid::Uuid);

impl TransferId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl std::fmt::Display for TransferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Top-level transfer phase.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum TransferPhase {
    New,
    Initialized,
    /// Outgoing only: PGP encryption running; `connect()` is illegal.
    Encrypting,
    /// Encryption finished, ready to connect.
    Encrypted,
    Connecting,
    Connected,
    /// Incoming only: wire session done, PGP decryption running.
    Decrypting,
    Ending,
    Ended,
}

impl TransferPhase {
    pub fn name(self) -> &'static str {
        match self {
            TransferPhase::New => "none",
            TransferPhase::Initialized => "initialized",
            TransferPhase::Encrypting => "encrypting",
            TransferPhase::Encrypted => "encrypted",
            TransferPhase::Connecting => "connecting",
            TransferPhase::Connected => "connected",
            TransferPhase::Decrypting => "decrypting",
            TransferPhase::Ending => "ending",
            TransferPhase::Ended => "ended",
        }
    }
}

/// `phase/substate` pair for transfers; only `connecting` carries
/// substates (`dns_lookup`, `ringing`, `starting`).
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct TransferState {
    pub phase: TransferPhase,
    pub substate: Option<Substate>,
}

impl TransferState {
    pub const fn new(phase: TransferPhase) -> Self {
        Self {
            phase,
            substate: None,
        }
    }

    pub const fn with_substate(phase: TransferPhase, substate: Substate) -> Self {
        Self {
            phase,
            substate: Some(substate),
        }
    }
}

impl std::fmt::Display for TransferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.substate {
            Some(sub) => write!(f, "{}/{}", self.phase.name(), sub.name()),
            None => f.write_str(self.phase.name()),
        }
    }
}

/// The file being offered or fetched, with its content hash.
///
/// The hash is reused across retries as long as the file's mtime is
/// unchanged; a changed mtime forces a recompute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSelector {
    pub path: PathBuf,
    pub size: u64,
    pub mtime: Option<SystemTime>,
    pub hash: Option<String>,
}

impl FileSelector {
    /// Describe a local file, hashing its contents.
    pub async fn for_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| SessionError::file(format!("{}: {e}", path.display())))?;
        let mut selector = Self {
            path,
            size: metadata.len(),
            mtime: metadata.modified().ok(),
            hash: None,
        };
        selector.compute_hash().await?;
        Ok(selector)
    }

    /// Describe a remote file offered to us; no local hash available.
    pub fn for_remote(path: impl Into<PathBuf>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
            mtime: None,
            hash: None,
        }
    }

    /// Refresh for a retry: recompute the hash only when the file
    /// changed since it was last hashed.
    pub async fn refresh(&mut self) -> Result<()> {
        let metadata = tokio::fs::metadata(&self.path)
            .await
            .map_err(|e| SessionError::file(format!("{}: {e}", self.path.display())))?;
        let mtime = metadata.modified().ok();
        if mtime != self.mtime || self.hash.is_none() {
            self.size = metadata.len();
            self.mtime = mtime;
            self.compute_hash().await?;
        }
        Ok(())
    }

    async fn compute_hash(&mut self) -> Result<()> {
        let contents = tokio::fs::read(&self.path)
            .await
            .map_err(|e| SessionError::file(format!("{}: {e}", self.path.display())))?;
        let digest = Sha256::digest(&contents);
        self.hash = Some(format!("sha256:{digest:x}"));
        Ok(())
    }

    /// Whether the payload looks PGP-armored.
    pub fn is_armored(&self) -> bool {
        self.path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("asc"))
            .unwrap_or(false)
    }
}

/// One file push or pull with a remote party.
#[derive(Debug)]
pub struct FileTransfer {
    id: TransferId,
    state: TransferState,

    pub account: Option<Account>,
    pub contact: Option<Contact>,
    pub uri: Option<SipUri>,
    pub direction: Option<Direction>,
    pub kind: Option<TransferKind>,
    pub selector: Option<FileSelector>,

    pub engine_session: Option<EngineSessionId>,
    pub lookup: Option<LookupId>,
    pub routes: Vec<Route>,

    pub transferred: u64,
    pub total: u64,

    pub created: Option<chrono::DateTime<Utc>>,
    pub ended_at: Option<chrono::DateTime<Utc>>,
    pub end_reason: Option<String>,
    pub end_error: bool,
}

impl FileTransfer {
    pub fn new() -> Self {
        Self {
            id: TransferId::new(),
            state: TransferState::new(TransferPhase::New),
            account: None,
            contact: None,
            uri: None,
            direction: None,
            kind: None,
            selector: None,
            engine_session: None,
            lookup: None,
            routes: Vec::new(),
            transferred: 0,
            total: 0,
            created: None,
            ended_at: None,
            end_reason: None,
            end_error: false,
        }
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    fn set_state(&mut self, new: TransferState, events: &mut Vec<SessionEvent>) {
        if self.state == new {
            return;
        }
        let old = self.state;
        self.state = new;
        tracing::debug!(transfer = %self.id, "state {} -> {}", old, new);
        events.push(SessionEvent::TransferStateChanged {
            transfer: self.id,
            old,
            new,
        });
    }

    fn is_winding_down(&self) -> bool {
        matches!(self.state.phase, TransferPhase::Ending | TransferPhase::Ended)
    }

    fn reinitialize(&mut self) {
        self.engine_session = None;
        self.lookup = None;
        self.routes.clear();
        self.transferred = 0;
        self.total = 0;
        self.ended_at = None;
        self.end_reason = None;
        self.end_error = false;
    }

    fn guard_init(&self, operation: &str) -> Result<()> {
        match self.state.phase {
            TransferPhase::New | TransferPhase::Initialized | TransferPhase::Ended => Ok(()),
            _ => Err(SessionError::invalid_state(operation, self.state)),
        }
    }

    /// Entry point for an outgoing push (or pull of a previously
    /// offered file).
    pub fn init_outgoing(
        &mut self,
        account: Account,
        contact: Contact,
        uri: SipUri,
        selector: FileSelector,
        kind: TransferKind,
    ) -> Result<Vec<SessionEvent>> {
        self.guard_init("init_outgoing")?;
        self.reinitialize();
        let mut events = Vec::new();
        self.created = Some(Utc::now());
        self.account = Some(account);
        self.contact = Some(contact);
        self.uri = Some(uri);
        self.direction = Some(Direction::Outgoing);
        self.kind = Some(kind);
        self.total = selector.size;
        self.selector = Some(selector);
        self.set_state(TransferState::new(TransferPhase::Initialized), &mut events);
        Ok(events)
    }

    /// Entry point for an incoming transfer reported by the engine.
    pub fn init_incoming(
        &mut self,
        account: Account,
        contact: Contact,
        uri: SipUri,
        engine_session: EngineSessionId,
        selector: FileSelector,
        kind: TransferKind,
    ) -> Result<Vec<SessionEvent>> {
        self.guard_init("init_incoming")?;
        self.reinitialize();
        let mut events = Vec::new();
        self.created = Some(Utc::now());
        self.account = Some(account);
        self.contact = Some(contact);
        self.uri = Some(uri);
        self.direction = Some(Direction::Incoming);
        self.kind = Some(kind);
        self.engine_session = Some(engine_session);
        self.total = selector.size;
        self.selector = Some(selector);
        self.set_state(TransferState::new(TransferPhase::Initialized), &mut events);
        Ok(events)
    }

    /// Re-enter `initialized` from `ended` for a retry. The manager
    /// refreshes the selector (mtime-gated hash reuse) before calling
    /// this.
    pub fn reinit_for_retry(&mut self) -> Result<Vec<SessionEvent>> {
        if self.state.phase != TransferPhase::Ended {
            return Err(SessionError::invalid_state("retry", self.state));
        }
        self.reinitialize();
        let mut events = Vec::new();
        self.created = Some(Utc::now());
        self.total = self.selector.as_ref().map(|s| s.size).unwrap_or(0);
        self.set_state(TransferState::new(TransferPhase::Initialized), &mut events);
        Ok(events)
    }

    /// Enter the PGP encryption sub-phase.
    pub fn begin_encrypting(&mut self) -> Result<Vec<SessionEvent>> {
        if self.state.phase != TransferPhase::Initialized
            || self.direction != Some(Direction::Outgoing)
        {
            return Err(SessionError::invalid_state("encrypt", self.state));
        }
        let mut events = Vec::new();
        self.set_state(TransferState::new(TransferPhase::Encrypting), &mut events);
        Ok(events)
    }

    /// Encryption helper finished; swap the selector to the armored
    /// output. Ignored when the transfer was ended meanwhile.
    pub fn handle_encrypted(&mut self, armored: PathBuf, size: u64) -> Vec<SessionEvent> {
        if self.is_winding_down() || self.state.phase != TransferPhase::Encrypting {
            return Vec::new();
        }
        let mut events = Vec::new();
        if let Some(selector) = self.selector.as_mut() {
            selector.path = armored;
            selector.size = size;
        }
        self.total = size;
        self.set_state(TransferState::new(TransferPhase::Encrypted), &mut events);
        events
    }

    pub fn handle_encrypt_failed(&mut self, reason: String) -> Vec<SessionEvent> {
        if self.is_winding_down() {
            return Vec::new();
        }
        self.terminate(reason, true)
    }

    /// Whether `connect()` is legal right now.
    pub fn can_connect(&self) -> Result<()> {
        match self.state.phase {
            TransferPhase::Encrypting => Err(SessionError::EncryptionPending),
            TransferPhase::Initialized | TransferPhase::Encrypted => Ok(()),
            _ => Err(SessionError::invalid_state("connect", self.state)),
        }
    }

    /// Begin connecting. Illegal while encryption is still running;
    /// the encryption completion path calls back into connect.
    pub fn start_connect(&mut self, lookup: LookupId) -> Result<Vec<SessionEvent>> {
        self.can_connect()?;
        let mut events = Vec::new();
        self.lookup = Some(lookup);
        self.set_state(
            TransferState::with_substate(TransferPhase::Connecting, Substate::DnsLookup),
            &mut events,
        );
        Ok(events)
    }

    pub fn handle_lookup_succeeded(&mut self, routes: Vec<Route>) -> Vec<SessionEvent> {
        if self.is_winding_down() || self.lookup.is_none() {
            return Vec::new();
        }
        self.lookup = None;
        if routes.is_empty() {
            return self.terminate("Domain not found in DNS".into(), true);
        }
        self.routes = routes;
        // Stays in connecting; the engine session comes next.
        Vec::new()
    }

    pub fn handle_lookup_failed(&mut self) -> Vec<SessionEvent> {
        if self.is_winding_down() || self.lookup.is_none() {
            return Vec::new();
        }
        self.lookup = None;
        self.terminate("Domain not found in DNS".into(), true)
    }

    pub fn handle_started_session(&mut self, engine_session: EngineSessionId) -> Vec<SessionEvent> {
        if self.is_winding_down() {
            return Vec::new();
        }
        self.engine_session = Some(engine_session);
        Vec::new()
    }

    pub fn handle_ringing(&mut self) -> Vec<SessionEvent> {
        if self.state.phase != TransferPhase::Connecting {
            return Vec::new();
        }
        let mut events = Vec::new();
        self.set_state(
            TransferState::with_substate(TransferPhase::Connecting, Substate::Ringing),
            &mut events,
        );
        events
    }

    pub fn handle_will_start(&mut self) -> Vec<SessionEvent> {
        if self.state.phase != TransferPhase::Connecting {
            return Vec::new();
        }
        let mut events = Vec::new();
        self.set_state(
            TransferState::with_substate(TransferPhase::Connecting, Substate::Starting),
            &mut events,
        );
        events
    }

    pub fn handle_did_start(&mut self) -> Vec<SessionEvent> {
        if self.is_winding_down() {
            return Vec::new();
        }
        let mut events = Vec::new();
        self.set_state(TransferState::new(TransferPhase::Connected), &mut events);
        events
    }

    pub fn handle_progress(&mut self, transferred: u64, total: u64) -> Vec<SessionEvent> {
        if self.state.phase != TransferPhase::Connected {
            return Vec::new();
        }
        self.transferred = transferred;
        if total > 0 {
            self.total = total;
        }
        vec![SessionEvent::TransferProgress {
            transfer: self.id,
            transferred,
            total: self.total,
        }]
    }

    /// Whether a finished incoming payload still needs PGP decryption.
    fn needs_decryption(&self) -> bool {
        self.direction == Some(Direction::Incoming)
            && self
                .selector
                .as_ref()
                .map(|s| s.is_armored())
                .unwrap_or(false)
    }

    /// Wire session ended. Complete incoming armored payloads detour
    /// through `decrypting`; everything else terminates here. Returns
    /// the events plus whether the manager must start decryption.
    pub fn handle_did_end(&mut self, originator: Originator) -> (Vec<SessionEvent>, bool) {
        if self.state.phase == TransferPhase::Ended {
            return (Vec::new(), false);
        }
        let complete = self.total > 0 && self.transferred >= self.total;
        if complete && self.needs_decryption() && self.state.phase == TransferPhase::Connected {
            let mut events = Vec::new();
            self.engine_session = None;
            self.set_state(TransferState::new(TransferPhase::Decrypting), &mut events);
            return (events, true);
        }
        let events = if complete {
            self.terminate("Transfer completed".into(), false)
        } else if self.state.phase == TransferPhase::Connected {
            self.terminate("Transfer interrupted".into(), true)
        } else {
            let reason = match originator {
                Originator::Local => "Transfer cancelled".to_string(),
                Originator::Remote => "Transfer refused by remote party".to_string(),
            };
            self.terminate(reason, true)
        };
        (events, false)
    }

    pub fn handle_did_fail(&mut self, code: u16, reason: String) -> Vec<SessionEvent> {
        let reason = if reason.is_empty() {
            format!("Transfer failed ({code})")
        } else {
            reason
        };
        self.terminate(reason, true)
    }

    /// Decryption helper finished; swap the selector to the plaintext
    /// output.
    pub fn handle_decrypted(&mut self, plaintext: PathBuf) -> Vec<SessionEvent> {
        if self.state.phase != TransferPhase::Decrypting {
            return Vec::new();
        }
        if let Some(selector) = self.selector.as_mut() {
            selector.path = plaintext;
        }
        self.terminate("Transfer completed".into(), false)
    }

    pub fn handle_decrypt_failed(&mut self, reason: String) -> Vec<SessionEvent> {
        if self.state.phase != TransferPhase::Decrypting {
            return Vec::new();
        }
        self.terminate(reason, true)
    }

    /// `end()`: cancel or finish locally.
    pub fn end(&mut self) -> (Vec<SessionEvent>, bool) {
        match self.state.phase {
            TransferPhase::New | TransferPhase::Ending | TransferPhase::Ended => {
                (Vec::new(), false)
            }
            // No wire session yet (including encrypting: the helper's
            // completion will find the transfer ended and bail).
            _ if self.engine_session.is_none() => {
                (self.terminate("Transfer cancelled".into(), false), false)
            }
            _ => {
                let mut events = Vec::new();
                self.lookup = None;
                self.set_state(TransferState::new(TransferPhase::Ending), &mut events);
                (events, true)
            }
        }
    }

    /// Single funnel to `ended`.
    pub fn terminate(&mut self, reason: String, error: bool) -> Vec<SessionEvent> {
        if self.state.phase == TransferPhase::Ended {
            return Vec::new();
        }
        let mut events = Vec::new();
        self.lookup = None;
        self.engine_session = None;
        self.routes.clear();
        self.end_reason = Some(reason.clone());
        self.end_error = error;
        self.ended_at = Some(Utc::now());
        self.set_state(TransferState::new(TransferPhase::Ended), &mut events);
        events.push(SessionEvent::TransferDidEnd {
            transfer: self.id,
            reason,
            error,
        });
        events
    }
}
