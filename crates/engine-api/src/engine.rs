//! Collaborator traits: the signaling/media engine, its client-side
//! audio mixer, the PGP helper, and contact resolution.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{
    Account, Contact, EngineSessionId, LookupId, MediaKind, Route, SipUri, StreamSpec,
    TransferKind,
};

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors the engine can return synchronously.
///
/// Asynchronous failures (a call that fails after setup started) never
/// surface here; those arrive as [`crate::EngineEvent::DidFail`].
#[derive(Debug, Error)]
pub enum EngineError {
    /// The operation is not legal for the session's current protocol
    /// state (e.g. transferring a session that is not established).
    #[error("illegal state: {message}")]
    IllegalState { message: String },

    /// The operation is not legal for the session's direction.
    #[error("illegal direction: {message}")]
    IllegalDirection { message: String },

    /// The engine does not know the referenced session.
    #[error("unknown engine session: {session}")]
    UnknownSession { session: EngineSessionId },

    /// The engine rejected the request outright.
    #[error("engine rejected request: {message}")]
    Rejected { message: String },

    /// External helper tool failed (PGP encrypt/decrypt).
    #[error("helper failed: {message}")]
    Helper { message: String },
}

impl EngineError {
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState {
            message: message.into(),
        }
    }

    pub fn illegal_direction(message: impl Into<String>) -> Self {
        Self::IllegalDirection {
            message: message.into(),
        }
    }

    pub fn helper(message: impl Into<String>) -> Self {
        Self::Helper {
            message: message.into(),
        }
    }
}

/// The external SIP + media stack.
///
/// Every method is fire-and-forget from the session core's point of
/// view: a returned `Ok` means the engine accepted the request, and the
/// outcome arrives later as [`crate::EngineEvent`]s on the event
/// channel. No method blocks on network activity.
#[async_trait]
pub trait SignalingEngine: Send + Sync {
    /// Start an asynchronous DNS/route lookup for `target`. The result
    /// arrives as `LookupSucceeded`/`LookupFailed` carrying the
    /// returned id.
    async fn start_lookup(
        &self,
        target: &SipUri,
        outbound_proxy: Option<&SipUri>,
    ) -> EngineResult<LookupId>;

    /// Create an outgoing protocol session toward `target` over the
    /// given routes, requesting `streams`. Progress arrives as
    /// `WillStart`/`GotRinging`/`GotEarlyMedia`/`DidStart`/`DidFail`.
    async fn create_session(
        &self,
        account: &Account,
        target: &SipUri,
        routes: &[Route],
        streams: &[StreamSpec],
    ) -> EngineResult<EngineSessionId>;

    /// Accept an incoming session with the given streams.
    async fn accept_session(
        &self,
        session: EngineSessionId,
        streams: &[StreamSpec],
    ) -> EngineResult<()>;

    /// Reject an incoming session with a response code (486 busy, 603
    /// decline, ...).
    async fn reject_session(&self, session: EngineSessionId, code: u16) -> EngineResult<()>;

    /// End an established or in-progress session. Completion arrives as
    /// `DidEnd` (or `DidFail` for sessions that never started).
    async fn end_session(&self, session: EngineSessionId) -> EngineResult<()>;

    /// Blind or attended transfer of an established session.
    async fn transfer_session(
        &self,
        session: EngineSessionId,
        target: &SipUri,
        replaced: Option<EngineSessionId>,
    ) -> EngineResult<()>;

    /// Propose adding streams mid-call. Outcome arrives as
    /// `ProposalAccepted`/`ProposalRejected`/`ProposalFailed`.
    async fn add_streams(
        &self,
        session: EngineSessionId,
        streams: &[StreamSpec],
    ) -> EngineResult<()>;

    /// Renegotiate the session without the given stream kinds.
    async fn remove_streams(
        &self,
        session: EngineSessionId,
        kinds: &[MediaKind],
    ) -> EngineResult<()>;

    /// Accept the remote party's pending stream proposal, keeping the
    /// listed kinds.
    async fn accept_proposal(
        &self,
        session: EngineSessionId,
        kinds: &[MediaKind],
    ) -> EngineResult<()>;

    /// Reject the remote party's pending stream proposal.
    async fn reject_proposal(&self, session: EngineSessionId) -> EngineResult<()>;

    /// Put the session on hold / take it off hold at the protocol
    /// level.
    async fn hold_session(&self, session: EngineSessionId, on_hold: bool) -> EngineResult<()>;

    /// Mute or unmute one stream's input.
    async fn mute_stream(
        &self,
        session: EngineSessionId,
        kind: MediaKind,
        muted: bool,
    ) -> EngineResult<()>;

    /// Send a DTMF digit on the audio stream.
    async fn send_dtmf(&self, session: EngineSessionId, digit: char) -> EngineResult<()>;

    /// Start recording the session's audio.
    async fn start_recording(&self, session: EngineSessionId) -> EngineResult<()>;

    /// Stop recording the session's audio.
    async fn stop_recording(&self, session: EngineSessionId) -> EngineResult<()>;

    /// Create a client-side audio mixing bridge.
    async fn create_audio_bridge(&self) -> EngineResult<Arc<dyn AudioBridge>>;

    /// Ask the focus server to dial out to / add `participant`.
    /// Confirmation arrives via `ConferenceRoster` snapshots.
    async fn add_conference_participant(
        &self,
        session: EngineSessionId,
        participant: &SipUri,
    ) -> EngineResult<()>;

    /// Ask the focus server to remove `participant`.
    async fn remove_conference_participant(
        &self,
        session: EngineSessionId,
        participant: &SipUri,
    ) -> EngineResult<()>;

    /// Start a file transfer session (MSRP push or pull). Lifecycle
    /// arrives through the same session events, plus
    /// `TransferProgress`.
    async fn start_transfer(
        &self,
        account: &Account,
        peer: &SipUri,
        routes: &[Route],
        file: &Path,
        size: u64,
        hash: Option<&str>,
        kind: TransferKind,
    ) -> EngineResult<EngineSessionId>;
}

/// Client-side audio mixer backing a local conference.
///
/// The bridge is the one genuinely shared media resource; all mutation
/// goes through the owning conference, never directly from sessions.
#[async_trait]
pub trait AudioBridge: Send + Sync {
    /// Mirror the audio of the given engine session into the mix.
    async fn add_stream(&self, session: EngineSessionId) -> EngineResult<()>;

    /// Remove the given engine session's audio from the mix.
    async fn remove_stream(&self, session: EngineSessionId) -> EngineResult<()>;

    /// Hold the whole bridge (silences the mix toward all members).
    async fn hold(&self) -> EngineResult<()>;

    /// Resume the whole bridge.
    async fn unhold(&self) -> EngineResult<()>;

    /// Number of streams currently mirrored into the mix.
    async fn stream_count(&self) -> usize;
}

/// External PGP helper used by file transfers.
///
/// Implementations run the helper tool off-thread; the session core
/// awaits these from spawned tasks and marshals completion back through
/// its event channel.
#[async_trait]
pub trait PgpEngine: Send + Sync {
    /// Encrypt `path` for `recipient`, returning the `.asc` output
    /// path.
    async fn encrypt_file(&self, path: &Path, recipient: &SipUri) -> EngineResult<PathBuf>;

    /// Decrypt an `.asc` file, returning the plaintext output path.
    async fn decrypt_file(&self, path: &Path) -> EngineResult<PathBuf>;
}

/// Maps a raw URI/number string to a display contact. Pure lookup; the
/// session core calls it whenever a remote party must be identified.
pub trait ContactResolver: Send + Sync {
    fn resolve(&self, uri: &SipUri) -> Contact;
}
