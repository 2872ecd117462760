//! Notification surface of the session core.
//!
//! Every observable change the core makes is published as a
//! [`SessionEvent`] on a broadcast channel owned by the manager. GUI
//! layers, history/logging and tests all consume the same stream; the
//! core itself never calls back into its consumers.

use softcall_engine_api::{MediaKind, Originator, SipUri};

use crate::conference::ConferenceId;
use crate::manager::{RequestId, RequestTarget, RingtonePlan};
use crate::session::SessionId;
use crate::state::SessionState;
use crate::transfer::{TransferId, TransferState};

/// Outcome of a mid-call stream proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposalOutcome {
    Accepted,
    Rejected,
    Failed,
}

/// Events published by the session core.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A session moved along the lifecycle graph.
    SessionStateChanged {
        session: SessionId,
        old: SessionState,
        new: SessionState,
    },
    /// The session is established and media is flowing.
    SessionDidStart { session: SessionId },
    /// The session reached `ended`, carrying the terminal reason.
    SessionDidEnd {
        session: SessionId,
        reason: String,
        error: bool,
        originator: Option<Originator>,
    },
    /// The session reached `deleted`; all external references must be
    /// dropped.
    SessionDeleted { session: SessionId },

    /// Local and/or remote hold flags changed.
    HoldChanged {
        session: SessionId,
        local_hold: bool,
        remote_hold: bool,
        on_hold: bool,
    },

    /// Streams became active on the session.
    StreamsAdded {
        session: SessionId,
        kinds: Vec<MediaKind>,
    },
    /// Streams were removed from the session.
    StreamsRemoved {
        session: SessionId,
        kinds: Vec<MediaKind>,
    },
    /// The remote party proposed adding streams.
    ProposalReceived {
        session: SessionId,
        kinds: Vec<MediaKind>,
    },
    /// A pending proposal concluded and the session is `connected`
    /// again.
    ProposalConcluded {
        session: SessionId,
        outcome: ProposalOutcome,
    },

    /// A local audio-mixed conference came into existence.
    ConferenceCreated { conference: ConferenceId },
    /// A conference dissolved (membership fell under two).
    ConferenceDissolved { conference: ConferenceId },
    /// A session joined a local conference.
    ConferenceJoined {
        conference: ConferenceId,
        session: SessionId,
    },
    /// A session left a local conference.
    ConferenceLeft {
        conference: ConferenceId,
        session: SessionId,
    },

    /// Focus-server roster: a participant confirmed present.
    ParticipantJoined { session: SessionId, uri: SipUri },
    /// Focus-server roster: a participant disappeared.
    ParticipantLeft { session: SessionId, uri: SipUri },
    /// An optimistic add never showed up in the roster.
    ParticipantAddFailed { session: SessionId, uri: SipUri },

    /// An incoming request was queued for a user decision.
    IncomingRequestQueued {
        request: RequestId,
        target: RequestTarget,
        kinds: Vec<MediaKind>,
        /// Whether this request currently owns keyboard focus.
        focused: bool,
    },
    /// The request left the queue (answered, rejected, cancelled).
    IncomingRequestRemoved { request: RequestId },
    /// Focus moved to a different pending request.
    IncomingRequestFocused { request: RequestId },

    /// The ringtone arbitration produced a new plan.
    RingtoneChanged { plan: RingtonePlan },

    /// The foreground session changed.
    ActiveSessionChanged { session: Option<SessionId> },

    /// A file transfer moved along its lifecycle graph.
    TransferStateChanged {
        transfer: TransferId,
        old: TransferState,
        new: TransferState,
    },
    /// A file transfer reached `ended`.
    TransferDidEnd {
        transfer: TransferId,
        reason: String,
        error: bool,
    },
    /// Byte progress for a running transfer.
    TransferProgress {
        transfer: TransferId,
        transferred: u64,
        total: u64,
    },
}
