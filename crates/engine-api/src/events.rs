//! Inbound callback surface of the engine.
//!
//! The engine reports everything that happens on the wire as values of
//! one closed enum, delivered over an `mpsc` channel to the session
//! core's event pump. Keeping the enum closed means every consumer is
//! an exhaustive `match`: adding a callback is a compile error until
//! every component has decided what to do with it.

use serde::{Deserialize, Serialize};

use crate::types::{
    EncryptionState, EngineSessionId, IceState, LookupId, MediaKind, Originator, RosterEntry,
    Route, SipUri, StreamSpec, StreamStats, TransferKind,
};

/// Everything the engine can tell the session core.
///
/// Events referencing an [`EngineSessionId`] the core does not know are
/// logged and dropped by the pump; the engine may legitimately emit a
/// few trailing events after the core has discarded a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineEvent {
    /// Route lookup finished with at least the returned routes.
    /// An empty route list is treated as a resolution failure.
    LookupSucceeded {
        lookup: LookupId,
        routes: Vec<Route>,
    },
    /// Route lookup failed outright.
    LookupFailed { lookup: LookupId },

    /// A remote party opened a session toward one of our accounts.
    IncomingSession {
        session: EngineSessionId,
        account: String,
        from: SipUri,
        proposed_streams: Vec<StreamSpec>,
        /// Remote endpoint instance, when the peer advertises one.
        remote_instance_id: Option<String>,
    },

    /// A remote party offered or requested a file transfer.
    IncomingTransfer {
        session: EngineSessionId,
        account: String,
        from: SipUri,
        filename: String,
        size: u64,
        kind: TransferKind,
    },

    /// The engine put our outgoing session request on the wire.
    NewOutgoing { session: EngineSessionId },

    /// Provisional 180: the remote party is ringing.
    GotRinging { session: EngineSessionId },
    /// Provisional 183: the remote party is sending early media.
    GotEarlyMedia { session: EngineSessionId },

    /// The engine accepted our session request and is about to start
    /// final negotiation.
    WillStart { session: EngineSessionId },
    /// The session is established with the given negotiated streams.
    DidStart {
        session: EngineSessionId,
        streams: Vec<StreamSpec>,
    },
    /// Session setup or an established session failed.
    DidFail {
        session: EngineSessionId,
        code: u16,
        reason: String,
        originator: Originator,
    },
    /// The session ended normally.
    DidEnd {
        session: EngineSessionId,
        originator: Originator,
    },

    /// Remote or local hold state changed at the protocol level.
    HoldChanged {
        session: EngineSessionId,
        originator: Originator,
        on_hold: bool,
    },

    /// The remote party proposed adding streams mid-call.
    ProposalReceived {
        session: EngineSessionId,
        streams: Vec<StreamSpec>,
    },
    /// A proposal (ours or theirs) was accepted; `streams` is the new
    /// negotiated stream list.
    ProposalAccepted {
        session: EngineSessionId,
        streams: Vec<StreamSpec>,
    },
    /// A proposal was rejected.
    ProposalRejected {
        session: EngineSessionId,
        code: u16,
        reason: String,
    },
    /// Negotiation of a proposal failed.
    ProposalFailed {
        session: EngineSessionId,
        code: u16,
        reason: String,
    },

    /// Periodic statistics for one stream.
    StreamStatsTick {
        session: EngineSessionId,
        kind: MediaKind,
        stats: StreamStats,
    },
    /// ICE negotiation state changed for one stream.
    IceStateChanged {
        session: EngineSessionId,
        kind: MediaKind,
        state: IceState,
    },
    /// Media encryption state changed for one stream.
    EncryptionChanged {
        session: EngineSessionId,
        kind: MediaKind,
        state: EncryptionState,
        /// Negotiated codec, when it changed alongside.
        codec: Option<String>,
    },

    /// Focus server pushed a fresh participant roster.
    ConferenceRoster {
        session: EngineSessionId,
        entries: Vec<RosterEntry>,
    },

    /// Byte-level progress for a file transfer session.
    TransferProgress {
        session: EngineSessionId,
        transferred: u64,
        total: u64,
    },
}

impl EngineEvent {
    /// The engine session this event belongs to, when it has one.
    pub fn session(&self) -> Option<EngineSessionId> {
        match self {
            EngineEvent::LookupSucceeded { .. } | EngineEvent::LookupFailed { .. } => None,
            EngineEvent::IncomingSession { session, .. }
            | EngineEvent::IncomingTransfer { session, .. }
            | EngineEvent::NewOutgoing { session }
            | EngineEvent::GotRinging { session }
            | EngineEvent::GotEarlyMedia { session }
            | EngineEvent::WillStart { session }
            | EngineEvent::DidStart { session, .. }
            | EngineEvent::DidFail { session, .. }
            | EngineEvent::DidEnd { session, .. }
            | EngineEvent::HoldChanged { session, .. }
            | EngineEvent::ProposalReceived { session, .. }
            | EngineEvent::ProposalAccepted { session, .. }
            | EngineEvent::ProposalRejected { session, .. }
            | EngineEvent::ProposalFailed { session, .. }
            | EngineEvent::StreamStatsTick { session, .. }
            | EngineEvent::IceStateChanged { session, .. }
            | EngineEvent::EncryptionChanged { session, .. }
            | EngineEvent::ConferenceRoster { session, .. }
            | EngineEvent::TransferProgress { session, .. } => Some(*session),
        }
    }
}
