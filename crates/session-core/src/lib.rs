//! Session lifecycle and call orchestration for the softcall
//! softphone.
//!
//! This crate is the coordination layer between a user interface and
//! the external communications engine: it tracks per-conversation state
//! machines, local and server-hosted conferences, file transfers, the
//! incoming-request queue and ringtone arbitration. It implements no
//! protocol itself — every wire-level operation is delegated through
//! the traits in `softcall-engine-api`, and every engine callback comes
//! back as an event consumed by [`manager::SessionManager`].
//!
//! The crate is organized leaf to root:
//!
//! - [`state`]: the `phase/substate` state value with wildcard
//!   pattern matching used by every guard condition.
//! - [`streams`]: typed stream collections (at most one stream per
//!   media kind).
//! - [`info`]: passive telemetry snapshots fed from engine events.
//! - [`session`]: the per-conversation state machine.
//! - [`conference`]: client-side audio mixing and focus-server roster
//!   tracking.
//! - [`transfer`]: the file push/pull state machine with its PGP
//!   sub-phases, plus history persistence.
//! - [`manager`]: the process-wide coordinator owning all of the
//!   above.

pub mod conference;
pub mod errors;
pub mod events;
pub mod info;
pub mod manager;
pub mod session;
pub mod state;
pub mod streams;
pub mod transfer;

pub use conference::{ClientConference, ConferenceId, Participant, ServerConference};
pub use errors::{Result, SessionError};
pub use events::{ProposalOutcome, SessionEvent};
pub use info::{SessionInfo, StreamInfo};
pub use manager::{
    HoldTone, IncomingRequest, NullToneSink, RequestId, RequestTarget, RingTone, RingtonePlan,
    SessionManager, ToneSink,
};
pub use session::{Direction, Session, SessionId};
pub use state::{Phase, SessionState, StatePattern, Substate, SubstatePattern};
pub use streams::{Stream, StreamMap, StreamSet};
pub use transfer::{
    FileSelector, FileTransfer, TransferHistory, TransferId, TransferPhase, TransferRecord,
    TransferState,
};
