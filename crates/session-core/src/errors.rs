//! Error types for the session core.

use softcall_engine_api::MediaKind;
use thiserror::Error;

use crate::session::SessionId;
use crate::transfer::TransferId;

/// Result type for session core operations.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Errors returned to callers of session core operations.
///
/// These cover local contract violations only. Failures arriving from
/// the engine asynchronously are never surfaced here — they become
/// terminal state transitions carrying a `(reason, error)` pair.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Operation invoked outside its documented valid states.
    #[error("invalid state for {operation}: session is {actual}")]
    InvalidState { operation: String, actual: String },

    /// A stream of this kind already exists on the session.
    #[error("duplicate {kind} stream")]
    DuplicateStream { kind: MediaKind },

    /// A requested stream is not present on the session.
    #[error("no {kind} stream on session")]
    StreamNotFound { kind: MediaKind },

    /// Unknown session id.
    #[error("session not found: {session}")]
    SessionNotFound { session: SessionId },

    /// Unknown file transfer id.
    #[error("transfer not found: {transfer}")]
    TransferNotFound { transfer: TransferId },

    /// Unknown incoming request id.
    #[error("incoming request not found")]
    RequestNotFound,

    /// Unknown account id in the settings store.
    #[error("account not found: {account}")]
    AccountNotFound { account: String },

    /// `connect()` called while PGP encryption is still running.
    #[error("encryption in progress, connect deferred")]
    EncryptionPending,

    /// Conference membership rule violated.
    #[error("conference error: {message}")]
    Conference { message: String },

    /// The engine rejected a request synchronously.
    #[error("engine error: {0}")]
    Engine(#[from] softcall_engine_api::EngineError),

    /// File selector could not read the transfer source.
    #[error("file error: {message}")]
    File { message: String },
}

impl SessionError {
    pub fn invalid_state(operation: impl Into<String>, actual: impl ToString) -> Self {
        Self::InvalidState {
            operation: operation.into(),
            actual: actual.to_string(),
        }
    }

    pub fn conference(message: impl Into<String>) -> Self {
        Self::Conference {
            message: message.into(),
        }
    }

    pub fn file(message: impl Into<String>) -> Self {
        Self::File {
            message: message.into(),
        }
    }
}
