//! Contract between the softcall session core and the external
//! communications engine (SIP signaling + media stack).
//!
//! The session core never speaks SIP, RTP or MSRP itself. It drives the
//! engine through the [`SignalingEngine`] trait and consumes the
//! engine's callbacks as [`EngineEvent`] values delivered over a
//! channel. Everything in this crate is vocabulary for that boundary:
//! identifiers, media descriptors, the event enum, and the collaborator
//! traits (engine, audio bridge, PGP helper, contact resolution,
//! persistent settings).

pub mod engine;
pub mod events;
pub mod settings;
pub mod types;

pub use engine::{
    AudioBridge, ContactResolver, EngineError, EngineResult, PgpEngine, SignalingEngine,
};
pub use events::EngineEvent;
pub use settings::{Settings, SettingsStore};
pub use types::{
    Account, Contact, EncryptionState, EngineSessionId, IceState, LookupId, MediaKind, Originator,
    RosterEntry, Route, SipUri, StreamSpec, StreamStats, TransferKind, Transport,
};
