//! Multi-party conversation coordination.
//!
//! Two unrelated mechanisms share this module: [`ClientConference`]
//! mixes the audio of several local sessions through an engine bridge,
//! while [`ServerConference`] tracks the roster of a focus-server
//! hosted session with optimistic add/remove reconciliation.

mod client;
mod server;

pub use client::{ClientConference, ConferenceId};
pub use server::{Participant, ServerConference};
