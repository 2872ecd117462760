//! Ringtone arbitration.
//!
//! Three tone slots exist: outbound ringback, inbound ringtone and hold
//! tone. [`plan_ringtone`] recomputes all three from scratch on every
//! relevant change; it is a pure function of the current sessions and
//! pending requests, so repeated evaluation without a state change
//! yields the identical plan. Only the manager applies plans, through a
//! [`ToneSink`], and only when the plan actually changed.

use std::collections::HashMap;

use crate::manager::requests::RequestQueue;
use crate::session::{Session, SessionId};
use crate::state::{Phase, StatePattern, Substate};

/// Ring tone flavor: the full tone, or the discreet secondary beep
/// played when a full tone would talk over an existing call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingTone {
    Primary,
    Secondary,
}

/// Hold tone flavor, depending on how much of the call set is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldTone {
    AllHeld,
    SomeHeld,
}

/// The complete tone decision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingtonePlan {
    pub outbound: Option<RingTone>,
    pub inbound: Option<RingTone>,
    pub hold: Option<HoldTone>,
}

/// Applies a tone plan to the actual audio output.
pub trait ToneSink: Send + Sync {
    fn apply(&self, plan: &RingtonePlan);
}

/// Sink that plays nothing; useful headless and in tests.
pub struct NullToneSink;

impl ToneSink for NullToneSink {
    fn apply(&self, _plan: &RingtonePlan) {}
}

/// States a session rings back in: the remote side is being alerted,
/// either for initial setup or for a mid-call stream proposal.
const RINGBACK_STATES: &[StatePattern] = &[
    StatePattern::exact(Phase::Connecting, Substate::Ringing),
    StatePattern::exact(Phase::Connected, Substate::SentProposal),
];

/// Compute the tone plan for the current state of the world.
pub fn plan_ringtone(
    sessions: &HashMap<SessionId, Session>,
    requests: &RequestQueue,
) -> RingtonePlan {
    let outbound_ringing = sessions
        .values()
        .any(|s| !s.on_hold() && s.state().matches_any(RINGBACK_STATES));

    let connected: Vec<&Session> = sessions
        .values()
        .filter(|s| s.state().matches(&StatePattern::any(Phase::Connected)))
        .collect();

    let outbound = outbound_ringing.then_some(RingTone::Primary);

    let inbound = if requests.is_empty() {
        None
    } else if outbound_ringing || !connected.is_empty() {
        Some(RingTone::Secondary)
    } else {
        Some(RingTone::Primary)
    };

    let hold = if outbound.is_none() && inbound.is_none() {
        let held = connected.iter().filter(|s| s.on_hold()).count();
        if held == 0 {
            None
        } else if held == connected.len() {
            Some(HoldTone::AllHeld)
        } else {
            Some(HoldTone::SomeHeld)
        }
    } else {
        None
    };

    RingtonePlan {
        outbound,
        inbound,
        hold,
    }
}
