//! Hierarchical session state with wildcard pattern matching.
//!
//! A session's lifecycle state is a `phase/substate` pair, rendered as
//! `connecting/dns_lookup` or plain `connected`. Guard conditions
//! throughout the core compare states against patterns where the
//! substate may be a wildcard: `connected/*` matches `connected` with
//! any substate including none, while the bare pattern `connected`
//! matches only when no substate is set.

use serde::{Deserialize, Serialize};

/// Top-level lifecycle phase.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum Phase {
    /// Freshly allocated, never initialized.
    New,
    /// Identity assigned, ready to connect or accept.
    Initialized,
    Connecting,
    Connected,
    Ending,
    Ended,
    /// Terminal. No operation ever succeeds from here.
    Deleted,
}

impl Phase {
    pub fn name(self) -> &'static str {
        match self {
            Phase::New => "none",
            Phase::Initialized => "initialized",
            Phase::Connecting => "connecting",
            Phase::Connected => "connected",
            Phase::Ending => "ending",
            Phase::Ended => "ended",
            Phase::Deleted => "deleted",
        }
    }
}

/// Secondary state within a phase.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum Substate {
    DnsLookup,
    DnsLookupSucceeded,
    Ringing,
    EarlyMedia,
    Starting,
    SentProposal,
    ReceivedProposal,
}

impl Substate {
    pub fn name(self) -> &'static str {
        match self {
            Substate::DnsLookup => "dns_lookup",
            Substate::DnsLookupSucceeded => "dns_lookup_succeeded",
            Substate::Ringing => "ringing",
            Substate::EarlyMedia => "early_media",
            Substate::Starting => "starting",
            Substate::SentProposal => "sent_proposal",
            Substate::ReceivedProposal => "received_proposal",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "dns_lookup" => Substate::DnsLookup,
            "dns_lookup_succeeded" => Substate::DnsLookupSucceeded,
            "ringing" => Substate::Ringing,
            "early_media" => Substate::EarlyMedia,
            "starting" => Substate::Starting,
            "sent_proposal" => Substate::SentProposal,
            "received_proposal" => Substate::ReceivedProposal,
            _ => return None,
        })
    }
}

/// The `phase/substate` value carried by sessions and transfers.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub phase: Phase,
    pub substate: Option<Substate>,
}

impl SessionState {
    pub const fn new(phase: Phase) -> Self {
        Self {
            phase,
            substate: None,
        }
    }

    pub const fn with_substate(phase: Phase, substate: Substate) -> Self {
        Self {
            phase,
            substate: Some(substate),
        }
    }

    /// Exact or wildcard comparison against one pattern.
    pub fn matches(&self, pattern: &StatePattern) -> bool {
        if self.phase != pattern.phase {
            return false;
        }
        match pattern.substate {
            SubstatePattern::Any => true,
            SubstatePattern::Absent => self.substate.is_none(),
            SubstatePattern::Exact(sub) => self.substate == Some(sub),
        }
    }

    /// True when any of the patterns matches.
    pub fn matches_any(&self, patterns: &[StatePattern]) -> bool {
        patterns.iter().any(|p| self.matches(p))
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.substate {
            Some(sub) => write!(f, "{}/{}", self.phase.name(), sub.name()),
            None => f.write_str(self.phase.name()),
        }
    }
}

/// Substate part of a [`StatePattern`].
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum SubstatePattern {
    /// Matches only a state with no substate.
    Absent,
    /// Matches exactly this substate.
    Exact(Substate),
    /// `*`: matches any substate, including none.
    Any,
}

/// A guard pattern a [`SessionState`] can be matched against.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct StatePattern {
    pub phase: Phase,
    pub substate: SubstatePattern,
}

impl StatePattern {
    /// Pattern matching the bare phase (no substate set).
    pub const fn bare(phase: Phase) -> Self {
        Self {
            phase,
            substate: SubstatePattern::Absent,
        }
    }

    /// `phase/*` pattern.
    pub const fn any(phase: Phase) -> Self {
        Self {
            phase,
            substate: SubstatePattern::Any,
        }
    }

    pub const fn exact(phase: Phase, substate: Substate) -> Self {
        Self {
            phase,
            substate: SubstatePattern::Exact(substate),
        }
    }
}

impl std::str::FromStr for StatePattern {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (phase_str, sub_str) = match s.split_once('/') {
            Some((p, sub)) => (p, Some(sub)),
            None => (s, None),
        };
        let phase = match phase_str {
            "none" => Phase::New,
            "initialized" => Phase::Initialized,
            "connecting" => Phase::Connecting,
            "connected" => Phase::Connected,
            "ending" => Phase::Ending,
            "ended" => Phase::Ended,
            "deleted" => Phase::Deleted,
            other => return Err(format!("unknown phase: {other}")),
        };
        let substate = match sub_str {
            None => SubstatePattern::Absent,
            Some("*") => SubstatePattern::Any,
            Some(name) => SubstatePattern::Exact(
                Substate::parse(name).ok_or_else(|| format!("unknown substate: {name}"))?,
            ),
        };
        Ok(Self { phase, substate })
    }
}

impl From<SessionState> for StatePattern {
    fn from(state: SessionState) -> Self {
        Self {
            phase: state.phase,
            substate: match state.substate {
                Some(sub) => SubstatePattern::Exact(sub),
                None => SubstatePattern::Absent,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pat(s: &str) -> StatePattern {
        s.parse().unwrap()
    }

    #[test]
    fn wildcard_matches_any_substate_including_none() {
        let bare = SessionState::new(Phase::Connected);
        let sub = SessionState::with_substate(Phase::Connected, Substate::SentProposal);
        assert!(bare.matches(&pat("connected/*")));
        assert!(sub.matches(&pat("connected/*")));
        assert!(!SessionState::new(Phase::Connecting).matches(&pat("connected/*")));
    }

    #[test]
    fn bare_pattern_requires_absent_substate() {
        let bare = SessionState::new(Phase::Connected);
        let sub = SessionState::with_substate(Phase::Connected, Substate::SentProposal);
        assert!(bare.matches(&pat("connected")));
        assert!(!sub.matches(&pat("connected")));
    }

    #[test]
    fn exact_substate_pattern() {
        let ringing = SessionState::with_substate(Phase::Connecting, Substate::Ringing);
        assert!(ringing.matches(&pat("connecting/ringing")));
        assert!(!ringing.matches(&pat("connecting/early_media")));
        assert!(!ringing.matches(&pat("connecting")));
    }

    #[test]
    fn display_renders_pair() {
        assert_eq!(
            SessionState::with_substate(Phase::Connecting, Substate::DnsLookup).to_string(),
            "connecting/dns_lookup"
        );
        assert_eq!(SessionState::new(Phase::Ended).to_string(), "ended");
    }

    #[test]
    fn matches_any_over_guard_lists() {
        let state = SessionState::with_substate(Phase::Connecting, Substate::Starting);
        assert!(state.matches_any(&[
            pat("initialized"),
            pat("connecting/*"),
            pat("connected/*"),
        ]));
        assert!(!SessionState::new(Phase::Deleted).matches_any(&[
            pat("initialized"),
            pat("connecting/*"),
            pat("connected/*"),
        ]));
    }
}
