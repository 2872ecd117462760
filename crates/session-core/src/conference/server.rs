//! Focus-server conference roster with optimistic updates.
//!
//! Adding a participant inserts a local placeholder immediately and
//! asks the server to dial out; the server's next roster snapshot
//! confirms or refutes it. Reconciliation always diffs the snapshot
//! against the current roster (never against history) in a fixed order:
//! removed, confirmed-added, updated, newly-appeared. Repeating a
//! snapshot is a no-op.

use std::collections::{BTreeSet, HashMap};

use softcall_engine_api::{RosterEntry, SipUri};

use crate::events::SessionEvent;
use crate::session::SessionId;

/// One participant in a server-hosted conference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub uri: SipUri,
    pub display_name: Option<String>,
    /// Placeholder awaiting server confirmation.
    pub pending: bool,
}

/// Roster tracking for one focus-hosted session.
#[derive(Debug, Default)]
pub struct ServerConference {
    participants: HashMap<SipUri, Participant>,
    pending_removals: BTreeSet<SipUri>,
}

impl ServerConference {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn participants(&self) -> impl Iterator<Item = &Participant> {
        self.participants.values()
    }

    pub fn contains(&self, uri: &SipUri) -> bool {
        self.participants.contains_key(uri)
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    /// Optimistically record a participant the local user asked the
    /// server to add. Returns false when the URI is already known.
    pub fn add_pending(&mut self, uri: SipUri, display_name: Option<String>) -> bool {
        if self.participants.contains_key(&uri) {
            return false;
        }
        self.pending_removals.remove(&uri);
        self.participants.insert(
            uri.clone(),
            Participant {
                uri,
                display_name,
                pending: true,
            },
        );
        true
    }

    /// Roll back an optimistic add whose request the engine rejected
    /// outright.
    pub fn drop_pending(&mut self, uri: &SipUri) -> bool {
        match self.participants.get(uri) {
            Some(participant) if participant.pending => {
                self.participants.remove(uri);
                true
            }
            _ => false,
        }
    }

    /// Record that the local user asked the server to remove `uri`.
    /// The entry stays in the roster until a snapshot confirms it.
    pub fn mark_removal(&mut self, uri: &SipUri) -> bool {
        if !self.participants.contains_key(uri) {
            return false;
        }
        self.pending_removals.insert(uri.clone());
        true
    }

    /// Reconcile a server roster snapshot.
    pub fn apply_snapshot(
        &mut self,
        session: SessionId,
        entries: &[RosterEntry],
    ) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        let snapshot: HashMap<&SipUri, &RosterEntry> =
            entries.iter().map(|e| (&e.uri, e)).collect();

        // 1. Removed: known entries absent from the snapshot. A
        // pending add that never appeared is a failed add; anything
        // else is gone, whether or not we asked for its removal.
        let absent: Vec<SipUri> = self
            .participants
            .keys()
            .filter(|uri| !snapshot.contains_key(*uri))
            .cloned()
            .collect();
        for uri in absent {
            let participant = self.participants.remove(&uri).expect("known participant");
            self.pending_removals.remove(&uri);
            if participant.pending {
                tracing::info!(%session, %uri, "conference add failed");
                events.push(SessionEvent::ParticipantAddFailed { session, uri });
            } else {
                events.push(SessionEvent::ParticipantLeft { session, uri });
            }
        }

        // 2. Confirmed-added: pending placeholders present in the
        // snapshot.
        let confirmed: Vec<SipUri> = self
            .participants
            .iter()
            .filter(|(uri, p)| p.pending && snapshot.contains_key(*uri))
            .map(|(uri, _)| uri.clone())
            .collect();
        for uri in confirmed {
            let participant = self.participants.get_mut(&uri).expect("known participant");
            participant.pending = false;
            if let Some(entry) = snapshot.get(&uri) {
                participant.display_name = entry.display_name.clone();
            }
            events.push(SessionEvent::ParticipantJoined { session, uri });
        }

        // 3. Updated: established entries refresh their details
        // silently. Entries we asked to remove but which are still
        // present stay pending, unconfirmed.
        for (uri, participant) in self.participants.iter_mut() {
            if let Some(entry) = snapshot.get(uri) {
                if !participant.pending {
                    participant.display_name = entry.display_name.clone();
                }
            }
        }

        // 4. Newly-appeared: snapshot entries we have never seen.
        for entry in entries {
            if !self.participants.contains_key(&entry.uri) {
                self.participants.insert(
                    entry.uri.clone(),
                    Participant {
                        uri: entry.uri.clone(),
                        display_name: entry.display_name.clone(),
                        pending: false,
                    },
                );
                events.push(SessionEvent::ParticipantJoined {
                    session,
                    uri: entry.uri.clone(),
                });
            }
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn uri(s: &str) -> SipUri {
        SipUri::parse(s)
    }

    fn entry(s: &str) -> RosterEntry {
        RosterEntry {
            uri: uri(s),
            display_name: None,
        }
    }

    #[test]
    fn optimistic_add_confirmed_by_snapshot() {
        let session = SessionId::new();
        let mut conference = ServerConference::new();
        assert!(conference.add_pending(uri("carol@example.com"), None));

        let events = conference.apply_snapshot(session, &[entry("carol@example.com")]);
        assert_eq!(
            events,
            vec![SessionEvent::ParticipantJoined {
                session,
                uri: uri("carol@example.com")
            }]
        );
        assert!(!conference
            .participants()
            .any(|p| p.pending));
    }

    #[test]
    fn pending_add_missing_from_snapshot_fails() {
        let session = SessionId::new();
        let mut conference = ServerConference::new();
        conference.add_pending(uri("carol@example.com"), None);

        let events = conference.apply_snapshot(session, &[entry("dave@example.com")]);
        assert!(events.contains(&SessionEvent::ParticipantAddFailed {
            session,
            uri: uri("carol@example.com")
        }));
        assert!(events.contains(&SessionEvent::ParticipantJoined {
            session,
            uri: uri("dave@example.com")
        }));
        assert!(!conference.contains(&uri("carol@example.com")));
    }

    #[test]
    fn unexpected_absence_is_a_removal() {
        let session = SessionId::new();
        let mut conference = ServerConference::new();
        conference.apply_snapshot(session, &[entry("carol@x"), entry("dave@x")]);

        let events = conference.apply_snapshot(session, &[entry("dave@x")]);
        assert_eq!(
            events,
            vec![SessionEvent::ParticipantLeft {
                session,
                uri: uri("carol@x")
            }]
        );
    }

    #[test]
    fn pending_removal_still_present_stays_pending() {
        let session = SessionId::new();
        let mut conference = ServerConference::new();
        conference.apply_snapshot(session, &[entry("carol@x")]);
        assert!(conference.mark_removal(&uri("carol@x")));

        // Server has not processed the removal yet.
        let events = conference.apply_snapshot(session, &[entry("carol@x")]);
        assert!(events.is_empty());
        assert!(conference.contains(&uri("carol@x")));

        // Now it has.
        let events = conference.apply_snapshot(session, &[]);
        assert_eq!(
            events,
            vec![SessionEvent::ParticipantLeft {
                session,
                uri: uri("carol@x")
            }]
        );
    }

    #[test]
    fn reconciliation_is_idempotent() {
        let session = SessionId::new();
        let mut conference = ServerConference::new();
        conference.add_pending(uri("carol@x"), None);
        let snapshot = [entry("carol@x"), entry("dave@x")];

        let first = conference.apply_snapshot(session, &snapshot);
        assert_eq!(first.len(), 2);
        let second = conference.apply_snapshot(session, &snapshot);
        assert!(second.is_empty());
        let third = conference.apply_snapshot(session, &snapshot);
        assert!(third.is_empty());
    }
}
