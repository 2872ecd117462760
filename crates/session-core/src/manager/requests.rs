//! Incoming-request queue.
//!
//! Every inbound decision the user must make (new session, mid-call
//! stream proposal, file transfer offer) queues here, ordered by media
//! priority. Only the head of the queue owns keyboard focus; the rest
//! wait their turn.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use softcall_engine_api::MediaKind;

use crate::session::SessionId;
use crate::transfer::TransferId;

/// Incoming request identifier.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RequestId(pub uuid::Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the pending decision is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestTarget {
    Session(SessionId),
    Transfer(TransferId),
}

/// Priority rank of a file transfer offer (below chat).
const FILE_TRANSFER_PRIORITY: u8 = 4;

/// A pending inbound decision.
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    pub id: RequestId,
    pub target: RequestTarget,
    /// Stream kinds on offer. Empty for file transfer offers.
    pub kinds: Vec<MediaKind>,
    /// Mid-call stream proposal rather than a new session.
    pub is_proposal: bool,
    pub received: DateTime<Utc>,
    pub focused: bool,
}

impl IncomingRequest {
    pub fn new_session(session: SessionId, kinds: Vec<MediaKind>) -> Self {
        Self {
            id: RequestId::new(),
            target: RequestTarget::Session(session),
            kinds,
            is_proposal: false,
            received: Utc::now(),
            focused: false,
        }
    }

    pub fn proposal(session: SessionId, kinds: Vec<MediaKind>) -> Self {
        Self {
            is_proposal: true,
            ..Self::new_session(session, kinds)
        }
    }

    pub fn transfer(transfer: TransferId) -> Self {
        Self {
            id: RequestId::new(),
            target: RequestTarget::Transfer(transfer),
            kinds: Vec::new(),
            is_proposal: false,
            received: Utc::now(),
            focused: false,
        }
    }

    /// Arbitration priority; lower sorts first.
    pub fn priority(&self) -> u8 {
        if matches!(self.target, RequestTarget::Transfer(_)) {
            return FILE_TRANSFER_PRIORITY;
        }
        self.kinds
            .iter()
            .map(|k| k.priority())
            .min()
            .unwrap_or(u8::MAX)
    }
}

/// Priority-ordered pending requests.
#[derive(Debug, Default)]
pub struct RequestQueue {
    requests: Vec<IncomingRequest>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IncomingRequest> {
        self.requests.iter()
    }

    pub fn get(&self, id: RequestId) -> Option<&IncomingRequest> {
        self.requests.iter().find(|r| r.id == id)
    }

    /// Ordered insertion: the request lands after every entry of equal
    /// or higher priority, never simply at the end.
    pub fn insert(&mut self, request: IncomingRequest) {
        let priority = request.priority();
        let position = self
            .requests
            .iter()
            .position(|r| r.priority() > priority)
            .unwrap_or(self.requests.len());
        self.requests.insert(position, request);
    }

    pub fn remove(&mut self, id: RequestId) -> Option<IncomingRequest> {
        let position = self.requests.iter().position(|r| r.id == id)?;
        Some(self.requests.remove(position))
    }

    /// Drop requests matching `predicate`, returning them.
    pub fn remove_where(
        &mut self,
        predicate: impl Fn(&IncomingRequest) -> bool,
    ) -> Vec<IncomingRequest> {
        let (dropped, kept) = std::mem::take(&mut self.requests)
            .into_iter()
            .partition(|r| predicate(r));
        self.requests = kept;
        dropped
    }

    /// Drop every request belonging to `session`.
    pub fn remove_for_session(&mut self, session: SessionId) -> Vec<IncomingRequest> {
        self.remove_where(|r| r.target == RequestTarget::Session(session))
    }

    /// Drop every request belonging to `transfer`.
    pub fn remove_for_transfer(&mut self, transfer: TransferId) -> Vec<IncomingRequest> {
        self.remove_where(|r| r.target == RequestTarget::Transfer(transfer))
    }

    /// Ensure only the head of the queue is focused. Returns the newly
    /// focused request id when focus moved.
    pub fn refresh_focus(&mut self) -> Option<RequestId> {
        let mut newly_focused = None;
        for (index, request) in self.requests.iter_mut().enumerate() {
            let should_focus = index == 0;
            if should_focus && !request.focused {
                newly_focused = Some(request.id);
            }
            request.focused = should_focus;
        }
        newly_focused
    }
}
