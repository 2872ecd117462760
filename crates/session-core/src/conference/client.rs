//! Local audio-mixed conference.
//!
//! Groups two or more sessions into one conversation by mirroring each
//! member's audio into a shared engine [`AudioBridge`]. The bridge is
//! the one shared media resource in the core; all mutation goes through
//! this type, never through the sessions directly.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use softcall_engine_api::{AudioBridge, EngineResult, EngineSessionId};

use crate::session::SessionId;

/// Identifier for a local conference.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ConferenceId(pub uuid::Uuid);

impl ConferenceId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl std::fmt::Display for ConferenceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A set of sessions mixed together client-side.
///
/// Invariants: membership is 0 (dissolved) or >= 2, enforced by the
/// manager which dissolves a conference dropping under two members; a
/// member's audio is mirrored into the bridge exactly once.
pub struct ClientConference {
    id: ConferenceId,
    bridge: Arc<dyn AudioBridge>,
    sessions: Vec<SessionId>,
    mirrored: HashMap<SessionId, EngineSessionId>,
    on_hold: bool,
}

impl std::fmt::Debug for ClientConference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConference")
            .field("id", &self.id)
            .field("sessions", &self.sessions)
            .field("on_hold", &self.on_hold)
            .finish()
    }
}

impl ClientConference {
    pub fn new(bridge: Arc<dyn AudioBridge>) -> Self {
        Self {
            id: ConferenceId::new(),
            bridge,
            sessions: Vec::new(),
            mirrored: HashMap::new(),
            on_hold: false,
        }
    }

    pub fn id(&self) -> ConferenceId {
        self.id
    }

    pub fn sessions(&self) -> &[SessionId] {
        &self.sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, session: SessionId) -> bool {
        self.sessions.contains(&session)
    }

    pub fn on_hold(&self) -> bool {
        self.on_hold
    }

    /// Add a member and mirror its audio into the bridge when it
    /// already has an engine session carrying audio.
    pub async fn add_session(
        &mut self,
        session: SessionId,
        engine_session: Option<EngineSessionId>,
    ) -> EngineResult<()> {
        if self.sessions.contains(&session) {
            return Ok(());
        }
        self.sessions.push(session);
        tracing::debug!(conference = %self.id, %session, "conference member added");
        if let Some(engine_session) = engine_session {
            self.mirror(session, engine_session).await?;
        }
        Ok(())
    }

    /// Mirror a member's audio into the mix, exactly once. Also used
    /// when a member's audio stream shows up after joining.
    pub async fn mirror(
        &mut self,
        session: SessionId,
        engine_session: EngineSessionId,
    ) -> EngineResult<()> {
        if !self.sessions.contains(&session) || self.mirrored.contains_key(&session) {
            return Ok(());
        }
        self.mirrored.insert(session, engine_session);
        self.bridge.add_stream(engine_session).await
    }

    /// Remove a member, unmirroring its audio.
    pub async fn remove_session(&mut self, session: SessionId) -> EngineResult<()> {
        let Some(position) = self.sessions.iter().position(|s| *s == session) else {
            return Ok(());
        };
        self.sessions.remove(position);
        tracing::debug!(conference = %self.id, %session, "conference member removed");
        if let Some(engine_session) = self.mirrored.remove(&session) {
            self.bridge.remove_stream(engine_session).await?;
        }
        Ok(())
    }

    /// Drain the remaining members for dissolution, unmirroring each.
    pub async fn dissolve(&mut self) -> EngineResult<Vec<SessionId>> {
        for engine_session in self.mirrored.values() {
            self.bridge.remove_stream(*engine_session).await?;
        }
        self.mirrored.clear();
        Ok(std::mem::take(&mut self.sessions))
    }

    /// Hold the whole conference at the bridge. Idempotent.
    pub async fn hold(&mut self) -> EngineResult<()> {
        if self.on_hold {
            return Ok(());
        }
        self.on_hold = true;
        self.bridge.hold().await
    }

    /// Resume the whole conference at the bridge. Idempotent.
    pub async fn unhold(&mut self) -> EngineResult<()> {
        if !self.on_hold {
            return Ok(());
        }
        self.on_hold = false;
        self.bridge.unhold().await
    }
}
