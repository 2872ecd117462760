//! Passive telemetry snapshots, updated only from engine events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use softcall_engine_api::{EncryptionState, IceState, StreamStats};

/// Per-stream telemetry: codec, encryption, ICE and the latest
/// statistics tick. Nothing here drives the state machine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamInfo {
    pub codec: Option<String>,
    pub encryption: EncryptionState,
    pub ice: Option<IceState>,
    pub stats: Option<StreamStats>,
}

/// Per-session timing and identity snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionInfo {
    pub created: Option<DateTime<Utc>>,
    pub connected: Option<DateTime<Utc>>,
    pub ended: Option<DateTime<Utc>>,
    /// Remote party identity as shown to the user.
    pub remote_identity: Option<String>,
}

impl SessionInfo {
    /// Elapsed connected time: up to `ended` for finished sessions,
    /// up to now for live ones. Zero before the session connects.
    pub fn duration(&self) -> chrono::Duration {
        match self.connected {
            Some(connected) => {
                let until = self.ended.unwrap_or_else(Utc::now);
                until - connected
            }
            None => chrono::Duration::zero(),
        }
    }

    /// Reset everything except nothing: used on full session
    /// re-initialization.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_is_zero_before_connect() {
        let info = SessionInfo::default();
        assert_eq!(info.duration(), chrono::Duration::zero());
    }

    #[test]
    fn duration_uses_end_timestamp_when_finished() {
        let mut info = SessionInfo::default();
        let t0 = Utc::now();
        info.connected = Some(t0);
        info.ended = Some(t0 + chrono::Duration::seconds(42));
        assert_eq!(info.duration(), chrono::Duration::seconds(42));
    }
}
