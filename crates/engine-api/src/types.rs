//! Shared vocabulary for the engine boundary: identifiers, URIs,
//! accounts, media descriptors and telemetry values.

use serde::{Deserialize, Serialize};

/// Identifier the engine assigns to a protocol session (a SIP dialog
/// plus its media). One logical conversation holds at most one of these
/// at a time.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct EngineSessionId(pub uuid::Uuid);

impl EngineSessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl std::fmt::Display for EngineSessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for an in-flight DNS/route lookup.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct LookupId(pub uuid::Uuid);

impl LookupId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl std::fmt::Display for LookupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A SIP URI in normalized form (`user@domain`, lowercase, no scheme).
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct SipUri(String);

impl SipUri {
    /// Normalize a raw address string: strip a `sip:`/`sips:` scheme,
    /// drop display-name decoration, lowercase.
    pub fn parse(raw: &str) -> Self {
        let s = raw.trim();
        let s = s.trim_start_matches('<').trim_end_matches('>');
        let s = s
            .strip_prefix("sips:")
            .or_else(|| s.strip_prefix("sip:"))
            .unwrap_or(s);
        let s = s.split(';').next().unwrap_or(s);
        Self(s.to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The domain part, if the URI has one.
    pub fn domain(&self) -> Option<&str> {
        self.0.split_once('@').map(|(_, d)| d)
    }
}

impl std::fmt::Display for SipUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A local account the engine registers and places calls from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Account identifier, conventionally the account's own URI string.
    pub id: String,
    /// The account's address of record.
    pub uri: SipUri,
    /// Display name presented to remote parties.
    pub display_name: Option<String>,
    /// Fixed outbound proxy, overriding DNS route discovery.
    pub outbound_proxy: Option<SipUri>,
}

/// A remote party as resolved by the contact collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub uri: SipUri,
    pub display_name: Option<String>,
}

impl Contact {
    pub fn unknown(uri: SipUri) -> Self {
        Self {
            uri,
            display_name: None,
        }
    }

    /// Preferred human-readable identity: display name when known,
    /// otherwise the URI.
    pub fn identity(&self) -> String {
        match &self.display_name {
            Some(name) => name.clone(),
            None => self.uri.to_string(),
        }
    }
}

/// Transport protocol for a resolved route.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum Transport {
    Udp,
    Tcp,
    Tls,
}

/// One resolved signaling route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub address: String,
    pub port: u16,
    pub transport: Transport,
}

/// Which side initiated an action (used for session end attribution).
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum Originator {
    Local,
    Remote,
}

/// Media/data channel kinds a session can carry.
///
/// `Messages` is the synthetic short-message channel that exists even
/// without a network stream behind it.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub enum MediaKind {
    Audio,
    Video,
    ScreenSharing,
    Chat,
    Messages,
}

impl MediaKind {
    /// Arbitration priority for incoming requests. Lower sorts first.
    pub fn priority(self) -> u8 {
        match self {
            MediaKind::Audio => 0,
            MediaKind::Video => 1,
            MediaKind::ScreenSharing => 2,
            MediaKind::Chat => 3,
            MediaKind::Messages => u8::MAX,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
            MediaKind::ScreenSharing => "screen-sharing",
            MediaKind::Chat => "chat",
            MediaKind::Messages => "messages",
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Creation parameters for one requested stream. Immutable once built;
/// the session core hands these to the engine verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSpec {
    pub kind: MediaKind,
    /// Whether the call should proceed even if this stream fails to
    /// negotiate.
    pub best_effort: bool,
}

impl StreamSpec {
    pub fn new(kind: MediaKind) -> Self {
        Self {
            kind,
            best_effort: false,
        }
    }

    pub fn best_effort(kind: MediaKind) -> Self {
        Self {
            kind,
            best_effort: true,
        }
    }
}

/// ICE negotiation state as reported by the engine.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum IceState {
    Disabled,
    Gathering,
    Negotiating,
    Connected,
    Failed,
}

/// Media encryption state for one stream.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EncryptionState {
    /// Cipher/protocol label (e.g. "AES-256/ZRTP"), `None` when the
    /// stream is unencrypted.
    pub cipher: Option<String>,
    /// Peer verification status (ZRTP SAS confirmed or similar).
    pub verified: bool,
}

/// Periodic per-stream statistics tick.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StreamStats {
    pub jitter_ms: u32,
    pub packet_loss_percent: f32,
    pub round_trip_time_ms: u32,
}

/// One participant entry in a focus-server roster snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub uri: SipUri,
    pub display_name: Option<String>,
}

/// Direction of a file transfer relative to the local party.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum TransferKind {
    /// Local party offers a file to the remote party.
    Push,
    /// Local party fetches a file the remote party offered.
    Pull,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_normalization() {
        assert_eq!(SipUri::parse("sip:Alice@Example.COM").as_str(), "alice@example.com");
        assert_eq!(SipUri::parse("<sips:bob@host>").as_str(), "bob@host");
        assert_eq!(SipUri::parse("carol@host;transport=tls").as_str(), "carol@host");
        assert_eq!(SipUri::parse("sip:dave@host").domain(), Some("host"));
    }

    #[test]
    fn media_priority_order() {
        assert!(MediaKind::Audio.priority() < MediaKind::Video.priority());
        assert!(MediaKind::Video.priority() < MediaKind::ScreenSharing.priority());
        assert!(MediaKind::ScreenSharing.priority() < MediaKind::Chat.priority());
    }
}
