//! Typed stream collections.
//!
//! Requests carry a [`StreamSet`] of creation descriptors; live
//! sessions carry a [`StreamMap`] of [`Stream`] instances. Both enforce
//! at most one stream per media kind.

use std::collections::BTreeMap;

use softcall_engine_api::{MediaKind, StreamSpec};

use crate::errors::{Result, SessionError};
use crate::info::StreamInfo;

/// A set of requested streams, keyed by kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamSet {
    specs: BTreeMap<MediaKind, StreamSpec>,
}

impl StreamSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from specs; later duplicates of a kind are rejected.
    pub fn from_specs(specs: impl IntoIterator<Item = StreamSpec>) -> Result<Self> {
        let mut set = Self::new();
        for spec in specs {
            set.insert(spec)?;
        }
        Ok(set)
    }

    pub fn insert(&mut self, spec: StreamSpec) -> Result<()> {
        if self.specs.contains_key(&spec.kind) {
            return Err(SessionError::DuplicateStream { kind: spec.kind });
        }
        self.specs.insert(spec.kind, spec);
        Ok(())
    }

    pub fn contains(&self, kind: MediaKind) -> bool {
        self.specs.contains_key(&kind)
    }

    pub fn get(&self, kind: MediaKind) -> Option<&StreamSpec> {
        self.specs.get(&kind)
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn kinds(&self) -> impl Iterator<Item = MediaKind> + '_ {
        self.specs.keys().copied()
    }

    pub fn specs(&self) -> impl Iterator<Item = &StreamSpec> {
        self.specs.values()
    }

    pub fn to_vec(&self) -> Vec<StreamSpec> {
        self.specs.values().cloned().collect()
    }

    /// Highest arbitration priority present in the set (lowest value).
    pub fn top_priority(&self) -> Option<u8> {
        self.specs.keys().map(|k| k.priority()).min()
    }
}

/// One live stream on a session.
#[derive(Debug, Clone, Default)]
pub struct Stream {
    pub spec: Option<StreamSpec>,
    pub info: StreamInfo,
    pub muted: bool,
}

impl Stream {
    pub fn from_spec(spec: StreamSpec) -> Self {
        Self {
            spec: Some(spec),
            info: StreamInfo::default(),
            muted: false,
        }
    }

    pub fn kind(&self) -> Option<MediaKind> {
        self.spec.as_ref().map(|s| s.kind)
    }
}

/// Streams a session currently holds, keyed by kind.
#[derive(Debug, Clone, Default)]
pub struct StreamMap {
    streams: BTreeMap<MediaKind, Stream>,
}

impl StreamMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, spec: StreamSpec) -> Result<&mut Stream> {
        let kind = spec.kind;
        if self.streams.contains_key(&kind) {
            return Err(SessionError::DuplicateStream { kind });
        }
        Ok(self.streams.entry(kind).or_insert(Stream::from_spec(spec)))
    }

    pub fn remove(&mut self, kind: MediaKind) -> Option<Stream> {
        self.streams.remove(&kind)
    }

    pub fn contains(&self, kind: MediaKind) -> bool {
        self.streams.contains_key(&kind)
    }

    pub fn get(&self, kind: MediaKind) -> Option<&Stream> {
        self.streams.get(&kind)
    }

    pub fn get_mut(&mut self, kind: MediaKind) -> Option<&mut Stream> {
        self.streams.get_mut(&kind)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn kinds(&self) -> Vec<MediaKind> {
        self.streams.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MediaKind, &Stream)> {
        self.streams.iter()
    }

    pub fn clear(&mut self) {
        self.streams.clear();
    }

    /// Replace the whole map from a negotiated spec list, e.g. after
    /// `DidStart` reports the final stream set.
    pub fn reset_from_specs(&mut self, specs: &[StreamSpec]) {
        self.streams.clear();
        for spec in specs {
            // Engine guarantees one stream per kind in a negotiated
            // answer; keep the first if it ever does not.
            self.streams
                .entry(spec.kind)
                .or_insert_with(|| Stream::from_spec(spec.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_most_one_stream_per_kind() {
        let mut map = StreamMap::new();
        map.insert(StreamSpec::new(MediaKind::Audio)).unwrap();
        let err = map.insert(StreamSpec::new(MediaKind::Audio)).unwrap_err();
        assert!(matches!(
            err,
            SessionError::DuplicateStream {
                kind: MediaKind::Audio
            }
        ));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn set_rejects_duplicates_too() {
        let err = StreamSet::from_specs([
            StreamSpec::new(MediaKind::Chat),
            StreamSpec::new(MediaKind::Chat),
        ])
        .unwrap_err();
        assert!(matches!(err, SessionError::DuplicateStream { .. }));
    }

    #[test]
    fn top_priority_prefers_audio() {
        let set = StreamSet::from_specs([
            StreamSpec::new(MediaKind::Chat),
            StreamSpec::new(MediaKind::Audio),
        ])
        .unwrap();
        assert_eq!(set.top_priority(), Some(0));
    }
}
