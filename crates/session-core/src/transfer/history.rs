//! Transfer history persistence.
//!
//! A small opaque blob: a serialized list of finished transfers, loaded
//! at startup and rewritten on every append. The format is an
//! implementation detail, not a compatibility surface.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use softcall_engine_api::TransferKind;

use crate::errors::{Result, SessionError};
use crate::session::Direction;
use crate::transfer::TransferId;

const HISTORY_FILE: &str = "transfer_history.json";

/// One finished transfer as remembered across restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: TransferId,
    pub direction: Direction,
    pub kind: TransferKind,
    pub peer: String,
    pub filename: PathBuf,
    pub size: u64,
    pub started: Option<DateTime<Utc>>,
    pub ended: Option<DateTime<Utc>>,
    pub reason: String,
    pub error: bool,
}

/// The on-disk history list.
#[derive(Debug)]
pub struct TransferHistory {
    path: PathBuf,
    records: Vec<TransferRecord>,
}

impl TransferHistory {
    /// Load the blob from `directory`, tolerating a missing file and a
    /// corrupt one (a corrupt history is discarded, not fatal).
    pub async fn load(directory: &Path) -> Self {
        let path = directory.join(HISTORY_FILE);
        let records = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(records) => records,
                Err(e) => {
                    tracing::warn!(path = %path.display(), "discarding corrupt transfer history: {e}");
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };
        Self { path, records }
    }

    pub fn records(&self) -> &[TransferRecord] {
        &self.records
    }

    /// Append a record and rewrite the blob.
    pub async fn add(&mut self, record: TransferRecord) -> Result<()> {
        self.records.push(record);
        self.save().await
    }

    async fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SessionError::file(format!("{}: {e}", parent.display())))?;
        }
        let bytes = serde_json::to_vec_pretty(&self.records)
            .map_err(|e| SessionError::file(e.to_string()))?;
        tokio::fs::write(&self.path, bytes)
            .await
            .map_err(|e| SessionError::file(format!("{}: {e}", self.path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, error: bool) -> TransferRecord {
        TransferRecord {
            id: TransferId::new(),
            direction: Direction::Outgoing,
            kind: TransferKind::Push,
            peer: "bob@example.com".into(),
            filename: PathBuf::from(name),
            size: 42,
            started: Some(Utc::now()),
            ended: Some(Utc::now()),
            reason: if error { "Transfer interrupted" } else { "Transfer completed" }.into(),
            error,
        }
    }

    #[tokio::test]
    async fn round_trips_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut history = TransferHistory::load(dir.path()).await;
        assert!(history.records().is_empty());

        history.add(record("a.txt", false)).await.unwrap();
        history.add(record("b.txt", true)).await.unwrap();

        let reloaded = TransferHistory::load(dir.path()).await;
        assert_eq!(reloaded.records(), history.records());
    }

    #[tokio::test]
    async fn corrupt_blob_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join(HISTORY_FILE), b"not json")
            .await
            .unwrap();
        let history = TransferHistory::load(dir.path()).await;
        assert!(history.records().is_empty());
    }
}
