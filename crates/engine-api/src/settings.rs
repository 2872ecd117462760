//! Persistent settings collaborator.
//!
//! The session core reads durable configuration through this trait but
//! does not own the schema; the application decides where settings live
//! and how they are edited.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::Account;

/// Snapshot of the durable configuration the session core consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Accounts available for placing and receiving calls.
    pub accounts: Vec<Account>,
    /// Answer incoming requests automatically after this delay.
    /// `None` disables auto-answer.
    pub auto_answer_delay: Option<Duration>,
    /// Encrypt outgoing file transfers with PGP when the file fits
    /// under `pgp_max_size` bytes.
    pub pgp_enabled: bool,
    /// Upper size bound for PGP-encrypted transfers.
    pub pgp_max_size: u64,
    /// Directory incoming files are saved to.
    pub download_directory: PathBuf,
    /// Directory the transfer history blob is persisted in.
    pub history_directory: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            accounts: Vec::new(),
            auto_answer_delay: None,
            pgp_enabled: false,
            pgp_max_size: 10 * 1024 * 1024,
            download_directory: PathBuf::from("downloads"),
            history_directory: PathBuf::from("history"),
        }
    }
}

impl Settings {
    /// Look up an account by id.
    pub fn account(&self, id: &str) -> Option<&Account> {
        self.accounts.iter().find(|a| a.id == id)
    }
}

/// Read access to the durable settings.
pub trait SettingsStore: Send + Sync {
    fn settings(&self) -> Settings;
}
