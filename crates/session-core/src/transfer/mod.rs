//! File transfer state machine and history.

mod history;
mod transfer;

pub use history::{TransferHistory, TransferRecord};
pub use transfer::{
    FileSelector, FileTransfer, TransferId, TransferPhase, TransferState,
};
