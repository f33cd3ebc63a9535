//! Progress events and the terminal report of a sync run

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use crate::error::{Error, ErrorClass, ErrorContext};
use crate::models::{AccountId, EntityKind, Guid, LocalId};

/// States of the per-account sync state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Authenticating,
    PullingOwnAccount,
    PullingLinkedNotebooks,
    SendingLocalChanges,
    Succeeded,
    Failed,
}

impl SyncPhase {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// One progress event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncProgress {
    pub phase: SyncPhase,
    pub items_processed: u64,
    pub total_estimate: Option<u64>,
    pub current_error: Option<String>,
}

/// A failure confined to one entity; the run continues past it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemError {
    #[serde(skip)]
    pub class: ErrorClass,
    pub operation: &'static str,
    pub kind: Option<EntityKind>,
    pub guid: Option<Guid>,
    pub local_id: Option<LocalId>,
    pub message: String,
}

impl ItemError {
    pub fn from_error(error: &Error) -> Self {
        let context = error.context().cloned().unwrap_or_default();
        Self {
            class: error.class(),
            operation: context.operation,
            kind: context.kind,
            guid: context.guid,
            local_id: context.local_id,
            message: error.to_string(),
        }
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub account: AccountId,
    /// Remote creates and updates written locally
    pub applied: usize,
    /// Local entities removed because the server expunged them
    pub expunged: usize,
    /// Conflicts settled by renaming or duplicating
    pub conflicts: usize,
    /// Local changes acknowledged by the server
    pub sent: usize,
    pub item_errors: Vec<ItemError>,
}

impl SyncReport {
    pub const fn new(account: AccountId) -> Self {
        Self {
            account,
            applied: 0,
            expunged: 0,
            conflicts: 0,
            sent: 0,
            item_errors: Vec::new(),
        }
    }
}

/// Sends progress events to the caller, if anyone is listening.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    sender: Option<UnboundedSender<SyncProgress>>,
}

impl ProgressSink {
    pub const fn new(sender: Option<UnboundedSender<SyncProgress>>) -> Self {
        Self { sender }
    }

    pub fn emit(&self, progress: SyncProgress) {
        if let Some(sender) = &self.sender {
            // A dropped receiver only means nobody is watching
            let _ = sender.send(progress);
        }
    }
}
