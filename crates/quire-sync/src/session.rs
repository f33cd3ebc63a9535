//! State shared by the phases of one sync run

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::models::AccountId;
use crate::report::{ItemError, ProgressSink, SyncPhase, SyncProgress, SyncReport};
use crate::retry::RateLimitedCaller;

/// Cooperative cancellation signal.
///
/// Checked between chunks and between items; in-flight calls complete.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Collaborators and bookkeeping for one run of one account.
pub struct SyncSession<S, R, P> {
    pub account: AccountId,
    pub store: Arc<S>,
    pub state: Arc<P>,
    pub caller: Arc<RateLimitedCaller<R, P>>,
    pub config: SyncConfig,
    pub cancel: CancelFlag,
    progress: ProgressSink,
    phase: Mutex<SyncPhase>,
    processed: AtomicU64,
    estimate: AtomicU64,
    report: Mutex<SyncReport>,
}

impl<S, R, P> SyncSession<S, R, P> {
    pub fn new(
        account: AccountId,
        store: Arc<S>,
        state: Arc<P>,
        caller: Arc<RateLimitedCaller<R, P>>,
        config: SyncConfig,
        cancel: CancelFlag,
        progress: ProgressSink,
    ) -> Self {
        Self {
            report: Mutex::new(SyncReport::new(account.clone())),
            account,
            store,
            state,
            caller,
            config,
            cancel,
            progress,
            phase: Mutex::new(SyncPhase::Idle),
            processed: AtomicU64::new(0),
            estimate: AtomicU64::new(0),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `phase`, restarting the item counters.
    pub fn enter_phase(&self, phase: SyncPhase) {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner) = phase;
        self.processed.store(0, Ordering::SeqCst);
        self.estimate.store(0, Ordering::SeqCst);
        tracing::info!(account = %self.account, ?phase, "Sync phase");
        self.emit(None);
    }

    pub fn add_estimate(&self, items: u64) {
        self.estimate.fetch_add(items, Ordering::SeqCst);
        self.emit(None);
    }

    pub fn items_processed(&self, items: u64) {
        if items == 0 {
            return;
        }
        self.processed.fetch_add(items, Ordering::SeqCst);
        self.emit(None);
    }

    /// Collect a per-item failure; the run continues.
    pub fn record_item_error(&self, error: &Error) {
        tracing::warn!(account = %self.account, error = %error, "Skipping item");
        let item = ItemError::from_error(error);
        let message = item.message.clone();
        self.report
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .item_errors
            .push(item);
        self.emit(Some(message));
    }

    pub fn update_report(&self, update: impl FnOnce(&mut SyncReport)) {
        update(&mut self.report.lock().unwrap_or_else(PoisonError::into_inner));
    }

    pub fn report(&self) -> SyncReport {
        self.report
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Emit the terminal event for the run.
    pub fn finish(&self, outcome: &Result<SyncReport>) {
        let (phase, current_error) = match outcome {
            Ok(_) => (SyncPhase::Succeeded, None),
            Err(error) => (SyncPhase::Failed, Some(error.to_string())),
        };
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner) = phase;
        self.emit(current_error);
    }

    fn emit(&self, current_error: Option<String>) {
        let estimate = self.estimate.load(Ordering::SeqCst);
        self.progress.emit(SyncProgress {
            phase: self.phase(),
            items_processed: self.processed.load(Ordering::SeqCst),
            total_estimate: (estimate > 0).then_some(estimate),
            current_error,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_flag_is_shared_between_clones() {
        let flag = CancelFlag::new();
        let observer = flag.clone();
        assert!(observer.check().is_ok());
        flag.cancel();
        assert!(observer.is_cancelled());
        assert!(matches!(observer.check(), Err(Error::Cancelled)));
    }
}
