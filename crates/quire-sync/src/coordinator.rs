//! Top-level sync state machine

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use futures::stream::{self, StreamExt};
use tokio::sync::mpsc::UnboundedSender;

use crate::applier::{PullOutcome, RemoteChangeApplier};
use crate::auth::{AccountAuthCache, CredentialStore};
use crate::config::SyncConfig;
use crate::error::{Error, ErrorContext, Result};
use crate::models::{AccountId, LinkedNotebook, Scope, SyncEntity};
use crate::remote::RemoteService;
use crate::report::{ProgressSink, SyncPhase, SyncProgress, SyncReport};
use crate::retry::RateLimitedCaller;
use crate::sender::LocalChangeSender;
use crate::session::{CancelFlag, SyncSession};
use crate::state::SyncStateRepository;
use crate::store::{LocalStore, StoreTransaction};

/// Runs syncs for any number of accounts, at most one per account at a time.
///
/// Credentials and per-endpoint rate-limit pauses are kept per account and
/// outlive individual runs.
pub struct SyncCoordinator<S, R, P> {
    store: Arc<S>,
    state: Arc<P>,
    remote: Arc<R>,
    credentials: Arc<dyn CredentialStore>,
    config: SyncConfig,
    callers: Mutex<HashMap<AccountId, Arc<RateLimitedCaller<R, P>>>>,
    running: Mutex<HashMap<AccountId, CancelFlag>>,
}

impl<S, R, P> SyncCoordinator<S, R, P>
where
    S: LocalStore,
    R: RemoteService,
    P: SyncStateRepository,
{
    pub fn new(
        store: Arc<S>,
        state: Arc<P>,
        remote: Arc<R>,
        credentials: Arc<dyn CredentialStore>,
        config: SyncConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            state,
            remote,
            credentials,
            config,
            callers: Mutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
        })
    }

    /// Run one full sync of `account`: pull the own account, pull every
    /// linked notebook, then send local changes.
    ///
    /// Progress events go to `progress` when given; the last one carries a
    /// terminal phase.
    pub async fn sync(
        &self,
        account: &AccountId,
        progress: Option<UnboundedSender<SyncProgress>>,
    ) -> Result<SyncReport> {
        let cancel = CancelFlag::new();
        let _run = RunGuard::claim(&self.running, account, &cancel)?;

        let session = SyncSession::new(
            account.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.state),
            self.caller_for(account),
            self.config.clone(),
            cancel,
            ProgressSink::new(progress),
        );

        let outcome = self.run(&session).await;
        session.finish(&outcome);
        match &outcome {
            Ok(report) => tracing::info!(
                account = %account,
                applied = report.applied,
                expunged = report.expunged,
                conflicts = report.conflicts,
                sent = report.sent,
                item_errors = report.item_errors.len(),
                "Sync finished"
            ),
            Err(error) => tracing::error!(account = %account, error = %error, "Sync failed"),
        }
        outcome
    }

    /// Request cancellation of the account's running sync. Returns `false`
    /// when none is running.
    pub fn cancel(&self, account: &AccountId) -> bool {
        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        running.get(account).is_some_and(|flag| {
            tracing::info!(account = %account, "Cancelling sync");
            flag.cancel();
            true
        })
    }

    pub fn is_running(&self, account: &AccountId) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(account)
    }

    fn caller_for(&self, account: &AccountId) -> Arc<RateLimitedCaller<R, P>> {
        let mut callers = self.callers.lock().unwrap_or_else(PoisonError::into_inner);
        let caller = callers.entry(account.clone()).or_insert_with(|| {
            let auth = AccountAuthCache::new(
                account.clone(),
                Arc::clone(&self.remote),
                Arc::clone(&self.state),
                Arc::clone(&self.credentials),
                self.config.credential_expiry_skew_secs,
                self.config.request_timeout(),
            );
            Arc::new(RateLimitedCaller::new(
                Arc::new(auth),
                Arc::clone(&self.remote),
                &self.config,
            ))
        });
        Arc::clone(caller)
    }

    async fn run(&self, session: &SyncSession<S, R, P>) -> Result<SyncReport> {
        let auth = session.caller.auth();
        if !auth.has_valid_credential(None) {
            session.enter_phase(SyncPhase::Authenticating);
            auth.credential(&Scope::Own)
                .await
                .map_err(|error| error.with_context(&ErrorContext::new("authenticate")))?;
        }

        session.cancel.check()?;
        session.enter_phase(SyncPhase::PullingOwnAccount);
        let own = RemoteChangeApplier::new(session).pull(&Scope::Own).await?;
        log_pull(session, &Scope::Own, own);

        session.cancel.check()?;
        session.enter_phase(SyncPhase::PullingLinkedNotebooks);
        self.pull_linked_notebooks(session).await?;

        session.cancel.check()?;
        session.enter_phase(SyncPhase::SendingLocalChanges);
        LocalChangeSender::new(session).send().await?;

        Ok(session.report())
    }

    /// Pull every linked notebook, up to `worker_limit` at a time.
    ///
    /// A notebook whose share can no longer be accessed is reported and
    /// skipped; other failures abort the run once the in-flight pulls end.
    async fn pull_linked_notebooks(&self, session: &SyncSession<S, R, P>) -> Result<()> {
        let linked: Vec<LinkedNotebook> = {
            let mut tx = session.store.begin().await?;
            let all = tx.list::<LinkedNotebook>(None).await?;
            all.into_iter()
                .filter(|linked| linked.guid().is_some() && !linked.meta.deleted)
                .collect()
        };
        if linked.is_empty() {
            return Ok(());
        }

        let results: Vec<(Scope, Result<PullOutcome>)> = stream::iter(linked)
            .map(|linked| async move {
                let scope = Scope::linked(linked);
                let outcome = RemoteChangeApplier::new(session).pull(&scope).await;
                (scope, outcome)
            })
            .buffer_unordered(session.config.worker_limit)
            .collect()
            .await;

        let mut fatal = None;
        for (scope, result) in results {
            match result {
                Ok(outcome) => log_pull(session, &scope, outcome),
                Err(error @ Error::Authentication { .. }) => session.record_item_error(&error),
                Err(error) if error.is_item_level() => session.record_item_error(&error),
                Err(error) => {
                    fatal.get_or_insert(error);
                }
            }
        }
        fatal.map_or(Ok(()), Err)
    }
}

fn log_pull<S, R, P>(session: &SyncSession<S, R, P>, scope: &Scope, outcome: PullOutcome) {
    tracing::debug!(
        account = %session.account,
        scope = %scope,
        chunks = outcome.chunks,
        usn = outcome.checkpoint,
        full_sync = outcome.full_sync,
        "Pulled scope"
    );
}

/// Marks an account as syncing until dropped.
struct RunGuard<'a> {
    running: &'a Mutex<HashMap<AccountId, CancelFlag>>,
    account: AccountId,
}

impl<'a> RunGuard<'a> {
    fn claim(
        running: &'a Mutex<HashMap<AccountId, CancelFlag>>,
        account: &AccountId,
        cancel: &CancelFlag,
    ) -> Result<Self> {
        let mut map = running.lock().unwrap_or_else(PoisonError::into_inner);
        if map.contains_key(account) {
            return Err(Error::AlreadyInProgress(account.to_string()));
        }
        map.insert(account.clone(), cancel.clone());
        Ok(Self {
            running,
            account: account.clone(),
        })
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.account);
    }
}
