//! Transient-failure handling for remote calls

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::auth::{AccountAuthCache, Credential};
use crate::config::SyncConfig;
use crate::error::{Error, ErrorContext, Result};
use crate::models::Scope;
use crate::remote::{RemoteService, RemoteStoreAdapter};
use crate::state::SyncStateRepository;

/// Runs remote calls under the service's rate-limit and auth-expiry contract.
///
/// A rate-limit response pauses every call to the same endpoint for the
/// server-mandated wait, then the failed call is retried. An auth-expired
/// response refreshes the credential and retries once. Network failures back
/// off exponentially. All retries of one call share a bounded budget.
pub struct RateLimitedCaller<R, P> {
    auth: Arc<AccountAuthCache<R, P>>,
    remote: Arc<R>,
    paused_until: Mutex<HashMap<String, Instant>>,
    max_retries: u32,
    network_retry_base: Duration,
    request_timeout: Duration,
}

impl<R: RemoteService, P: SyncStateRepository> RateLimitedCaller<R, P> {
    pub fn new(auth: Arc<AccountAuthCache<R, P>>, remote: Arc<R>, config: &SyncConfig) -> Self {
        Self {
            auth,
            remote,
            paused_until: Mutex::new(HashMap::new()),
            max_retries: config.max_transient_retries,
            network_retry_base: config.network_retry_base(),
            request_timeout: config.request_timeout(),
        }
    }

    pub const fn auth(&self) -> &Arc<AccountAuthCache<R, P>> {
        &self.auth
    }

    /// Execute `operation` against the scope's note store.
    ///
    /// The operation receives an adapter bound to the endpoint and the
    /// credential to use; it may be invoked several times.
    pub async fn call<T, F, Fut>(
        &self,
        scope: &Scope,
        context: ErrorContext,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut(RemoteStoreAdapter<R::NoteStore>, Credential) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retries = 0u32;
        let mut auth_refreshed = false;

        loop {
            let (endpoint, outcome) = match self.auth.credential(scope).await {
                Ok(credential) => {
                    let endpoint = credential.note_store_url.clone();
                    self.wait_for_endpoint(&endpoint).await;
                    let adapter = RemoteStoreAdapter::new(
                        self.remote.note_store(&endpoint),
                        endpoint.clone(),
                        self.request_timeout,
                    );
                    (endpoint, operation(adapter, credential).await)
                }
                Err(error) => (scope.to_string(), Err(error)),
            };

            let error = match outcome {
                Ok(value) => {
                    if retries > 0 {
                        tracing::debug!(
                            operation = context.operation,
                            retries,
                            "Remote call succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(error) => error.with_context(&context),
            };

            match &error {
                Error::RateLimited { retry_after, .. } => {
                    let Some(wait) = retry_after.filter(|wait| !wait.is_zero()) else {
                        return Err(Error::internal(
                            "rate limit response without a positive wait",
                            context,
                        ));
                    };
                    if retries >= self.max_retries {
                        return Err(error);
                    }
                    retries += 1;
                    tracing::warn!(
                        operation = context.operation,
                        endpoint = %endpoint,
                        wait_secs = wait.as_secs(),
                        "Rate limited, pausing endpoint"
                    );
                    self.pause_endpoint(&endpoint, wait);
                }
                Error::AuthExpired { .. } => {
                    if auth_refreshed || retries >= self.max_retries {
                        return Err(error);
                    }
                    retries += 1;
                    auth_refreshed = true;
                    tracing::warn!(
                        operation = context.operation,
                        scope = %scope,
                        "Credential expired, refreshing"
                    );
                    self.auth.invalidate(scope.guid());
                }
                Error::Network { .. } => {
                    if retries >= self.max_retries {
                        return Err(error);
                    }
                    let delay = self.network_retry_base * 2u32.saturating_pow(retries);
                    retries += 1;
                    tracing::warn!(
                        operation = context.operation,
                        retries,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %error,
                        "Transient error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                _ => return Err(error),
            }
        }
    }

    fn pause_endpoint(&self, endpoint: &str, wait: Duration) {
        let until = Instant::now() + wait;
        let mut paused = self
            .paused_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let entry = paused.entry(endpoint.to_string()).or_insert(until);
        if *entry < until {
            *entry = until;
        }
    }

    async fn wait_for_endpoint(&self, endpoint: &str) {
        let until = self
            .paused_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(endpoint)
            .copied();
        if let Some(until) = until {
            if until > Instant::now() {
                tokio::time::sleep_until(until).await;
            }
        }
    }
}
