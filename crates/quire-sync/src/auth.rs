//! Credentials for the account and each linked notebook.
//!
//! Lookups go memory cache → credential store → remote refresh. Refreshed
//! credentials are written back to the credential store, and their endpoint
//! and expiry are recorded in the sync state database.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorContext, Result};
use crate::models::{AccountId, EntityKind, Guid, LinkedNotebook, Scope};
use crate::remote::{translate_rpc_error, AuthenticationResult, RemoteService, RemoteStoreAdapter};
use crate::state::{EndpointRecord, SyncStateRepository};
use crate::util::unix_timestamp_now;

/// Token plus the endpoint it is valid for.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub token: String,
    /// Expiry (Unix seconds)
    pub expires_at: i64,
    pub note_store_url: String,
    #[serde(default)]
    pub shard_id: Option<String>,
}

impl Credential {
    /// Expired, or expiring within `skew_secs`.
    pub fn is_expired(&self, skew_secs: i64) -> bool {
        self.expires_at <= unix_timestamp_now() + skew_secs
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Credential")
            .field("token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("note_store_url", &self.note_store_url)
            .field("shard_id", &self.shard_id)
            .finish()
    }
}

impl From<AuthenticationResult> for Credential {
    fn from(value: AuthenticationResult) -> Self {
        Self {
            token: value.token,
            expires_at: value.expires_at,
            note_store_url: value.note_store_url,
            shard_id: value.shard_id,
        }
    }
}

/// Identifies one stored credential.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CredentialKey {
    pub account: AccountId,
    pub linked_notebook: Option<Guid>,
}

impl CredentialKey {
    pub fn new(account: &AccountId, scope: Option<&Guid>) -> Self {
        Self {
            account: account.clone(),
            linked_notebook: scope.cloned(),
        }
    }

    /// Flat key for keychain-style stores.
    pub fn storage_key(&self) -> String {
        match &self.linked_notebook {
            Some(guid) => format!("quire:{}:linked:{guid}", self.account),
            None => format!("quire:{}", self.account),
        }
    }
}

/// Secure credential storage provided by the host (OS keychain or similar).
pub trait CredentialStore: Send + Sync {
    fn read(&self, key: &CredentialKey) -> Result<Option<Credential>>;
    fn write(&self, key: &CredentialKey, credential: &Credential) -> Result<()>;
    fn delete(&self, key: &CredentialKey) -> Result<()>;
}

/// Per-account credential cache with on-demand refresh.
pub struct AccountAuthCache<R, P> {
    account: AccountId,
    remote: Arc<R>,
    state: Arc<P>,
    store: Arc<dyn CredentialStore>,
    cache: Mutex<HashMap<Option<Guid>, Credential>>,
    skew_secs: i64,
    request_timeout: std::time::Duration,
}

impl<R: RemoteService, P: SyncStateRepository> AccountAuthCache<R, P> {
    pub fn new(
        account: AccountId,
        remote: Arc<R>,
        state: Arc<P>,
        store: Arc<dyn CredentialStore>,
        skew_secs: i64,
        request_timeout: std::time::Duration,
    ) -> Self {
        Self {
            account,
            remote,
            state,
            store,
            cache: Mutex::new(HashMap::new()),
            skew_secs,
            request_timeout,
        }
    }

    pub const fn account(&self) -> &AccountId {
        &self.account
    }

    /// A usable credential for the scope, refreshing it when needed.
    pub async fn credential(&self, scope: &Scope) -> Result<Credential> {
        match scope {
            Scope::Own => self.account_credential(false).await,
            Scope::Linked(linked) => self.linked_credential(linked, false).await,
        }
    }

    /// Discard any cached credential and fetch a new one.
    pub async fn refresh(&self, scope: &Scope) -> Result<Credential> {
        self.invalidate(scope.guid());
        match scope {
            Scope::Own => self.account_credential(true).await,
            Scope::Linked(linked) => self.linked_credential(linked, true).await,
        }
    }

    /// Whether a sync could start without contacting the auth service.
    pub fn has_valid_credential(&self, scope: Option<&Guid>) -> bool {
        self.lookup(scope).is_some()
    }

    /// Drop the cached and stored credential for a scope.
    pub fn invalidate(&self, scope: Option<&Guid>) {
        let key = scope.cloned();
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key);
        if let Err(error) = self.store.delete(&CredentialKey::new(&self.account, scope)) {
            tracing::warn!(account = %self.account, "Failed to delete stored credential: {}", error);
        }
    }

    fn lookup(&self, scope: Option<&Guid>) -> Option<Credential> {
        let key = scope.cloned();
        {
            let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(credential) = cache.get(&key) {
                if !credential.is_expired(self.skew_secs) {
                    return Some(credential.clone());
                }
            }
        }

        let stored = match self.store.read(&CredentialKey::new(&self.account, scope)) {
            Ok(stored) => stored,
            Err(error) => {
                tracing::warn!(account = %self.account, "Failed to read stored credential: {}", error);
                None
            }
        }?;
        if stored.is_expired(self.skew_secs) {
            return None;
        }
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, stored.clone());
        Some(stored)
    }

    async fn account_credential(&self, force: bool) -> Result<Credential> {
        if !force {
            if let Some(credential) = self.lookup(None) {
                return Ok(credential);
            }
        }

        tracing::info!(account = %self.account, "Refreshing account credential");
        let fresh = self
            .remote
            .refresh_account_auth(&self.account)
            .await
            .map_err(|error| {
                translate_rpc_error(error, ErrorContext::new("refresh_account_auth"))
            })?;
        let credential = Credential::from(fresh);
        self.remember(None, &credential).await?;
        Ok(credential)
    }

    async fn linked_credential(&self, linked: &LinkedNotebook, force: bool) -> Result<Credential> {
        let guid = linked.meta.guid.as_ref().ok_or_else(|| {
            Error::internal(
                "linked notebook has no guid",
                ErrorContext::new("authenticate_to_shared_notebook")
                    .kind(EntityKind::LinkedNotebook)
                    .local_id(linked.meta.local_id),
            )
        })?;
        if !force {
            if let Some(credential) = self.lookup(Some(guid)) {
                return Ok(credential);
            }
        }

        let account = self.account_credential(false).await?;
        let credential = if linked.shared_notebook_global_id.is_some() {
            tracing::info!(account = %self.account, scope = %guid, "Authenticating to linked notebook");
            let adapter = RemoteStoreAdapter::new(
                self.remote.note_store(&linked.note_store_url),
                linked.note_store_url.clone(),
                self.request_timeout,
            );
            let mut credential = Credential::from(
                adapter
                    .authenticate_to_shared_notebook(&account.token, linked)
                    .await?,
            );
            if credential.note_store_url.trim().is_empty() {
                credential.note_store_url.clone_from(&linked.note_store_url);
            }
            if credential.shard_id.is_none() {
                credential.shard_id.clone_from(&linked.shard_id);
            }
            credential
        } else {
            // Public notebooks are read with the account's own token
            Credential {
                token: account.token,
                expires_at: account.expires_at,
                note_store_url: linked.note_store_url.clone(),
                shard_id: linked.shard_id.clone(),
            }
        };
        self.remember(Some(guid), &credential).await?;
        Ok(credential)
    }

    async fn remember(&self, scope: Option<&Guid>, credential: &Credential) -> Result<()> {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(scope.cloned(), credential.clone());

        if let Err(error) = self
            .store
            .write(&CredentialKey::new(&self.account, scope), credential)
        {
            tracing::warn!(account = %self.account, "Failed to persist credential: {}", error);
        }

        self.state
            .save_endpoint(
                &self.account,
                scope,
                &EndpointRecord {
                    note_store_url: credential.note_store_url.clone(),
                    shard_id: credential.shard_id.clone(),
                    expires_at: credential.expires_at,
                },
            )
            .await
    }

    /// Forget everything held for a linked notebook that no longer exists.
    pub fn forget_linked(&self, guid: &Guid) {
        self.invalidate(Some(guid));
    }
}
