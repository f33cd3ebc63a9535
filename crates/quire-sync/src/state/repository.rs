//! Sync state repository
//!
//! Each account has one update stream for its own data plus one per linked
//! notebook. A stream is keyed by `(account, scope)` where `scope` is the
//! linked notebook guid, or `None` for the own account.

use libsql::{params, Connection};

use super::Database;
use crate::error::Result;
use crate::models::{AccountId, Guid, Usn};

/// Persisted progress of one update stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Checkpoint {
    /// Highest USN fully applied locally
    pub usn: Usn,
    /// When the stream last completed a sync (Unix ms), 0 if never
    pub last_sync_time: i64,
}

/// Note-store endpoint remembered alongside a credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointRecord {
    pub note_store_url: String,
    pub shard_id: Option<String>,
    /// Credential expiry (Unix seconds)
    pub expires_at: i64,
}

/// Trait for sync state storage operations (async)
#[allow(async_fn_in_trait)]
pub trait SyncStateRepository {
    /// Load the checkpoint of a stream; unknown streams start at zero
    async fn checkpoint(&self, account: &AccountId, scope: Option<&Guid>) -> Result<Checkpoint>;

    /// Raise the stored USN to `usn` and return the stored value
    ///
    /// Never lowers it.
    async fn advance_checkpoint(
        &self,
        account: &AccountId,
        scope: Option<&Guid>,
        usn: Usn,
    ) -> Result<Usn>;

    /// Record that the stream completed a sync at `time` (Unix ms)
    async fn record_sync_time(
        &self,
        account: &AccountId,
        scope: Option<&Guid>,
        time: i64,
    ) -> Result<()>;

    async fn endpoint(
        &self,
        account: &AccountId,
        scope: Option<&Guid>,
    ) -> Result<Option<EndpointRecord>>;

    async fn save_endpoint(
        &self,
        account: &AccountId,
        scope: Option<&Guid>,
        record: &EndpointRecord,
    ) -> Result<()>;

    /// Drop everything stored for a linked notebook
    async fn forget_scope(&self, account: &AccountId, scope: &Guid) -> Result<()>;
}

/// libSQL implementation of `SyncStateRepository`
pub struct LibSqlSyncStateRepository {
    db: Database,
}

impl LibSqlSyncStateRepository {
    /// Create a new repository over an opened state database
    pub const fn new(db: Database) -> Self {
        Self { db }
    }

    fn conn(&self) -> &Connection {
        self.db.connection()
    }
}

fn scope_key(scope: Option<&Guid>) -> String {
    scope.map(|guid| guid.as_str().to_string()).unwrap_or_default()
}

impl SyncStateRepository for LibSqlSyncStateRepository {
    async fn checkpoint(&self, account: &AccountId, scope: Option<&Guid>) -> Result<Checkpoint> {
        let mut rows = self
            .conn()
            .query(
                "SELECT usn, last_sync_time FROM sync_checkpoints
                 WHERE account_id = ? AND linked_notebook_guid = ?",
                params![account.as_str().to_string(), scope_key(scope)],
            )
            .await?;

        if let Some(row) = rows.next().await? {
            Ok(Checkpoint {
                usn: row.get::<i32>(0)?,
                last_sync_time: row.get::<i64>(1)?,
            })
        } else {
            Ok(Checkpoint::default())
        }
    }

    async fn advance_checkpoint(
        &self,
        account: &AccountId,
        scope: Option<&Guid>,
        usn: Usn,
    ) -> Result<Usn> {
        self.conn()
            .execute(
                "INSERT INTO sync_checkpoints (account_id, linked_notebook_guid, usn)
                 VALUES (?, ?, ?)
                 ON CONFLICT(account_id, linked_notebook_guid)
                 DO UPDATE SET usn = MAX(usn, excluded.usn)",
                params![account.as_str().to_string(), scope_key(scope), i64::from(usn)],
            )
            .await?;

        let stored = self.checkpoint(account, scope).await?.usn;
        tracing::debug!(
            account = %account,
            scope = scope.map_or("own", Guid::as_str),
            requested = usn,
            stored,
            "Advanced sync checkpoint"
        );
        Ok(stored)
    }

    async fn record_sync_time(
        &self,
        account: &AccountId,
        scope: Option<&Guid>,
        time: i64,
    ) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO sync_checkpoints (account_id, linked_notebook_guid, last_sync_time)
                 VALUES (?, ?, ?)
                 ON CONFLICT(account_id, linked_notebook_guid)
                 DO UPDATE SET last_sync_time = excluded.last_sync_time",
                params![account.as_str().to_string(), scope_key(scope), time],
            )
            .await?;
        Ok(())
    }

    async fn endpoint(
        &self,
        account: &AccountId,
        scope: Option<&Guid>,
    ) -> Result<Option<EndpointRecord>> {
        let mut rows = self
            .conn()
            .query(
                "SELECT note_store_url, shard_id, expires_at FROM auth_endpoints
                 WHERE account_id = ? AND linked_notebook_guid = ?",
                params![account.as_str().to_string(), scope_key(scope)],
            )
            .await?;

        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        let shard_id: String = row.get(1)?;
        Ok(Some(EndpointRecord {
            note_store_url: row.get(0)?,
            shard_id: (!shard_id.is_empty()).then_some(shard_id),
            expires_at: row.get(2)?,
        }))
    }

    async fn save_endpoint(
        &self,
        account: &AccountId,
        scope: Option<&Guid>,
        record: &EndpointRecord,
    ) -> Result<()> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO auth_endpoints
                 (account_id, linked_notebook_guid, note_store_url, shard_id, expires_at)
                 VALUES (?, ?, ?, ?, ?)",
                params![
                    account.as_str().to_string(),
                    scope_key(scope),
                    record.note_store_url.clone(),
                    record.shard_id.clone().unwrap_or_default(),
                    record.expires_at
                ],
            )
            .await?;
        Ok(())
    }

    async fn forget_scope(&self, account: &AccountId, scope: &Guid) -> Result<()> {
        for table in ["sync_checkpoints", "auth_endpoints"] {
            self.conn()
                .execute(
                    &format!(
                        "DELETE FROM {table} WHERE account_id = ? AND linked_notebook_guid = ?"
                    ),
                    params![account.as_str().to_string(), scope.as_str().to_string()],
                )
                .await?;
        }
        tracing::info!(account = %account, scope = %scope, "Forgot linked notebook sync state");
        Ok(())
    }
}
