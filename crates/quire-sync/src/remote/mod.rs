//! Remote note-store contract.
//!
//! [`NoteStoreTransport`] is the raw RPC surface of one note-store endpoint,
//! returning [`RpcError`]s exactly as the service reports them.
//! [`RemoteStoreAdapter`] wraps a transport and translates those errors into
//! the crate's [`Error`](crate::Error) taxonomy.

mod adapter;
mod http;

pub use adapter::{translate_rpc_error, RemoteStoreAdapter};
pub use http::{HttpNoteStore, HttpRemoteService};

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{
    AccountId, Entity, EntityKind, Guid, LinkedNotebook, Note, Notebook, Resource, SyncChunk,
    SyncState, Tag, Usn,
};

/// Error codes the service attaches to user and system exceptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RpcErrorCode {
    Unknown = 1,
    BadDataFormat = 2,
    PermissionDenied = 3,
    InternalError = 4,
    DataRequired = 5,
    LimitReached = 6,
    QuotaReached = 7,
    InvalidAuth = 8,
    AuthExpired = 9,
    DataConflict = 10,
    EnmlValidation = 11,
    ShardUnavailable = 12,
    LenTooShort = 13,
    LenTooLong = 14,
    TooFew = 15,
    TooMany = 16,
    UnsupportedOperation = 17,
    TakenDown = 18,
    RateLimitReached = 19,
}

impl RpcErrorCode {
    /// Map a numeric wire code; unrecognized values become `Unknown`.
    pub const fn from_code(code: i32) -> Self {
        match code {
            2 => Self::BadDataFormat,
            3 => Self::PermissionDenied,
            4 => Self::InternalError,
            5 => Self::DataRequired,
            6 => Self::LimitReached,
            7 => Self::QuotaReached,
            8 => Self::InvalidAuth,
            9 => Self::AuthExpired,
            10 => Self::DataConflict,
            11 => Self::EnmlValidation,
            12 => Self::ShardUnavailable,
            13 => Self::LenTooShort,
            14 => Self::LenTooLong,
            15 => Self::TooFew,
            16 => Self::TooMany,
            17 => Self::UnsupportedOperation,
            18 => Self::TakenDown,
            19 => Self::RateLimitReached,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for RpcErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Failure reported by a note-store RPC.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    /// The request was rejected because of the caller's data or credentials.
    #[error("user exception {code}: {parameter:?}")]
    User {
        code: RpcErrorCode,
        /// Offending field, e.g. `Note.title`
        parameter: Option<String>,
    },
    /// The service failed or asked the caller to back off.
    #[error("system exception {code}: {message:?}")]
    System {
        code: RpcErrorCode,
        message: Option<String>,
        /// Seconds to wait before retrying, for `RateLimitReached`
        rate_limit_duration: Option<i32>,
    },
    /// The referenced object does not exist.
    #[error("not found: {identifier:?}={key:?}")]
    NotFound {
        identifier: Option<String>,
        key: Option<String>,
    },
    /// The request never produced a service response.
    #[error("transport failure: {message}")]
    Transport { message: String, timeout: bool },
}

pub type RpcResult<T> = std::result::Result<T, RpcError>;

/// Credential issued for a note-store endpoint.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticationResult {
    pub token: String,
    /// Expiry (Unix seconds)
    pub expires_at: i64,
    pub note_store_url: String,
    #[serde(default)]
    pub shard_id: Option<String>,
}

impl fmt::Debug for AuthenticationResult {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AuthenticationResult")
            .field("token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("note_store_url", &self.note_store_url)
            .field("shard_id", &self.shard_id)
            .finish()
    }
}

/// Server acknowledgement of a create or update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushAck {
    pub guid: Guid,
    pub usn: Usn,
}

/// RPC surface of one note-store endpoint.
#[allow(async_fn_in_trait)]
pub trait NoteStoreTransport {
    async fn get_sync_state(&self, token: &str) -> RpcResult<SyncState>;

    /// Changes with USN greater than `after_usn`, at most `max_entries` items.
    async fn get_sync_chunk(
        &self,
        token: &str,
        after_usn: Usn,
        max_entries: i32,
    ) -> RpcResult<SyncChunk>;

    async fn get_linked_notebook_sync_state(
        &self,
        token: &str,
        linked: &LinkedNotebook,
    ) -> RpcResult<SyncState>;

    async fn get_linked_notebook_sync_chunk(
        &self,
        token: &str,
        linked: &LinkedNotebook,
        after_usn: Usn,
        max_entries: i32,
    ) -> RpcResult<SyncChunk>;

    /// Note including its content.
    async fn get_note(&self, token: &str, guid: &Guid) -> RpcResult<Note>;

    /// Resource including its data.
    async fn get_resource(&self, token: &str, guid: &Guid) -> RpcResult<Resource>;

    async fn get_notebook(&self, token: &str, guid: &Guid) -> RpcResult<Notebook>;

    async fn get_tag(&self, token: &str, guid: &Guid) -> RpcResult<Tag>;

    /// Create the entity when it has no guid, update it otherwise.
    async fn create_or_update(&self, token: &str, entity: &Entity) -> RpcResult<PushAck>;

    /// Permanently remove an entity; returns the USN of the deletion.
    async fn expunge(&self, token: &str, kind: EntityKind, guid: &Guid) -> RpcResult<Usn>;

    /// Exchange the account token for a token scoped to a shared notebook.
    async fn authenticate_to_shared_notebook(
        &self,
        token: &str,
        linked: &LinkedNotebook,
    ) -> RpcResult<AuthenticationResult>;
}

/// Entry point to the remote service for one user store.
#[allow(async_fn_in_trait)]
pub trait RemoteService {
    type NoteStore: NoteStoreTransport;

    /// Transport bound to a note-store URL.
    fn note_store(&self, url: &str) -> Self::NoteStore;

    /// Obtain a fresh credential for the account itself.
    async fn refresh_account_auth(&self, account: &AccountId) -> RpcResult<AuthenticationResult>;
}
