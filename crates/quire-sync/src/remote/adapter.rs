//! Typed facade over one note-store endpoint

use std::future::Future;
use std::time::Duration;

use super::{AuthenticationResult, NoteStoreTransport, PushAck, RpcError, RpcErrorCode, RpcResult};
use crate::error::{Error, ErrorContext, Result};
use crate::models::{
    Entity, EntityKind, Guid, LinkedNotebook, Note, Notebook, Resource, SyncChunk, SyncState, Tag,
    Usn,
};

/// Translate a service failure into the crate error taxonomy.
pub fn translate_rpc_error(error: RpcError, context: ErrorContext) -> Error {
    match error {
        RpcError::System {
            code: RpcErrorCode::RateLimitReached,
            rate_limit_duration,
            ..
        } => Error::RateLimited {
            retry_after: rate_limit_duration
                .and_then(|seconds| u64::try_from(seconds).ok())
                .filter(|seconds| *seconds > 0)
                .map(Duration::from_secs),
            context,
        },
        RpcError::User {
            code: RpcErrorCode::AuthExpired,
            ..
        }
        | RpcError::System {
            code: RpcErrorCode::AuthExpired,
            ..
        } => Error::AuthExpired { context },
        RpcError::User { code, parameter } => {
            let message = parameter.map_or_else(|| code.to_string(), |field| format!("{code} on {field}"));
            user_error(code, message, context)
        }
        RpcError::System { code, message, .. } => {
            let message = message.map_or_else(|| code.to_string(), |text| format!("{code}: {text}"));
            match code {
                RpcErrorCode::ShardUnavailable => Error::network(message, context),
                _ => user_error(code, message, context),
            }
        }
        RpcError::NotFound { identifier, key } => Error::integrity(
            format!(
                "remote object not found: {}={}",
                identifier.as_deref().unwrap_or("?"),
                key.as_deref().unwrap_or("?")
            ),
            context,
        ),
        RpcError::Transport { message, timeout } => {
            let message = if timeout {
                format!("request timed out: {message}")
            } else {
                message
            };
            Error::network(message, context)
        }
    }
}

fn user_error(code: RpcErrorCode, message: String, context: ErrorContext) -> Error {
    match code {
        RpcErrorCode::BadDataFormat
        | RpcErrorCode::DataRequired
        | RpcErrorCode::LimitReached
        | RpcErrorCode::QuotaReached
        | RpcErrorCode::EnmlValidation
        | RpcErrorCode::LenTooShort
        | RpcErrorCode::LenTooLong
        | RpcErrorCode::TooFew
        | RpcErrorCode::TooMany => Error::validation(message, context),
        RpcErrorCode::DataConflict => Error::DataConflict { message, context },
        RpcErrorCode::InvalidAuth | RpcErrorCode::PermissionDenied => {
            Error::Authentication { message, context }
        }
        RpcErrorCode::ShardUnavailable => Error::network(message, context),
        RpcErrorCode::AuthExpired => Error::AuthExpired { context },
        RpcErrorCode::RateLimitReached => Error::RateLimited {
            retry_after: None,
            context,
        },
        RpcErrorCode::Unknown
        | RpcErrorCode::InternalError
        | RpcErrorCode::UnsupportedOperation
        | RpcErrorCode::TakenDown => Error::internal(message, context),
    }
}

/// One note-store endpoint, speaking the crate's error taxonomy.
///
/// Calls that produce no answer within the configured timeout fail with a
/// network error.
pub struct RemoteStoreAdapter<N> {
    transport: N,
    url: String,
    timeout: Duration,
}

impl<N: NoteStoreTransport> RemoteStoreAdapter<N> {
    pub fn new(transport: N, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            transport,
            url: url.into(),
            timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn run<T>(
        &self,
        context: ErrorContext,
        call: impl Future<Output = RpcResult<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(translate_rpc_error(error, context)),
            Err(_) => Err(Error::network(
                format!("no response from {} within {:?}", self.url, self.timeout),
                context,
            )),
        }
    }

    pub async fn get_sync_state(&self, token: &str) -> Result<SyncState> {
        self.run(
            ErrorContext::new("get_sync_state"),
            self.transport.get_sync_state(token),
        )
        .await
    }

    pub async fn get_sync_chunk(
        &self,
        token: &str,
        after_usn: Usn,
        max_entries: i32,
    ) -> Result<SyncChunk> {
        self.run(
            ErrorContext::new("get_sync_chunk"),
            self.transport.get_sync_chunk(token, after_usn, max_entries),
        )
        .await
    }

    pub async fn get_linked_notebook_sync_state(
        &self,
        token: &str,
        linked: &LinkedNotebook,
    ) -> Result<SyncState> {
        self.run(
            ErrorContext::new("get_linked_notebook_sync_state")
                .kind(EntityKind::LinkedNotebook)
                .guid(linked.meta.guid.as_ref()),
            self.transport.get_linked_notebook_sync_state(token, linked),
        )
        .await
    }

    pub async fn get_linked_notebook_sync_chunk(
        &self,
        token: &str,
        linked: &LinkedNotebook,
        after_usn: Usn,
        max_entries: i32,
    ) -> Result<SyncChunk> {
        self.run(
            ErrorContext::new("get_linked_notebook_sync_chunk")
                .kind(EntityKind::LinkedNotebook)
                .guid(linked.meta.guid.as_ref()),
            self.transport
                .get_linked_notebook_sync_chunk(token, linked, after_usn, max_entries),
        )
        .await
    }

    pub async fn get_full_note(&self, token: &str, guid: &Guid) -> Result<Note> {
        self.run(
            ErrorContext::new("get_note")
                .kind(EntityKind::Note)
                .guid(Some(guid)),
            self.transport.get_note(token, guid),
        )
        .await
    }

    pub async fn get_full_resource(&self, token: &str, guid: &Guid) -> Result<Resource> {
        self.run(
            ErrorContext::new("get_resource")
                .kind(EntityKind::Resource)
                .guid(Some(guid)),
            self.transport.get_resource(token, guid),
        )
        .await
    }

    pub async fn get_notebook(&self, token: &str, guid: &Guid) -> Result<Notebook> {
        self.run(
            ErrorContext::new("get_notebook")
                .kind(EntityKind::Notebook)
                .guid(Some(guid)),
            self.transport.get_notebook(token, guid),
        )
        .await
    }

    pub async fn get_tag(&self, token: &str, guid: &Guid) -> Result<Tag> {
        self.run(
            ErrorContext::new("get_tag")
                .kind(EntityKind::Tag)
                .guid(Some(guid)),
            self.transport.get_tag(token, guid),
        )
        .await
    }

    pub async fn create_or_update(&self, token: &str, entity: &Entity) -> Result<PushAck> {
        let operation = if entity.meta().guid.is_some() {
            "update"
        } else {
            "create"
        };
        self.run(
            ErrorContext::new(operation)
                .kind(entity.kind())
                .guid(entity.meta().guid.as_ref())
                .local_id(entity.meta().local_id),
            self.transport.create_or_update(token, entity),
        )
        .await
    }

    pub async fn expunge(&self, token: &str, kind: EntityKind, guid: &Guid) -> Result<Usn> {
        self.run(
            ErrorContext::new("expunge").kind(kind).guid(Some(guid)),
            self.transport.expunge(token, kind, guid),
        )
        .await
    }

    pub async fn authenticate_to_shared_notebook(
        &self,
        token: &str,
        linked: &LinkedNotebook,
    ) -> Result<AuthenticationResult> {
        self.run(
            ErrorContext::new("authenticate_to_shared_notebook")
                .kind(EntityKind::LinkedNotebook)
                .guid(linked.meta.guid.as_ref()),
            self.transport.authenticate_to_shared_notebook(token, linked),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;

    fn context() -> ErrorContext {
        ErrorContext::new("create").kind(EntityKind::Note)
    }

    #[test]
    fn rate_limit_carries_wait() {
        let error = translate_rpc_error(
            RpcError::System {
                code: RpcErrorCode::RateLimitReached,
                message: None,
                rate_limit_duration: Some(30),
            },
            context(),
        );
        assert!(matches!(
            error,
            Error::RateLimited { retry_after: Some(wait), .. } if wait == Duration::from_secs(30)
        ));
    }

    #[test]
    fn non_positive_rate_limit_wait_is_dropped() {
        let error = translate_rpc_error(
            RpcError::System {
                code: RpcErrorCode::RateLimitReached,
                message: None,
                rate_limit_duration: Some(0),
            },
            context(),
        );
        assert!(matches!(error, Error::RateLimited { retry_after: None, .. }));
    }

    #[test]
    fn field_errors_are_validation() {
        let error = translate_rpc_error(
            RpcError::User {
                code: RpcErrorCode::LenTooLong,
                parameter: Some("Note.title".to_string()),
            },
            context(),
        );
        assert_eq!(error.class(), ErrorClass::Validation);
        assert!(error.to_string().contains("Note.title"));
        assert!(error.to_string().contains("kind=note"));
    }

    #[test]
    fn auth_and_conflict_codes() {
        let expired = translate_rpc_error(
            RpcError::User {
                code: RpcErrorCode::AuthExpired,
                parameter: None,
            },
            context(),
        );
        assert!(matches!(expired, Error::AuthExpired { .. }));

        let conflict = translate_rpc_error(
            RpcError::User {
                code: RpcErrorCode::DataConflict,
                parameter: Some("Notebook.name".to_string()),
            },
            context(),
        );
        assert_eq!(conflict.class(), ErrorClass::DataConflict);

        let denied = translate_rpc_error(
            RpcError::User {
                code: RpcErrorCode::InvalidAuth,
                parameter: None,
            },
            context(),
        );
        assert!(matches!(denied, Error::Authentication { .. }));
    }

    #[test]
    fn transport_and_shard_failures_are_transient() {
        let timeout = translate_rpc_error(
            RpcError::Transport {
                message: "connect".to_string(),
                timeout: true,
            },
            context(),
        );
        assert_eq!(timeout.class(), ErrorClass::Transient);
        assert!(timeout.to_string().contains("timed out"));

        let shard = translate_rpc_error(
            RpcError::System {
                code: RpcErrorCode::ShardUnavailable,
                message: None,
                rate_limit_duration: None,
            },
            context(),
        );
        assert_eq!(shard.class(), ErrorClass::Transient);
    }

    #[test]
    fn unknown_codes_are_internal() {
        let error = translate_rpc_error(
            RpcError::System {
                code: RpcErrorCode::Unknown,
                message: Some("boom".to_string()),
                rate_limit_duration: None,
            },
            context(),
        );
        assert_eq!(error.class(), ErrorClass::Internal);
    }

    #[test]
    fn missing_objects_are_integrity_errors() {
        let error = translate_rpc_error(
            RpcError::NotFound {
                identifier: Some("Notebook.guid".to_string()),
                key: Some("nb-9".to_string()),
            },
            context(),
        );
        assert_eq!(error.class(), ErrorClass::Integrity);
    }
}
