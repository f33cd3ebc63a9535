//! JSON-over-HTTPS note-store transport.
//!
//! Each RPC is a `POST {endpoint}/{method}` carrying a JSON parameter object
//! and the credential as a bearer token. Failures come back as an error
//! envelope `{"error": {"type": "user" | "system" | "not_found", ...}}`.

use std::time::Duration;

use reqwest::header::RETRY_AFTER;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{
    AuthenticationResult, NoteStoreTransport, PushAck, RemoteService, RpcError, RpcErrorCode,
    RpcResult,
};
use crate::error::{Error, Result};
use crate::models::{
    AccountId, Entity, EntityKind, Guid, LinkedNotebook, Note, Notebook, Resource, SyncChunk,
    SyncState, Tag, Usn,
};
use crate::util::compact_text;

/// Remote service reached over HTTPS.
#[derive(Clone)]
pub struct HttpRemoteService {
    user_store_url: String,
    client: Client,
}

impl HttpRemoteService {
    pub fn new(user_store_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let user_store_url = normalize_endpoint(user_store_url.into())?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| Error::Configuration(format!("HTTP client: {error}")))?;
        Ok(Self {
            user_store_url,
            client,
        })
    }
}

impl RemoteService for HttpRemoteService {
    type NoteStore = HttpNoteStore;

    fn note_store(&self, url: &str) -> HttpNoteStore {
        HttpNoteStore {
            url: url.trim().trim_end_matches('/').to_string(),
            client: self.client.clone(),
        }
    }

    async fn refresh_account_auth(&self, account: &AccountId) -> RpcResult<AuthenticationResult> {
        call(
            &self.client,
            &self.user_store_url,
            "refreshAuthentication",
            None,
            &json!({ "account": account }),
        )
        .await
    }
}

/// Transport bound to one note-store URL.
#[derive(Clone)]
pub struct HttpNoteStore {
    url: String,
    client: Client,
}

impl HttpNoteStore {
    async fn call<T: DeserializeOwned>(&self, method: &str, token: &str, params: &Value) -> RpcResult<T> {
        call(&self.client, &self.url, method, Some(token), params).await
    }
}

impl NoteStoreTransport for HttpNoteStore {
    async fn get_sync_state(&self, token: &str) -> RpcResult<SyncState> {
        self.call("getSyncState", token, &json!({})).await
    }

    async fn get_sync_chunk(
        &self,
        token: &str,
        after_usn: Usn,
        max_entries: i32,
    ) -> RpcResult<SyncChunk> {
        self.call(
            "getFilteredSyncChunk",
            token,
            &json!({ "after_usn": after_usn, "max_entries": max_entries, "include_expunged": true }),
        )
        .await
    }

    async fn get_linked_notebook_sync_state(
        &self,
        token: &str,
        linked: &LinkedNotebook,
    ) -> RpcResult<SyncState> {
        self.call(
            "getLinkedNotebookSyncState",
            token,
            &json!({ "linked_notebook": linked }),
        )
        .await
    }

    async fn get_linked_notebook_sync_chunk(
        &self,
        token: &str,
        linked: &LinkedNotebook,
        after_usn: Usn,
        max_entries: i32,
    ) -> RpcResult<SyncChunk> {
        self.call(
            "getLinkedNotebookSyncChunk",
            token,
            &json!({
                "linked_notebook": linked,
                "after_usn": after_usn,
                "max_entries": max_entries,
                "full_sync_only": false,
            }),
        )
        .await
    }

    async fn get_note(&self, token: &str, guid: &Guid) -> RpcResult<Note> {
        self.call(
            "getNote",
            token,
            &json!({ "guid": guid, "with_content": true, "with_resources_data": false }),
        )
        .await
    }

    async fn get_resource(&self, token: &str, guid: &Guid) -> RpcResult<Resource> {
        self.call(
            "getResource",
            token,
            &json!({ "guid": guid, "with_data": true }),
        )
        .await
    }

    async fn get_notebook(&self, token: &str, guid: &Guid) -> RpcResult<Notebook> {
        self.call("getNotebook", token, &json!({ "guid": guid })).await
    }

    async fn get_tag(&self, token: &str, guid: &Guid) -> RpcResult<Tag> {
        self.call("getTag", token, &json!({ "guid": guid })).await
    }

    async fn create_or_update(&self, token: &str, entity: &Entity) -> RpcResult<PushAck> {
        let verb = if entity.meta().guid.is_some() {
            "update"
        } else {
            "create"
        };
        let method = format!("{verb}{}", method_suffix(entity.kind()));
        let payload = entity_payload(entity).map_err(|error| RpcError::System {
            code: RpcErrorCode::BadDataFormat,
            message: Some(compact_text(&error.to_string())),
            rate_limit_duration: None,
        })?;
        self.call(&method, token, &payload).await
    }

    async fn expunge(&self, token: &str, kind: EntityKind, guid: &Guid) -> RpcResult<Usn> {
        let method = format!("expunge{}", method_suffix(kind));
        self.call(&method, token, &json!({ "guid": guid })).await
    }

    async fn authenticate_to_shared_notebook(
        &self,
        token: &str,
        linked: &LinkedNotebook,
    ) -> RpcResult<AuthenticationResult> {
        self.call(
            "authenticateToSharedNotebook",
            token,
            &json!({ "share_key": linked.shared_notebook_global_id }),
        )
        .await
    }
}

const fn method_suffix(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Notebook => "Notebook",
        EntityKind::Tag => "Tag",
        EntityKind::SavedSearch => "SearchRecord",
        EntityKind::Note => "Note",
        EntityKind::Resource => "Resource",
        EntityKind::LinkedNotebook => "LinkedNotebook",
    }
}

fn entity_payload(entity: &Entity) -> serde_json::Result<Value> {
    match entity {
        Entity::Notebook(notebook) => serde_json::to_value(notebook),
        Entity::Tag(tag) => serde_json::to_value(tag),
        Entity::SavedSearch(search) => serde_json::to_value(search),
        Entity::Note(note) => serde_json::to_value(note),
        Entity::Resource(resource) => serde_json::to_value(resource),
        Entity::LinkedNotebook(linked) => serde_json::to_value(linked),
    }
}

async fn call<T: DeserializeOwned>(
    client: &Client,
    endpoint: &str,
    method: &str,
    token: Option<&str>,
    params: &Value,
) -> RpcResult<T> {
    let mut request = client
        .post(format!("{endpoint}/{method}"))
        .header("Accept", "application/json")
        .json(params);
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }

    let response = request.send().await.map_err(transport_error)?;
    let status = response.status();
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<i32>().ok());
    let body = response.text().await.map_err(transport_error)?;

    if !status.is_success() {
        tracing::debug!(method, status = status.as_u16(), "Note store call failed");
        return Err(parse_rpc_error(status, retry_after, &body));
    }

    serde_json::from_str(&body).map_err(|error| RpcError::System {
        code: RpcErrorCode::Unknown,
        message: Some(format!(
            "invalid {method} response: {}",
            compact_text(&error.to_string())
        )),
        rate_limit_duration: None,
    })
}

fn transport_error(error: reqwest::Error) -> RpcError {
    RpcError::Transport {
        message: compact_text(&error.to_string()),
        timeout: error.is_timeout(),
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ErrorBody {
    User {
        error_code: i32,
        parameter: Option<String>,
    },
    System {
        error_code: i32,
        message: Option<String>,
        rate_limit_duration: Option<i32>,
    },
    NotFound {
        identifier: Option<String>,
        key: Option<String>,
    },
}

fn parse_rpc_error(status: StatusCode, retry_after: Option<i32>, body: &str) -> RpcError {
    if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(body) {
        return match envelope.error {
            ErrorBody::User {
                error_code,
                parameter,
            } => RpcError::User {
                code: RpcErrorCode::from_code(error_code),
                parameter: non_blank(parameter),
            },
            ErrorBody::System {
                error_code,
                message,
                rate_limit_duration,
            } => RpcError::System {
                code: RpcErrorCode::from_code(error_code),
                message: non_blank(message),
                rate_limit_duration,
            },
            ErrorBody::NotFound { identifier, key } => RpcError::NotFound { identifier, key },
        };
    }

    let trimmed = body.trim();
    let message = if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", compact_text(trimmed), status.as_u16())
    };

    match status {
        StatusCode::TOO_MANY_REQUESTS => RpcError::System {
            code: RpcErrorCode::RateLimitReached,
            message: Some(message),
            rate_limit_duration: retry_after,
        },
        StatusCode::UNAUTHORIZED => RpcError::User {
            code: RpcErrorCode::InvalidAuth,
            parameter: None,
        },
        status if status.is_server_error() => RpcError::Transport {
            message,
            timeout: status == StatusCode::GATEWAY_TIMEOUT,
        },
        _ => RpcError::System {
            code: RpcErrorCode::Unknown,
            message: Some(message),
            rate_limit_duration: None,
        },
    }
}

/// Error envelope fields sometimes arrive as empty strings.
fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn normalize_endpoint(raw: String) -> Result<String> {
    let endpoint = non_blank(Some(raw))
        .ok_or_else(|| Error::Configuration("endpoint must not be empty".to_string()))?;
    if endpoint.starts_with("https://") || endpoint.starts_with("http://") {
        Ok(endpoint.trim_end_matches('/').to_string())
    } else {
        Err(Error::Configuration(
            "endpoint must include http:// or https://".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LocalId, Notebook};
    use pretty_assertions::assert_eq;

    #[test]
    fn normalize_endpoint_rejects_invalid_values() {
        assert!(normalize_endpoint(String::new()).is_err());
        assert!(normalize_endpoint("example.com".to_string()).is_err());
        assert!(normalize_endpoint("ftp://example.com".to_string()).is_err());
        assert_eq!(
            normalize_endpoint(" https://example.com/user/ ".to_string()).unwrap(),
            "https://example.com/user"
        );
    }

    #[test]
    fn parse_rpc_error_reads_user_envelope() {
        let body = r#"{"error": {"type": "user", "error_code": 14, "parameter": "Note.title"}}"#;
        assert_eq!(
            parse_rpc_error(StatusCode::BAD_REQUEST, None, body),
            RpcError::User {
                code: RpcErrorCode::LenTooLong,
                parameter: Some("Note.title".to_string()),
            }
        );
    }

    #[test]
    fn blank_envelope_fields_are_dropped() {
        let body = r#"{"error": {"type": "system", "error_code": 4, "message": "  "}}"#;
        assert_eq!(
            parse_rpc_error(StatusCode::INTERNAL_SERVER_ERROR, None, body),
            RpcError::System {
                code: RpcErrorCode::InternalError,
                message: None,
                rate_limit_duration: None,
            }
        );
    }

    #[test]
    fn parse_rpc_error_reads_rate_limit_envelope() {
        let body = r#"{"error": {"type": "system", "error_code": 19, "rate_limit_duration": 30}}"#;
        assert_eq!(
            parse_rpc_error(StatusCode::BAD_REQUEST, None, body),
            RpcError::System {
                code: RpcErrorCode::RateLimitReached,
                message: None,
                rate_limit_duration: Some(30),
            }
        );
    }

    #[test]
    fn parse_rpc_error_falls_back_to_status() {
        assert_eq!(
            parse_rpc_error(StatusCode::TOO_MANY_REQUESTS, Some(12), ""),
            RpcError::System {
                code: RpcErrorCode::RateLimitReached,
                message: Some("HTTP 429".to_string()),
                rate_limit_duration: Some(12),
            }
        );
        assert!(matches!(
            parse_rpc_error(StatusCode::BAD_GATEWAY, None, "upstream down"),
            RpcError::Transport { timeout: false, .. }
        ));
    }

    #[test]
    fn create_payload_omits_local_bookkeeping() {
        let mut notebook = Notebook::new("Work");
        notebook.meta.local_id = LocalId::new();
        let payload = entity_payload(&Entity::Notebook(notebook)).unwrap();
        assert_eq!(payload["name"], "Work");
        assert!(payload.get("local_id").is_none());
        assert!(payload.get("dirty").is_none());
    }

    #[test]
    fn note_store_url_is_trimmed() {
        let service =
            HttpRemoteService::new("https://example.com/user", Duration::from_secs(5)).unwrap();
        let store = service.note_store("https://example.com/shard/s1/notestore/");
        assert_eq!(store.url, "https://example.com/shard/s1/notestore");
    }
}
