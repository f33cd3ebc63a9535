//! Error types for quire-sync

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::models::{EntityKind, Guid, LocalId};

/// Result type alias using quire-sync's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification used to decide whether a failure is retried,
/// reported per item, absorbed, or aborts the current phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Rate limit, expired auth, network trouble. Retried by `RateLimitedCaller`.
    Transient,
    /// Malformed entity or quota exceeded. Reported per item.
    Validation,
    /// Remote and local disagree. Absorbed by the conflict resolver.
    DataConflict,
    /// Missing dependency or broken identity invariant. Reported per item.
    Integrity,
    /// Contract violation, storage failure or fatal auth. Aborts the phase.
    Internal,
}

/// Call context attached to errors so a failure can be reproduced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub operation: &'static str,
    pub kind: Option<EntityKind>,
    pub guid: Option<Guid>,
    pub local_id: Option<LocalId>,
}

impl ErrorContext {
    pub const fn new(operation: &'static str) -> Self {
        Self {
            operation,
            kind: None,
            guid: None,
            local_id: None,
        }
    }

    #[must_use]
    pub const fn kind(mut self, kind: EntityKind) -> Self {
        self.kind = Some(kind);
        self
    }

    #[must_use]
    pub fn guid(mut self, guid: Option<&Guid>) -> Self {
        self.guid = guid.cloned();
        self
    }

    #[must_use]
    pub const fn local_id(mut self, local_id: LocalId) -> Self {
        self.local_id = Some(local_id);
        self
    }

    const fn is_empty(&self) -> bool {
        self.operation.is_empty()
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "no context");
        }
        write!(f, "operation={}", self.operation)?;
        if let Some(kind) = self.kind {
            write!(f, " kind={}", kind.label())?;
        }
        if let Some(guid) = &self.guid {
            write!(f, " guid={guid}")?;
        }
        if let Some(local_id) = &self.local_id {
            write!(f, " local_id={local_id}")?;
        }
        Ok(())
    }
}

/// Errors that can occur in quire-sync operations
#[derive(Error, Debug)]
pub enum Error {
    /// Server asked us to back off
    #[error("Rate limit reached, retry after {retry_after:?} ({context})")]
    RateLimited {
        retry_after: Option<Duration>,
        context: ErrorContext,
    },

    /// Authentication token expired mid-run
    #[error("Authentication expired ({context})")]
    AuthExpired { context: ErrorContext },

    /// Connection failure, timeout or unavailable shard
    #[error("Network error: {message} ({context})")]
    Network {
        message: String,
        context: ErrorContext,
    },

    /// Server rejected the entity
    #[error("Validation failed: {message} ({context})")]
    Validation {
        message: String,
        context: ErrorContext,
    },

    /// Server reported a conflicting state for the entity
    #[error("Data conflict: {message} ({context})")]
    DataConflict {
        message: String,
        context: ErrorContext,
    },

    /// Missing dependency or broken identity invariant
    #[error("Integrity error: {message} ({context})")]
    Integrity {
        message: String,
        context: ErrorContext,
    },

    /// Credentials were rejected and cannot be refreshed
    #[error("Authentication failed: {message} ({context})")]
    Authentication {
        message: String,
        context: ErrorContext,
    },

    /// Programming-contract violation
    #[error("Internal error: {message} ({context})")]
    Internal {
        message: String,
        context: ErrorContext,
    },

    /// Local store failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// Credential storage failure
    #[error("Credential storage error: {0}")]
    CredentialStorage(String),

    /// A sync for this account is already running
    #[error("Sync already in progress for account {0}")]
    AlreadyInProgress(String),

    /// The run was cancelled cooperatively
    #[error("Sync cancelled")]
    Cancelled,
}

impl Error {
    pub fn validation(message: impl Into<String>, context: ErrorContext) -> Self {
        Self::Validation {
            message: message.into(),
            context,
        }
    }

    pub fn integrity(message: impl Into<String>, context: ErrorContext) -> Self {
        Self::Integrity {
            message: message.into(),
            context,
        }
    }

    pub fn internal(message: impl Into<String>, context: ErrorContext) -> Self {
        Self::Internal {
            message: message.into(),
            context,
        }
    }

    pub fn network(message: impl Into<String>, context: ErrorContext) -> Self {
        Self::Network {
            message: message.into(),
            context,
        }
    }

    /// Map the error onto the retry/report/abort taxonomy.
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::RateLimited { .. } | Self::AuthExpired { .. } | Self::Network { .. } => {
                ErrorClass::Transient
            }
            Self::Validation { .. } => ErrorClass::Validation,
            Self::DataConflict { .. } => ErrorClass::DataConflict,
            Self::Integrity { .. } => ErrorClass::Integrity,
            Self::Authentication { .. }
            | Self::Internal { .. }
            | Self::Storage(_)
            | Self::LibSql(_)
            | Self::Io(_)
            | Self::Serialization(_)
            | Self::Configuration(_)
            | Self::CredentialStorage(_)
            | Self::AlreadyInProgress(_)
            | Self::Cancelled => ErrorClass::Internal,
        }
    }

    /// Per-item errors are collected in the run report instead of aborting.
    pub const fn is_item_level(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Validation | ErrorClass::Integrity | ErrorClass::DataConflict
        )
    }

    pub const fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::RateLimited { context, .. }
            | Self::AuthExpired { context }
            | Self::Network { context, .. }
            | Self::Validation { context, .. }
            | Self::DataConflict { context, .. }
            | Self::Integrity { context, .. }
            | Self::Authentication { context, .. }
            | Self::Internal { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Fill in call context where the error does not carry any yet.
    ///
    /// Uncontextualized errors (storage, serialization) are wrapped as
    /// internal errors naming the call that produced them.
    #[must_use]
    pub fn with_context(self, call: &ErrorContext) -> Self {
        match self {
            Self::RateLimited {
                retry_after,
                context,
            } => Self::RateLimited {
                retry_after,
                context: merge(context, call),
            },
            Self::AuthExpired { context } => Self::AuthExpired {
                context: merge(context, call),
            },
            Self::Network { message, context } => Self::Network {
                message,
                context: merge(context, call),
            },
            Self::Validation { message, context } => Self::Validation {
                message,
                context: merge(context, call),
            },
            Self::DataConflict { message, context } => Self::DataConflict {
                message,
                context: merge(context, call),
            },
            Self::Integrity { message, context } => Self::Integrity {
                message,
                context: merge(context, call),
            },
            Self::Authentication { message, context } => Self::Authentication {
                message,
                context: merge(context, call),
            },
            Self::Internal { message, context } => Self::Internal {
                message,
                context: merge(context, call),
            },
            error @ (Self::Storage(_)
            | Self::LibSql(_)
            | Self::Io(_)
            | Self::Serialization(_)
            | Self::CredentialStorage(_)) => Self::internal(error.to_string(), call.clone()),
            other => other,
        }
    }
}

fn merge(context: ErrorContext, call: &ErrorContext) -> ErrorContext {
    if context.is_empty() {
        return call.clone();
    }
    ErrorContext {
        operation: context.operation,
        kind: context.kind.or(call.kind),
        guid: context.guid.or_else(|| call.guid.clone()),
        local_id: context.local_id.or(call.local_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_classified() {
        let rate = Error::RateLimited {
            retry_after: Some(Duration::from_secs(3)),
            context: ErrorContext::new("get_sync_chunk"),
        };
        assert_eq!(rate.class(), ErrorClass::Transient);
        assert!(!rate.is_item_level());
        assert_eq!(
            Error::network("timeout", ErrorContext::default()).class(),
            ErrorClass::Transient
        );
    }

    #[test]
    fn storage_errors_abort() {
        assert_eq!(
            Error::Storage("disk full".into()).class(),
            ErrorClass::Internal
        );
        assert_eq!(Error::Cancelled.class(), ErrorClass::Internal);
    }

    #[test]
    fn with_context_fills_missing_fields() {
        let guid = Guid::new("g-1");
        let call = ErrorContext::new("push")
            .kind(EntityKind::Tag)
            .guid(Some(&guid));
        let error = Error::validation("name too long", ErrorContext::default()).with_context(&call);

        let context = error.context().unwrap();
        assert_eq!(context.operation, "push");
        assert_eq!(context.kind, Some(EntityKind::Tag));
        assert!(error.to_string().contains("guid=g-1"));
    }

    #[test]
    fn with_context_wraps_uncategorized_errors() {
        let call = ErrorContext::new("apply_chunk").kind(EntityKind::Note);
        let error = Error::Storage("locked".into()).with_context(&call);
        assert!(matches!(error, Error::Internal { .. }));
        assert!(error.to_string().contains("operation=apply_chunk kind=note"));
    }
}
