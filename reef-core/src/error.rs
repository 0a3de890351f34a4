//! Error types for Reef core operations.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::protocol::Status;
use crate::service::ServiceType;

/// Structured context attached to user-facing errors.
///
/// Every surfaced error carries the correlation id, the attempted service
/// and the final observed status; this is the troubleshooting contract.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    /// Correlation id of the originating request.
    pub correlation_id: Option<Uuid>,
    /// Service the request was dispatched to.
    pub service: Option<ServiceType>,
    /// Node the request was dispatched to, as `host:port`.
    pub node: Option<String>,
    /// Last status observed from the server.
    pub last_status: Option<Status>,
    /// Time elapsed since submission.
    pub elapsed: Option<Duration>,
}

impl ErrorContext {
    /// Creates a context carrying only a correlation id.
    pub fn for_request(correlation_id: Uuid) -> Self {
        Self {
            correlation_id: Some(correlation_id),
            ..Self::default()
        }
    }

    /// Sets the attempted service.
    pub fn with_service(mut self, service: ServiceType) -> Self {
        self.service = Some(service);
        self
    }

    /// Sets the target node.
    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    /// Sets the last observed status.
    pub fn with_status(mut self, status: Status) -> Self {
        self.last_status = Some(status);
        self
    }

    /// Sets the elapsed time.
    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = Some(elapsed);
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut wrote = false;
        let sep = |f: &mut fmt::Formatter<'_>, wrote: &mut bool| -> fmt::Result {
            if *wrote {
                write!(f, ", ")?;
            }
            *wrote = true;
            Ok(())
        };
        if let Some(id) = self.correlation_id {
            sep(f, &mut wrote)?;
            write!(f, "id={}", id)?;
        }
        if let Some(service) = self.service {
            sep(f, &mut wrote)?;
            write!(f, "service={}", service)?;
        }
        if let Some(node) = &self.node {
            sep(f, &mut wrote)?;
            write!(f, "node={}", node)?;
        }
        if let Some(status) = self.last_status {
            sep(f, &mut wrote)?;
            write!(f, "status={}", status)?;
        }
        if let Some(elapsed) = self.elapsed {
            sep(f, &mut wrote)?;
            write!(f, "elapsed={}ms", elapsed.as_millis())?;
        }
        if !wrote {
            write!(f, "no context")?;
        }
        Ok(())
    }
}

/// Sub-document error kinds, one per sub-document status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubDocumentErrorKind {
    /// The path does not exist in the document.
    PathNotFound,
    /// The path conflicts with document structure.
    PathMismatch,
    /// The path is malformed.
    PathInvalid,
    /// The path is too deep.
    PathTooBig,
    /// The path already exists.
    PathExists,
    /// The fragment cannot be inserted at the path.
    ValueCantInsert,
    /// Inserting the fragment would nest too deeply.
    ValueTooDeep,
    /// The document is not JSON.
    DocNotJson,
    /// The document is nested too deeply.
    DocTooDeep,
    /// The command combination was rejected; a client-side encoding bug.
    InvalidCombo,
}

impl SubDocumentErrorKind {
    /// Maps a sub-document status to its error kind.
    pub fn from_status(status: Status) -> Option<Self> {
        match status {
            Status::SubdocPathNotFound => Some(Self::PathNotFound),
            Status::SubdocPathMismatch => Some(Self::PathMismatch),
            Status::SubdocPathInvalid => Some(Self::PathInvalid),
            Status::SubdocPathTooBig => Some(Self::PathTooBig),
            Status::SubdocPathExists => Some(Self::PathExists),
            Status::SubdocValueCantInsert => Some(Self::ValueCantInsert),
            Status::SubdocValueTooDeep => Some(Self::ValueTooDeep),
            Status::SubdocDocNotJson => Some(Self::DocNotJson),
            Status::SubdocDocTooDeep => Some(Self::DocTooDeep),
            Status::SubdocInvalidCombo => Some(Self::InvalidCombo),
            _ => None,
        }
    }
}

impl fmt::Display for SubDocumentErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The main error type for Reef core operations.
///
/// The set is closed and taxonomized; each user-facing variant carries a
/// structured [`ErrorContext`].
#[derive(Debug, Error, Clone)]
pub enum CoreError {
    /// The document was not found.
    #[error("document not found ({ctx})")]
    DocumentNotFound {
        /// Error context.
        ctx: ErrorContext,
    },

    /// The document already exists.
    #[error("document exists ({ctx})")]
    DocumentExists {
        /// Error context.
        ctx: ErrorContext,
    },

    /// The CAS guard did not match the stored document.
    #[error("cas mismatch ({ctx})")]
    CasMismatch {
        /// Error context.
        ctx: ErrorContext,
    },

    /// The value exceeds the server's size limit.
    #[error("value too large ({ctx})")]
    ValueTooLarge {
        /// Error context.
        ctx: ErrorContext,
    },

    /// A durable write is in an ambiguous state.
    #[error("durability ambiguous ({ctx})")]
    DurabilityAmbiguous {
        /// Error context.
        ctx: ErrorContext,
    },

    /// Authentication failed.
    #[error("authentication failure: {message} ({ctx})")]
    AuthenticationFailure {
        /// Human-readable reason.
        message: String,
        /// Error context.
        ctx: ErrorContext,
    },

    /// The caller lacks access to the resource.
    #[error("access failure ({ctx})")]
    AccessFailure {
        /// Error context.
        ctx: ErrorContext,
    },

    /// The bucket does not exist or cannot be selected.
    #[error("bucket not found: {name} ({ctx})")]
    BucketNotFound {
        /// Bucket name.
        name: String,
        /// Error context.
        ctx: ErrorContext,
    },

    /// The addressed collection is unknown.
    #[error("collection not found ({ctx})")]
    CollectionNotFound {
        /// Error context.
        ctx: ErrorContext,
    },

    /// The server reported a transient condition.
    #[error("temporary failure ({ctx})")]
    TemporaryFailure {
        /// Error context.
        ctx: ErrorContext,
    },

    /// The request was canceled before completion.
    #[error("request canceled: {reason} ({ctx})")]
    RequestCanceled {
        /// Why the request was canceled.
        reason: String,
        /// Error context.
        ctx: ErrorContext,
    },

    /// The connection closed while requests were in flight.
    #[error("connection closed ({ctx})")]
    ConnectionClosed {
        /// Error context.
        ctx: ErrorContext,
    },

    /// The deadline expired before the request was written.
    #[error("unambiguous timeout ({ctx})")]
    UnambiguousTimeout {
        /// Error context.
        ctx: ErrorContext,
    },

    /// The deadline expired after the request may have been executed.
    #[error("ambiguous timeout ({ctx})")]
    AmbiguousTimeout {
        /// Error context.
        ctx: ErrorContext,
    },

    /// A sub-document command failed.
    #[error("sub-document error: {kind} ({ctx})")]
    SubDocument {
        /// The specific sub-document failure.
        kind: SubDocumentErrorKind,
        /// Error context.
        ctx: ErrorContext,
    },

    /// No enabled node offers the requested service.
    #[error("service not available: {service} ({ctx})")]
    ServiceNotAvailable {
        /// The requested service.
        service: ServiceType,
        /// Error context.
        ctx: ErrorContext,
    },

    /// The server returned a status the operation cannot handle.
    #[error("unexpected status {status} ({ctx})")]
    UnexpectedStatus {
        /// The observed status.
        status: Status,
        /// Error context.
        ctx: ErrorContext,
    },

    /// Protocol-level errors (malformed frames, invalid magic).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The caller supplied invalid arguments.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration errors (invalid settings, unparseable topology).
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O errors from the standard library (wrapped in `Arc` for `Clone`).
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),
}

impl From<io::Error> for CoreError {
    fn from(err: io::Error) -> Self {
        CoreError::Io(Arc::new(err))
    }
}

impl CoreError {
    /// Returns `true` if repeating the request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TemporaryFailure { .. } | Self::ConnectionClosed { .. } | Self::Io(_)
        )
    }

    /// Returns the error context, when the variant carries one.
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::DocumentNotFound { ctx }
            | Self::DocumentExists { ctx }
            | Self::CasMismatch { ctx }
            | Self::ValueTooLarge { ctx }
            | Self::DurabilityAmbiguous { ctx }
            | Self::AuthenticationFailure { ctx, .. }
            | Self::AccessFailure { ctx }
            | Self::BucketNotFound { ctx, .. }
            | Self::CollectionNotFound { ctx }
            | Self::TemporaryFailure { ctx }
            | Self::RequestCanceled { ctx, .. }
            | Self::ConnectionClosed { ctx }
            | Self::UnambiguousTimeout { ctx }
            | Self::AmbiguousTimeout { ctx }
            | Self::SubDocument { ctx, .. }
            | Self::ServiceNotAvailable { ctx, .. }
            | Self::UnexpectedStatus { ctx, .. } => Some(ctx),
            _ => None,
        }
    }

    /// Returns true for either timeout kind.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::UnambiguousTimeout { .. } | Self::AmbiguousTimeout { .. }
        )
    }
}

/// Maps a non-success response status to a user-facing error.
///
/// `is_insert` and `has_cas` disambiguate EXISTS: on an insert it means the
/// document is already there, on a CAS-bearing mutation it means the guard
/// did not match.
pub fn status_to_error(
    status: Status,
    is_insert: bool,
    has_cas: bool,
    ctx: ErrorContext,
) -> CoreError {
    let ctx = ctx.with_status(status);
    if let Some(kind) = SubDocumentErrorKind::from_status(status) {
        return CoreError::SubDocument { kind, ctx };
    }
    match status {
        Status::NotFound | Status::NotStored => CoreError::DocumentNotFound { ctx },
        Status::Exists => {
            if is_insert {
                CoreError::DocumentExists { ctx }
            } else if has_cas {
                CoreError::CasMismatch { ctx }
            } else {
                CoreError::DocumentExists { ctx }
            }
        }
        Status::TooBig => CoreError::ValueTooLarge { ctx },
        Status::AuthError => CoreError::AuthenticationFailure {
            message: "the server rejected the credentials".to_string(),
            ctx,
        },
        Status::AccessError => CoreError::AccessFailure { ctx },
        Status::NoBucket => CoreError::BucketNotFound {
            name: String::new(),
            ctx,
        },
        Status::UnknownCollection => CoreError::CollectionNotFound { ctx },
        Status::SyncWriteAmbiguous => CoreError::DurabilityAmbiguous { ctx },
        Status::TemporaryFailure
        | Status::Locked
        | Status::NotInitialized
        | Status::SyncWriteInProgress => CoreError::TemporaryFailure { ctx },
        other => CoreError::UnexpectedStatus { status: other, ctx },
    }
}

/// A specialized `Result` type for Reef core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
