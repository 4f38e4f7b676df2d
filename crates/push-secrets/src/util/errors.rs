use std::fmt;

use thiserror::Error;
use tokio::time::Duration;

/// The error taxonomy of spec.md §7, layered the way the upstream operator
/// distinguishes a bare `StdError` from one carrying its own requeue
/// duration (`ErrorWithRequeue`).
#[derive(Error, Debug)]
pub enum StdError {
    #[error("JsonSerializationError: {0}")]
    JsonSerializationError(#[source] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("Finalizer Error: {0}")]
    // boxed to break the cycle: finalizer::Error embeds the reconciler error, which is this.
    FinalizerError(#[source] Box<kube::runtime::finalizer::Error<Error>>),

    #[error("MetadataMissing: {0}")]
    MetadataMissing(String),

    #[error("InvalidArgument: {0}")]
    InvalidArgument(String),

    #[error("SourceMissing: {0}")]
    SourceMissing(String),

    #[error("StoreMissing: {0}")]
    StoreMissing(String),

    #[error("LockConflict: {0}")]
    LockConflict(String),

    #[error("TemplateFailed: {0}")]
    TemplateFailed(String),

    #[error("PushFailed: {0}")]
    PushFailed(String),

    #[error("DeleteFailed: {0}")]
    DeleteFailed(String),

    #[error("CircuitOpen: {0}")]
    CircuitOpen(String),

    #[error("ValidationFailed: {0}")]
    ValidationFailed(String),

    #[error("DuplicateRemoteKey: {0}")]
    DuplicateRemoteKey(String),

    #[error("provider rpc failed: {0}")]
    ProviderRpc(#[source] provider_fabric::errors::FabricError),
}

impl StdError {
    pub fn metric_label(&self) -> String {
        match self {
            StdError::JsonSerializationError(_) => "json_serialization_error",
            StdError::KubeError(_) => "kube_error",
            StdError::FinalizerError(_) => "finalizer_error",
            StdError::MetadataMissing(_) => "metadata_missing",
            StdError::InvalidArgument(_) => "invalid_argument",
            StdError::SourceMissing(_) => "source_missing",
            StdError::StoreMissing(_) => "store_missing",
            StdError::LockConflict(_) => "lock_conflict",
            StdError::TemplateFailed(_) => "template_failed",
            StdError::PushFailed(_) => "push_failed",
            StdError::DeleteFailed(_) => "delete_failed",
            StdError::CircuitOpen(_) => "circuit_open",
            StdError::ValidationFailed(_) => "validation_failed",
            StdError::DuplicateRemoteKey(_) => "duplicate_remote_key",
            StdError::ProviderRpc(_) => "provider_rpc",
        }
        .to_string()
    }

    /// LockConflict requeues immediately with no backoff and no status
    /// mutation (spec.md §7).
    pub fn is_lock_conflict(&self) -> bool {
        matches!(self, StdError::LockConflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(&self, StdError::KubeError(kube::Error::Api(e)) if e.code == 404)
    }
}

#[derive(Error, Debug)]
pub struct ErrorWithRequeue {
    pub duration: Duration,
    pub error: StdError,
}

impl ErrorWithRequeue {
    pub fn new(error: StdError, duration: Duration) -> ErrorWithRequeue {
        ErrorWithRequeue { error, duration }
    }

    pub fn metric_label(&self) -> String {
        self.error.metric_label()
    }
}

impl fmt::Display for ErrorWithRequeue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Standard Error: {0}")]
    StdError(#[source] StdError),

    #[error("Error With Requeue: {0}")]
    ErrorWithRequeue(#[source] ErrorWithRequeue),
}

impl Error {
    pub fn metric_label(&self) -> String {
        match self {
            Error::StdError(e) => e.metric_label(),
            Error::ErrorWithRequeue(e) => e.metric_label(),
        }
    }

    pub fn is_lock_conflict(&self) -> bool {
        match self {
            Error::StdError(e) => e.is_lock_conflict(),
            Error::ErrorWithRequeue(e) => e.error.is_lock_conflict(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::StdError(e) => e.is_not_found(),
            Error::ErrorWithRequeue(e) => e.error.is_not_found(),
        }
    }
}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        Error::StdError(StdError::KubeError(e))
    }
}

impl From<provider_fabric::errors::FabricError> for Error {
    fn from(e: provider_fabric::errors::FabricError) -> Self {
        Error::StdError(StdError::ProviderRpc(e))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
