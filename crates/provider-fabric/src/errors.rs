use thiserror::Error;

/// Error classification used by the resilient client's retry policy and by
/// the per-status-code observability counters (spec.md §4.A).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Timeout,
    ConnectionRefused,
    Unavailable,
    Forbidden,
    NotFound,
    Unauthorized,
    Unknown,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Timeout => "timeout",
            ErrorClass::ConnectionRefused => "connection_refused",
            ErrorClass::Unavailable => "unavailable",
            ErrorClass::Forbidden => "forbidden",
            ErrorClass::NotFound => "not_found",
            ErrorClass::Unauthorized => "unauthorized",
            ErrorClass::Unknown => "unknown",
        }
    }
}

#[derive(Error, Debug)]
pub enum FabricError {
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("rpc failed: {0}")]
    Rpc(#[source] tonic::Status),

    #[error("circuit breaker is open")]
    CircuitOpen,

    #[error("tls configuration error: {0}")]
    Tls(String),

    #[error("connection pool exhausted for {0}")]
    PoolExhausted(String),
}

impl FabricError {
    /// Classify an RPC failure per spec.md §4.A's retry table.
    pub fn classify(status: &tonic::Status) -> ErrorClass {
        use tonic::Code;
        match status.code() {
            Code::Unavailable => ErrorClass::Unavailable,
            Code::DeadlineExceeded => ErrorClass::Timeout,
            Code::PermissionDenied => ErrorClass::Forbidden,
            Code::Unauthenticated => ErrorClass::Unauthorized,
            Code::NotFound => ErrorClass::NotFound,
            Code::Unknown => ErrorClass::Unknown,
            _ => ErrorClass::Unknown,
        }
    }

    /// Whether a failed call is safe to retry, per spec.md §4.A / P10.
    pub fn is_retryable(status: &tonic::Status) -> bool {
        use tonic::Code;
        matches!(
            status.code(),
            Code::Unavailable
                | Code::DeadlineExceeded
                | Code::ResourceExhausted
                | Code::Aborted
                | Code::Unknown
        )
    }
}

pub type Result<T> = std::result::Result<T, FabricError>;
