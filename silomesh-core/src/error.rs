//! Structured failure taxonomy — spec.md §7.
//!
//! Grounded on `knhk-sidecar::error::SidecarError`: one `thiserror` variant
//! per named failure signal, plus a free classifier function rather than a
//! method (mirrors the teacher's standalone `is_retryable_error`).

use thiserror::Error;

pub type RuntimeResult<T> = Result<T, RuntimeError>;

#[derive(Debug, Error, Clone)]
pub enum RuntimeError {
    // --- Transient: retry allowed ---
    #[error("gateway too busy")]
    GatewayTooBusy,
    #[error("silo overloaded")]
    Overloaded,
    #[error("request timed out")]
    Timeout,
    #[error("membership table write lost a concurrency race")]
    MembershipContention,

    // --- Routing: retry after cache invalidation ---
    #[error("activation address is stale: {0}")]
    StaleActivation(String),
    #[error("cache invalidation notice, not a terminal failure")]
    CacheInvalidation,

    // --- Unrecoverable request: surfaced to caller ---
    #[error("duplicate request for correlation id {0}")]
    DuplicateRequest(u64),
    #[error("unsupported request: {0}")]
    UnsupportedRequest(String),

    // --- Application: thrown by invokable, carries a stack description ---
    #[error("application error: {message}")]
    Application { message: String, stack: String },

    // --- Consistency ---
    #[error("inconsistent state for grain {0}")]
    InconsistentState(String),

    // --- Transactional ---
    #[error("lock broken: access count mismatch for tx {0}")]
    BrokenLock(u64),
    #[error("lock validation failed for tx {0}")]
    LockValidationFailed(u64),
    #[error("lock upgrade rejected for tx {0}: conflicting writer has equal or higher priority")]
    LockUpgrade(u64),
    #[error("lock group deadline exceeded")]
    LockDeadlineExceeded,
    #[error("transaction {0} aborted")]
    TransactionAborted(u64),

    // --- Fatal: drop the connection/resource ---
    #[error("cluster id mismatch: expected {expected}, got {actual}")]
    ClusterIdMismatch { expected: String, actual: String },
    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    ProtocolVersionMismatch { expected: u32, actual: u32 },

    // --- Misc infrastructure ---
    #[error("activation lifecycle hook failed: {0}")]
    ActivationFailed(String),
    #[error("max retries exceeded: {0}")]
    RetryExhausted(String),
    #[error("configuration error: {0}")]
    ConfigError(String),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Classes named in spec.md §7, used to decide router/catalog policy.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ErrorClass {
    Transient,
    Routing,
    UnrecoverableRequest,
    Application,
    Consistency,
    Transactional,
    Fatal,
}

pub fn classify(err: &RuntimeError) -> ErrorClass {
    use RuntimeError::*;
    match err {
        GatewayTooBusy | Overloaded | Timeout | MembershipContention => ErrorClass::Transient,
        StaleActivation(_) | CacheInvalidation => ErrorClass::Routing,
        DuplicateRequest(_) | UnsupportedRequest(_) => ErrorClass::UnrecoverableRequest,
        Application { .. } => ErrorClass::Application,
        InconsistentState(_) => ErrorClass::Consistency,
        BrokenLock(_) | LockValidationFailed(_) | LockUpgrade(_) | LockDeadlineExceeded
        | TransactionAborted(_) => ErrorClass::Transactional,
        ClusterIdMismatch { .. } | ProtocolVersionMismatch { .. } => ErrorClass::Fatal,
        ActivationFailed(_) | RetryExhausted(_) | ConfigError(_) | Internal(_) => {
            ErrorClass::UnrecoverableRequest
        }
    }
}

/// Whether the router should retry this failure in place (bounded), per
/// spec.md §4.6 "Rejection kinds".
pub fn is_retryable(err: &RuntimeError) -> bool {
    matches!(classify(err), ErrorClass::Transient | ErrorClass::Routing)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_and_routing_errors_are_retryable() {
        assert!(is_retryable(&RuntimeError::Timeout));
        assert!(is_retryable(&RuntimeError::CacheInvalidation));
        assert!(!is_retryable(&RuntimeError::DuplicateRequest(1)));
    }

    #[test]
    fn fatal_errors_classify_as_fatal() {
        assert_eq!(
            classify(&RuntimeError::ClusterIdMismatch {
                expected: "a".into(),
                actual: "b".into()
            }),
            ErrorClass::Fatal
        );
    }
}
