//! Error taxonomy shared by every resilience layer.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

use crate::context::CancelReason;

/// HTTP-style status codes carried by errors that cross the resilience layer.
pub mod code {
    /// Malformed or invalid request.
    pub const BAD_REQUEST: u16 = 400;
    /// Missing or invalid credentials.
    pub const UNAUTHORIZED: u16 = 401;
    /// Caller is not permitted.
    pub const FORBIDDEN: u16 = 403;
    /// Resource does not exist.
    pub const NOT_FOUND: u16 = 404;
    /// Conflicting state.
    pub const CONFLICT: u16 = 409;
    /// Quota exhausted.
    pub const TOO_MANY_REQUESTS: u16 = 429;
    /// Caller went away before a response.
    pub const CLIENT_CLOSED_REQUEST: u16 = 499;
    /// Unclassified failure.
    pub const INTERNAL: u16 = 500;
    /// Dependency unavailable.
    pub const SERVICE_UNAVAILABLE: u16 = 503;
    /// Deadline expired.
    pub const GATEWAY_TIMEOUT: u16 = 504;
}

/// An application error with a status code, a machine-readable reason and metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusError {
    /// Status code (HTTP semantics).
    pub code: u16,
    /// Stable machine-readable reason, e.g. `USER_NOT_FOUND`.
    pub reason: String,
    /// Human-readable message.
    pub message: String,
    /// Free-form key/value details.
    pub metadata: HashMap<String, String>,
}

impl StatusError {
    /// Creates a new status error.
    pub fn new(code: u16, reason: &str, message: &str) -> Self {
        Self {
            code,
            reason: reason.to_string(),
            message: message.to_string(),
            metadata: HashMap::new(),
        }
    }

    /// 400 Bad Request.
    pub fn bad_request(reason: &str, message: &str) -> Self {
        Self::new(code::BAD_REQUEST, reason, message)
    }

    /// 401 Unauthorized.
    pub fn unauthorized(reason: &str, message: &str) -> Self {
        Self::new(code::UNAUTHORIZED, reason, message)
    }

    /// 403 Forbidden.
    pub fn forbidden(reason: &str, message: &str) -> Self {
        Self::new(code::FORBIDDEN, reason, message)
    }

    /// 404 Not Found.
    pub fn not_found(reason: &str, message: &str) -> Self {
        Self::new(code::NOT_FOUND, reason, message)
    }

    /// 409 Conflict.
    pub fn conflict(reason: &str, message: &str) -> Self {
        Self::new(code::CONFLICT, reason, message)
    }

    /// 429 Too Many Requests.
    pub fn too_many_requests(reason: &str, message: &str) -> Self {
        Self::new(code::TOO_MANY_REQUESTS, reason, message)
    }

    /// 500 Internal Server Error.
    pub fn internal(reason: &str, message: &str) -> Self {
        Self::new(code::INTERNAL, reason, message)
    }

    /// 503 Service Unavailable.
    pub fn service_unavailable(reason: &str, message: &str) -> Self {
        Self::new(code::SERVICE_UNAVAILABLE, reason, message)
    }

    /// Replaces the metadata map.
    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    /// True for 4xx codes: the request itself is at fault and repeating it will not help.
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.code)
    }
}

impl fmt::Display for StatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "code = {} reason = {} message = {}",
            self.code, self.reason, self.message
        )?;
        if !self.metadata.is_empty() {
            let mut keys: Vec<_> = self.metadata.keys().collect();
            keys.sort();
            write!(f, " metadata = {{")?;
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}: {}", key, self.metadata[*key])?;
            }
            write!(f, "}}")?;
        }
        Ok(())
    }
}

impl std::error::Error for StatusError {}

/// Errors surfaced by the resilience layer.
///
/// `NoAvailableNode`, `CircuitOpen`, `RateLimited` and `Cancelled` are control
/// signals raised before the downstream call runs. `Status` and `Call` are
/// handler errors passed through untouched.
#[derive(Debug, Error)]
pub enum ResilienceError {
    /// The selector had no candidate left to pick from.
    #[error("no available node")]
    NoAvailableNode,

    /// The breaker rejected the call without running it.
    #[error("circuit breaker {name} is open")]
    CircuitOpen {
        /// Name of the rejecting breaker.
        name: String,
    },

    /// The limiter denied the call.
    #[error("rate limited for key {key}, retry after {retry_after_ms}ms")]
    RateLimited {
        /// Limiter key the call was counted against.
        key: String,
        /// Suggested wait before the next attempt.
        retry_after_ms: u64,
    },

    /// The call's context was cancelled or its deadline passed.
    #[error("call cancelled: {0}")]
    Cancelled(CancelReason),

    /// Coded error returned by a handler.
    #[error("status error: {0}")]
    Status(#[from] StatusError),

    /// Any other handler error.
    #[error(transparent)]
    Call(Box<dyn std::error::Error + Send + Sync>),

    /// A configuration value was rejected.
    #[error("invalid config {field}: {reason}")]
    InvalidConfig {
        /// Dotted path of the offending field.
        field: String,
        /// Why it was rejected.
        reason: String,
    },
}

impl ResilienceError {
    /// Wraps an arbitrary application error.
    pub fn call<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        ResilienceError::Call(Box::new(err))
    }

    pub(crate) fn invalid_config(field: &str, reason: &str) -> Self {
        ResilienceError::InvalidConfig {
            field: field.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Status code describing this error to a remote caller.
    pub fn code(&self) -> u16 {
        match self {
            ResilienceError::NoAvailableNode => code::SERVICE_UNAVAILABLE,
            ResilienceError::CircuitOpen { .. } => code::SERVICE_UNAVAILABLE,
            ResilienceError::RateLimited { .. } => code::TOO_MANY_REQUESTS,
            ResilienceError::Cancelled(CancelReason::DeadlineExceeded) => code::GATEWAY_TIMEOUT,
            ResilienceError::Cancelled(_) => code::CLIENT_CLOSED_REQUEST,
            ResilienceError::Status(status) => status.code,
            ResilienceError::Call(_) => code::INTERNAL,
            ResilienceError::InvalidConfig { .. } => code::INTERNAL,
        }
    }

    /// True for fail-fast signals produced by this crate rather than by a handler.
    pub fn is_control_signal(&self) -> bool {
        matches!(
            self,
            ResilienceError::NoAvailableNode
                | ResilienceError::CircuitOpen { .. }
                | ResilienceError::RateLimited { .. }
                | ResilienceError::Cancelled(_)
        )
    }

    /// True for a handler error classified as a client/validation failure.
    pub fn is_client_error(&self) -> bool {
        match self {
            ResilienceError::Status(status) => status.is_client_error(),
            _ => false,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ResilienceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_error_display() {
        let err = StatusError::not_found("USER_NOT_FOUND", "no such user");
        assert_eq!(
            err.to_string(),
            "code = 404 reason = USER_NOT_FOUND message = no such user"
        );

        let mut md = HashMap::new();
        md.insert("b".to_string(), "2".to_string());
        md.insert("a".to_string(), "1".to_string());
        let err = StatusError::internal("BOOM", "failed").with_metadata(md);
        assert_eq!(
            err.to_string(),
            "code = 500 reason = BOOM message = failed metadata = {a: 1, b: 2}"
        );
    }

    #[test]
    fn test_client_error_classification() {
        assert!(StatusError::bad_request("X", "x").is_client_error());
        assert!(StatusError::too_many_requests("X", "x").is_client_error());
        assert!(!StatusError::internal("X", "x").is_client_error());
        assert!(!StatusError::service_unavailable("X", "x").is_client_error());

        let err: ResilienceError = StatusError::forbidden("X", "x").into();
        assert!(err.is_client_error());
        assert!(!ResilienceError::NoAvailableNode.is_client_error());
    }

    #[test]
    fn test_codes() {
        assert_eq!(ResilienceError::NoAvailableNode.code(), 503);
        assert_eq!(
            ResilienceError::CircuitOpen {
                name: "db".to_string()
            }
            .code(),
            503
        );
        assert_eq!(
            ResilienceError::RateLimited {
                key: "k".to_string(),
                retry_after_ms: 10
            }
            .code(),
            429
        );
        assert_eq!(
            ResilienceError::Cancelled(CancelReason::DeadlineExceeded).code(),
            504
        );
        assert_eq!(
            ResilienceError::Cancelled(CancelReason::UserRequested).code(),
            499
        );
        assert_eq!(
            ResilienceError::call(std::io::Error::new(std::io::ErrorKind::Other, "io")).code(),
            500
        );
    }

    #[test]
    fn test_control_signals() {
        assert!(ResilienceError::NoAvailableNode.is_control_signal());
        assert!(ResilienceError::Cancelled(CancelReason::ServerShutdown).is_control_signal());
        assert!(!ResilienceError::Status(StatusError::internal("X", "x")).is_control_signal());
        assert!(!ResilienceError::call(std::fmt::Error).is_control_signal());
    }

    #[test]
    fn test_display_messages() {
        let err = ResilienceError::RateLimited {
            key: "10.0.0.1".to_string(),
            retry_after_ms: 250,
        };
        assert_eq!(
            err.to_string(),
            "rate limited for key 10.0.0.1, retry after 250ms"
        );
        let err = ResilienceError::CircuitOpen {
            name: "payments".to_string(),
        };
        assert_eq!(err.to_string(), "circuit breaker payments is open");
    }
}
