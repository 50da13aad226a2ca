//! Crate-wide error taxonomy.
//!
//! `ResilienceError<E>` is the generic retry/backoff envelope; `TransportError`
//! and `ApiError` are the concrete errors the HTTP client pool and everything
//! downstream of it classify against.

use std::fmt;

/// Cap the number of stored failures inside RetryExhausted to avoid unbounded growth.
pub const MAX_RETRY_FAILURES: usize = 10;

/// Generic envelope produced by [`crate::retry::RetryPolicy`].
#[derive(Debug)]
pub enum ResilienceError<E> {
    /// All retry attempts were exhausted.
    RetryExhausted { attempts: usize, failures: Vec<E> },
    /// The underlying operation failed and the predicate said not to retry.
    Inner(E),
}

impl<E: Clone> Clone for ResilienceError<E> {
    fn clone(&self) -> Self {
        match self {
            Self::RetryExhausted { attempts, failures } => {
                Self::RetryExhausted { attempts: *attempts, failures: failures.clone() }
            }
            Self::Inner(e) => Self::Inner(e.clone()),
        }
    }
}

impl<E: fmt::Display> fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RetryExhausted { attempts, failures } => {
                let last = failures.last().map(|e| e.to_string()).unwrap_or_default();
                write!(
                    f,
                    "retry exhausted after {} attempts ({} failures), last error: {}",
                    attempts,
                    failures.len(),
                    last
                )
            }
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ResilienceError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RetryExhausted { failures, .. } => {
                failures.last().map(|e| e as &dyn std::error::Error)
            }
        }
    }
}

impl<E> ResilienceError<E> {
    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. })
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

/// Service error codes with a distinct retry/sticky disposition.
pub const CODE_DEPENDENCY: i32 = 0;
pub const CODE_TIMEOUT: i32 = 29;
pub const CODE_OVER_CAPACITY: i32 = 130;
pub const CODE_EXCEEDED_DAILY_POST_LIMIT: i32 = 88;
pub const CODE_ACCOUNT_LOCKED: i32 = 326;

/// A structured error surfaced by the remote timeline service's `errors[]` body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub code: i32,
    pub raw: String,
}

impl ApiError {
    pub fn new(code: i32, raw: impl Into<String>) -> Self {
        Self { code, raw: raw.into() }
    }

    /// Codes that mark the *client identity* permanently unusable for the run.
    pub fn is_sticky(&self) -> bool {
        matches!(self.code, CODE_EXCEEDED_DAILY_POST_LIMIT | CODE_ACCOUNT_LOCKED)
    }

    /// Codes that are transient service hiccups worth a retry.
    pub fn is_transient(&self) -> bool {
        matches!(self.code, CODE_DEPENDENCY | CODE_TIMEOUT | CODE_OVER_CAPACITY)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "api error {}: {}", self.code, self.raw)
    }
}

impl std::error::Error for ApiError {}

/// Everything that can go wrong issuing one HTTP request through the client pool.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport failure: {0}")]
    Network(#[from] reqwest::Error),
    #[error("{0}")]
    Api(#[from] ApiError),
    #[error("rate arbiter would block")]
    WouldBlock,
    #[error("run cancelled")]
    Cancelled,
    #[error("unexpected response status {status}: {body}")]
    Status { status: u16, body: String },
}

impl TransportError {
    /// True for errors that never participate in the client-pool retry loop:
    /// the would-block sentinel means "try a different client", not "retry".
    pub fn is_would_block(&self) -> bool {
        matches!(self, Self::WouldBlock)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn as_api(&self) -> Option<&ApiError> {
        match self {
            Self::Api(e) => Some(e),
            _ => None,
        }
    }
}

/// Fatal, run-stopping errors surfaced to the CLI exit code.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("login failed: {0}")]
    Login(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("run failed: {0}")]
    Run(String),
}

impl AppError {
    /// Process exit code for the binary entry point.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Config(_) => 2,
            AppError::Login(_) => 3,
            AppError::Database(_) => 4,
            AppError::Run(_) => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sticky_codes_are_88_and_326() {
        assert!(ApiError::new(88, "").is_sticky());
        assert!(ApiError::new(326, "").is_sticky());
        assert!(!ApiError::new(29, "").is_sticky());
    }

    #[test]
    fn transient_codes_are_0_29_130() {
        for code in [0, 29, 130] {
            assert!(ApiError::new(code, "").is_transient(), "{code} should be transient");
        }
        assert!(!ApiError::new(88, "").is_transient());
    }

    #[test]
    fn would_block_is_never_considered_cancelled() {
        assert!(TransportError::WouldBlock.is_would_block());
        assert!(!TransportError::WouldBlock.is_cancelled());
    }

    #[test]
    fn retry_exhausted_display_includes_last_error() {
        let err: ResilienceError<ApiError> = ResilienceError::RetryExhausted {
            attempts: 3,
            failures: vec![ApiError::new(0, "dependency"), ApiError::new(29, "timeout")],
        };
        let msg = format!("{err}");
        assert!(msg.contains("3 attempts"));
        assert!(msg.contains("timeout"));
    }

    #[test]
    fn exit_codes_are_distinct() {
        let cfg = AppError::Config("bad".into());
        let login = AppError::Login("bad".into());
        let run = AppError::Run("bad".into());
        assert_eq!(cfg.exit_code(), 2);
        assert_eq!(login.exit_code(), 3);
        assert_eq!(run.exit_code(), 1);
    }
}
