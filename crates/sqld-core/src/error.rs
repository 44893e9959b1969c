//! Error taxonomy shared by the request, builder, execution and response layers.

use thiserror::Error;

/// Result alias used across request handling.
pub type SqldResult<T> = Result<T, SqldError>;

/// Coarse error classes, each mapped to one HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    NotFound,
    MethodNotAllowed,
    Timeout,
    Unavailable,
    Internal,
}

impl ErrorKind {
    pub fn status_code(self) -> u16 {
        match self {
            ErrorKind::BadRequest => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::MethodNotAllowed => 405,
            ErrorKind::Timeout => 408,
            ErrorKind::Unavailable => 503,
            ErrorKind::Internal => 500,
        }
    }
}

/// Request-scoped failure carried back to the HTTP layer as `{"error": message}`.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct SqldError {
    kind: ErrorKind,
    message: String,
}

impl SqldError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn method_not_allowed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MethodNotAllowed, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn status_code(&self) -> u16 {
        self.kind.status_code()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Statement failures stay client errors; only pool and transport failures are
/// reported as the database being unavailable.
impl From<sqlx::Error> for SqldError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => SqldError::bad_request(db_err.message()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                SqldError::unavailable(err.to_string())
            }
            sqlx::Error::Io(_) | sqlx::Error::Tls(_) => SqldError::unavailable(err.to_string()),
            sqlx::Error::WorkerCrashed => SqldError::internal(err.to_string()),
            other => SqldError::bad_request(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for SqldError {
    fn from(err: serde_json::Error) -> Self {
        SqldError::bad_request(err.to_string())
    }
}

impl From<csv::Error> for SqldError {
    fn from(err: csv::Error) -> Self {
        SqldError::internal(err.to_string())
    }
}

/// Startup-time configuration failures. Never produced while serving requests.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("unsupported database type '{0}' (expected mysql, postgres or sqlite3)")]
    UnsupportedDatabase(String),
    #[error("invalid url prefix '{0}'")]
    InvalidPrefix(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_http_statuses() {
        assert_eq!(SqldError::bad_request("x").status_code(), 400);
        assert_eq!(SqldError::not_found("x").status_code(), 404);
        assert_eq!(SqldError::method_not_allowed("x").status_code(), 405);
        assert_eq!(SqldError::timeout("x").status_code(), 408);
        assert_eq!(SqldError::unavailable("x").status_code(), 503);
        assert_eq!(SqldError::internal("x").status_code(), 500);
    }

    #[test]
    fn pool_timeouts_are_unavailable() {
        let err = SqldError::from(sqlx::Error::PoolTimedOut);
        assert_eq!(err.kind(), ErrorKind::Unavailable);

        let err = SqldError::from(sqlx::Error::RowNotFound);
        assert_eq!(err.kind(), ErrorKind::BadRequest);
    }
}
