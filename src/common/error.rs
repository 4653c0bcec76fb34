//! Error types for relaykv

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Storage Errors ===
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Corrupted data: {0}")]
    Corrupted(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Value is not a number: {0}")]
    NotANumber(String),

    // === Serialization Errors ===
    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Replication Errors ===
    #[error("unable to perform a write operation on a read-only (replica) instance")]
    ReadOnly,

    #[error("operation requires a master instance")]
    NotMaster,

    #[error("Invalid offset: {0}")]
    InvalidOffset(String),

    #[error("Offset {0} is no longer retained by the master WAL")]
    OffsetTrimmed(String),

    #[error("Dump length mismatch: declared {declared} bytes, imported {imported}")]
    DumpLengthMismatch { declared: u64, imported: u64 },

    #[error("Bootstrap failed: {0}")]
    Bootstrap(String),

    // === Network Errors ===
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("Master responded with {status}: {body}")]
    MasterStatus { status: u16, body: String },

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unknown engine: {0}")]
    UnknownEngine(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Timeout(_) | Error::Io(_) => true,
            Error::HttpClient(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Error::MasterStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::ReadOnly => StatusCode::FORBIDDEN,
            Error::InvalidKey(_)
            | Error::InvalidOffset(_)
            | Error::NotANumber(_)
            | Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Error::NotMaster => StatusCode::CONFLICT,
            Error::OffsetTrimmed(_) => StatusCode::GONE,
            Error::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let status = self.to_http_status();
        if status.is_server_error() {
            tracing::error!("request failed: {}", self);
        }
        let body = axum::Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

impl From<sled::transaction::TransactionError<Error>> for Error {
    fn from(e: sled::transaction::TransactionError<Error>) -> Self {
        match e {
            sled::transaction::TransactionError::Abort(e) => e,
            sled::transaction::TransactionError::Storage(e) => Error::Sled(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(Error::ReadOnly.to_http_status(), StatusCode::FORBIDDEN);
        assert_eq!(
            Error::OffsetTrimmed("1-1".into()).to_http_status(),
            StatusCode::GONE
        );
        assert_eq!(
            Error::NotANumber("abc".into()).to_http_status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::Corrupted("bad".into()).to_http_status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_retryable() {
        assert!(Error::Timeout("wal fetch".into()).is_retryable());
        assert!(Error::MasterStatus {
            status: 503,
            body: String::new()
        }
        .is_retryable());
        assert!(!Error::MasterStatus {
            status: 410,
            body: String::new()
        }
        .is_retryable());
        assert!(!Error::ReadOnly.is_retryable());
        assert!(!Error::DumpLengthMismatch {
            declared: 10,
            imported: 9
        }
        .is_retryable());
    }
}
