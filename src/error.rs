//! Error types and handling for kadnet

use thiserror::Error;

/// Result type alias for kadnet operations
pub type Result<T> = std::result::Result<T, Error>;

/// kadnet error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("RPC timeout: {0}")]
    Timeout(String),

    #[error("peer unreachable: {0}")]
    Unreachable(String),

    #[error("connection reset: {0}")]
    ConnectionReset(String),

    #[error("random-id echo mismatch")]
    BadEcho,

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("query to self")]
    SenderIsSelf,

    #[error("all k-buckets are empty")]
    AllBucketsEmpty,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage corrupted: {0}")]
    CorruptStorage(String),

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Transient transport failures feed the eviction counter instead of
    /// aborting the enclosing lookup.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::Unreachable(_) | Error::ConnectionReset(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(Error::Timeout("ping".into()).is_transient());
        assert!(Error::Unreachable("10.0.0.1:7001".into()).is_transient());
        assert!(Error::ConnectionReset("mid-frame".into()).is_transient());
        assert!(!Error::BadEcho.is_transient());
        assert!(!Error::SenderIsSelf.is_transient());
        assert!(!Error::CorruptStorage("store.json".into()).is_transient());
    }
}
