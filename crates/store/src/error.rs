//! Error taxonomy for store adapters.

use thiserror::Error;

/// Errors produced by a remote store adapter.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The object (or a required part of it) does not exist.
    #[error("object not found: {key}")]
    NotFound { key: String },

    /// The requested byte range lies outside the object.
    #[error("range start {start} outside object of {size} bytes")]
    RangeNotSatisfiable { start: u64, size: u64 },

    /// Transport-level failure. `retryable` distinguishes transient faults
    /// (timeouts, 5xx-equivalents) from permanent rejections.
    #[error("network error: {message}")]
    Network { message: String, retryable: bool },

    /// The store rejected the credentials or the operation.
    #[error("access denied: {message}")]
    AccessDenied { message: String },

    /// No pending upload exists for the object, or the pending state is
    /// inconsistent with the request.
    #[error("no pending upload for object {key}")]
    NoPendingUpload { key: String },

    /// Local I/O failure inside the adapter.
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Anything the adapter cannot classify.
    #[error("{message}")]
    Other { message: String },
}

impl StoreError {
    /// Whether a retry of the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Network { retryable, .. } => *retryable,
            StoreError::NotFound { .. }
            | StoreError::RangeNotSatisfiable { .. }
            | StoreError::AccessDenied { .. }
            | StoreError::NoPendingUpload { .. }
            | StoreError::Io { .. }
            | StoreError::Other { .. } => false,
        }
    }

    /// Transient network failure helper.
    pub fn transient(message: impl Into<String>) -> Self {
        StoreError::Network {
            message: message.into(),
            retryable: true,
        }
    }

    /// Permanent network failure helper.
    pub fn permanent(message: impl Into<String>) -> Self {
        StoreError::Network {
            message: message.into(),
            retryable: false,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(StoreError::transient("timeout").is_retryable());
        assert!(!StoreError::permanent("403").is_retryable());
        assert!(
            !StoreError::NotFound {
                key: "k".into()
            }
            .is_retryable()
        );
        assert!(
            !StoreError::RangeNotSatisfiable { start: 10, size: 5 }.is_retryable()
        );
    }
}
