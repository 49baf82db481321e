//! Error types for hashdex
//!
//! We use `thiserror` for automatic `Display` and `Error` trait
//! implementations. Errors raised by the backing store propagate through the
//! public enumerator layer unchanged in meaning.

use std::io;
use thiserror::Error;

use crate::store::HashId;

/// Result type alias for hashdex operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the content-hash enumerator
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from the backing files or memory mapping
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Hash content whose length differs from the configured signature length
    #[error("Invalid signature length: expected {expected} bytes, got {actual}")]
    InvalidSignatureLength {
        /// Signature length the store was opened with
        expected: usize,
        /// Length of the rejected input
        actual: usize,
    },

    /// Format inconsistency detected in a backing file
    #[error("Storage corrupted: {0}")]
    Corrupted(String),

    /// `value_of` called with an id no record was ever assigned
    #[error("Unknown hash id: {0}")]
    UnknownHashId(HashId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_invalid_signature_length() {
        let err = Error::InvalidSignatureLength {
            expected: 20,
            actual: 16,
        };
        let msg = err.to_string();
        assert!(msg.contains("20"));
        assert!(msg.contains("16"));
    }

    #[test]
    fn test_display_io() {
        let err = Error::Io(io::Error::new(io::ErrorKind::NotFound, "file not found"));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_display_corrupted() {
        let err = Error::Corrupted("bad magic word".to_string());
        let msg = err.to_string();
        assert!(msg.contains("corrupted"));
        assert!(msg.contains("bad magic word"));
    }

    #[test]
    fn test_display_unknown_hash_id() {
        let err = Error::UnknownHashId(42);
        assert!(err.to_string().contains("42"));
    }
}
