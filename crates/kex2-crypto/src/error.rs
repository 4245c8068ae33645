//! Error types for Kex2 cryptographic operations.

use thiserror::Error;

/// Errors from secret handling and secretbox operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Authentication tag did not verify (wrong key or tampered ciphertext)
    #[error("decryption failed: {reason}")]
    DecryptionFailed {
        /// Why decryption was rejected
        reason: String,
    },

    /// Secret material had the wrong length
    #[error("bad secret: expected {expected} bytes, got {len}")]
    BadSecret {
        /// Required length
        expected: usize,
        /// Length that was supplied
        len: usize,
    },
}
