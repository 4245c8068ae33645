//! Error types for the Kex2 transport and pairing engine.
//!
//! Strongly-typed errors for each layer: relay errors (post/get failures),
//! connection errors (integrity, ordering, timing), and pairing errors
//! (cancellation, timeout, application failures).
//!
//! Every error is `Clone` so a connection can latch the first failure and hand
//! the same value back on every later call.

use std::{io, time::Duration};

use kex2_crypto::CryptoError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{rpc::Method, types::Seqno};

/// Errors reported by a [`crate::MessageRouter`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouterError {
    /// Relay refused a post that was not the next seqno for its sender
    #[error("seqno conflict: expected {expected}, got {got}")]
    Conflict {
        /// Seqno the relay expected next
        expected: Seqno,
        /// Seqno that was posted
        got: Seqno,
    },

    /// Relay could not be reached or rejected the request
    #[error("relay unavailable: {0}")]
    Unavailable(String),

    /// Failure injected by a test relay
    #[error("injected failure: {0}")]
    Injected(String),
}

/// Errors from [`crate::Conn`] reads and writes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnError {
    /// Ciphertext failed authentication under the shared secret
    #[error("decryption failed")]
    DecryptionFailed,

    /// Decrypted metadata disagrees with the outer envelope
    #[error("inner and outer message metadata mismatch")]
    BadMetadata,

    /// Message was addressed to a different session
    #[error("message for wrong session")]
    WrongSession,

    /// Message claims to come from this device
    #[error("received a message from ourselves")]
    SelfReceive,

    /// Message arrived out of order, duplicated, or after a gap
    #[error("bad packet sequence: expected {expected}, got {got}")]
    BadPacketSequence {
        /// Seqno that had to come next
        expected: Seqno,
        /// Seqno that actually arrived
        got: Seqno,
    },

    /// Sequence counter cannot advance any further
    #[error("sequence numbers exhausted")]
    SeqnoExhausted,

    /// Envelope could not be encoded or decoded
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Nothing arrived within the poll budget
    #[error("read timed out")]
    TimedOut,

    /// Non-blocking read found nothing to return
    #[error("operation would block")]
    WouldBlock,

    /// Connection is closed: a write after the local side closed, or the peer
    /// closed while an exchange was still expected
    #[error("connection closed")]
    Eof,

    /// Operation is not supported by this transport
    #[error("not implemented")]
    NotImplemented,

    /// Relay post or get failed
    #[error("router error: {0}")]
    Router(#[from] RouterError),
}

impl ConnError {
    /// Returns true for errors caused by a tampered, replayed, reordered, or
    /// misrouted message.
    ///
    /// These are never retried: the relay cannot resend a corrupted message,
    /// and a peer that sends one is broken or malicious.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            Self::DecryptionFailed
                | Self::BadMetadata
                | Self::WrongSession
                | Self::SelfReceive
                | Self::BadPacketSequence { .. }
                | Self::Malformed(_)
        )
    }
}

impl From<CryptoError> for ConnError {
    fn from(_: CryptoError) -> Self {
        Self::DecryptionFailed
    }
}

/// Convert `ConnError` to `io::Error` for compatibility with byte-stream APIs.
///
/// This is only for boundary conversion - internally we use `ConnError`.
impl From<ConnError> for io::Error {
    fn from(err: ConnError) -> Self {
        let kind = match &err {
            ConnError::TimedOut => io::ErrorKind::TimedOut,
            ConnError::WouldBlock => io::ErrorKind::WouldBlock,
            ConnError::Eof => io::ErrorKind::BrokenPipe,
            ConnError::NotImplemented => io::ErrorKind::Unsupported,
            ConnError::DecryptionFailed
            | ConnError::BadMetadata
            | ConnError::WrongSession
            | ConnError::SelfReceive
            | ConnError::BadPacketSequence { .. }
            | ConnError::SeqnoExhausted
            | ConnError::Malformed(_) => io::ErrorKind::InvalidData,
            ConnError::Router(_) => io::ErrorKind::Other,
        };
        Self::new(kind, err.to_string())
    }
}

/// Error returned by an embedding application's callback.
///
/// Crosses the RPC layer as its message, so both peers end up holding equal
/// values.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message}")]
pub struct ApplicationError {
    /// Human-readable reason
    pub message: String,
}

impl ApplicationError {
    /// Create an application error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

/// Terminal outcome of a failed pairing run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KexError {
    /// Caller requested cancellation
    #[error("pairing canceled")]
    Canceled,

    /// No result within the configured timeout
    #[error("pairing timed out")]
    TimedOut,

    /// Local device ID was missing or nil
    #[error("invalid local device id")]
    InvalidDeviceId,

    /// Secret bytes supplied by the caller had the wrong length
    #[error("bad secret")]
    BadSecret,

    /// Secure channel failed
    #[error("transport error: {0}")]
    Conn(ConnError),

    /// Embedding application rejected the handshake
    #[error("application error: {0}")]
    Application(ApplicationError),

    /// Peer does not serve the called method
    #[error("peer does not support {0:?}")]
    Unsupported(Method),

    /// Peer sent a malformed or unexpected RPC packet
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl KexError {
    /// Timeout error for a wait bounded by `timeout`, logged at the call site.
    pub fn timed_out_after(timeout: Duration) -> Self {
        tracing::debug!(?timeout, "pairing step timed out");
        Self::TimedOut
    }
}

/// Transport timeouts surface as the canonical pairing timeout; everything
/// else passes through unmodified.
impl From<ConnError> for KexError {
    fn from(err: ConnError) -> Self {
        match err {
            ConnError::TimedOut => Self::TimedOut,
            other => Self::Conn(other),
        }
    }
}

impl From<ApplicationError> for KexError {
    fn from(err: ApplicationError) -> Self {
        Self::Application(err)
    }
}

impl From<CryptoError> for KexError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::BadSecret { .. } => Self::BadSecret,
            CryptoError::DecryptionFailed { .. } => Self::Conn(ConnError::DecryptionFailed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integrity_errors_are_classified() {
        assert!(ConnError::DecryptionFailed.is_integrity_failure());
        assert!(ConnError::BadMetadata.is_integrity_failure());
        assert!(ConnError::WrongSession.is_integrity_failure());
        assert!(ConnError::SelfReceive.is_integrity_failure());
        assert!(
            ConnError::BadPacketSequence { expected: Seqno(1), got: Seqno(2) }
                .is_integrity_failure()
        );

        assert!(!ConnError::TimedOut.is_integrity_failure());
        assert!(!ConnError::WouldBlock.is_integrity_failure());
        assert!(
            !ConnError::Router(RouterError::Unavailable("down".to_string())).is_integrity_failure()
        );
    }

    #[test]
    fn conn_timeout_becomes_kex_timeout() {
        assert_eq!(KexError::from(ConnError::TimedOut), KexError::TimedOut);
        assert_eq!(
            KexError::from(ConnError::BadMetadata),
            KexError::Conn(ConnError::BadMetadata)
        );
    }

    #[test]
    fn router_error_is_carried_typed() {
        let conflict = RouterError::Conflict { expected: Seqno(2), got: Seqno(1) };
        let err = KexError::from(ConnError::from(conflict.clone()));
        assert_eq!(err, KexError::Conn(ConnError::Router(conflict)));
    }

    #[test]
    fn io_error_kinds() {
        assert_eq!(io::Error::from(ConnError::TimedOut).kind(), io::ErrorKind::TimedOut);
        assert_eq!(io::Error::from(ConnError::WouldBlock).kind(), io::ErrorKind::WouldBlock);
        assert_eq!(io::Error::from(ConnError::DecryptionFailed).kind(), io::ErrorKind::InvalidData);
        assert_eq!(io::Error::from(ConnError::Eof).kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn bad_secret_maps_from_crypto() {
        let err = CryptoError::BadSecret { expected: 32, len: 3 };
        assert_eq!(KexError::from(err), KexError::BadSecret);
    }

    #[test]
    fn application_error_displays_message() {
        let err = KexError::Application(ApplicationError::new("wrong user"));
        assert_eq!(err.to_string(), "application error: wrong user");
    }
}
