//! Shared pairing secret and session ID derivation.
//!
//! # Security Properties
//!
//! - Secret bytes are zeroized when the value is dropped
//! - `Debug` never prints secret material
//! - Equality is evaluated in constant time
//! - The session ID is a one-way function of the secret, so publishing it to
//!   the relay reveals nothing about the key

use std::fmt;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::error::CryptoError;

type HmacSha256 = Hmac<Sha256>;

/// Length of a shared secret in bytes.
pub const SECRET_LEN: usize = 32;

/// Length of a derived session ID in bytes.
pub const SESSION_ID_LEN: usize = 32;

/// HMAC message used to derive the session ID from the secret
const SESSION_ID_LABEL: &[u8] = b"Kex v2 Session ID";

/// A 32-byte secret shared out-of-band between the two devices.
///
/// Both the relay session and the per-message encryption key are derived from
/// this value, so it must never be logged or sent over the relay.
#[derive(Clone)]
pub struct Secret {
    bytes: [u8; SECRET_LEN],
}

impl Secret {
    /// Wrap raw secret bytes.
    pub fn from_bytes(bytes: [u8; SECRET_LEN]) -> Self {
        Self { bytes }
    }

    /// Parse a secret from a slice.
    ///
    /// # Errors
    ///
    /// - `CryptoError::BadSecret` if the slice is not exactly [`SECRET_LEN`]
    ///   bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; SECRET_LEN] = bytes
            .try_into()
            .map_err(|_| CryptoError::BadSecret { expected: SECRET_LEN, len: bytes.len() })?;
        Ok(Self { bytes })
    }

    /// Raw key bytes, used as the secretbox key.
    pub fn as_bytes(&self) -> &[u8; SECRET_LEN] {
        &self.bytes
    }

    /// Session ID that both peers compute independently from this secret.
    pub fn session_id(&self) -> [u8; SESSION_ID_LEN] {
        derive_session_id(self)
    }
}

impl PartialEq for Secret {
    fn eq(&self, other: &Self) -> bool {
        self.bytes.ct_eq(&other.bytes).into()
    }
}

impl Eq for Secret {}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

/// Derive the relay session ID: `HMAC-SHA256(secret, "Kex v2 Session ID")`.
///
/// Deterministic: the same secret always yields the same session ID.
pub fn derive_session_id(secret: &Secret) -> [u8; SESSION_ID_LEN] {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        unreachable!("HMAC-SHA256 accepts keys of any length");
    };
    mac.update(SESSION_ID_LABEL);

    let mut session_id = [0u8; SESSION_ID_LEN];
    session_id.copy_from_slice(&mac.finalize().into_bytes());
    session_id
}
