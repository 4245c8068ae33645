//! Single-message authenticated encryption using `XChaCha20-Poly1305`
//!
//! All functions are pure - random bytes must be provided by the caller.

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit},
};

use crate::{error::CryptoError, secret::Secret};

/// Size of the `XChaCha20` nonce (24 bytes)
pub const NONCE_LEN: usize = 24;

/// Size of the random prefix in the nonce (20 bytes)
pub const NONCE_RANDOM_LEN: usize = 20;

/// Poly1305 tag size (16 bytes)
pub const TAG_LEN: usize = 16;

/// Build a 24-byte nonce for `XChaCha20`.
///
/// Structure:
/// - bytes 0-19: random prefix (caller-provided)
/// - bytes 20-23: seqno (big-endian)
pub fn build_nonce(random_prefix: [u8; NONCE_RANDOM_LEN], seqno: u32) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..NONCE_RANDOM_LEN].copy_from_slice(&random_prefix);
    nonce[NONCE_RANDOM_LEN..].copy_from_slice(&seqno.to_be_bytes());
    nonce
}

/// Seal `plaintext` under the shared secret.
///
/// Returns ciphertext with the 16-byte Poly1305 tag appended. Empty plaintext
/// is valid and produces a tag-only ciphertext.
pub fn seal(secret: &Secret, nonce: &[u8; NONCE_LEN], plaintext: &[u8]) -> Vec<u8> {
    let cipher = XChaCha20Poly1305::new(secret.as_bytes().into());

    let Ok(ciphertext) = cipher.encrypt(XNonce::from_slice(nonce), plaintext) else {
        unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };

    ciphertext
}

/// Open a ciphertext produced by [`seal`].
///
/// # Errors
///
/// - `DecryptionFailed`: If the authentication tag or key is incorrect
///   (tamper), or the ciphertext is shorter than a tag
pub fn open(
    secret: &Secret,
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::DecryptionFailed {
            reason: format!("ciphertext too short: {} bytes", ciphertext.len()),
        });
    }

    let cipher = XChaCha20Poly1305::new(secret.as_bytes().into());

    cipher.decrypt(XNonce::from_slice(nonce), ciphertext).map_err(|_| {
        CryptoError::DecryptionFailed { reason: "authentication failed".to_string() }
    })
}
