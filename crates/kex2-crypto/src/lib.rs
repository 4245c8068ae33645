//! Kex2 Cryptographic Primitives
//!
//! Cryptographic building blocks for Kex2 device pairing. Pure functions with
//! deterministic outputs. Callers provide random bytes for deterministic
//! testing.
//!
//! # Key Lifecycle
//!
//! Both devices start from the same 32-byte shared secret, typed in as a
//! phrase or scanned as a code. Nothing derived from it ever crosses the relay
//! except the session ID, which is a one-way function of the secret.
//!
//! ```text
//! Shared Secret (32 bytes)
//!        │
//!        ├──► HMAC-SHA256("Kex v2 Session ID") → Session ID (relay routing)
//!        │
//!        ▼
//! XChaCha20-Poly1305 (nonce = random || seqno) → Ciphertext
//! ```
//!
//! # Security
//!
//! Confidentiality and integrity:
//! - Every message is sealed with XChaCha20-Poly1305 under the shared secret
//! - A failed authentication tag is always a hard error, never retried
//!
//! Nonce uniqueness:
//! - 20 random bytes per message plus the 4-byte sequence number
//! - The random prefix keeps nonces unique across restarts that reuse a
//!   secret; the seqno binds each nonce to its position in the stream
//!
//! Secret hygiene:
//! - [`Secret`] zeroizes on drop, redacts itself in `Debug`, and compares in
//!   constant time

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod error;
pub mod secret;
pub mod secretbox;

pub use error::CryptoError;
pub use secret::{SECRET_LEN, SESSION_ID_LEN, Secret, derive_session_id};
pub use secretbox::{NONCE_LEN, NONCE_RANDOM_LEN, TAG_LEN, build_nonce, open, seal};
