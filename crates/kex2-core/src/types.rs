//! Wire identifiers: device IDs, session IDs, and sequence numbers.

use std::fmt;

use kex2_crypto::{SESSION_ID_LEN, Secret};
use serde::{Deserialize, Serialize};

use crate::env::Environment;

/// Length of a device ID in bytes.
pub const DEVICE_ID_LEN: usize = 16;

/// Identifies one endpoint of a pairing on the wire.
///
/// A device never accepts a message carrying its own ID as sender; seeing one
/// means the relay echoed our traffic back.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub [u8; DEVICE_ID_LEN]);

impl DeviceId {
    /// The all-zero ID, which is never valid for a live device.
    pub const NIL: Self = Self([0u8; DEVICE_ID_LEN]);

    /// Wrap raw ID bytes.
    pub const fn new(bytes: [u8; DEVICE_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Fresh random device ID from the environment's RNG.
    pub fn generate<E: Environment>(env: &E) -> Self {
        let mut bytes = [0u8; DEVICE_ID_LEN];
        env.random_bytes(&mut bytes);
        Self(bytes)
    }

    /// True for the unset (all-zero) ID.
    pub fn is_nil(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; DEVICE_ID_LEN] {
        &self.0
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", hex::encode(self.0))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..4]))
    }
}

/// Relay routing key, derived from the shared secret.
///
/// Both parties compute the same value independently; the secret itself never
/// leaves the device.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub [u8; SESSION_ID_LEN]);

impl SessionId {
    /// `HMAC-SHA256(secret, "Kex v2 Session ID")`.
    pub fn derive(secret: &Secret) -> Self {
        Self(secret.session_id())
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; SESSION_ID_LEN] {
        &self.0
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", hex::encode(self.0))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..4]))
    }
}

/// Per-direction message counter.
///
/// Starts at 0; the first real message is 1 and every later message is
/// exactly one greater than its predecessor.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Seqno(pub u32);

impl Seqno {
    /// Counter value before any message has been sent or received.
    pub const ZERO: Self = Self(0);

    /// The seqno that must follow this one. `None` once the counter is
    /// exhausted.
    pub fn next(self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }

    /// Raw counter value.
    pub fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Seqno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Generate a fresh pairing secret from the environment's RNG.
pub fn generate_secret<E: Environment>(env: &E) -> Secret {
    let mut bytes = [0u8; kex2_crypto::SECRET_LEN];
    env.random_bytes(&mut bytes);
    Secret::from_bytes(bytes)
}
