//! CBOR-encoded wire envelopes.
//!
//! An [`OuterMsg`] is what the relay stores: routing metadata in the clear
//! plus a sealed payload. Opening the payload yields an [`InnerMsg`] that
//! repeats the metadata under authentication.
//!
//! # Invariants
//!
//! - The inner sender, session, and seqno MUST equal the outer ones. The
//!   relay can rewrite the outer fields freely; only the inner copies are
//!   authenticated, so any disagreement is a hard decode failure.
//! - An empty inner payload is the end-of-stream marker. The outer envelope
//!   is always present, even for EOF.

use kex2_crypto::NONCE_LEN;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    error::ConnError,
    types::{DeviceId, SessionId, Seqno},
};

/// Largest encoded envelope accepted from the relay (1 MiB).
///
/// Checked before CBOR parsing so a hostile relay cannot make us parse
/// arbitrarily large inputs.
pub const MAX_ENVELOPE_SIZE: usize = 1 << 20;

/// Relay-visible envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OuterMsg {
    /// Device that sent the message
    pub sender: DeviceId,
    /// Session the message belongs to
    pub session: SessionId,
    /// Sender's sequence number for this message
    pub seqno: Seqno,
    /// `XChaCha20` nonce: `[random:20][seqno:4]`
    pub nonce: [u8; NONCE_LEN],
    /// Sealed [`InnerMsg`], including the 16-byte Poly1305 tag
    pub payload: Vec<u8>,
}

/// Authenticated plaintext recovered from an [`OuterMsg`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InnerMsg {
    /// Device that sent the message
    pub sender: DeviceId,
    /// Session the message belongs to
    pub session: SessionId,
    /// Sender's sequence number for this message
    pub seqno: Seqno,
    /// Application bytes; empty means end-of-stream
    pub payload: Vec<u8>,
}

impl OuterMsg {
    /// Encode to CBOR.
    ///
    /// # Errors
    ///
    /// - `ConnError::Malformed` if serialization fails
    pub fn encode(&self) -> Result<Vec<u8>, ConnError> {
        encode_cbor(self)
    }

    /// Decode from CBOR.
    ///
    /// # Errors
    ///
    /// - `ConnError::Malformed` if the input is too large or not a valid
    ///   envelope
    pub fn decode(bytes: &[u8]) -> Result<Self, ConnError> {
        decode_cbor(bytes)
    }
}

impl InnerMsg {
    /// Encode to CBOR.
    ///
    /// # Errors
    ///
    /// - `ConnError::Malformed` if serialization fails
    pub fn encode(&self) -> Result<Vec<u8>, ConnError> {
        encode_cbor(self)
    }

    /// Decode from CBOR.
    ///
    /// # Errors
    ///
    /// - `ConnError::Malformed` if the input is too large or not a valid
    ///   envelope
    pub fn decode(bytes: &[u8]) -> Result<Self, ConnError> {
        decode_cbor(bytes)
    }

    /// Check the inner metadata against the outer envelope it came in.
    ///
    /// # Errors
    ///
    /// - `ConnError::BadMetadata` if sender, session, or seqno differ
    pub fn check_matches(&self, outer: &OuterMsg) -> Result<(), ConnError> {
        if self.sender != outer.sender || self.session != outer.session || self.seqno != outer.seqno
        {
            return Err(ConnError::BadMetadata);
        }
        Ok(())
    }

    /// True if this message marks end-of-stream.
    pub fn is_eof(&self) -> bool {
        self.payload.is_empty()
    }
}

fn encode_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, ConnError> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf).map_err(|e| ConnError::Malformed(e.to_string()))?;
    Ok(buf)
}

fn decode_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ConnError> {
    if bytes.len() > MAX_ENVELOPE_SIZE {
        return Err(ConnError::Malformed(format!(
            "envelope too large: {} bytes (max {MAX_ENVELOPE_SIZE})",
            bytes.len()
        )));
    }
    ciborium::de::from_reader(bytes).map_err(|e| ConnError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_outer() -> OuterMsg {
        OuterMsg {
            sender: DeviceId::new([1; 16]),
            session: SessionId([2; 32]),
            seqno: Seqno(3),
            nonce: [4; NONCE_LEN],
            payload: vec![5, 6, 7],
        }
    }

    fn matching_inner(outer: &OuterMsg) -> InnerMsg {
        InnerMsg {
            sender: outer.sender,
            session: outer.session,
            seqno: outer.seqno,
            payload: b"data".to_vec(),
        }
    }

    #[test]
    fn outer_roundtrip() {
        let outer = sample_outer();
        let decoded = OuterMsg::decode(&outer.encode().unwrap()).unwrap();
        assert_eq!(decoded, outer);
    }

    #[test]
    fn inner_roundtrip_with_empty_payload() {
        let outer = sample_outer();
        let inner = InnerMsg { payload: Vec::new(), ..matching_inner(&outer) };

        let decoded = InnerMsg::decode(&inner.encode().unwrap()).unwrap();
        assert!(decoded.is_eof());
    }

    #[test]
    fn metadata_mismatch_is_detected() {
        let outer = sample_outer();
        assert!(matching_inner(&outer).check_matches(&outer).is_ok());

        let wrong_sender = InnerMsg { sender: DeviceId::new([9; 16]), ..matching_inner(&outer) };
        assert_eq!(wrong_sender.check_matches(&outer), Err(ConnError::BadMetadata));

        let wrong_session = InnerMsg { session: SessionId([9; 32]), ..matching_inner(&outer) };
        assert_eq!(wrong_session.check_matches(&outer), Err(ConnError::BadMetadata));

        let wrong_seqno = InnerMsg { seqno: Seqno(4), ..matching_inner(&outer) };
        assert_eq!(wrong_seqno.check_matches(&outer), Err(ConnError::BadMetadata));
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(OuterMsg::decode(&[0xFF, 0x00, 0x13]), Err(ConnError::Malformed(_))));
        assert!(matches!(OuterMsg::decode(&[]), Err(ConnError::Malformed(_))));
    }

    #[test]
    fn oversized_input_rejected_before_parsing() {
        let huge = vec![0u8; MAX_ENVELOPE_SIZE + 1];
        let err = OuterMsg::decode(&huge).unwrap_err();
        assert!(matches!(err, ConnError::Malformed(msg) if msg.contains("too large")));
    }
}
