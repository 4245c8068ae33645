//! RPC packets and length-prefixed framing.
//!
//! # Frame Format
//!
//! ```text
//! [length: u32 BE][CBOR-encoded Packet: length bytes]
//! ```
//!
//! Each frame is written with a single [`Conn::write`], so one relay message
//! carries exactly one packet. Reads may still split or merge frames, so the
//! reader reassembles from the byte stream.

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};

use crate::{
    conn::Conn,
    env::Environment,
    error::{ApplicationError, KexError},
    router::MessageRouter,
};

/// Size of the frame length prefix in bytes.
pub const FRAME_HEADER_LEN: usize = 4;

/// Largest packet body accepted (64 KiB). Handshake payloads are small.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// First handshake payload, produced by the provisioner's application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloArg {
    /// Opaque application bytes
    pub payload: Vec<u8>,
}

/// Provisionee's answer to [`HelloArg`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloRes(pub Vec<u8>);

/// First payload of the v2 handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello2Arg {
    /// Opaque application bytes
    pub payload: Vec<u8>,
}

/// Provisionee's answer to [`Hello2Arg`]: the signature payload plus a key
/// the provisioner seals its second message to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello2Res {
    /// Payload for the provisioner to counter-sign
    pub sig_payload: Vec<u8>,
    /// Provisionee's public encryption key
    pub encryption_key: Vec<u8>,
}

/// Provisioner's v2 counter-signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DidCounterSign2Arg {
    /// Counter-signature
    pub sig: Vec<u8>,
    /// Data sealed to [`Hello2Res::encryption_key`]
    pub sealed: Vec<u8>,
}

/// Remote procedure names, for logging, completion tracking, and refusing
/// calls a peer does not serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    /// [`Call::Hello`]
    Hello,
    /// [`Call::DidCounterSign`]
    DidCounterSign,
    /// [`Call::Hello2`]
    Hello2,
    /// [`Call::DidCounterSign2`]
    DidCounterSign2,
}

/// Request sent by the active party.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Call {
    /// Start the handshake
    Hello(HelloArg),
    /// Deliver the provisioner's counter-signature
    DidCounterSign(Vec<u8>),
    /// Start the v2 handshake
    Hello2(Hello2Arg),
    /// Deliver the v2 counter-signature
    DidCounterSign2(DidCounterSign2Arg),
}

impl Call {
    /// Name of the procedure this call invokes.
    pub fn method(&self) -> Method {
        match self {
            Self::Hello(_) => Method::Hello,
            Self::DidCounterSign(_) => Method::DidCounterSign,
            Self::Hello2(_) => Method::Hello2,
            Self::DidCounterSign2(_) => Method::DidCounterSign2,
        }
    }
}

/// Successful result of a [`Call`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    /// Result of [`Call::Hello`]
    Hello(HelloRes),
    /// Result of [`Call::DidCounterSign`]
    DidCounterSign,
    /// Result of [`Call::Hello2`]
    Hello2(Hello2Res),
    /// Result of [`Call::DidCounterSign2`]
    DidCounterSign2,
}

/// One-way message; never answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notify {
    /// Provisionee is listening on this session
    KexStart,
}

/// Failed call result as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcFailure {
    /// Handler ran and failed
    Application {
        /// Application error message, verbatim
        message: String,
    },
    /// Receiver does not serve this method; the handler never ran
    Unsupported(Method),
}

impl From<ApplicationError> for RpcFailure {
    fn from(err: ApplicationError) -> Self {
        Self::Application { message: err.message }
    }
}

impl From<RpcFailure> for KexError {
    fn from(failure: RpcFailure) -> Self {
        match failure {
            RpcFailure::Application { message } => {
                Self::Application(ApplicationError::new(message))
            },
            RpcFailure::Unsupported(method) => Self::Unsupported(method),
        }
    }
}

/// Unit of the RPC stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Packet {
    /// Request expecting a reply with the same `seqid`
    Call {
        /// Caller-chosen request ID
        seqid: u32,
        /// Procedure and arguments
        call: Call,
    },
    /// Answer to an earlier call
    Reply {
        /// ID of the call being answered
        seqid: u32,
        /// Handler outcome
        result: Result<Reply, RpcFailure>,
    },
    /// One-way notification
    Notify(Notify),
}

impl Packet {
    /// Encode as one length-prefixed frame.
    ///
    /// # Errors
    ///
    /// - `KexError::Protocol` if serialization fails or the body exceeds
    ///   [`MAX_FRAME_LEN`]
    pub fn encode_frame(&self) -> Result<Vec<u8>, KexError> {
        let mut body = Vec::new();
        ciborium::ser::into_writer(self, &mut body)
            .map_err(|e| KexError::Protocol(format!("packet encode failed: {e}")))?;

        if body.len() > MAX_FRAME_LEN {
            return Err(KexError::Protocol(format!(
                "packet too large: {} bytes (max {MAX_FRAME_LEN})",
                body.len()
            )));
        }

        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Decode a packet body (without the length prefix).
    ///
    /// # Errors
    ///
    /// - `KexError::Protocol` if the body is oversized or not a valid packet
    pub fn decode(body: &[u8]) -> Result<Self, KexError> {
        if body.len() > MAX_FRAME_LEN {
            return Err(KexError::Protocol(format!(
                "packet too large: {} bytes (max {MAX_FRAME_LEN})",
                body.len()
            )));
        }
        ciborium::de::from_reader(body)
            .map_err(|e| KexError::Protocol(format!("packet decode failed: {e}")))
    }
}

/// Reassembles packets from a [`Conn`] byte stream.
#[derive(Debug, Default)]
pub struct FrameReader {
    buffer: BytesMut,
}

impl FrameReader {
    /// Create an empty reader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw stream bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Pop the next complete packet, if one is buffered.
    ///
    /// # Errors
    ///
    /// - `KexError::Protocol` if the length prefix exceeds [`MAX_FRAME_LEN`]
    ///   or the body does not decode
    pub fn try_next(&mut self) -> Result<Option<Packet>, KexError> {
        if self.buffer.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let mut header = [0u8; FRAME_HEADER_LEN];
        header.copy_from_slice(&self.buffer[..FRAME_HEADER_LEN]);
        let len = u32::from_be_bytes(header) as usize;
        if len > MAX_FRAME_LEN {
            return Err(KexError::Protocol(format!(
                "frame length {len} exceeds maximum {MAX_FRAME_LEN}"
            )));
        }

        if self.buffer.len() < FRAME_HEADER_LEN + len {
            return Ok(None);
        }

        self.buffer.advance(FRAME_HEADER_LEN);
        let body = self.buffer.split_to(len);
        Packet::decode(&body).map(Some)
    }

    /// Read from `conn` until a whole packet is available.
    ///
    /// Returns `Ok(None)` on a clean end-of-stream between packets.
    ///
    /// # Errors
    ///
    /// - Any connection error, converted to `KexError`
    /// - `KexError::Protocol` if the stream ends mid-frame or a packet is
    ///   malformed
    pub async fn read_packet<R, E>(&mut self, conn: &Conn<R, E>) -> Result<Option<Packet>, KexError>
    where
        R: MessageRouter,
        E: Environment,
    {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(packet) = self.try_next()? {
                return Ok(Some(packet));
            }

            let n = conn.read(&mut chunk).await?;
            if n == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(KexError::Protocol(format!(
                    "stream ended inside a frame ({} bytes buffered)",
                    self.buffer.len()
                )));
            }
            self.extend(&chunk[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello_call() -> Packet {
        Packet::Call { seqid: 7, call: Call::Hello(HelloArg { payload: b"hi".to_vec() }) }
    }

    #[test]
    fn frame_prefix_is_big_endian_body_length() {
        let frame = hello_call().encode_frame().unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - FRAME_HEADER_LEN);
    }

    #[test]
    fn reader_reassembles_split_frames() {
        let frame = hello_call().encode_frame().unwrap();
        let mut reader = FrameReader::new();

        for byte in &frame[..frame.len() - 1] {
            reader.extend(&[*byte]);
            assert_eq!(reader.try_next().unwrap(), None);
        }
        reader.extend(&frame[frame.len() - 1..]);

        assert_eq!(reader.try_next().unwrap(), Some(hello_call()));
        assert_eq!(reader.try_next().unwrap(), None);
    }

    #[test]
    fn reader_splits_merged_frames() {
        let notify = Packet::Notify(Notify::KexStart);
        let mut bytes = hello_call().encode_frame().unwrap();
        bytes.extend(notify.encode_frame().unwrap());

        let mut reader = FrameReader::new();
        reader.extend(&bytes);

        assert_eq!(reader.try_next().unwrap(), Some(hello_call()));
        assert_eq!(reader.try_next().unwrap(), Some(notify));
    }

    #[test]
    fn oversized_length_prefix_rejected() {
        let mut reader = FrameReader::new();
        reader.extend(&((MAX_FRAME_LEN as u32) + 1).to_be_bytes());

        assert!(matches!(reader.try_next(), Err(KexError::Protocol(_))));
    }

    #[test]
    fn failure_reply_keeps_message() {
        let packet = Packet::Reply {
            seqid: 1,
            result: Err(RpcFailure::from(ApplicationError::new("nope"))),
        };
        let frame = packet.encode_frame().unwrap();
        let decoded = Packet::decode(&frame[FRAME_HEADER_LEN..]).unwrap();

        let Packet::Reply { result: Err(failure), .. } = decoded else {
            unreachable!("expected failed reply, got {decoded:?}")
        };
        assert_eq!(
            KexError::from(failure),
            KexError::Application(ApplicationError::new("nope"))
        );
    }

    #[test]
    fn unsupported_reply_names_method() {
        let refused = Err(RpcFailure::Unsupported(Method::Hello2));
        let packet = Packet::Reply { seqid: 3, result: refused };
        let frame = packet.encode_frame().unwrap();
        let decoded = Packet::decode(&frame[FRAME_HEADER_LEN..]).unwrap();

        let Packet::Reply { result: Err(failure), .. } = decoded else {
            unreachable!("expected failed reply, got {decoded:?}")
        };
        assert_eq!(KexError::from(failure), KexError::Unsupported(Method::Hello2));
    }

    #[test]
    fn v2_calls_name_their_methods() {
        let hello2 = Call::Hello2(Hello2Arg { payload: vec![1] });
        let sign2 = Call::DidCounterSign2(DidCounterSign2Arg { sig: vec![2], sealed: vec![3] });
        assert_eq!(hello2.method(), Method::Hello2);
        assert_eq!(sign2.method(), Method::DidCounterSign2);
    }

    #[test]
    fn garbage_body_is_protocol_error() {
        assert!(matches!(Packet::decode(&[0xFF, 0xFF]), Err(KexError::Protocol(_))));
    }
}
