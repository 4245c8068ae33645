//! Fuzz target for RPC frame reassembly across arbitrary chunk boundaries
//!
//! The connection delivers bytes in whatever chunks the peer wrote and the
//! reader asked for. Reassembly must not depend on where those cuts fall.
//!
//! # Strategy
//!
//! - Valid: well-formed packets concatenated, then split at fuzzed offsets
//! - Garbage: arbitrary bytes fed in arbitrary chunks
//!
//! # Invariants
//!
//! - Valid streams yield exactly the packets written, in order
//! - Garbage yields packets or a protocol error, never a panic

#![no_main]

use arbitrary::Arbitrary;
use kex2_core::rpc::{
    Call, DidCounterSign2Arg, FrameReader, Hello2Arg, HelloArg, HelloRes, Method, Notify, Packet,
    Reply, RpcFailure,
};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
enum PacketShape {
    Hello { seqid: u32, payload: Vec<u8> },
    DidCounterSign { seqid: u32, sig: Vec<u8> },
    HelloReply { seqid: u32, res: Vec<u8> },
    Hello2 { seqid: u32, payload: Vec<u8> },
    DidCounterSign2 { seqid: u32, sig: Vec<u8>, sealed: Vec<u8> },
    Failure { seqid: u32, message: String },
    Refused { seqid: u32 },
    KexStart,
}

impl PacketShape {
    fn build(self) -> Packet {
        match self {
            Self::Hello { seqid, payload } => {
                Packet::Call { seqid, call: Call::Hello(HelloArg { payload }) }
            },
            Self::DidCounterSign { seqid, sig } => {
                Packet::Call { seqid, call: Call::DidCounterSign(sig) }
            },
            Self::HelloReply { seqid, res } => {
                Packet::Reply { seqid, result: Ok(Reply::Hello(HelloRes(res))) }
            },
            Self::Hello2 { seqid, payload } => {
                Packet::Call { seqid, call: Call::Hello2(Hello2Arg { payload }) }
            },
            Self::DidCounterSign2 { seqid, sig, sealed } => {
                let arg = DidCounterSign2Arg { sig, sealed };
                Packet::Call { seqid, call: Call::DidCounterSign2(arg) }
            },
            Self::Failure { seqid, message } => {
                Packet::Reply { seqid, result: Err(RpcFailure::Application { message }) }
            },
            Self::Refused { seqid } => {
                Packet::Reply { seqid, result: Err(RpcFailure::Unsupported(Method::Hello2)) }
            },
            Self::KexStart => Packet::Notify(Notify::KexStart),
        }
    }
}

#[derive(Debug, Arbitrary)]
enum Input {
    Valid { packets: Vec<PacketShape>, cuts: Vec<u16> },
    Garbage { chunks: Vec<Vec<u8>> },
}

fuzz_target!(|input: Input| {
    match input {
        Input::Valid { packets, cuts } => {
            let mut written = Vec::new();
            let mut stream = Vec::new();
            for packet in packets.into_iter().map(PacketShape::build) {
                // Oversized packets are refused at encode time
                if let Ok(frame) = packet.encode_frame() {
                    stream.extend_from_slice(&frame);
                    written.push(packet);
                }
            }

            let mut reader = FrameReader::new();
            let mut decoded = Vec::new();
            let mut rest = stream.as_slice();
            for cut in cuts.into_iter().chain(std::iter::once(u16::MAX)) {
                let at = (cut as usize).min(rest.len());
                let (chunk, tail) = rest.split_at(at);
                rest = tail;

                reader.extend(chunk);
                while let Some(packet) = reader.try_next().unwrap() {
                    decoded.push(packet);
                }
            }
            reader.extend(rest);
            while let Some(packet) = reader.try_next().unwrap() {
                decoded.push(packet);
            }

            assert_eq!(decoded, written);
        },

        Input::Garbage { chunks } => {
            let mut reader = FrameReader::new();
            for chunk in chunks {
                reader.extend(&chunk);
                loop {
                    match reader.try_next() {
                        Ok(Some(_)) => continue,
                        Ok(None) | Err(_) => break,
                    }
                }
            }
        },
    }
});
