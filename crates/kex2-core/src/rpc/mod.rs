//! Framed request/response layer over [`crate::Conn`].
//!
//! Carries the pairing handshake: `Hello` and `DidCounterSign` calls (or their
//! v2 counterparts) from the provisioner, and the `KexStart` notification a
//! provisionee sends on every connection it opens.

mod endpoint;
mod packet;

pub use endpoint::{RpcEndpoint, RpcHandler};
pub use packet::{
    Call, DidCounterSign2Arg, FRAME_HEADER_LEN, FrameReader, Hello2Arg, Hello2Res, HelloArg,
    HelloRes, MAX_FRAME_LEN, Method, Notify, Packet, Reply, RpcFailure,
};
