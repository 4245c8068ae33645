//! Kex2 secure relay transport and pairing engine.
//!
//! Pairs two devices that share a short-lived secret and can only reach each
//! other through an untrusted store-and-forward relay.
//!
//! # Architecture
//!
//! ```text
//! run_provisioner / run_provisionee      (kex: first-contact race, handshake)
//!              │
//!         RpcEndpoint                    (rpc: framed calls and replies)
//!              │
//!            Conn                        (encrypted ordered byte stream)
//!              │
//!        MessageRouter                   (relay: post / long-poll get)
//! ```
//!
//! # Components
//!
//! - [`Conn`]: encryption, authentication, strict ordering, deadlines, EOF
//! - [`rpc`]: length-prefixed CBOR packets with a dispatcher task
//! - [`kex`]: the provisioner and provisionee role runners
//! - [`MessageRouter`]: the relay seam; implementations live elsewhere
//! - [`Environment`]: time and randomness, swapped for a paused clock in tests

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod conn;
pub mod env;
mod error;
pub mod kex;
mod router;
pub mod rpc;
mod types;
pub mod wire;

pub use conn::{Conn, ConnConfig, DEFAULT_READ_TIMEOUT};
pub use env::{Environment, SystemEnv};
pub use error::{ApplicationError, ConnError, KexError, RouterError};
pub use kex::{
    CancelHandle, Cancellation, DEFAULT_KEX_TIMEOUT, KexArgs, ProvisioneeCallbacks,
    ProvisionerCallbacks, cancellation, run_provisionee, run_provisioner,
};
pub use kex2_crypto::Secret;
pub use router::MessageRouter;
pub use types::{DEVICE_ID_LEN, DeviceId, SessionId, Seqno, generate_secret};
