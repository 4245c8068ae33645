//! Pairing roles.
//!
//! Two devices holding (or about to hold) the same secret race to meet on the
//! relay, then run a two-call handshake driven by the provisioner:
//!
//! ```text
//! Provisioner                          Provisionee
//!     │                                     │
//!     │  KexStart  (on every session the    │
//!     │ <─────────  provisionee listens on) │
//!     │                                     │
//!     │  Hello(HelloArg)                    │
//!     │ ──────────────────────────────────> │ handle_hello
//!     │                        HelloRes     │
//!     │ <────────────────────────────────── │
//! counter_sign                              │
//!     │  DidCounterSign(sig)                │
//!     │ ──────────────────────────────────> │ handle_did_counter_sign
//!     │                              ok     │
//!     │ <────────────────────────────────── │
//! ```
//!
//! When both applications opt in with `supports_v2`, the provisioner sends
//! `Hello2` and `DidCounterSign2` instead. A provisionee that does not serve v2
//! refuses `Hello2` and the provisioner falls back to the v1 calls on the same
//! connection.
//!
//! The application plugs in through [`ProvisionerCallbacks`] and
//! [`ProvisioneeCallbacks`]; the payloads are opaque to this crate.

mod base;
mod cancel;
mod provisionee;
mod provisioner;

use async_trait::async_trait;
pub use base::{DEFAULT_KEX_TIMEOUT, KexArgs};
pub use cancel::{CancelHandle, Cancellation, cancellation};
pub use provisionee::run_provisionee;
pub use provisioner::run_provisioner;

use crate::{
    error::ApplicationError,
    rpc::{DidCounterSign2Arg, Hello2Arg, Hello2Res, HelloArg, HelloRes},
};

/// Application hooks for the device approving a new one.
#[async_trait]
pub trait ProvisionerCallbacks: Send + Sync + 'static {
    /// Produce the first handshake payload.
    async fn get_hello_arg(&self) -> Result<HelloArg, ApplicationError>;

    /// Counter-sign the provisionee's answer.
    async fn counter_sign(&self, res: HelloRes) -> Result<Vec<u8>, ApplicationError>;

    /// Whether to try the v2 handshake first.
    fn supports_v2(&self) -> bool {
        false
    }

    /// Produce the first v2 handshake payload.
    async fn get_hello2_arg(&self) -> Result<Hello2Arg, ApplicationError> {
        Err(ApplicationError::new("v2 handshake not implemented"))
    }

    /// Counter-sign the provisionee's v2 answer, sealing anything secret to
    /// its encryption key.
    async fn counter_sign2(&self, _res: Hello2Res) -> Result<DidCounterSign2Arg, ApplicationError> {
        Err(ApplicationError::new("v2 handshake not implemented"))
    }
}

/// Application hooks for the device being provisioned.
#[async_trait]
pub trait ProvisioneeCallbacks: Send + Sync + 'static {
    /// Answer the provisioner's hello.
    async fn handle_hello(&self, arg: HelloArg) -> Result<HelloRes, ApplicationError>;

    /// Accept the provisioner's counter-signature. Success completes pairing.
    async fn handle_did_counter_sign(&self, sig: Vec<u8>) -> Result<(), ApplicationError>;

    /// Whether to serve `Hello2` and `DidCounterSign2`. When false the peer's
    /// v2 calls are refused and it falls back to v1.
    fn supports_v2(&self) -> bool {
        false
    }

    /// Answer the provisioner's v2 hello.
    async fn handle_hello2(&self, _arg: Hello2Arg) -> Result<Hello2Res, ApplicationError> {
        Err(ApplicationError::new("v2 handshake not implemented"))
    }

    /// Accept the v2 counter-signature. Success completes pairing.
    async fn handle_did_counter_sign2(
        &self,
        _arg: DidCounterSign2Arg,
    ) -> Result<(), ApplicationError> {
        Err(ApplicationError::new("v2 handshake not implemented"))
    }
}
