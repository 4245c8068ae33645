//! Relay abstraction.
//!
//! The relay is an untrusted store-and-forward service: it stores opaque
//! blobs keyed by `(session, sender, seqno)` and hands them to the other
//! party on request. It never sees plaintext, and nothing it returns is
//! trusted until [`crate::Conn`] has authenticated it.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::{
    error::RouterError,
    types::{DeviceId, SessionId, Seqno},
};

/// Store-and-forward message relay.
///
/// Must be Clone (each connection holds its own handle), Send + Sync, and
/// cheap to clone. Implementations typically share internal state via Arc,
/// so clones talk to the same underlying relay.
#[async_trait]
pub trait MessageRouter: Clone + Send + Sync + 'static {
    /// Post one message from `sender` at `seqno`.
    ///
    /// # Invariants
    ///
    /// - Callers never post the same `(session, sender, seqno)` twice
    /// - Post does not long-poll; it returns once the relay has the message
    async fn post(
        &self,
        session: SessionId,
        sender: DeviceId,
        seqno: Seqno,
        msg: Bytes,
    ) -> Result<(), RouterError>;

    /// Fetch messages for `receiver` with seqno >= `seqno`.
    ///
    /// Returns messages in increasing seqno order, waiting up to `poll` for
    /// at least one to arrive. A clean timeout is an empty vector, not an
    /// error. Implementations may cap the wait below `poll`, so callers must
    /// loop until their own budget is spent.
    async fn get(
        &self,
        session: SessionId,
        receiver: DeviceId,
        seqno: Seqno,
        poll: Duration,
    ) -> Result<Vec<Bytes>, RouterError>;
}
