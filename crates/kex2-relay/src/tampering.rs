//! Deterministic adversarial relay.
//!
//! Wraps a relay and applies one [`Fault`] to the first message posted
//! through it. Everything else passes through untouched, so the receiver's
//! first read is the one that must detect the attack.
//!
//! ```text
//! CorruptSender/Session:  outer metadata byte flipped  → BadMetadata
//! CorruptCiphertext:      sealed payload byte flipped  → DecryptionFailed
//! Reorder:                [m1, m2] stored as [m2, m1]  → BadPacketSequence
//! Drop:                   m1 discarded, m2 in slot 1   → BadPacketSequence
//! ```

use std::{
    str::FromStr,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use kex2_core::{DeviceId, MessageRouter, RouterError, SessionId, Seqno, wire::OuterMsg};
use thiserror::Error;

/// Attack applied to the first posted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Flip a byte of the relay-visible sender ID
    CorruptSender,
    /// Flip a byte of the relay-visible session ID
    CorruptSession,
    /// Flip a byte of the sealed payload
    CorruptCiphertext,
    /// Swap the first two messages from the same sender
    Reorder,
    /// Discard the first message and close the gap
    Drop,
}

/// Fault name not recognized on the command line.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown fault: {0}")]
pub struct UnknownFault(pub String);

impl FromStr for Fault {
    type Err = UnknownFault;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "corrupt-sender" => Ok(Self::CorruptSender),
            "corrupt-session" => Ok(Self::CorruptSession),
            "corrupt-ciphertext" => Ok(Self::CorruptCiphertext),
            "reorder" => Ok(Self::Reorder),
            "drop" => Ok(Self::Drop),
            other => Err(UnknownFault(other.to_string())),
        }
    }
}

#[derive(Debug, Default)]
enum TamperState {
    /// Waiting for the first post
    #[default]
    Armed,
    /// Reorder: first message held until its successor arrives
    Holding { session: SessionId, sender: DeviceId, msg: Bytes },
    /// Drop: later posts from this sender move down one slot
    Shifting { session: SessionId, sender: DeviceId },
    /// Fault applied; pass everything through
    Spent,
}

/// Relay wrapper that attacks the first message posted through it.
#[derive(Clone)]
pub struct TamperingRouter<R: MessageRouter> {
    inner: R,
    fault: Fault,
    state: Arc<Mutex<TamperState>>,
}

/// What to forward for one post, decided under the lock.
enum Forward {
    Pass(Seqno, Bytes),
    Swap(Bytes, Bytes),
    Nothing,
}

impl<R: MessageRouter> TamperingRouter<R> {
    /// Wrap `inner`, arming `fault`.
    pub fn new(inner: R, fault: Fault) -> Self {
        Self { inner, fault, state: Arc::new(Mutex::new(TamperState::default())) }
    }

    /// Underlying relay.
    pub fn inner(&self) -> &R {
        &self.inner
    }

    /// True once the fault has been applied.
    pub fn is_spent(&self) -> bool {
        !matches!(
            *self.state.lock().unwrap_or_else(PoisonError::into_inner),
            TamperState::Armed | TamperState::Holding { .. }
        )
    }

    fn plan(
        &self,
        session: SessionId,
        sender: DeviceId,
        seqno: Seqno,
        msg: Bytes,
    ) -> Result<Forward, RouterError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        match std::mem::take(&mut *state) {
            TamperState::Armed => {
                tracing::debug!(fault = ?self.fault, %session, %sender, %seqno, "tampering");
                match self.fault {
                    Fault::CorruptSender | Fault::CorruptSession | Fault::CorruptCiphertext => {
                        *state = TamperState::Spent;
                        Ok(Forward::Pass(seqno, corrupt(self.fault, &msg)?))
                    },
                    Fault::Reorder => {
                        *state = TamperState::Holding { session, sender, msg };
                        Ok(Forward::Nothing)
                    },
                    Fault::Drop => {
                        *state = TamperState::Shifting { session, sender };
                        Ok(Forward::Nothing)
                    },
                }
            },
            TamperState::Holding { session: s, sender: d, msg: held }
                if s == session && d == sender =>
            {
                *state = TamperState::Spent;
                Ok(Forward::Swap(msg, held))
            },
            TamperState::Shifting { session: s, sender: d } if s == session && d == sender => {
                *state = TamperState::Shifting { session: s, sender: d };
                let shifted = Seqno(seqno.value().saturating_sub(1));
                Ok(Forward::Pass(shifted, msg))
            },
            other => {
                *state = other;
                Ok(Forward::Pass(seqno, msg))
            },
        }
    }
}

/// Flip one byte of the field `fault` targets and re-encode.
fn corrupt(fault: Fault, msg: &[u8]) -> Result<Bytes, RouterError> {
    let mut outer = OuterMsg::decode(msg)
        .map_err(|e| RouterError::Unavailable(format!("tampering relay cannot parse: {e}")))?;

    match fault {
        Fault::CorruptSender => outer.sender.0[0] ^= 0x01,
        Fault::CorruptSession => outer.session.0[0] ^= 0x01,
        Fault::CorruptCiphertext => {
            if let Some(byte) = outer.payload.first_mut() {
                *byte ^= 0x01;
            }
        },
        Fault::Reorder | Fault::Drop => {},
    }

    let encoded = outer
        .encode()
        .map_err(|e| RouterError::Unavailable(format!("tampering relay cannot encode: {e}")))?;
    Ok(Bytes::from(encoded))
}

#[async_trait]
impl<R: MessageRouter> MessageRouter for TamperingRouter<R> {
    async fn post(
        &self,
        session: SessionId,
        sender: DeviceId,
        seqno: Seqno,
        msg: Bytes,
    ) -> Result<(), RouterError> {
        match self.plan(session, sender, seqno, msg)? {
            Forward::Pass(seqno, msg) => self.inner.post(session, sender, seqno, msg).await,
            Forward::Swap(second, first) => {
                self.inner.post(session, sender, Seqno(1), second).await?;
                self.inner.post(session, sender, Seqno(2), first).await
            },
            Forward::Nothing => Ok(()),
        }
    }

    async fn get(
        &self,
        session: SessionId,
        receiver: DeviceId,
        seqno: Seqno,
        poll: Duration,
    ) -> Result<Vec<Bytes>, RouterError> {
        self.inner.get(session, receiver, seqno, poll).await
    }
}
