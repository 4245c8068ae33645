//! Chaotic relay wrapper for fault injection testing
//!
//! Relay wrapper that randomly fails posts and gets to test how the transport
//! and pairing engine surface relay outages. Seeded, so chaos runs are
//! reproducible.

use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use kex2_core::{DeviceId, MessageRouter, RouterError, SessionId, Seqno};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Seed used by [`ChaoticRouter::new`].
pub const DEFAULT_CHAOS_SEED: u64 = 0x1234_5678_9ABC_DEF0;

/// Relay wrapper that randomly injects failures
///
/// Delegates to an underlying relay but fails operations with probability
/// `failure_rate`. A failed post stores nothing.
#[derive(Clone)]
pub struct ChaoticRouter<R: MessageRouter> {
    inner: R,
    /// Failure rate (0.0 = never fail, 1.0 = always fail)
    failure_rate: f64,
    rng: Arc<Mutex<ChaCha8Rng>>,
    operation_count: Arc<AtomicUsize>,
}

impl<R: MessageRouter> ChaoticRouter<R> {
    /// Create a chaotic wrapper with the default seed.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn new(inner: R, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, DEFAULT_CHAOS_SEED)
    }

    /// Create with explicit seed for reproducible chaos
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn with_seed(inner: R, failure_rate: f64, seed: u64) -> Self {
        assert!(
            (0.0..=1.0).contains(&failure_rate),
            "failure_rate must be between 0.0 and 1.0, got {failure_rate}"
        );

        Self {
            inner,
            failure_rate,
            rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed))),
            operation_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Underlying relay (for checking invariants after chaos).
    pub fn inner(&self) -> &R {
        &self.inner
    }

    /// Total number of relay operations attempted.
    pub fn operation_count(&self) -> usize {
        self.operation_count.load(Ordering::Relaxed)
    }

    fn inject(&self, op: &str) -> Result<(), RouterError> {
        self.operation_count.fetch_add(1, Ordering::Relaxed);

        let fail = {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            rng.gen_bool(self.failure_rate)
        };
        if fail {
            tracing::debug!(op, "injecting relay failure");
            return Err(RouterError::Injected(format!("chaotic {op} failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl<R: MessageRouter> MessageRouter for ChaoticRouter<R> {
    async fn post(
        &self,
        session: SessionId,
        sender: DeviceId,
        seqno: Seqno,
        msg: Bytes,
    ) -> Result<(), RouterError> {
        self.inject("post")?;
        self.inner.post(session, sender, seqno, msg).await
    }

    async fn get(
        &self,
        session: SessionId,
        receiver: DeviceId,
        seqno: Seqno,
        poll: Duration,
    ) -> Result<Vec<Bytes>, RouterError> {
        self.inject("get")?;
        self.inner.get(session, receiver, seqno, poll).await
    }
}
