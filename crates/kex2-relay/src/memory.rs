use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use kex2_core::{DeviceId, MessageRouter, RouterError, SessionId, Seqno};
use tokio::sync::Notify;

/// Default cap on a single long-poll.
pub const DEFAULT_MAX_POLL: Duration = Duration::from_secs(5);

/// Relay configuration
#[derive(Debug, Clone)]
pub struct MemoryRouterConfig {
    /// Longest a single get may wait, whatever the caller asks for. Real relays
    /// return early too, so connections must loop.
    pub max_poll: Duration,
}

impl Default for MemoryRouterConfig {
    fn default() -> Self {
        Self { max_poll: DEFAULT_MAX_POLL }
    }
}

/// In-memory store-and-forward relay.
///
/// Messages are kept per `(session, sender)` in seqno order. All state is
/// wrapped in `Arc<Mutex<>>` so clones share one relay; long-pollers are woken
/// through a shared [`Notify`] on every post.
#[derive(Clone)]
pub struct MemoryRouter {
    inner: Arc<Mutex<MemoryRouterInner>>,
    posted: Arc<Notify>,
    config: MemoryRouterConfig,
}

#[derive(Default)]
struct MemoryRouterInner {
    /// Message slot `i` holds seqno `i + 1`
    queues: HashMap<(SessionId, DeviceId), Vec<Bytes>>,
}

impl MemoryRouterInner {
    fn collect(&self, session: SessionId, receiver: DeviceId, seqno: Seqno) -> Vec<Bytes> {
        let skip = seqno.value().saturating_sub(1) as usize;

        let mut senders: Vec<_> = self
            .queues
            .iter()
            .filter(|((s, sender), _)| *s == session && *sender != receiver)
            .collect();
        senders.sort_by_key(|((_, sender), _)| *sender);

        senders.into_iter().flat_map(|(_, queue)| queue.iter().skip(skip).cloned()).collect()
    }
}

impl MemoryRouter {
    /// Create an empty relay with the default configuration.
    pub fn new() -> Self {
        Self::with_config(MemoryRouterConfig::default())
    }

    /// Create an empty relay.
    pub fn with_config(config: MemoryRouterConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryRouterInner::default())),
            posted: Arc::new(Notify::new()),
            config,
        }
    }

    /// Number of messages `sender` has posted on `session`.
    pub fn message_count(&self, session: SessionId, sender: DeviceId) -> usize {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.queues.get(&(session, sender)).map_or(0, Vec::len)
    }

    /// Total messages stored across all sessions.
    pub fn total_message_count(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.queues.values().map(Vec::len).sum()
    }

    fn snapshot(&self, session: SessionId, receiver: DeviceId, seqno: Seqno) -> Vec<Bytes> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).collect(session, receiver, seqno)
    }
}

impl Default for MemoryRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageRouter for MemoryRouter {
    async fn post(
        &self,
        session: SessionId,
        sender: DeviceId,
        seqno: Seqno,
        msg: Bytes,
    ) -> Result<(), RouterError> {
        {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            let queue = inner.queues.entry((session, sender)).or_default();

            let expected = Seqno(queue.len() as u32 + 1);
            if seqno != expected {
                return Err(RouterError::Conflict { expected, got: seqno });
            }
            queue.push(msg);
        }

        tracing::trace!(%session, %sender, %seqno, "relay stored message");
        self.posted.notify_waiters();
        Ok(())
    }

    async fn get(
        &self,
        session: SessionId,
        receiver: DeviceId,
        seqno: Seqno,
        poll: Duration,
    ) -> Result<Vec<Bytes>, RouterError> {
        let deadline = tokio::time::Instant::now() + poll.min(self.config.max_poll);

        loop {
            // Registered before the check so a post in between is not missed.
            let notified = self.posted.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let messages = self.snapshot(session, receiver, seqno);
            if !messages.is_empty() {
                return Ok(messages);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(self.snapshot(session, receiver, seqno));
            }
        }
    }
}
