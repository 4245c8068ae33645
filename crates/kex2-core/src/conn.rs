//! Encrypted, ordered byte stream over a polling relay.
//!
//! The relay only knows "post a blob" and "poll for blobs newer than N". This
//! module layers stream semantics on top: blocking reads with deadlines,
//! writes, and an explicit end-of-stream marker. Every message is sealed under
//! the shared secret and carries an authenticated copy of its routing
//! metadata.
//!
//! # State Machine (per direction)
//!
//! ```text
//! Read:   Open ──EOF marker──> Eof
//!           │
//!           └──any error─────> Failed(err)   (returned on every later read)
//!
//! Write:  Open ──close()─────> Closed        (later writes fail with Eof)
//!           │
//!           └──any error─────> Failed(err)
//! ```
//!
//! # Invariants
//!
//! - Accepted inbound seqnos are exactly 1, 2, 3, ... with no gaps, repeats,
//!   or reordering. Anything else is fatal.
//! - A failed read poisons future writes (a broken inbound channel breaks the
//!   whole connection). Closing the write side does not poison reads, so data
//!   already in flight can still be drained.
//! - At most one read and one write are in flight at a time; a read and a
//!   write may run concurrently.

use std::{
    fmt,
    sync::{Mutex, OnceLock, PoisonError},
    time::Duration,
};

use bytes::{Buf, Bytes, BytesMut};
use kex2_crypto::{NONCE_RANDOM_LEN, Secret, build_nonce, open, seal};
use tokio::sync::Mutex as AsyncMutex;

use crate::{
    env::Environment,
    error::ConnError,
    router::MessageRouter,
    types::{DeviceId, SessionId, Seqno},
    wire::{InnerMsg, OuterMsg},
};

/// Default budget for a single read when no deadline is set.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Connection configuration
#[derive(Debug, Clone)]
pub struct ConnConfig {
    /// Poll budget for each read without a deadline. Zero makes reads
    /// non-blocking.
    pub read_timeout: Duration,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self { read_timeout: DEFAULT_READ_TIMEOUT }
    }
}

#[derive(Debug)]
enum ReadState {
    Open,
    Eof,
    Failed(ConnError),
}

#[derive(Debug)]
struct ReadHalf {
    /// Last accepted inbound seqno
    seqno: Seqno,
    /// Decrypted plaintext not yet handed to the caller
    buffer: BytesMut,
    state: ReadState,
}

impl ReadHalf {
    fn drain_into(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.buffer.len());
        out[..n].copy_from_slice(&self.buffer[..n]);
        self.buffer.advance(n);
        n
    }
}

#[derive(Debug)]
enum WriteState {
    Open,
    Closed,
    Failed(ConnError),
}

#[derive(Debug)]
struct WriteHalf {
    /// Last posted outbound seqno
    seqno: Seqno,
    state: WriteState,
}

/// One endpoint's view of the encrypted channel.
///
/// Created once per pairing attempt. A connection that has failed is never
/// repaired; callers construct a new one (with a new secret, if needed).
pub struct Conn<R, E>
where
    R: MessageRouter,
    E: Environment,
{
    router: R,
    env: E,
    secret: Secret,
    session: SessionId,
    device: DeviceId,
    config: ConnConfig,
    reader: AsyncMutex<ReadHalf>,
    writer: AsyncMutex<WriteHalf>,
    /// Absolute read cutoff, settable while a read is in flight
    deadline: Mutex<Option<E::Instant>>,
    /// First non-EOF read error, visible to the write path without taking the
    /// reader lock
    read_failure: OnceLock<ConnError>,
}

impl<R, E> Conn<R, E>
where
    R: MessageRouter,
    E: Environment,
{
    /// Create a connection for `device` on the session derived from `secret`.
    ///
    /// Performs no I/O.
    pub fn new(router: R, env: E, secret: Secret, device: DeviceId, config: ConnConfig) -> Self {
        let session = SessionId::derive(&secret);
        Self {
            router,
            env,
            secret,
            session,
            device,
            config,
            reader: AsyncMutex::new(ReadHalf {
                seqno: Seqno::ZERO,
                buffer: BytesMut::new(),
                state: ReadState::Open,
            }),
            writer: AsyncMutex::new(WriteHalf { seqno: Seqno::ZERO, state: WriteState::Open }),
            deadline: Mutex::new(None),
            read_failure: OnceLock::new(),
        }
    }

    /// Relay session this connection routes on.
    pub fn session_id(&self) -> SessionId {
        self.session
    }

    /// Local device ID.
    pub fn device_id(&self) -> DeviceId {
        self.device
    }

    /// Read decrypted bytes into `out`.
    ///
    /// Returns the number of bytes copied; `Ok(0)` means end-of-stream (or an
    /// empty `out`). Partial fills are normal, callers loop as with any
    /// stream.
    ///
    /// # Errors
    ///
    /// - Integrity failures (`DecryptionFailed`, `BadMetadata`,
    ///   `WrongSession`, `SelfReceive`, `BadPacketSequence`, `Malformed`)
    /// - `TimedOut` if nothing arrived within the deadline or read timeout
    /// - `WouldBlock` if the read timeout is zero and nothing was queued
    /// - `Router` if the relay's get failed
    ///
    /// The first error is latched. One exception to returning it at once:
    /// plaintext already decoded from messages that arrived before the
    /// failing one is still buffered, and reads drain that buffer before they
    /// start returning the latched error. Once the buffer is empty every read
    /// fails with that same error.
    pub async fn read(&self, out: &mut [u8]) -> Result<usize, ConnError> {
        let mut half = self.reader.lock().await;

        if !half.buffer.is_empty() {
            return Ok(half.drain_into(out));
        }
        if let ReadState::Failed(err) = &half.state {
            return Err(err.clone());
        }
        if matches!(half.state, ReadState::Eof) || out.is_empty() {
            return Ok(0);
        }

        if let Err(err) = self.fill(&mut half).await {
            let err = self.fail_read(&mut half, err);
            if half.buffer.is_empty() {
                return Err(err);
            }
        }

        Ok(half.drain_into(out))
    }

    /// Encrypt and post `buf` as one message.
    ///
    /// An empty `buf` is a no-op; use [`Conn::close`] to signal end-of-stream.
    /// Returns the number of ciphertext bytes handed to the relay.
    ///
    /// # Errors
    ///
    /// - `Eof` after [`Conn::close`]
    /// - The latched read error, if the read side has failed
    /// - `Router` if the relay's post failed
    ///
    /// The first error is latched and returned by every later write.
    pub async fn write(&self, buf: &[u8]) -> Result<usize, ConnError> {
        let mut half = self.writer.lock().await;
        self.check_writable(&mut half)?;

        if buf.is_empty() {
            return Ok(0);
        }

        self.send(&mut half, buf).await
    }

    /// Post the end-of-stream marker and refuse further writes.
    ///
    /// Idempotent: closing an already-closed connection succeeds without I/O.
    ///
    /// # Errors
    ///
    /// - The latched write (or read) error, if the connection already failed
    /// - `Router` if posting the marker failed
    pub async fn close(&self) -> Result<(), ConnError> {
        let mut half = self.writer.lock().await;
        if matches!(half.state, WriteState::Closed) {
            return Ok(());
        }
        self.check_writable(&mut half)?;

        self.send(&mut half, &[]).await?;
        half.state = WriteState::Closed;
        tracing::debug!(session = %self.session, device = %self.device, "connection closed");
        Ok(())
    }

    /// Set or clear the absolute read deadline.
    ///
    /// Takes effect for reads that start after the call. A deadline already
    /// in the past makes the next read time out without touching the relay.
    pub fn set_read_deadline(&self, deadline: Option<E::Instant>) {
        *self.deadline.lock().unwrap_or_else(PoisonError::into_inner) = deadline;
    }

    /// Write deadlines are unsupported: relay posts never long-poll.
    ///
    /// # Errors
    ///
    /// - Always `NotImplemented`
    pub fn set_write_deadline(&self, _deadline: Option<E::Instant>) -> Result<(), ConnError> {
        Err(ConnError::NotImplemented)
    }

    /// Poll the relay once and decode whatever arrives into the read buffer.
    async fn fill(&self, half: &mut ReadHalf) -> Result<(), ConnError> {
        let budget = self.poll_budget()?;
        let expected = half.seqno.next().ok_or(ConnError::SeqnoExhausted)?;
        let messages = self.poll(expected, budget).await?;

        if messages.is_empty() {
            return Err(if budget.is_zero() { ConnError::WouldBlock } else { ConnError::TimedOut });
        }

        for raw in messages {
            let inner = self.open_message(&raw, half.seqno)?;
            half.seqno = inner.seqno;

            if inner.is_eof() {
                tracing::debug!(session = %self.session, seqno = %inner.seqno, "peer closed");
                half.state = ReadState::Eof;
                break;
            }
            half.buffer.extend_from_slice(&inner.payload);
        }

        Ok(())
    }

    /// Remaining time this read may spend polling.
    fn poll_budget(&self) -> Result<Duration, ConnError> {
        let deadline = *self.deadline.lock().unwrap_or_else(PoisonError::into_inner);
        match deadline {
            Some(deadline) => {
                let now = self.env.now();
                if deadline <= now {
                    return Err(ConnError::TimedOut);
                }
                Ok(deadline - now)
            },
            None => Ok(self.config.read_timeout),
        }
    }

    /// Call the relay's get until a message arrives or `budget` is spent.
    ///
    /// The relay may return empty before the requested wait elapses (it can
    /// cap individual polls), so one empty answer is not a timeout.
    async fn poll(&self, expected: Seqno, budget: Duration) -> Result<Vec<Bytes>, ConnError> {
        let start = self.env.now();
        loop {
            let remaining = budget.saturating_sub(self.env.now() - start);
            tracing::trace!(
                session = %self.session,
                seqno = %expected,
                ?remaining,
                "polling relay"
            );

            let messages = self.router.get(self.session, self.device, expected, remaining).await?;
            if !messages.is_empty() || remaining.is_zero() || self.env.now() - start >= budget {
                return Ok(messages);
            }
        }
    }

    /// Authenticate one relay message and check it is next in sequence.
    fn open_message(&self, raw: &[u8], last: Seqno) -> Result<InnerMsg, ConnError> {
        let outer = OuterMsg::decode(raw)?;
        let plaintext = open(&self.secret, &outer.nonce, &outer.payload)?;
        let inner = InnerMsg::decode(&plaintext)?;

        inner.check_matches(&outer)?;
        if inner.session != self.session {
            return Err(ConnError::WrongSession);
        }
        if inner.sender == self.device {
            return Err(ConnError::SelfReceive);
        }

        let expected = last.next().ok_or(ConnError::SeqnoExhausted)?;
        if inner.seqno != expected {
            return Err(ConnError::BadPacketSequence { expected, got: inner.seqno });
        }

        Ok(inner)
    }

    fn fail_read(&self, half: &mut ReadHalf, err: ConnError) -> ConnError {
        if err.is_integrity_failure() {
            tracing::warn!(session = %self.session, error = %err, "rejecting inbound message");
        } else {
            tracing::debug!(session = %self.session, error = %err, "read failed");
        }

        half.state = ReadState::Failed(err.clone());
        let _ = self.read_failure.set(err.clone());
        err
    }

    fn check_writable(&self, half: &mut WriteHalf) -> Result<(), ConnError> {
        match &half.state {
            WriteState::Failed(err) => return Err(err.clone()),
            WriteState::Closed => return Err(ConnError::Eof),
            WriteState::Open => {},
        }

        if let Some(err) = self.read_failure.get() {
            half.state = WriteState::Failed(err.clone());
            return Err(err.clone());
        }

        Ok(())
    }

    async fn send(&self, half: &mut WriteHalf, payload: &[u8]) -> Result<usize, ConnError> {
        match self.post_message(half, payload).await {
            Ok(n) => Ok(n),
            Err(err) => {
                tracing::debug!(session = %self.session, error = %err, "write failed");
                half.state = WriteState::Failed(err.clone());
                Err(err)
            },
        }
    }

    async fn post_message(&self, half: &mut WriteHalf, payload: &[u8]) -> Result<usize, ConnError> {
        let seqno = half.seqno.next().ok_or(ConnError::SeqnoExhausted)?;

        let inner = InnerMsg {
            sender: self.device,
            session: self.session,
            seqno,
            payload: payload.to_vec(),
        };

        let mut random_prefix = [0u8; NONCE_RANDOM_LEN];
        self.env.random_bytes(&mut random_prefix);
        let nonce = build_nonce(random_prefix, seqno.value());

        let outer = OuterMsg {
            sender: self.device,
            session: self.session,
            seqno,
            nonce,
            payload: seal(&self.secret, &nonce, &inner.encode()?),
        };
        let ciphertext_len = outer.payload.len();

        self.router.post(self.session, self.device, seqno, Bytes::from(outer.encode()?)).await?;
        half.seqno = seqno;

        tracing::trace!(session = %self.session, %seqno, len = payload.len(), "posted message");
        Ok(ciphertext_len)
    }
}

impl<R, E> fmt::Debug for Conn<R, E>
where
    R: MessageRouter,
    E: Environment,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("session", &self.session)
            .field("device", &self.device)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
