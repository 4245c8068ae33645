//! RPC endpoint: one dispatcher task per connection.
//!
//! The dispatcher owns the read side of the [`Conn`]. Inbound calls are
//! handled sequentially and answered in order; inbound replies complete the
//! matching pending call. Writes (outgoing calls, notifications, replies) go
//! straight to the connection, which serializes them.
//!
//! # Termination
//!
//! The first read or decode error, or peer EOF, ends the dispatcher. The error
//! becomes the endpoint's terminal state: every pending call fails with it,
//! later calls fail immediately, and [`RpcEndpoint::terminated`] resolves.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU32, Ordering},
    },
};

use async_trait::async_trait;
use tokio::{
    sync::{oneshot, watch},
    task::JoinHandle,
};

use crate::{
    conn::Conn,
    env::Environment,
    error::{ApplicationError, ConnError, KexError},
    router::MessageRouter,
    rpc::packet::{Call, FrameReader, Method, Notify, Packet, Reply, RpcFailure},
};

/// Server side of the RPC protocol, supplied by each role.
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    /// Handle an inbound call. The result is sent back to the caller.
    async fn call(&self, call: Call) -> Result<Reply, ApplicationError>;

    /// Handle an inbound notification.
    async fn notify(&self, notify: Notify);

    /// Whether this handler serves `method`. Calls to other methods are
    /// refused with [`RpcFailure::Unsupported`] without reaching
    /// [`RpcHandler::call`] or [`RpcHandler::replied`].
    fn supports(&self, _method: Method) -> bool {
        true
    }

    /// Invoked after the reply to a `method` call has been written.
    async fn replied(&self, _method: Method, _result: &Result<Reply, ApplicationError>) {}
}

type PendingReply = oneshot::Sender<Result<Reply, KexError>>;

struct Shared {
    pending: Mutex<HashMap<u32, PendingReply>>,
    next_seqid: AtomicU32,
    terminal: watch::Sender<Option<KexError>>,
}

impl Shared {
    /// Latch `err` and fail every pending call with it.
    fn terminate(&self, err: KexError) {
        self.terminal.send_if_modified(|terminal| {
            if terminal.is_some() {
                return false;
            }
            *terminal = Some(err.clone());
            true
        });

        let drained: Vec<_> = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            pending.drain().collect()
        };
        for (_, tx) in drained {
            let _ = tx.send(Err(err.clone()));
        }
    }

    fn terminal_error(&self) -> Option<KexError> {
        self.terminal.borrow().clone()
    }
}

/// Bidirectional RPC over one [`Conn`].
pub struct RpcEndpoint<R, E>
where
    R: MessageRouter,
    E: Environment,
{
    conn: Arc<Conn<R, E>>,
    shared: Arc<Shared>,
    dispatcher: JoinHandle<()>,
}

impl<R, E> RpcEndpoint<R, E>
where
    R: MessageRouter,
    E: Environment,
{
    /// Start serving `conn` with `handler`.
    ///
    /// Spawns the dispatcher task; must be called within a tokio runtime.
    pub fn spawn<H: RpcHandler>(conn: Conn<R, E>, handler: Arc<H>) -> Self {
        let conn = Arc::new(conn);
        let (terminal, _) = watch::channel(None);
        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            next_seqid: AtomicU32::new(1),
            terminal,
        });

        let dispatcher = tokio::spawn(dispatch(Arc::clone(&conn), Arc::clone(&shared), handler));

        tracing::debug!(
            session = %conn.session_id(),
            device = %conn.device_id(),
            "rpc endpoint started"
        );
        Self { conn, shared, dispatcher }
    }

    /// Underlying connection.
    pub fn conn(&self) -> &Conn<R, E> {
        &self.conn
    }

    /// Invoke `call` on the peer and wait for its reply.
    ///
    /// # Errors
    ///
    /// - `KexError::Application` if the peer's handler failed
    /// - `KexError::Unsupported` if the peer does not serve the method
    /// - The endpoint's terminal error if the connection failed before the
    ///   reply arrived (or had already failed)
    /// - Any error writing the call
    pub async fn call(&self, call: Call) -> Result<Reply, KexError> {
        let seqid = self.shared.next_seqid.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending.lock().unwrap_or_else(PoisonError::into_inner);
            // Checked under the lock: terminate() latches before draining.
            if let Some(err) = self.shared.terminal_error() {
                return Err(err);
            }
            pending.insert(seqid, tx);
        }

        let method = call.method();
        tracing::debug!(session = %self.conn.session_id(), seqid, ?method, "rpc call");

        let sent = Packet::Call { seqid, call }.encode_frame();
        let sent = match sent {
            Ok(frame) => self.conn.write(&frame).await.map_err(KexError::from),
            Err(err) => Err(err),
        };
        if let Err(err) = sent {
            self.shared.pending.lock().unwrap_or_else(PoisonError::into_inner).remove(&seqid);
            return Err(err);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(self
                .shared
                .terminal_error()
                .unwrap_or_else(|| KexError::Protocol("rpc endpoint shut down".to_string()))),
        }
    }

    /// Send a one-way notification.
    ///
    /// # Errors
    ///
    /// - The endpoint's terminal error, if any
    /// - Any error writing the notification
    pub async fn notify(&self, notify: Notify) -> Result<(), KexError> {
        if let Some(err) = self.shared.terminal_error() {
            return Err(err);
        }

        tracing::debug!(session = %self.conn.session_id(), ?notify, "rpc notify");
        let frame = Packet::Notify(notify).encode_frame()?;
        self.conn.write(&frame).await?;
        Ok(())
    }

    /// Resolves with the error that ended the dispatcher.
    pub async fn terminated(&self) -> KexError {
        let mut terminal = self.shared.terminal.subscribe();
        loop {
            if let Some(err) = terminal.borrow_and_update().clone() {
                return err;
            }
            if terminal.changed().await.is_err() {
                // Sender lives in `shared`, which we hold.
                std::future::pending::<()>().await;
            }
        }
    }

    /// Stop the dispatcher without signalling the peer.
    ///
    /// Used for connections that lost the first-contact race: posting EOF on
    /// a session another connection may take over would collide with its
    /// seqnos.
    pub fn abandon(self) {
        tracing::debug!(session = %self.conn.session_id(), "abandoning rpc endpoint");
        self.dispatcher.abort();
    }

    /// Stop the dispatcher and post EOF to the peer. Idempotent.
    ///
    /// # Errors
    ///
    /// - Any error posting the EOF marker
    pub async fn close(&self) -> Result<(), ConnError> {
        self.dispatcher.abort();
        self.conn.close().await
    }
}

impl<R, E> Drop for RpcEndpoint<R, E>
where
    R: MessageRouter,
    E: Environment,
{
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

async fn dispatch<R, E, H>(conn: Arc<Conn<R, E>>, shared: Arc<Shared>, handler: Arc<H>)
where
    R: MessageRouter,
    E: Environment,
    H: RpcHandler,
{
    let mut reader = FrameReader::new();
    let err = loop {
        let packet = match reader.read_packet(&conn).await {
            Ok(Some(packet)) => packet,
            Ok(None) => break KexError::Conn(ConnError::Eof),
            Err(err) => break err,
        };

        match packet {
            Packet::Call { seqid, call } => {
                let method = call.method();
                tracing::debug!(session = %conn.session_id(), seqid, ?method, "handling rpc call");

                if !handler.supports(method) {
                    tracing::debug!(session = %conn.session_id(), ?method, "refusing rpc call");
                    let refused = Err(RpcFailure::Unsupported(method));
                    let reply = Packet::Reply { seqid, result: refused };
                    if let Err(err) = write_packet(&conn, &reply).await {
                        break err;
                    }
                    continue;
                }

                let result = handler.call(call).await;
                let reply =
                    Packet::Reply { seqid, result: result.clone().map_err(RpcFailure::from) };
                if let Err(err) = write_packet(&conn, &reply).await {
                    break err;
                }
                handler.replied(method, &result).await;
            },
            Packet::Reply { seqid, result } => {
                let tx = {
                    let mut pending = shared.pending.lock().unwrap_or_else(PoisonError::into_inner);
                    pending.remove(&seqid)
                };
                match tx {
                    Some(tx) => {
                        let _ = tx.send(result.map_err(KexError::from));
                    },
                    None => {
                        tracing::warn!(
                            session = %conn.session_id(),
                            seqid,
                            "reply to unknown call"
                        );
                    },
                }
            },
            Packet::Notify(notify) => {
                tracing::debug!(session = %conn.session_id(), ?notify, "handling rpc notify");
                handler.notify(notify).await;
            },
        }
    };

    tracing::debug!(session = %conn.session_id(), error = %err, "rpc dispatcher stopped");
    shared.terminate(err);
}

async fn write_packet<R, E>(conn: &Conn<R, E>, packet: &Packet) -> Result<(), KexError>
where
    R: MessageRouter,
    E: Environment,
{
    let frame = packet.encode_frame()?;
    conn.write(&frame).await?;
    Ok(())
}
