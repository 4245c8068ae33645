//! Run arguments and pieces shared by both roles.

use std::{sync::Arc, time::Duration};

use kex2_crypto::Secret;
use tokio::sync::{Notify as Wakeup, mpsc};

use crate::{
    conn::{Conn, ConnConfig},
    env::Environment,
    error::KexError,
    kex::cancel::Cancellation,
    router::MessageRouter,
    rpc::{RpcEndpoint, RpcHandler},
    types::DeviceId,
};

/// Default bound on a pairing run (and on each connection read within it).
pub const DEFAULT_KEX_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Everything a pairing run needs from its caller.
pub struct KexArgs<R, E> {
    /// Aborts the run with [`KexError::Canceled`]
    pub cancel: Cancellation,
    /// Relay both devices talk through
    pub router: R,
    /// Time and randomness
    pub env: E,
    /// This device's ID; must not be nil
    pub device_id: DeviceId,
    /// Secret known when the run starts, if any
    pub secret: Option<Secret>,
    /// Secret arriving after the run started (e.g. typed in by the user)
    pub secret_rx: Option<mpsc::Receiver<Secret>>,
    /// Bound on first contact, on completion, and on each connection read
    pub timeout: Duration,
}

impl<R, E> KexArgs<R, E>
where
    R: MessageRouter,
    E: Environment,
{
    /// Arguments with no secret, no side channel, no cancellation, and the
    /// default timeout.
    pub fn new(router: R, env: E, device_id: DeviceId) -> Self {
        Self {
            cancel: Cancellation::never(),
            router,
            env,
            device_id,
            secret: None,
            secret_rx: None,
            timeout: DEFAULT_KEX_TIMEOUT,
        }
    }

    /// Set the initial secret.
    #[must_use]
    pub fn with_secret(mut self, secret: Secret) -> Self {
        self.secret = Some(secret);
        self
    }

    /// Set the initial secret from raw bytes, e.g. decoded from a scanned
    /// code.
    ///
    /// # Errors
    ///
    /// - `KexError::BadSecret` if `bytes` is not exactly 32 bytes long
    pub fn with_secret_bytes(self, bytes: &[u8]) -> Result<Self, KexError> {
        let secret = Secret::from_slice(bytes)?;
        Ok(self.with_secret(secret))
    }

    /// Set the channel a late secret arrives on.
    #[must_use]
    pub fn with_secret_channel(mut self, secret_rx: mpsc::Receiver<Secret>) -> Self {
        self.secret_rx = Some(secret_rx);
        self
    }

    /// Set the cancellation signal.
    #[must_use]
    pub fn with_cancel(mut self, cancel: Cancellation) -> Self {
        self.cancel = cancel;
        self
    }

    /// Set the run timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Reject a nil device ID before any I/O.
    pub(crate) fn check_device_id(&self) -> Result<(), KexError> {
        if self.device_id.is_nil() {
            return Err(KexError::InvalidDeviceId);
        }
        Ok(())
    }

    /// Open a connection on `secret` and start serving it with `handler`.
    pub(crate) fn open_endpoint<H: RpcHandler>(
        &self,
        secret: Secret,
        handler: Arc<H>,
    ) -> RpcEndpoint<R, E> {
        let config = ConnConfig { read_timeout: self.timeout };
        let conn =
            Conn::new(self.router.clone(), self.env.clone(), secret, self.device_id, config);
        RpcEndpoint::spawn(conn, handler)
    }
}

/// Which wait source won the first-contact race.
#[derive(Debug)]
pub(crate) enum FirstContact {
    /// Peer reached the listener on the initial secret
    Listener,
    /// A new secret arrived on the side channel
    Secret(Secret),
    /// Caller cancelled
    Canceled,
    /// Timeout elapsed
    TimedOut,
    /// The listener's connection failed before contact
    Failed(KexError),
}

/// Race every first-contact source until one settles the outcome.
///
/// A late secret equal to `held` changes nothing and is skipped; the timeout
/// keeps running across skips.
pub(crate) async fn first_contact<R, E>(
    args: &mut KexArgs<R, E>,
    start: &Wakeup,
    listener: Option<&RpcEndpoint<R, E>>,
    held: Option<&Secret>,
) -> FirstContact
where
    R: MessageRouter,
    E: Environment,
{
    let timeout = args.env.sleep(args.timeout);
    tokio::pin!(timeout);

    loop {
        let contact = tokio::select! {
            biased;
            () = args.cancel.cancelled() => FirstContact::Canceled,
            () = start.notified(), if listener.is_some() => FirstContact::Listener,
            err = listener_failed(listener) => FirstContact::Failed(err),
            secret = late_secret(&mut args.secret_rx) => FirstContact::Secret(secret),
            () = &mut timeout => FirstContact::TimedOut,
        };

        match contact {
            FirstContact::Secret(secret) if held == Some(&secret) => {
                tracing::debug!(device = %args.device_id, "late secret matches the one in use");
            },
            contact => return contact,
        }
    }
}

/// Next secret from the side channel. Pends forever if there is no channel or
/// it has closed.
pub(crate) async fn late_secret(secret_rx: &mut Option<mpsc::Receiver<Secret>>) -> Secret {
    if let Some(rx) = secret_rx {
        if let Some(secret) = rx.recv().await {
            return secret;
        }
    }
    std::future::pending().await
}

/// Terminal error of `listener`. Pends forever if there is none.
pub(crate) async fn listener_failed<R, E>(listener: Option<&RpcEndpoint<R, E>>) -> KexError
where
    R: MessageRouter,
    E: Environment,
{
    match listener {
        Some(endpoint) => endpoint.terminated().await,
        None => std::future::pending().await,
    }
}

/// Release a listener that lost the first-contact race.
pub(crate) fn abandon<R, E>(listener: Option<RpcEndpoint<R, E>>)
where
    R: MessageRouter,
    E: Environment,
{
    if let Some(endpoint) = listener {
        endpoint.abandon();
    }
}

/// Best-effort close once a run is over.
pub(crate) async fn finish<R, E>(endpoint: &RpcEndpoint<R, E>)
where
    R: MessageRouter,
    E: Environment,
{
    let session = endpoint.conn().session_id();
    if let Err(err) = endpoint.close().await {
        tracing::debug!(%session, error = %err, "close after pairing failed");
    }
}
