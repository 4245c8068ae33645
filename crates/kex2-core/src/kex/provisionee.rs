//! Provisionee: the new device, answering the handshake.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Notify as Wakeup, mpsc};

use crate::{
    env::Environment,
    error::{ApplicationError, KexError},
    kex::{
        ProvisioneeCallbacks,
        base::{FirstContact, KexArgs, abandon, finish, first_contact},
    },
    router::MessageRouter,
    rpc::{Call, Method, Notify, Reply, RpcEndpoint, RpcHandler},
};

/// Serves the provisioner's calls and reports when the handshake is over.
struct ProvisioneeServer<A> {
    app: A,
    /// Woken when a Hello arrives
    start: Arc<Wakeup>,
    /// First terminal outcome of the handshake
    done: mpsc::Sender<Result<(), KexError>>,
}

#[async_trait]
impl<A: ProvisioneeCallbacks> RpcHandler for ProvisioneeServer<A> {
    async fn call(&self, call: Call) -> Result<Reply, ApplicationError> {
        match call {
            Call::Hello(arg) => {
                self.start.notify_one();
                self.app.handle_hello(arg).await.map(Reply::Hello)
            },
            Call::DidCounterSign(sig) => {
                self.app.handle_did_counter_sign(sig).await.map(|()| Reply::DidCounterSign)
            },
            Call::Hello2(arg) => {
                self.start.notify_one();
                self.app.handle_hello2(arg).await.map(Reply::Hello2)
            },
            Call::DidCounterSign2(arg) => {
                self.app.handle_did_counter_sign2(arg).await.map(|()| Reply::DidCounterSign2)
            },
        }
    }

    async fn notify(&self, notify: Notify) {
        tracing::debug!(?notify, "provisionee ignoring notification");
    }

    fn supports(&self, method: Method) -> bool {
        match method {
            Method::Hello | Method::DidCounterSign => true,
            Method::Hello2 | Method::DidCounterSign2 => self.app.supports_v2(),
        }
    }

    async fn replied(&self, method: Method, result: &Result<Reply, ApplicationError>) {
        let outcome = match (method, result) {
            (_, Err(err)) => Err(KexError::Application(err.clone())),
            (Method::DidCounterSign | Method::DidCounterSign2, Ok(_)) => Ok(()),
            (Method::Hello | Method::Hello2, Ok(_)) => return,
        };
        let _ = self.done.try_send(outcome);
    }
}

/// Tell a provisioner listening on this session that we are here.
async fn announce<R, E>(endpoint: &RpcEndpoint<R, E>) -> Result<(), KexError>
where
    R: MessageRouter,
    E: Environment,
{
    tracing::debug!(session = %endpoint.conn().session_id(), "announcing kex start");
    endpoint.notify(Notify::KexStart).await
}

/// Run the provisionee side of a pairing.
///
/// Listens on the initial secret (if any) for the provisioner's Hello, or
/// switches to a secret delivered on the side channel. Every connection
/// opened is announced with `KexStart`, so a provisioner already listening on
/// the same secret starts the handshake. Returns once the provisioner's
/// counter-signature has been accepted and acknowledged.
///
/// # Errors
///
/// - `KexError::InvalidDeviceId` before any I/O if the device ID is nil
/// - `KexError::Canceled` or `KexError::TimedOut`
/// - `KexError::Application` if a callback failed
/// - `KexError::Conn` or `KexError::Protocol` if the channel failed
pub async fn run_provisionee<R, E, A>(mut args: KexArgs<R, E>, app: A) -> Result<(), KexError>
where
    R: MessageRouter,
    E: Environment,
    A: ProvisioneeCallbacks,
{
    args.check_device_id()?;
    if args.cancel.is_cancelled() {
        return Err(KexError::Canceled);
    }

    let start = Arc::new(Wakeup::new());
    let (done, mut done_rx) = mpsc::channel(1);
    let server = Arc::new(ProvisioneeServer { app, start: Arc::clone(&start), done });

    let held = args.secret.take();
    let listener = held.clone().map(|secret| args.open_endpoint(secret, Arc::clone(&server)));
    tracing::debug!(
        device = %args.device_id,
        listening = listener.is_some(),
        "provisionee started"
    );

    if let Some(endpoint) = &listener {
        if let Err(err) = announce(endpoint).await {
            abandon(listener);
            return Err(err);
        }
    }

    let contact = first_contact(&mut args, &start, listener.as_ref(), held.as_ref()).await;

    let endpoint = match (contact, listener) {
        (FirstContact::Listener, Some(endpoint)) => {
            tracing::debug!(session = %endpoint.conn().session_id(), "hello on initial secret");
            endpoint
        },
        (FirstContact::Secret(secret), listener) => {
            abandon(listener);
            let endpoint = args.open_endpoint(secret, Arc::clone(&server));
            tracing::debug!(session = %endpoint.conn().session_id(), "switched to late secret");

            if let Err(err) = announce(&endpoint).await {
                finish(&endpoint).await;
                return Err(err);
            }
            endpoint
        },
        (FirstContact::Listener | FirstContact::Failed(_), None) => {
            return Err(KexError::Protocol("first contact without a listener".to_string()));
        },
        (FirstContact::Failed(err), listener) => {
            abandon(listener);
            return Err(err);
        },
        (FirstContact::Canceled, listener) => {
            abandon(listener);
            return Err(KexError::Canceled);
        },
        (FirstContact::TimedOut, listener) => {
            abandon(listener);
            return Err(KexError::timed_out_after(args.timeout));
        },
    };

    let result = tokio::select! {
        biased;
        Some(outcome) = done_rx.recv() => outcome,
        () = args.cancel.cancelled() => Err(KexError::Canceled),
        err = endpoint.terminated() => Err(err),
        () = args.env.sleep(args.timeout) => Err(KexError::timed_out_after(args.timeout)),
    };

    finish(&endpoint).await;

    match &result {
        Ok(()) => tracing::info!(device = %args.device_id, "provisionee paired"),
        Err(err) => tracing::debug!(device = %args.device_id, error = %err, "provisionee failed"),
    }
    result
}
