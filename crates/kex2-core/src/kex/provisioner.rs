//! Provisioner: the already-trusted device, driving the handshake.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Notify as Wakeup;

use crate::{
    env::Environment,
    error::{ApplicationError, KexError},
    kex::{
        ProvisionerCallbacks,
        base::{FirstContact, KexArgs, abandon, finish, first_contact},
    },
    router::MessageRouter,
    rpc::{Call, Method, Notify, Reply, RpcEndpoint, RpcHandler},
};

/// Waits for the provisionee's `KexStart`. Serves no calls.
struct ProvisionerServer {
    start: Arc<Wakeup>,
}

#[async_trait]
impl RpcHandler for ProvisionerServer {
    async fn call(&self, call: Call) -> Result<Reply, ApplicationError> {
        tracing::warn!(method = ?call.method(), "provisioner received a call");
        Err(ApplicationError::new(format!("unsupported call: {:?}", call.method())))
    }

    async fn notify(&self, notify: Notify) {
        match notify {
            Notify::KexStart => self.start.notify_one(),
        }
    }

    fn supports(&self, _method: Method) -> bool {
        false
    }
}

/// Run the provisioner side of a pairing.
///
/// Listens on the initial secret (if any) for the provisionee's `KexStart`,
/// or opens a fresh connection on a secret delivered on the side channel.
/// Once connected, drives the handshake from a background task raced against
/// cancellation: v2 first if the application supports it, v1 otherwise or
/// when the peer refuses v2.
///
/// Cancellation wins whenever it was requested before this function consumed
/// the handshake result, even if the final reply had already arrived.
///
/// # Errors
///
/// - `KexError::InvalidDeviceId` before any I/O if the device ID is nil
/// - `KexError::Canceled` or `KexError::TimedOut`
/// - `KexError::Application` if a local callback or the peer's handler failed
/// - `KexError::Unsupported` if the peer refused a v1 call
/// - `KexError::Conn` or `KexError::Protocol` if the channel failed
pub async fn run_provisioner<R, E, A>(mut args: KexArgs<R, E>, app: A) -> Result<(), KexError>
where
    R: MessageRouter,
    E: Environment,
    A: ProvisionerCallbacks,
{
    args.check_device_id()?;
    if args.cancel.is_cancelled() {
        return Err(KexError::Canceled);
    }

    let start = Arc::new(Wakeup::new());
    let server = Arc::new(ProvisionerServer { start: Arc::clone(&start) });

    let held = args.secret.take();
    let listener = held.clone().map(|secret| args.open_endpoint(secret, Arc::clone(&server)));
    tracing::debug!(
        device = %args.device_id,
        listening = listener.is_some(),
        "provisioner started"
    );

    let contact = first_contact(&mut args, &start, listener.as_ref(), held.as_ref()).await;

    let endpoint = match (contact, listener) {
        (FirstContact::Listener, Some(endpoint)) => {
            tracing::debug!(session = %endpoint.conn().session_id(), "peer started on our secret");
            endpoint
        },
        (FirstContact::Secret(secret), listener) => {
            abandon(listener);
            let endpoint = args.open_endpoint(secret, server);
            tracing::debug!(session = %endpoint.conn().session_id(), "switched to late secret");
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

    let endpoint = Arc::new(endpoint);
    let mut task = tokio::spawn(handshake(Arc::clone(&endpoint), app));

    let result = tokio::select! {
        biased;
        () = args.cancel.cancelled() => Err(KexError::Canceled),
        joined = &mut task => match joined {
            Ok(result) => result,
            Err(err) => Err(KexError::Protocol(format!("handshake task failed: {err}"))),
        },
        () = args.env.sleep(args.timeout) => Err(KexError::timed_out_after(args.timeout)),
    };
    let result = if args.cancel.is_cancelled() { Err(KexError::Canceled) } else { result };

    task.abort();
    finish(&endpoint).await;

    match &result {
        Ok(()) => tracing::info!(device = %args.device_id, "provisioner paired"),
        Err(err) => tracing::debug!(device = %args.device_id, error = %err, "provisioner failed"),
    }
    result
}

async fn handshake<R, E, A>(endpoint: Arc<RpcEndpoint<R, E>>, app: A) -> Result<(), KexError>
where
    R: MessageRouter,
    E: Environment,
    A: ProvisionerCallbacks,
{
    if app.supports_v2() {
        match handshake_v2(&endpoint, &app).await {
            Err(KexError::Unsupported(method)) => {
                tracing::debug!(?method, "peer refused v2 handshake, falling back to v1");
            },
            result => return result,
        }
    }
    handshake_v1(&endpoint, &app).await
}

async fn handshake_v1<R, E, A>(endpoint: &RpcEndpoint<R, E>, app: &A) -> Result<(), KexError>
where
    R: MessageRouter,
    E: Environment,
    A: ProvisionerCallbacks,
{
    let arg = app.get_hello_arg().await?;
    let res = match endpoint.call(Call::Hello(arg)).await? {
        Reply::Hello(res) => res,
        other => return Err(KexError::Protocol(format!("unexpected reply to hello: {other:?}"))),
    };

    let sig = app.counter_sign(res).await?;
    match endpoint.call(Call::DidCounterSign(sig)).await? {
        Reply::DidCounterSign => Ok(()),
        other => Err(KexError::Protocol(format!("unexpected reply to counter-sign: {other:?}"))),
    }
}

async fn handshake_v2<R, E, A>(endpoint: &RpcEndpoint<R, E>, app: &A) -> Result<(), KexError>
where
    R: MessageRouter,
    E: Environment,
    A: ProvisionerCallbacks,
{
    let arg = app.get_hello2_arg().await?;
    let res = match endpoint.call(Call::Hello2(arg)).await? {
        Reply::Hello2(res) => res,
        other => return Err(KexError::Protocol(format!("unexpected reply to hello2: {other:?}"))),
    };

    let arg = app.counter_sign2(res).await?;
    match endpoint.call(Call::DidCounterSign2(arg)).await? {
        Reply::DidCounterSign2 => Ok(()),
        other => Err(KexError::Protocol(format!("unexpected reply to counter-sign2: {other:?}"))),
    }
}
