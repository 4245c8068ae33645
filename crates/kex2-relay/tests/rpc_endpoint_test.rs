//! RPC endpoint behavior over the in-memory relay.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use kex2_core::{
    ApplicationError, Conn, ConnConfig, ConnError, DeviceId, KexError, Secret, SystemEnv,
    rpc::{
        Call, DidCounterSign2Arg, Hello2Arg, Hello2Res, HelloArg, HelloRes, Method, Notify, Reply,
        RpcEndpoint, RpcHandler,
    },
};
use kex2_relay::MemoryRouter;
use tokio::sync::mpsc;

const CLIENT: DeviceId = DeviceId::new([0xC1; 16]);
const SERVER: DeviceId = DeviceId::new([0x5E; 16]);

type Endpoint = RpcEndpoint<MemoryRouter, SystemEnv>;

/// Echoes Hello payloads back reversed, rejects counter-signatures, does not
/// serve `DidCounterSign2`, and records everything it sees.
struct EchoHandler {
    events: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl RpcHandler for EchoHandler {
    async fn call(&self, call: Call) -> Result<Reply, ApplicationError> {
        let _ = self.events.send(format!("call {:?}", call.method()));
        match call {
            Call::Hello(arg) => {
                let mut payload = arg.payload;
                payload.reverse();
                Ok(Reply::Hello(HelloRes(payload)))
            },
            Call::Hello2(arg) => {
                let res = Hello2Res { sig_payload: arg.payload, encryption_key: vec![0xEE] };
                Ok(Reply::Hello2(res))
            },
            Call::DidCounterSign(_) | Call::DidCounterSign2(_) => {
                Err(ApplicationError::new("not accepting signatures"))
            },
        }
    }

    fn supports(&self, method: Method) -> bool {
        method != Method::DidCounterSign2
    }

    async fn notify(&self, notify: Notify) {
        let _ = self.events.send(format!("notify {notify:?}"));
    }

    async fn replied(&self, method: Method, result: &Result<Reply, ApplicationError>) {
        let _ = self.events.send(format!("replied {method:?} ok={}", result.is_ok()));
    }
}

fn endpoint(relay: &MemoryRouter, device: DeviceId) -> (Endpoint, mpsc::UnboundedReceiver<String>) {
    let secret = Secret::from_bytes([7; 32]);
    let config = ConnConfig { read_timeout: Duration::from_secs(30) };
    let conn = Conn::new(relay.clone(), SystemEnv::new(), secret, device, config);
    let (events, rx) = mpsc::unbounded_channel();
    (RpcEndpoint::spawn(conn, Arc::new(EchoHandler { events })), rx)
}

#[tokio::test(start_paused = true)]
async fn call_is_answered_by_peer_handler() {
    let relay = MemoryRouter::new();
    let (client, _) = endpoint(&relay, CLIENT);
    let (_server, mut events) = endpoint(&relay, SERVER);

    let reply = client.call(Call::Hello(HelloArg { payload: vec![1, 2, 3] })).await;
    assert_eq!(reply, Ok(Reply::Hello(HelloRes(vec![3, 2, 1]))));

    assert_eq!(events.recv().await.unwrap(), "call Hello");
    assert_eq!(events.recv().await.unwrap(), "replied Hello ok=true");
}

#[tokio::test(start_paused = true)]
async fn handler_error_reaches_caller() {
    let relay = MemoryRouter::new();
    let (client, _) = endpoint(&relay, CLIENT);
    let (_server, mut events) = endpoint(&relay, SERVER);

    let reply = client.call(Call::DidCounterSign(b"sig".to_vec())).await;
    assert_eq!(
        reply,
        Err(KexError::Application(ApplicationError::new("not accepting signatures")))
    );

    assert_eq!(events.recv().await.unwrap(), "call DidCounterSign");
    assert_eq!(events.recv().await.unwrap(), "replied DidCounterSign ok=false");
}

#[tokio::test(start_paused = true)]
async fn unserved_method_is_refused_without_running_handler() {
    let relay = MemoryRouter::new();
    let (client, _) = endpoint(&relay, CLIENT);
    let (_server, mut events) = endpoint(&relay, SERVER);

    let arg = DidCounterSign2Arg { sig: b"sig".to_vec(), sealed: b"box".to_vec() };
    let reply = client.call(Call::DidCounterSign2(arg)).await;
    assert_eq!(reply, Err(KexError::Unsupported(Method::DidCounterSign2)));

    // The endpoint keeps serving after a refusal.
    let reply = client.call(Call::Hello2(Hello2Arg { payload: vec![4] })).await;
    assert_eq!(
        reply,
        Ok(Reply::Hello2(Hello2Res { sig_payload: vec![4], encryption_key: vec![0xEE] }))
    );
    assert_eq!(events.recv().await.unwrap(), "call Hello2");
    assert_eq!(events.recv().await.unwrap(), "replied Hello2 ok=true");
}

#[tokio::test(start_paused = true)]
async fn sequential_calls_match_their_replies() {
    let relay = MemoryRouter::new();
    let (client, _) = endpoint(&relay, CLIENT);
    let (_server, _) = endpoint(&relay, SERVER);

    for round in 0u8..5 {
        let reply = client.call(Call::Hello(HelloArg { payload: vec![round, 0xFF] })).await;
        assert_eq!(reply, Ok(Reply::Hello(HelloRes(vec![0xFF, round]))));
    }
}

#[tokio::test(start_paused = true)]
async fn notification_is_delivered() {
    let relay = MemoryRouter::new();
    let (client, _) = endpoint(&relay, CLIENT);
    let (_server, mut events) = endpoint(&relay, SERVER);

    client.notify(Notify::KexStart).await.unwrap();
    assert_eq!(events.recv().await.unwrap(), "notify KexStart");
}

#[tokio::test(start_paused = true)]
async fn peer_close_terminates_endpoint() {
    let relay = MemoryRouter::new();
    let (client, _) = endpoint(&relay, CLIENT);
    let (server, _) = endpoint(&relay, SERVER);

    server.close().await.unwrap();

    assert_eq!(client.terminated().await, KexError::Conn(ConnError::Eof));
    assert_eq!(
        client.call(Call::Hello(HelloArg { payload: vec![1] })).await,
        Err(KexError::Conn(ConnError::Eof))
    );
}

#[tokio::test(start_paused = true)]
async fn silent_peer_times_out_pending_call() {
    let relay = MemoryRouter::new();
    let (client, _) = endpoint(&relay, CLIENT);

    let reply = client.call(Call::Hello(HelloArg { payload: vec![1] })).await;
    assert_eq!(reply, Err(KexError::TimedOut));
    assert_eq!(client.terminated().await, KexError::TimedOut);
}
