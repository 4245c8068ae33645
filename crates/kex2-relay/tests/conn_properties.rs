//! Property tests for Conn over the in-memory relay.
//!
//! - Round trip: bytes written on one side are read back exactly on the other
//! - Chunk invariance: write and read buffer sizes never change the stream
//! - EOF: close delivers everything before it, then EOF forever
//! - Poll loop: a relay that caps each poll does not cause spurious timeouts
//! - Relay refusals reach the caller as typed router errors

use std::time::Duration;

use kex2_core::{Conn, ConnConfig, ConnError, DeviceId, RouterError, Secret, Seqno, SystemEnv};
use kex2_relay::{MemoryRouter, MemoryRouterConfig};
use proptest::prelude::*;

const ALICE: DeviceId = DeviceId::new([0xA1; 16]);
const BOB: DeviceId = DeviceId::new([0xB0; 16]);

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .unwrap()
}

type MemConn = Conn<MemoryRouter, SystemEnv>;

fn pair(relay: &MemoryRouter, secret: &Secret) -> (MemConn, MemConn) {
    let config = ConnConfig { read_timeout: Duration::from_secs(5) };
    let alice =
        Conn::new(relay.clone(), SystemEnv::new(), secret.clone(), ALICE, config.clone());
    let bob = Conn::new(relay.clone(), SystemEnv::new(), secret.clone(), BOB, config);
    (alice, bob)
}

async fn read_to_end(conn: &MemConn, chunk: usize) -> Result<Vec<u8>, ConnError> {
    let mut out = Vec::new();
    let mut buf = vec![0u8; chunk];
    loop {
        let n = conn.read(&mut buf).await?;
        if n == 0 {
            return Ok(out);
        }
        out.extend_from_slice(&buf[..n]);
    }
}

#[test]
fn prop_round_trip_is_chunk_invariant() {
    proptest!(|(
        key in any::<[u8; 32]>(),
        writes in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..256), 1..16),
        read_chunk in 1usize..512,
    )| {
        let expected: Vec<u8> = writes.concat();

        let received = runtime().block_on(async {
            let relay = MemoryRouter::new();
            let (alice, bob) = pair(&relay, &Secret::from_bytes(key));

            for buf in &writes {
                alice.write(buf).await.unwrap();
            }
            alice.close().await.unwrap();

            read_to_end(&bob, read_chunk).await
        });

        prop_assert_eq!(received, Ok(expected));
    });
}

#[test]
fn prop_large_write_small_reads() {
    proptest!(|(
        data in prop::collection::vec(any::<u8>(), 1..8192),
        read_chunk in 1usize..64,
    )| {
        let received = runtime().block_on(async {
            let relay = MemoryRouter::new();
            let (alice, bob) = pair(&relay, &Secret::from_bytes([9; 32]));

            alice.write(&data).await.unwrap();
            alice.close().await.unwrap();

            read_to_end(&bob, read_chunk).await
        });

        prop_assert_eq!(received, Ok(data));
    });
}

#[tokio::test(start_paused = true)]
async fn both_directions_are_independent() {
    let relay = MemoryRouter::new();
    let (alice, bob) = pair(&relay, &Secret::from_bytes([1; 32]));

    alice.write(b"ping").await.unwrap();
    bob.write(b"pong").await.unwrap();

    let mut buf = [0u8; 8];
    let n = bob.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"ping");
    let n = alice.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"pong");
}

#[tokio::test(start_paused = true)]
async fn eof_is_idempotent_and_reads_survive_local_close() {
    let relay = MemoryRouter::new();
    let (alice, bob) = pair(&relay, &Secret::from_bytes([2; 32]));

    alice.write(b"before close").await.unwrap();
    alice.close().await.unwrap();
    bob.write(b"reply after peer closed").await.unwrap();
    bob.close().await.unwrap();

    assert_eq!(read_to_end(&bob, 4).await.unwrap(), b"before close");
    for _ in 0..3 {
        let mut buf = [0u8; 4];
        assert_eq!(bob.read(&mut buf).await, Ok(0));
    }

    // Alice's closed write side does not stop her draining Bob's data.
    assert_eq!(read_to_end(&alice, 64).await.unwrap(), b"reply after peer closed");
    assert_eq!(alice.write(b"late").await, Err(ConnError::Eof));
}

#[tokio::test(start_paused = true)]
async fn capped_polls_are_retried_until_data_arrives() {
    let relay =
        MemoryRouter::with_config(MemoryRouterConfig { max_poll: Duration::from_millis(10) });
    let (alice, bob) = pair(&relay, &Secret::from_bytes([3; 32]));

    let writer = async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        alice.write(b"slow").await.unwrap();
    };
    let reader = async {
        let mut buf = [0u8; 8];
        let n = bob.read(&mut buf).await.unwrap();
        buf[..n].to_vec()
    };

    let ((), got) = tokio::join!(writer, reader);
    assert_eq!(got, b"slow");
}

#[tokio::test(start_paused = true)]
async fn silence_times_out_then_stays_failed() {
    let relay = MemoryRouter::new();
    let (_alice, bob) = pair(&relay, &Secret::from_bytes([4; 32]));

    let mut buf = [0u8; 8];
    assert_eq!(bob.read(&mut buf).await, Err(ConnError::TimedOut));
    assert_eq!(bob.read(&mut buf).await, Err(ConnError::TimedOut));
}

#[tokio::test(start_paused = true)]
async fn different_secrets_never_meet() {
    let relay = MemoryRouter::new();
    let config = ConnConfig { read_timeout: Duration::from_secs(1) };
    let alice = Conn::new(
        relay.clone(),
        SystemEnv::new(),
        Secret::from_bytes([5; 32]),
        ALICE,
        config.clone(),
    );
    let bob = Conn::new(relay, SystemEnv::new(), Secret::from_bytes([6; 32]), BOB, config);

    assert_ne!(alice.session_id(), bob.session_id());
    alice.write(b"hello?").await.unwrap();

    let mut buf = [0u8; 8];
    assert_eq!(bob.read(&mut buf).await, Err(ConnError::TimedOut));
}

#[tokio::test(start_paused = true)]
async fn reused_sender_slot_is_a_typed_conflict() {
    let relay = MemoryRouter::new();
    let secret = Secret::from_bytes([7; 32]);
    let (first, _bob) = pair(&relay, &secret);
    let (second, _) = pair(&relay, &secret);

    first.write(b"mine").await.unwrap();

    let conflict = ConnError::Router(RouterError::Conflict { expected: Seqno(2), got: Seqno(1) });
    assert_eq!(second.write(b"also mine").await, Err(conflict.clone()));
    assert_eq!(second.write(b"again").await, Err(conflict));
}
