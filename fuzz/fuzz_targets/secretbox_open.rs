//! Fuzz target for opening sealed payloads
//!
//! A relay can hand back any nonce and ciphertext. Opening must fail cleanly
//! unless the input is an authentic seal under the same secret.
//!
//! # Invariants
//!
//! - `open` never panics, whatever the lengths
//! - A seal opens to its plaintext; flipping any ciphertext byte fails it

#![no_main]

use arbitrary::Arbitrary;
use kex2_crypto::{NONCE_LEN, Secret, open, seal};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input {
    key: [u8; 32],
    nonce: [u8; NONCE_LEN],
    plaintext: Vec<u8>,
    flip_at: u16,
    raw: Vec<u8>,
}

fuzz_target!(|input: Input| {
    let secret = Secret::from_bytes(input.key);

    let _ = open(&secret, &input.nonce, &input.raw);

    let mut sealed = seal(&secret, &input.nonce, &input.plaintext);
    assert_eq!(open(&secret, &input.nonce, &sealed).unwrap(), input.plaintext);

    let at = input.flip_at as usize % sealed.len();
    sealed[at] ^= 0x01;
    assert!(open(&secret, &input.nonce, &sealed).is_err());
});
