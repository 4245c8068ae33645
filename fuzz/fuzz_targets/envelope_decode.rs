//! Fuzz target for relay envelope decoding
//!
//! Everything the relay hands back is attacker-controlled. Decoding must
//! return an error for garbage and never panic.
//!
//! # Invariants
//!
//! - `OuterMsg::decode` and `InnerMsg::decode` never panic
//! - Anything that decodes re-encodes to a value that decodes to itself

#![no_main]

use kex2_core::wire::{InnerMsg, OuterMsg};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(outer) = OuterMsg::decode(data) {
        let encoded = outer.encode().unwrap();
        assert_eq!(OuterMsg::decode(&encoded).unwrap(), outer);
    }

    if let Ok(inner) = InnerMsg::decode(data) {
        let encoded = inner.encode().unwrap();
        assert_eq!(InnerMsg::decode(&encoded).unwrap(), inner);
    }
});
