//! In-process relays for Kex2.
//!
//! Implementations of [`kex2_core::MessageRouter`] for tests, simulation, and
//! single-process embedding:
//!
//! - [`MemoryRouter`]: reference store-and-forward relay with long-polling
//! - [`ChaoticRouter`]: seeded random failure injection around any relay
//! - [`TamperingRouter`]: a deterministic adversary that corrupts, reorders,
//!   or drops a message
//!
//! The `kex2-sim` binary pairs two in-process devices over these relays.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod chaotic;
mod memory;
mod tampering;

pub use chaotic::{ChaoticRouter, DEFAULT_CHAOS_SEED};
pub use memory::{DEFAULT_MAX_POLL, MemoryRouter, MemoryRouterConfig};
pub use tampering::{Fault, TamperingRouter, UnknownFault};
