//! Cryptographic primitives used by the ISAAC consensus engine.
//!
//! The consensus core treats keys, signatures and hashes as opaque values;
//! this crate provides the concrete schemes: ed25519 signatures and
//! Keccak256 content addressing.

pub use fmt::*;

pub mod ed25519;
mod fmt;
pub mod keccak256;
