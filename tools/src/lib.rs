//! Tools for running ISAAC nodes: config files, RocksDB storage, the
//! JSON-RPC transport and in-process local networks.
#![allow(missing_docs)]
mod config;
pub mod localnet;
pub mod rpc;
pub mod store;

#[cfg(test)]
mod tests;

pub use config::{AppConfig, SuffrageMember};
