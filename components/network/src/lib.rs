//! Network layer of an ISAAC node.
//!
//! The consensus core talks to peers only through [`Channel`]: one per remote
//! node, kept in the [`NodePool`]. [`Handler`] answers the same requests from
//! local storage, so a transport only has to carry calls from a remote
//! `Channel` to the local `Handler`. [`LocalNetwork`] is such a transport
//! within a single process.

mod channel;
mod handler;
mod local;
mod metrics;
mod pool;

pub use channel::{Channel, ChannelError, NodeInfo};
pub use handler::Handler;
pub use local::{LocalChannel, LocalNetwork, SealFilter};
pub use pool::{NodePool, RemoteNode};
