//! The ceres node core.
//!
//! A node stores immutable documents keyed by content digest, resolves
//! signed mutable references, and maintains a mesh of mutually
//! authenticated peers over TLS: peers exchange signed [`NodeMeta`]
//! records, dial each other against the certificates embedded in them, and
//! keep connections alive with heartbeats. Clients talk to a node through
//! the same framed RPC listener.
//!
//! [`NodeMeta`]: ceres_proto::NodeMeta

pub mod crypto;

mod client;
mod config;
mod error;
mod node_meta;
mod peers;
mod rpc;
mod server;
mod tls;

pub use client::PeerClient;
pub use config::{NodeConfig, DEFAULT_MAX_PEERS};
pub use error::{NodeError, Result};
pub use node_meta::{node_id, validate as validate_node_meta};
pub use server::Server;
pub use tls::{tls_config_insecure, tls_config_pinned};
