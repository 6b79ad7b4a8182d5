//! Persistence layer for ceres nodes.
//!
//! A single ordered keyspace (one `redb` database file per node) holds
//! documents, references, peer identity records and the node's own key
//! material, namespaced by key prefix. Values are the same canonical
//! encoding used on the wire. Writers get atomic transactions; readers run
//! concurrently against consistent snapshots.

mod error;
mod store;

pub use error::{Result, StoreError};
pub use store::{Store, CONFIG_CERT, CONFIG_KEY, CONFIG_PRIVATE_KEY};
