use std::path::PathBuf;

/// Default cap on connected outbound peers.
pub const DEFAULT_MAX_PEERS: u32 = 10;

/// Configuration for a node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Directory owning the node's key material and database. Created with
    /// mode 0700 on first open.
    pub path: PathBuf,
    /// Cap on concurrently connected outbound peers. Metadata about
    /// additional known peers is still retained.
    pub max_peers: u32,
}

impl NodeConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_peers: DEFAULT_MAX_PEERS,
        }
    }
}
