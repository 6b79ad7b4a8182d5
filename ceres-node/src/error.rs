use ceres_proto::rpc::{ErrorKind, RpcError};
use ceres_store::StoreError;
use thiserror::Error;

use crate::crypto::CryptoError;

/// Errors surfaced by a ceres node.
///
/// Validation happens at the boundaries (every RPC handler, every on-disk
/// load) and errors surface to the caller; the only locally recovered
/// failures are heartbeat errors (peer eviction) and duplicate-connection
/// races (the extra connection is closed silently).
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid signature: {0}")]
    SignatureInvalid(String),
    #[error("dialing {addr}: {source}")]
    Dial {
        addr: String,
        source: std::io::Error,
    },
    #[error("deadline exceeded")]
    Timeout,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("node is closed")]
    Closed,
    /// An error reported by the remote end of an RPC.
    #[error("peer reported {kind:?}: {message}")]
    Remote { kind: ErrorKind, message: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Tls(#[from] rustls::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("decoding frame: {0}")]
    Decode(#[from] prost::DecodeError),
}

impl NodeError {
    /// The kind reported on the wire when this error fails an RPC.
    pub(crate) fn wire_kind(&self) -> ErrorKind {
        match self {
            NodeError::NotFound(_) | NodeError::Store(StoreError::NotFound(_)) => {
                ErrorKind::NotFound
            }
            NodeError::InvalidArgument(_) | NodeError::Crypto(_) => ErrorKind::InvalidArgument,
            NodeError::SignatureInvalid(_) => ErrorKind::SignatureInvalid,
            NodeError::Remote { kind, .. } => *kind,
            _ => ErrorKind::Internal,
        }
    }

    /// Rebuilds a typed error from a wire [`RpcError`].
    pub(crate) fn from_wire(err: RpcError) -> Self {
        match err.kind() {
            ErrorKind::NotFound => NodeError::NotFound(err.message),
            ErrorKind::InvalidArgument => NodeError::InvalidArgument(err.message),
            ErrorKind::SignatureInvalid => NodeError::SignatureInvalid(err.message),
            kind => NodeError::Remote {
                kind,
                message: err.message,
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, NodeError>;
