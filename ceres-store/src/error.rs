use thiserror::Error;

/// Errors from the persistence layer.
///
/// Engine failures are surfaced to the caller untouched and never retried
/// internally; [`StoreError::NotFound`] is the only variant callers are
/// expected to branch on.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No record under the requested key.
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Database(#[from] redb::DatabaseError),
    #[error(transparent)]
    Transaction(#[from] redb::TransactionError),
    #[error(transparent)]
    Table(#[from] redb::TableError),
    #[error(transparent)]
    Storage(#[from] redb::StorageError),
    #[error(transparent)]
    Commit(#[from] redb::CommitError),
    /// A stored record no longer decodes; the store is incompatible.
    #[error("decoding stored record: {0}")]
    Decode(#[from] prost::DecodeError),
}

pub type Result<T> = std::result::Result<T, StoreError>;
