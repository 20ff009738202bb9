use thiserror::Error;

/// Error taxonomy surfaced by every public operation on [`crate::BlockFileStore`].
#[derive(Debug, Error)]
pub enum BlockFileError {
    #[error("file not found")]
    NotFound,

    #[error("file already exists")]
    Exists,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("file is deleted")]
    Deleted,

    #[error("flush already in progress")]
    Busy,

    #[error("conflicting write intention already in progress: {0}")]
    WriteConflict(String),

    #[error("backing store I/O error: {0}")]
    Io(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal invariant violation: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, BlockFileError>;

impl From<redb::DatabaseError> for BlockFileError {
    fn from(e: redb::DatabaseError) -> Self {
        BlockFileError::Io(e.to_string())
    }
}

impl From<redb::TransactionError> for BlockFileError {
    fn from(e: redb::TransactionError) -> Self {
        BlockFileError::Io(e.to_string())
    }
}

impl From<redb::TableError> for BlockFileError {
    fn from(e: redb::TableError) -> Self {
        BlockFileError::Io(e.to_string())
    }
}

impl From<redb::StorageError> for BlockFileError {
    fn from(e: redb::StorageError) -> Self {
        BlockFileError::Io(e.to_string())
    }
}

impl From<redb::CommitError> for BlockFileError {
    fn from(e: redb::CommitError) -> Self {
        BlockFileError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for BlockFileError {
    fn from(e: serde_json::Error) -> Self {
        BlockFileError::Io(e.to_string())
    }
}
