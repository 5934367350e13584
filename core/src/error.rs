use thiserror::Error;

pub type MonoResult<T> = Result<T, MonoError>;

#[derive(Error, Debug)]
pub enum MonoError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    /// An on-disk structure disagrees with itself. Not recoverable for the
    /// affected table.
    #[error("Consistency error: {0}")]
    Consistency(String),

    /// Another transaction committed an overlapping change first. The
    /// transaction has been rolled back and may be retried.
    #[error("Commit conflict: {0}")]
    CommitConflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl MonoError {
    /// Whether the failed operation can be retried in a fresh transaction.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MonoError::CommitConflict(_))
    }

    /// Whether the error indicates a corrupted structure.
    pub fn is_fatal(&self) -> bool {
        matches!(self, MonoError::Consistency(_))
    }
}

impl From<bincode::Error> for MonoError {
    fn from(e: bincode::Error) -> Self {
        MonoError::Serialization(e.to_string())
    }
}
