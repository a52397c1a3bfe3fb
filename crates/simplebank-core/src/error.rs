use thiserror::Error;

use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("invalid argument: {0}")]
    Validation(String),
    #[error("commit failed: {0}")]
    Commit(#[source] StorageError),
    /// The unit of work failed and the rollback failed too; the transaction
    /// may have been left in an indeterminate state.
    #[error("tx error: {cause}, rb err: {rollback}")]
    Rollback {
        cause: Box<LedgerError>,
        #[source]
        rollback: StorageError,
    },
}

/// Coarse classification for the boundary layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Validation,
    Cancelled,
    Internal,
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::Storage(e) if e.is_not_found() => ErrorKind::NotFound,
            LedgerError::Storage(e) if e.is_cancelled() => ErrorKind::Cancelled,
            LedgerError::Storage(_) => ErrorKind::Internal,
            LedgerError::Validation(_) => ErrorKind::Validation,
            LedgerError::Commit(_) | LedgerError::Rollback { .. } => ErrorKind::Internal,
        }
    }

    pub fn is_indeterminate(&self) -> bool {
        matches!(self, LedgerError::Rollback { .. })
    }
}
