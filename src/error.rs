use thiserror::Error;

use crate::model::Id;

pub type Result<T, E = HistoryError> = std::result::Result<T, E>;

/// Errors surfaced by history operations and the stores behind them.
///
/// Every variant is raised before any write happens or after the enclosing
/// transaction has been rolled back.
#[derive(Debug, Error)]
pub enum HistoryError {
    /// A required field was empty or missing at creation time.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The commit handed to an advance or seed was never persisted.
    #[error("Commit '{0}' has not been saved")]
    UnsavedCommit(Id),

    /// The branch has no head commit to link from.
    #[error("Branch '{0}' has no head commit")]
    MissingHead(Id),

    /// The head moved between read and swap.
    #[error("Head of branch '{branch_id}' changed concurrently (expected '{expected}', found '{found}')")]
    TransactionConflict {
        branch_id: Id,
        expected: Id,
        found: String,
    },

    /// The database aborted the transaction because of a concurrent writer.
    #[error("Transaction on branch '{0}' was aborted by a concurrent update")]
    ConcurrentUpdate(Id),

    /// The store could not complete the transaction in time.
    #[error("Transaction on branch '{0}' timed out")]
    TransactionTimeout(Id),

    #[error("Duplicate id: {0}")]
    DuplicateId(Id),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: Id },

    #[error("Branch '{0}' already has an initial commit")]
    AlreadySeeded(Id),

    #[error("Commit '{commit_id}' is already part of branch '{branch_id}'")]
    CommitAlreadyInHistory { branch_id: Id, commit_id: Id },

    /// The new commit already leads back to the head through next edges.
    #[error("Linking '{head_id}' -> '{commit_id}' would create a cycle of next edges")]
    CycleDetected { head_id: Id, commit_id: Id },

    #[error("Storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl HistoryError {
    pub fn not_found(kind: &'static str, id: impl Into<Id>) -> Self {
        HistoryError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Conflicts and timeouts leave the graph untouched and may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HistoryError::TransactionConflict { .. }
                | HistoryError::ConcurrentUpdate(_)
                | HistoryError::TransactionTimeout(_)
        )
    }

    /// Stable machine-readable name used in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            HistoryError::Validation(_) => "validation",
            HistoryError::UnsavedCommit(_) => "unsaved_commit",
            HistoryError::MissingHead(_) => "missing_head",
            HistoryError::TransactionConflict { .. } => "transaction_conflict",
            HistoryError::ConcurrentUpdate(_) => "transaction_conflict",
            HistoryError::TransactionTimeout(_) => "transaction_timeout",
            HistoryError::DuplicateId(_) => "duplicate_id",
            HistoryError::NotFound { .. } => "not_found",
            HistoryError::AlreadySeeded(_) => "already_seeded",
            HistoryError::CommitAlreadyInHistory { .. } => "commit_already_in_history",
            HistoryError::CycleDetected { .. } => "cycle_detected",
            HistoryError::Storage(_) => "storage",
        }
    }
}
