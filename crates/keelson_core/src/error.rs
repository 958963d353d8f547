//! Error types for Keelson core.

use crate::outcome::WriteOutcome;
use crate::transaction::TxnState;
use crate::types::TransactionId;
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in Keelson core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] keelson_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Commit or rollback attempted on a transaction that is already final.
    #[error("transaction {txn_id} conflict: record is {state}")]
    Conflict {
        /// The transaction.
        txn_id: TransactionId,
        /// The state the record was found in.
        state: TxnState,
    },

    /// No record exists for the transaction.
    #[error("transaction not found: {txn_id}")]
    TransactionNotFound {
        /// The transaction searched for.
        txn_id: TransactionId,
    },

    /// A row was rejected while writing in strict mode.
    #[error("row {row} rejected: {outcome}")]
    WriteRejected {
        /// Index of the row within its batch.
        row: usize,
        /// The outcome, including any constraint context.
        outcome: WriteOutcome,
    },

    /// A fatal outcome aborted the batch.
    #[error("batch aborted at row {row}: {outcome}")]
    WriteAborted {
        /// Index of the row that reported the fatal outcome.
        row: usize,
        /// The fatal outcome.
        outcome: WriteOutcome,
    },

    /// Retryable rows were still failing after the last attempt.
    #[error("{rows} row(s) still failing after {attempts} attempt(s): {outcome}")]
    RetriesExhausted {
        /// Number of rows given up on.
        rows: usize,
        /// Attempts made.
        attempts: u32,
        /// Last outcome of the first row given up on.
        outcome: WriteOutcome,
    },

    /// Permissive load rejected more rows than it tolerates.
    #[error("{count} bad record(s) exceed tolerance {tolerance}, see {file}")]
    BadRecordToleranceExceeded {
        /// Bad records seen by the reporting worker.
        count: u64,
        /// Configured tolerance.
        tolerance: i64,
        /// Logical bad-record file.
        file: String,
    },

    /// The substrate write call itself failed.
    #[error("substrate error: {message}")]
    Substrate {
        /// Error message.
        message: String,
        /// Whether the call can be repeated.
        retryable: bool,
    },

    /// A persisted record could not be decoded.
    #[error("corrupt record: {message}")]
    Corruption {
        /// Description of the corruption.
        message: String,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },

    /// Configuration rejected by validation.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// What is wrong.
        message: String,
    },

    /// The engine or one of its background services was shut down.
    #[error("engine is shut down")]
    Shutdown,
}

impl CoreError {
    /// Creates a conflict error.
    pub fn conflict(txn_id: TransactionId, state: TxnState) -> Self {
        Self::Conflict { txn_id, state }
    }

    /// Creates a corruption error.
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Creates a retryable substrate error.
    pub fn substrate_retryable(message: impl Into<String>) -> Self {
        Self::Substrate {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable substrate error.
    pub fn substrate_fatal(message: impl Into<String>) -> Self {
        Self::Substrate {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if repeating the operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Substrate { retryable, .. } => *retryable,
            Self::Storage(_) | Self::Io(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::{ConstraintContext, ConstraintKind};

    #[test]
    fn retryable_errors() {
        assert!(CoreError::substrate_retryable("connection reset").is_retryable());
        assert!(!CoreError::substrate_fatal("table dropped").is_retryable());
        assert!(!CoreError::conflict(TransactionId::new(3), TxnState::RolledBack).is_retryable());
        assert!(!CoreError::Shutdown.is_retryable());
    }

    #[test]
    fn rejected_row_reports_constraint() {
        let err = CoreError::WriteRejected {
            row: 5,
            outcome: WriteOutcome::constraint(
                ConstraintKind::Unique,
                ConstraintContext::new("sku_uq", "items", ["sku"]),
            ),
        };
        let text = err.to_string();
        assert!(text.contains("row 5"));
        assert!(text.contains("UNIQUE"));
        assert!(text.contains("sku_uq"));
    }

    #[test]
    fn conflict_display() {
        let err = CoreError::conflict(TransactionId::new(9), TxnState::Committed);
        assert_eq!(err.to_string(), "transaction txn:9 conflict: record is COMMITTED");
    }
}
