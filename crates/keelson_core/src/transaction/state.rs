//! Caller-side transaction handle.

use crate::types::{Timestamp, TransactionId};

/// Lifecycle of a [`Transaction`] handle, as seen by its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Open for writes.
    Active,
    /// Committed.
    Committed,
    /// Rolled back, failed or lost to expiry.
    Aborted,
}

/// An open transaction.
///
/// Reads through it see the snapshot at its begin timestamp plus its own
/// writes. The handle is owned by one caller; the shared truth lives in the
/// transaction record.
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    state: TransactionState,
    read_only: bool,
    /// Whether an ACTIVE record has been persisted for this transaction.
    persisted: bool,
    commit_ts: Option<Timestamp>,
}

impl Transaction {
    pub(crate) fn new(id: TransactionId, read_only: bool) -> Self {
        Self {
            id,
            state: TransactionState::Active,
            read_only,
            persisted: !read_only,
            commit_ts: None,
        }
    }

    /// Returns the transaction id.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Returns the snapshot timestamp (the begin timestamp).
    #[must_use]
    pub fn snapshot(&self) -> Timestamp {
        self.id.begin_timestamp()
    }

    /// Returns the handle state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Returns true while the transaction can still be committed.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    /// Returns true if the transaction may not write.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Returns the commit timestamp once committed.
    #[must_use]
    pub fn commit_timestamp(&self) -> Option<Timestamp> {
        self.commit_ts
    }

    pub(crate) fn is_persisted(&self) -> bool {
        self.persisted
    }

    pub(crate) fn mark_elevated(&mut self) {
        self.read_only = false;
        self.persisted = true;
    }

    pub(crate) fn mark_committed(&mut self, commit_ts: Timestamp) {
        self.state = TransactionState::Committed;
        self.commit_ts = Some(commit_ts);
    }

    pub(crate) fn mark_aborted(&mut self) {
        self.state = TransactionState::Aborted;
    }
}
