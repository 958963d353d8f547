//! Read-path visibility of stored versions.

use crate::error::CoreResult;
use crate::resolver::ReadResolver;
use crate::transaction::{FinalStatus, Transaction, TransactionManager};
use crate::types::{CellLocation, Timestamp, TransactionId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Status metadata carried by a stored version.
///
/// Written unresolved by the writer; later stamped with the writer's final
/// status by whoever resolves it first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellStamp {
    /// Transaction that wrote the version.
    pub txn_id: TransactionId,
    /// Final status of the writer, once resolved.
    pub status: Option<FinalStatus>,
}

impl CellStamp {
    /// A stamp nobody has resolved yet.
    #[must_use]
    pub const fn unresolved(txn_id: TransactionId) -> Self {
        Self {
            txn_id,
            status: None,
        }
    }

    /// A resolved stamp.
    #[must_use]
    pub const fn resolved(txn_id: TransactionId, status: FinalStatus) -> Self {
        Self {
            txn_id,
            status: Some(status),
        }
    }
}

fn visible_under(status: FinalStatus, snapshot: Timestamp) -> bool {
    matches!(status, FinalStatus::Committed(ts) if ts <= snapshot)
}

/// Decides visibility of stored versions, feeding the read resolver.
#[derive(Debug, Clone)]
pub struct VisibilityChecker {
    manager: Arc<TransactionManager>,
    resolver: Option<Arc<ReadResolver>>,
}

impl VisibilityChecker {
    /// Creates a checker. Without a resolver every unresolved stamp is
    /// resolved synchronously on each read.
    pub fn new(manager: Arc<TransactionManager>, resolver: Option<Arc<ReadResolver>>) -> Self {
        Self { manager, resolver }
    }

    /// Returns true if the version at `location` carrying `stamp` is
    /// visible to `reader`.
    ///
    /// A resolved stamp is trusted. An unresolved one is looked up, and if
    /// the writer turns out to be finished (or abandoned) the version is
    /// queued for stamping.
    pub fn is_visible_version(
        &self,
        reader: &Transaction,
        location: &CellLocation,
        stamp: &CellStamp,
    ) -> CoreResult<bool> {
        if stamp.txn_id == reader.id() {
            return Ok(true);
        }
        if let Some(status) = stamp.status {
            return Ok(visible_under(status, reader.snapshot()));
        }

        let Some(status) = self.manager.status(stamp.txn_id)?.final_status() else {
            return Ok(false);
        };
        if let Some(resolver) = &self.resolver {
            resolver.submit(location.clone(), stamp.txn_id);
        }
        Ok(visible_under(status, reader.snapshot()))
    }
}
