//! Core type definitions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A timestamp handed out by the timestamp oracle.
///
/// Timestamps are strictly increasing and never reused. They order both
/// transaction starts and commits.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Creates a timestamp.
    #[must_use]
    pub const fn new(ts: u64) -> Self {
        Self(ts)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ts:{}", self.0)
    }
}

/// Unique identifier for a transaction.
///
/// A transaction is identified by its begin timestamp, so ids are unique
/// and monotonically assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Creates a transaction ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the id of the transaction that began at `ts`.
    #[must_use]
    pub const fn from_begin(ts: Timestamp) -> Self {
        Self(ts.0)
    }

    /// Returns the begin timestamp this id was derived from.
    #[must_use]
    pub const fn begin_timestamp(self) -> Timestamp {
        Timestamp(self.0)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

/// Identifier for a table (a key range family in the substrate).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableId(pub u32);

impl TableId {
    /// Creates a table ID.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tbl:{}", self.0)
    }
}

/// Where a stored cell version lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CellLocation {
    /// Table the cell belongs to.
    pub table: TableId,
    /// Encoded row key.
    pub row_key: Vec<u8>,
}

impl CellLocation {
    /// Creates a cell location.
    pub fn new(table: TableId, row_key: impl Into<Vec<u8>>) -> Self {
        Self {
            table,
            row_key: row_key.into(),
        }
    }
}

impl fmt::Display for CellLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/", self.table)?;
        for b in &self.row_key {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Address of the partition currently serving a key range.
///
/// The generation changes whenever the partition moves or splits, so a
/// stale address can be told apart from a fresh one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionAddress {
    /// Partition (region) name.
    pub partition: String,
    /// Server currently hosting the partition.
    pub server: String,
    /// Routing generation.
    pub generation: u64,
}

impl fmt::Display for PartitionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}#{}", self.partition, self.server, self.generation)
    }
}
