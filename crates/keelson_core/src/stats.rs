//! Write statistics.
//!
//! Each pipeline accumulates its own [`WriteStats`]. Workers never share
//! counters; their stats are merged at a join point, in any order and at
//! any depth, with [`WriteStats::merge`] or a [`WriteStatsAggregator`].

use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign};

/// Row counters of one or more write pipelines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WriteStats {
    /// Rows written.
    pub written: u64,
    /// Row resubmissions, one per row per retry.
    pub retried: u64,
    /// Rows given up on after exhausting retries.
    pub thrown: u64,
    /// Row outcomes reporting an overloaded partition or pipeline.
    pub region_too_busy: u64,
    /// Rows that succeeded in an attempt that also had failures.
    pub partial_rows: u64,
    /// Rows resubmitted after an attempt that also had successes.
    pub partial_retried: u64,
    /// Rows rejected in an attempt that also had successes.
    pub partial_ignored: u64,
    /// Rows rejected and routed to the bad-record sink.
    pub ignored: u64,
}

impl WriteStats {
    /// Creates zeroed stats.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `other` into `self`, field by field.
    pub fn merge(&mut self, other: &WriteStats) {
        self.written += other.written;
        self.retried += other.retried;
        self.thrown += other.thrown;
        self.region_too_busy += other.region_too_busy;
        self.partial_rows += other.partial_rows;
        self.partial_retried += other.partial_retried;
        self.partial_ignored += other.partial_ignored;
        self.ignored += other.ignored;
    }

    /// Returns the rows that reached a final disposition.
    pub fn rows_finished(&self) -> u64 {
        self.written + self.thrown + self.ignored
    }

    /// Returns true if nothing was counted.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl AddAssign<&WriteStats> for WriteStats {
    fn add_assign(&mut self, rhs: &WriteStats) {
        self.merge(rhs);
    }
}

impl Add for WriteStats {
    type Output = WriteStats;

    fn add(mut self, rhs: WriteStats) -> WriteStats {
        self.merge(&rhs);
        self
    }
}

impl std::iter::Sum for WriteStats {
    fn sum<I: Iterator<Item = WriteStats>>(iter: I) -> Self {
        iter.fold(WriteStats::default(), Add::add)
    }
}

/// Collects worker stats at a join point.
///
/// Read the totals only once every contributing worker has finished.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WriteStatsAggregator {
    total: WriteStats,
    contributions: usize,
}

impl WriteStatsAggregator {
    /// Creates an empty aggregator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one worker's stats.
    pub fn add(&mut self, stats: &WriteStats) {
        self.total.merge(stats);
        self.contributions += 1;
    }

    /// Rolls a sub-operation's aggregator into this one.
    pub fn absorb(&mut self, child: &WriteStatsAggregator) {
        self.total.merge(&child.total);
        self.contributions += child.contributions;
    }

    /// Returns the number of worker stats added, including absorbed ones.
    pub fn contributions(&self) -> usize {
        self.contributions
    }

    /// Returns the merged totals.
    pub fn total(&self) -> &WriteStats {
        &self.total
    }

    /// Consumes the aggregator, returning the totals.
    pub fn finish(self) -> WriteStats {
        self.total
    }
}

impl Extend<WriteStats> for WriteStatsAggregator {
    fn extend<I: IntoIterator<Item = WriteStats>>(&mut self, iter: I) {
        for stats in iter {
            self.add(&stats);
        }
    }
}
