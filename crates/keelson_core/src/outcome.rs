//! Per-row write outcomes.
//!
//! Every row submitted to the substrate comes back with exactly one
//! [`WriteOutcome`]. The set of outcomes is closed; what the write pipeline
//! does with a row depends only on three properties of the outcome's
//! [`OutcomeCode`]:
//!
//! | code                | can_retry | should_cancel | refresh_cache |
//! |---------------------|-----------|---------------|---------------|
//! | `Success`           |           |               |               |
//! | `Partial`           | yes       |               |               |
//! | `NotRun`            | yes       |               |               |
//! | `WrongRegion`       | yes       |               | yes           |
//! | `NotServingRegion`  | yes       |               | yes           |
//! | `RegionTooBusy`     | yes       |               |               |
//! | `PipelineTooBusy`   | yes       |               |               |
//! | `IndexNotSetup`     |           |               |               |
//! | `Interrupted`       |           | yes           |               |
//! | `WriteConflict`     |           | yes           |               |
//! | `Constraint(_)`     |           |               |               |

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of a violated constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConstraintKind {
    /// Duplicate primary key.
    PrimaryKey,
    /// Duplicate value in a unique index.
    Unique,
    /// Missing parent row.
    ForeignKey,
    /// CHECK expression evaluated to false.
    Check,
    /// NULL written to a NOT NULL column.
    NotNull,
}

impl ConstraintKind {
    /// Returns the stable error code used in bad-record files.
    #[must_use]
    pub const fn error_code(self) -> &'static str {
        match self {
            Self::PrimaryKey => "PRIMARY_KEY",
            Self::Unique => "UNIQUE",
            Self::ForeignKey => "FOREIGN_KEY",
            Self::Check => "CHECK",
            Self::NotNull => "NOT_NULL",
        }
    }
}

/// Which constraint was violated, and on which columns.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConstraintContext {
    /// Constraint name.
    pub constraint: String,
    /// Table the constraint is declared on.
    pub table: Option<String>,
    /// Constrained columns.
    pub columns: Vec<String>,
}

impl ConstraintContext {
    /// Creates a context for `constraint` on `table(columns...)`.
    pub fn new<I, S>(constraint: impl Into<String>, table: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            constraint: constraint.into(),
            table: Some(table.into()),
            columns: columns.into_iter().map(Into::into).collect(),
        }
    }
}

impl fmt::Display for ConstraintContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "constraint {}", self.constraint)?;
        if let Some(table) = &self.table {
            write!(f, " on {table}({})", self.columns.join(", "))?;
        }
        Ok(())
    }
}

/// A constraint violation reported for one row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintViolation {
    /// What kind of constraint failed.
    pub kind: ConstraintKind,
    /// Human-readable message from the substrate.
    pub message: Option<String>,
    /// Structured context, when the substrate knows it.
    pub context: Option<ConstraintContext>,
}

/// The tag of a [`WriteOutcome`]. All retry decisions are pure functions of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutcomeCode {
    /// Row written.
    Success,
    /// Row belongs to a batch that was only partly applied.
    Partial,
    /// Row was not attempted because the batch stopped early.
    NotRun,
    /// Row was sent to a partition that does not own its key.
    WrongRegion,
    /// Partition is closed, splitting or moving.
    NotServingRegion,
    /// Partition is overloaded.
    RegionTooBusy,
    /// The server's write pipeline is overloaded.
    PipelineTooBusy,
    /// An index the row must be written to is not ready.
    IndexNotSetup,
    /// The write was interrupted.
    Interrupted,
    /// Another transaction wrote the same row concurrently.
    WriteConflict,
    /// A constraint was violated.
    Constraint(ConstraintKind),
}

impl OutcomeCode {
    /// Returns true if the row may be resubmitted.
    #[must_use]
    pub const fn can_retry(self) -> bool {
        matches!(
            self,
            Self::Partial
                | Self::NotRun
                | Self::WrongRegion
                | Self::NotServingRegion
                | Self::RegionTooBusy
                | Self::PipelineTooBusy
        )
    }

    /// Returns true if the whole batch must be aborted.
    #[must_use]
    pub const fn should_cancel(self) -> bool {
        matches!(self, Self::Interrupted | Self::WriteConflict)
    }

    /// Returns true if routing must be re-resolved before a retry.
    #[must_use]
    pub const fn refresh_cache(self) -> bool {
        matches!(self, Self::WrongRegion | Self::NotServingRegion)
    }

    /// Returns true for [`OutcomeCode::Success`].
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }

    /// Returns true for outcomes signalling overload.
    #[must_use]
    pub const fn is_busy(self) -> bool {
        matches!(self, Self::RegionTooBusy | Self::PipelineTooBusy)
    }

    /// Returns true if the row failed for good without poisoning the batch.
    #[must_use]
    pub const fn is_terminal_reject(self) -> bool {
        !self.is_success() && !self.can_retry() && !self.should_cancel()
    }

    /// Returns the stable upper-case name of the code.
    #[must_use]
    pub const fn error_code(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Partial => "PARTIAL",
            Self::NotRun => "NOT_RUN",
            Self::WrongRegion => "WRONG_REGION",
            Self::NotServingRegion => "NOT_SERVING_REGION",
            Self::RegionTooBusy => "REGION_TOO_BUSY",
            Self::PipelineTooBusy => "PIPELINE_TOO_BUSY",
            Self::IndexNotSetup => "INDEX_NOT_SETUP",
            Self::Interrupted => "INTERRUPTED",
            Self::WriteConflict => "WRITE_CONFLICT",
            Self::Constraint(kind) => kind.error_code(),
        }
    }
}

impl fmt::Display for OutcomeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.error_code())
    }
}

/// The result of writing one row.
///
/// Failure variants carry the substrate's message, when it sent one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteOutcome {
    /// Row written.
    Success,
    /// Batch only partly applied.
    Partial(Option<String>),
    /// Row not attempted.
    NotRun(Option<String>),
    /// Row routed to the wrong partition.
    WrongRegion(Option<String>),
    /// Partition not serving.
    NotServingRegion(Option<String>),
    /// Partition overloaded.
    RegionTooBusy(Option<String>),
    /// Server write pipeline overloaded.
    PipelineTooBusy(Option<String>),
    /// Index not ready.
    IndexNotSetup(Option<String>),
    /// Write interrupted.
    Interrupted(Option<String>),
    /// Concurrent write to the same row.
    WriteConflict(Option<String>),
    /// Constraint violated.
    Constraint(ConstraintViolation),
}

impl WriteOutcome {
    /// Builds a bare outcome for `code`.
    #[must_use]
    pub fn from_code(code: OutcomeCode) -> Self {
        match code {
            OutcomeCode::Success => Self::Success,
            OutcomeCode::Partial => Self::Partial(None),
            OutcomeCode::NotRun => Self::NotRun(None),
            OutcomeCode::WrongRegion => Self::WrongRegion(None),
            OutcomeCode::NotServingRegion => Self::NotServingRegion(None),
            OutcomeCode::RegionTooBusy => Self::RegionTooBusy(None),
            OutcomeCode::PipelineTooBusy => Self::PipelineTooBusy(None),
            OutcomeCode::IndexNotSetup => Self::IndexNotSetup(None),
            OutcomeCode::Interrupted => Self::Interrupted(None),
            OutcomeCode::WriteConflict => Self::WriteConflict(None),
            OutcomeCode::Constraint(kind) => Self::Constraint(ConstraintViolation {
                kind,
                message: None,
                context: None,
            }),
        }
    }

    /// Builds a constraint violation with structured context.
    #[must_use]
    pub fn constraint(kind: ConstraintKind, context: ConstraintContext) -> Self {
        Self::Constraint(ConstraintViolation {
            kind,
            message: None,
            context: Some(context),
        })
    }

    /// Attaches a human-readable message. No-op on [`WriteOutcome::Success`].
    #[must_use]
    pub fn with_message(mut self, text: impl Into<String>) -> Self {
        let text = Some(text.into());
        match &mut self {
            Self::Success => {}
            Self::Partial(m)
            | Self::NotRun(m)
            | Self::WrongRegion(m)
            | Self::NotServingRegion(m)
            | Self::RegionTooBusy(m)
            | Self::PipelineTooBusy(m)
            | Self::IndexNotSetup(m)
            | Self::Interrupted(m)
            | Self::WriteConflict(m) => *m = text,
            Self::Constraint(v) => v.message = text,
        }
        self
    }

    /// Returns the outcome's tag.
    #[must_use]
    pub fn code(&self) -> OutcomeCode {
        match self {
            Self::Success => OutcomeCode::Success,
            Self::Partial(_) => OutcomeCode::Partial,
            Self::NotRun(_) => OutcomeCode::NotRun,
            Self::WrongRegion(_) => OutcomeCode::WrongRegion,
            Self::NotServingRegion(_) => OutcomeCode::NotServingRegion,
            Self::RegionTooBusy(_) => OutcomeCode::RegionTooBusy,
            Self::PipelineTooBusy(_) => OutcomeCode::PipelineTooBusy,
            Self::IndexNotSetup(_) => OutcomeCode::IndexNotSetup,
            Self::Interrupted(_) => OutcomeCode::Interrupted,
            Self::WriteConflict(_) => OutcomeCode::WriteConflict,
            Self::Constraint(v) => OutcomeCode::Constraint(v.kind),
        }
    }

    /// Returns the substrate's message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Success => None,
            Self::Partial(m)
            | Self::NotRun(m)
            | Self::WrongRegion(m)
            | Self::NotServingRegion(m)
            | Self::RegionTooBusy(m)
            | Self::PipelineTooBusy(m)
            | Self::IndexNotSetup(m)
            | Self::Interrupted(m)
            | Self::WriteConflict(m) => m.as_deref(),
            Self::Constraint(v) => v.message.as_deref(),
        }
    }

    /// Returns the constraint context of a violation.
    #[must_use]
    pub fn constraint_context(&self) -> Option<&ConstraintContext> {
        match self {
            Self::Constraint(v) => v.context.as_ref(),
            _ => None,
        }
    }

    /// See [`OutcomeCode::can_retry`].
    #[must_use]
    pub fn can_retry(&self) -> bool {
        self.code().can_retry()
    }

    /// See [`OutcomeCode::should_cancel`].
    #[must_use]
    pub fn should_cancel(&self) -> bool {
        self.code().should_cancel()
    }

    /// See [`OutcomeCode::refresh_cache`].
    #[must_use]
    pub fn refresh_cache(&self) -> bool {
        self.code().refresh_cache()
    }

    /// See [`OutcomeCode::is_success`].
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.code().is_success()
    }

    /// See [`OutcomeCode::is_terminal_reject`].
    #[must_use]
    pub fn is_terminal_reject(&self) -> bool {
        self.code().is_terminal_reject()
    }
}

impl fmt::Display for WriteOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())?;
        if let Some(message) = self.message() {
            write!(f, ": {message}")?;
        }
        if let Some(context) = self.constraint_context() {
            write!(f, " ({context})")?;
        }
        Ok(())
    }
}
