//! Bad-record sinks for permissive bulk loads.
//!
//! A load names one logical sink per source file, `<stem>.bad` (or
//! `<stem>_<n>.bad` when that is taken). Each worker appends to its own
//! physical file `<logical>.<worker>`, so workers never contend on a file;
//! only counts are merged. Lines have the form `"<ERROR_CODE> <text>\n"`.
//!
//! Names are reserved when a recorder is created; a file only appears once
//! its recorder writes the first bad record.

use crate::error::{CoreError, CoreResult};
use keelson_storage::{SinkDirectory, StorageBackend};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

const SINK_EXTENSION: &str = "bad";

/// Post-load view of a bad-record sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BadRecordSummary {
    /// Location of the logical bad-record file.
    pub file: String,
    /// Bad records counted.
    pub count: u64,
    /// Configured tolerance; negative means unlimited.
    pub tolerance: i64,
    /// Whether the count exceeds the tolerance.
    pub exceeded: bool,
}

impl fmt::Display for BadRecordSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} bad record(s), see {}", self.count, self.file)
    }
}

/// Counts rejected rows and writes them to a sink file.
///
/// The recorder never refuses a record: once the tolerance is exceeded it
/// closes its sink and reports `true`, and the caller is expected to stop.
pub struct BadRecordsRecorder {
    directory: Arc<dyn SinkDirectory>,
    logical_name: String,
    physical_name: String,
    tolerance: i64,
    count: u64,
    sink: Option<Box<dyn StorageBackend>>,
    closed: bool,
}

impl BadRecordsRecorder {
    /// Creates the coordinator-side recorder for `source_name`.
    ///
    /// Reserves an unused logical name in `directory`. No file is created
    /// until the first bad record.
    ///
    /// # Errors
    ///
    /// Fails if the directory cannot be inspected.
    pub fn new(
        directory: Arc<dyn SinkDirectory>,
        source_name: &str,
        tolerance: i64,
    ) -> CoreResult<Self> {
        let stem = source_stem(source_name);
        let logical_name = reserve_first_free(directory.as_ref(), |n| match n {
            0 => format!("{stem}.{SINK_EXTENSION}"),
            n => format!("{stem}_{n}.{SINK_EXTENSION}"),
        })?;
        tracing::debug!(file = %directory.location(&logical_name), tolerance, "bad-record sink reserved");

        Ok(Self {
            physical_name: logical_name.clone(),
            logical_name,
            directory,
            tolerance,
            count: 0,
            sink: None,
            closed: false,
        })
    }

    /// Derives the recorder of one worker.
    ///
    /// The worker starts at count zero and writes to its own physical file.
    ///
    /// # Errors
    ///
    /// Fails if the directory cannot be inspected.
    pub fn for_worker(&self, worker_id: impl fmt::Display) -> CoreResult<Self> {
        let base = format!("{}.{}", self.logical_name, worker_id);
        let physical_name = reserve_first_free(self.directory.as_ref(), |n| match n {
            0 => base.clone(),
            n => format!("{base}_{n}"),
        })?;

        Ok(Self {
            directory: Arc::clone(&self.directory),
            logical_name: self.logical_name.clone(),
            physical_name,
            tolerance: self.tolerance,
            count: 0,
            sink: None,
            closed: false,
        })
    }

    /// Derives a worker recorder with a random worker id.
    ///
    /// # Errors
    ///
    /// Fails if the directory cannot be inspected.
    pub fn for_new_worker(&self) -> CoreResult<Self> {
        self.for_worker(uuid::Uuid::new_v4().simple())
    }

    /// Records a rejected row.
    ///
    /// Returns true if the count now exceeds the tolerance, in which case
    /// the sink has been closed.
    ///
    /// # Errors
    ///
    /// Fails if the sink cannot be created or written. Creation fails if a
    /// file with the reserved name appeared since the reservation.
    pub fn record_bad_record(&mut self, text: &str, error_code: &str) -> CoreResult<bool> {
        self.count += 1;

        if !self.closed {
            let line = format!("{error_code} {}\n", text.replace('\n', "\\n"));
            if self.sink.is_none() {
                self.sink = Some(self.directory.create(&self.physical_name)?);
            }
            if let Some(sink) = self.sink.as_mut() {
                sink.append(line.as_bytes())?;
            }
        }

        let exceeded = self.is_exceeded();
        if exceeded && !self.closed {
            tracing::warn!(
                count = self.count,
                tolerance = self.tolerance,
                file = %self.bad_record_file_name(),
                "bad-record tolerance exceeded"
            );
            self.close()?;
        }
        Ok(exceeded)
    }

    /// Adds another recorder's count to this one. Sink contents are not moved.
    pub fn merge(&mut self, other: &BadRecordsRecorder) {
        self.count += other.count;
    }

    /// Adds a count shipped from another process.
    pub fn merge_summary(&mut self, other: &BadRecordSummary) {
        self.count += other.count;
    }

    /// Returns the number of bad records counted (post-merge on the client).
    pub fn number_of_bad_records(&self) -> u64 {
        self.count
    }

    /// Returns the location of the logical bad-record file.
    pub fn bad_record_file_name(&self) -> String {
        self.directory.location(&self.logical_name)
    }

    /// Returns the location this instance writes to.
    pub fn physical_file_name(&self) -> String {
        self.directory.location(&self.physical_name)
    }

    /// Returns the tolerance; negative means unlimited.
    pub fn tolerance(&self) -> i64 {
        self.tolerance
    }

    /// Returns true once the count exceeds a non-negative tolerance.
    pub fn is_exceeded(&self) -> bool {
        exceeds(self.count, self.tolerance)
    }

    /// Returns true once the sink has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Flushes and closes the sink. Idempotent.
    ///
    /// # Errors
    ///
    /// Fails if the sink cannot be flushed.
    pub fn close(&mut self) -> CoreResult<()> {
        self.closed = true;
        if let Some(mut sink) = self.sink.take() {
            sink.flush()?;
            sink.sync()?;
        }
        Ok(())
    }

    /// Returns the post-load view.
    pub fn summary(&self) -> BadRecordSummary {
        BadRecordSummary {
            file: self.bad_record_file_name(),
            count: self.count,
            tolerance: self.tolerance,
            exceeded: self.is_exceeded(),
        }
    }

    /// Returns the tolerance error for the current count.
    pub fn tolerance_error(&self) -> CoreError {
        CoreError::BadRecordToleranceExceeded {
            count: self.count,
            tolerance: self.tolerance,
            file: self.bad_record_file_name(),
        }
    }
}

impl Drop for BadRecordsRecorder {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(file = %self.physical_name, error = %err, "failed to close bad-record sink");
        }
        self.directory.release(&self.physical_name);
    }
}

impl fmt::Debug for BadRecordsRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BadRecordsRecorder")
            .field("logical_name", &self.logical_name)
            .field("physical_name", &self.physical_name)
            .field("tolerance", &self.tolerance)
            .field("count", &self.count)
            .field("closed", &self.closed)
            .finish()
    }
}

/// Returns true if `count` bad records exceed `tolerance`.
pub fn exceeds(count: u64, tolerance: i64) -> bool {
    u64::try_from(tolerance).is_ok_and(|t| count > t)
}

/// File name of `source` without directories or its last extension.
fn source_stem(source: &str) -> &str {
    let name = source.rsplit(['/', '\\']).next().unwrap_or(source);
    match name.rfind('.') {
        Some(dot) if dot > 0 => &name[..dot],
        _ if name.is_empty() => "input",
        _ => name,
    }
}

fn reserve_first_free(
    directory: &dyn SinkDirectory,
    name: impl Fn(u32) -> String,
) -> CoreResult<String> {
    for n in 0..u32::MAX {
        let candidate = name(n);
        if directory.reserve(&candidate)? {
            return Ok(candidate);
        }
    }
    Err(CoreError::invalid_operation("no free bad-record file name"))
}
