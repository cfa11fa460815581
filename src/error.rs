//! Error types for the autodetect communication layer.
//!
//! `AutodetectError` is the single error type returned by every public
//! operation on a communicator or process handle. Callers are expected to
//! match on it rather than inspect message strings:
//!
//! - **`Write`**: an I/O error while writing a record or control message to the
//!   process. Never retried: a partially written frame leaves the input stream
//!   in an unknown state.
//! - **`ProcessDied`**: a flush wait discovered the process had exited. Carries
//!   whatever the process last wrote to its error stream.
//! - **`FlushTimeout`**: the flush acknowledgement did not arrive in time while
//!   the process stayed alive. Also carries the captured error text.
//! - **`ReaderFailed`**: the results stream was corrupt or truncated and the
//!   reader task stopped. Reported by the next flush or close.
//! - **`Closed`**: the communicator has been closed.
//!
//! Two smaller error types live alongside it. `ResultParseError` describes a
//! single result object that could not be understood; those are logged and
//! skipped. `ResultStreamError` is produced by the output frame decoder and
//! ends the reader task.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, AutodetectError>;

/// Errors raised by the communicator and the process handles.
#[derive(Error, Debug)]
pub enum AutodetectError {
    /// Writing to the process input failed.
    #[error("Failed to write to the Autodetect process: {0}")]
    Write(#[source] std::io::Error),

    /// The process is gone; carries its recent error output.
    #[error("Flush failed: Unexpected death of the Autodetect process flushing job. {0}")]
    ProcessDied(String),

    /// No flush acknowledgement arrived in time.
    #[error("Timed out flushing job. {0}")]
    FlushTimeout(String),

    /// The results reader stopped on a stream error.
    #[error("Results reader failed: {0}")]
    ReaderFailed(String),

    /// The communicator was already closed.
    #[error("Communicator is closed")]
    Closed,

    /// A record does not match the job's field count.
    #[error("Record has {actual} fields but the job expects {expected}")]
    InvalidRecord {
        /// Fields the job declares.
        expected: usize,
        /// Fields in the record.
        actual: usize,
    },

    /// A time range ends before it starts.
    #[error("Invalid time range: start {start} is after end {end}")]
    InvalidTimeRange {
        /// Range start, epoch seconds.
        start: i64,
        /// Range end, epoch seconds.
        end: i64,
    },

    /// The job description is unusable.
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// The native process could not be spawned.
    #[error("Failed to start the Autodetect process: {0}")]
    Spawn(#[source] std::io::Error),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration loaded but failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Any other I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for AutodetectError {
    fn from(value: figment::Error) -> Self {
        AutodetectError::Config(Box::new(value))
    }
}

impl AutodetectError {
    /// Whether the process is known to be unusable after this error.
    ///
    /// A timed out flush or a rejected record leaves the process running and
    /// the protocol intact, so the caller may keep using the communicator.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            AutodetectError::FlushTimeout(_)
                | AutodetectError::InvalidRecord { .. }
                | AutodetectError::InvalidTimeRange { .. }
                | AutodetectError::Configuration(_)
        )
    }
}

/// A single result object that could not be turned into a typed result.
#[derive(Error, Debug)]
pub enum ResultParseError {
    /// The first key does not name a known result.
    #[error("unexpected object parsed from output - first field {0}")]
    UnknownObject(String),

    /// The object has no keys.
    #[error("unexpected object parsed from output - empty object")]
    EmptyObject,

    /// The array element is not an object.
    #[error("expected a JSON object but found {0}")]
    NotAnObject(&'static str),

    /// The object has a known key but does not deserialize.
    #[error("invalid {kind}: {source}")]
    InvalidField {
        /// Result kind named by the first key.
        kind: &'static str,
        /// Deserialization failure.
        #[source]
        source: serde_json::Error,
    },

    /// The object is not valid JSON.
    #[error("malformed JSON object: {0}")]
    Malformed(String),
}

/// A failure of the output stream itself; the reader cannot continue.
#[derive(Error, Debug)]
pub enum ResultStreamError {
    /// Reading the output stream failed.
    #[error("I/O error reading results: {0}")]
    Io(#[from] std::io::Error),

    /// The output is not a JSON array of objects.
    #[error("Invalid JSON - {0}")]
    Corrupt(String),
}
