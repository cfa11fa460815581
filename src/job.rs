//! Job context: what the communicator knows about the job it serves.

use crate::error::{AppResult, AutodetectError};
use serde::{Deserialize, Serialize};

/// Immutable description of one analysis job.
///
/// Supplied at communicator construction and never changed afterwards. The
/// `analysis_fields` order is the positional order every data record must
/// follow on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobContext {
    /// Job identifier, also used as the native process log id
    pub job_id: String,
    /// Fields written for every record, in wire order
    pub analysis_fields: Vec<String>,
    /// Name of the time field inside `analysis_fields`
    #[serde(default = "default_time_field")]
    pub time_field: String,
    /// Bucket span in seconds
    #[serde(default)]
    pub bucket_span_secs: Option<u64>,
    /// How long the process waits for late data, in seconds
    #[serde(default)]
    pub latency_secs: Option<u64>,
}

fn default_time_field() -> String {
    "time".to_string()
}

impl JobContext {
    /// Create a job context with the default time field and no explicit spans.
    pub fn new<I, S>(job_id: impl Into<String>, analysis_fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            job_id: job_id.into(),
            analysis_fields: analysis_fields.into_iter().map(Into::into).collect(),
            time_field: default_time_field(),
            bucket_span_secs: None,
            latency_secs: None,
        }
    }

    /// Set the bucket span
    pub fn with_bucket_span(mut self, secs: u64) -> Self {
        self.bucket_span_secs = Some(secs);
        self
    }

    /// Set the latency
    pub fn with_latency(mut self, secs: u64) -> Self {
        self.latency_secs = Some(secs);
        self
    }

    /// Set the time field name
    pub fn with_time_field(mut self, field: impl Into<String>) -> Self {
        self.time_field = field.into();
        self
    }

    /// Number of values each data record carries.
    pub fn field_count(&self) -> usize {
        self.analysis_fields.len()
    }

    /// Reject contexts the wire protocol cannot serve.
    ///
    /// A job needs at least one analysis field: a one-field frame is how the
    /// process tells a control message from a data record.
    pub fn validate(&self) -> AppResult<()> {
        if self.job_id.trim().is_empty() {
            return Err(AutodetectError::InvalidJob("job id is empty".to_string()));
        }
        if self.analysis_fields.is_empty() {
            return Err(AutodetectError::InvalidJob(format!(
                "job '{}' has no analysis fields",
                self.job_id
            )));
        }
        if self.bucket_span_secs == Some(0) {
            return Err(AutodetectError::InvalidJob(format!(
                "job '{}' has a zero bucket span",
                self.job_id
            )));
        }
        Ok(())
    }
}
