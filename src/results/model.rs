//! Result objects emitted by the native process.
//!
//! Field names follow the camelCase keys of the process output. Timestamps
//! are epoch seconds on the wire and `DateTime<Utc>` here.

use chrono::{serde::ts_seconds, serde::ts_seconds_option, DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Influencer field name the process uses for the bucket-wide score.
pub const BUCKET_TIME_INFLUENCER: &str = "bucketTime";

/// One bucket of analysed data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bucket {
    /// Start of the bucket the result belongs to.
    #[serde(with = "ts_seconds")]
    pub timestamp: DateTime<Utc>,
    /// Score before normalization.
    #[serde(default)]
    pub raw_anomaly_score: f64,
    /// Normalized anomaly score, 0 to 100.
    #[serde(default)]
    pub anomaly_score: f64,
    /// Highest normalized probability of any record in the bucket.
    #[serde(default)]
    pub max_normalized_probability: f64,
    /// Number of anomaly records in the bucket.
    #[serde(default)]
    pub record_count: u64,
    /// Input records that fell into the bucket.
    #[serde(default)]
    pub event_count: u64,
    /// Set for results calculated before the bucket closed.
    #[serde(default)]
    pub is_interim: bool,
    /// Bucket length in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_span: Option<u64>,
    /// Anomaly records found in the bucket.
    #[serde(default)]
    pub records: Vec<AnomalyRecord>,
    /// Per-influencer scores for the bucket.
    #[serde(default)]
    pub bucket_influencers: Vec<BucketInfluencer>,
}

/// A single anomalous observation inside a bucket.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnomalyRecord {
    /// Detector that produced the record.
    pub detector_index: Option<u32>,
    /// Probability of the observation.
    pub probability: f64,
    /// By field of the detector.
    pub by_field_name: Option<String>,
    /// Value of the by field.
    pub by_field_value: Option<String>,
    /// By field value of the correlated series.
    pub correlated_by_field_value: Option<String>,
    /// Partition field of the detector.
    pub partition_field_name: Option<String>,
    /// Value of the partition field.
    pub partition_field_value: Option<String>,
    /// Over field of a population detector.
    pub over_field_name: Option<String>,
    /// Value of the over field.
    pub over_field_value: Option<String>,
    /// Analysed field.
    pub field_name: Option<String>,
    /// Detector function, e.g. `mean`.
    pub function: Option<String>,
    /// Human readable form of `function`.
    pub function_description: Option<String>,
    /// Typical values for the model.
    pub typical: Vec<f64>,
    /// Observed values.
    pub actual: Vec<f64>,
    /// Contributing causes of a population anomaly.
    pub causes: Vec<AnomalyCause>,
    /// Normalized anomaly score, 0 to 100.
    pub anomaly_score: f64,
    /// Probability normalized to 0 to 100.
    pub normalized_probability: f64,
    /// Normalized probability when first written.
    pub initial_normalized_probability: Option<f64>,
    /// Set for results calculated before the bucket closed.
    pub is_interim: bool,
}

/// Contributing cause of a population anomaly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnomalyCause {
    /// Probability of the observation.
    pub probability: f64,
    /// By field of the detector.
    pub by_field_name: Option<String>,
    /// Value of the by field.
    pub by_field_value: Option<String>,
    /// Partition field of the detector.
    pub partition_field_name: Option<String>,
    /// Value of the partition field.
    pub partition_field_value: Option<String>,
    /// Over field of a population detector.
    pub over_field_name: Option<String>,
    /// Value of the over field.
    pub over_field_value: Option<String>,
    /// Analysed field.
    pub field_name: Option<String>,
    /// Detector function, e.g. `mean`.
    pub function: Option<String>,
    /// Typical values for the model.
    pub typical: Vec<f64>,
    /// Observed values.
    pub actual: Vec<f64>,
}

/// Per-influencer score attached to a bucket.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BucketInfluencer {
    /// Influencer field, or `bucketTime` for the bucket-wide entry.
    pub influencer_field_name: String,
    /// Score before normalization.
    pub raw_anomaly_score: f64,
    /// Probability of the observation.
    pub probability: f64,
    /// Anomaly score when first written.
    pub initial_anomaly_score: f64,
    /// Normalized anomaly score, 0 to 100.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anomaly_score: Option<f64>,
}

impl BucketInfluencer {
    /// Normalized score, falling back to the initial score before renormalization.
    pub fn score(&self) -> f64 {
        self.anomaly_score.unwrap_or(self.initial_anomaly_score)
    }

    /// Whether this is the bucket-wide `bucketTime` entry.
    pub fn is_bucket_time(&self) -> bool {
        self.influencer_field_name == BUCKET_TIME_INFLUENCER
    }
}

/// Score for one influencer value in one bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Influencer {
    /// Start of the bucket the result belongs to.
    #[serde(with = "ts_seconds")]
    pub timestamp: DateTime<Utc>,
    /// Influencer field, or `bucketTime` for the bucket-wide entry.
    pub influencer_field_name: String,
    /// Value of the influencer field.
    #[serde(default)]
    pub influencer_field_value: String,
    /// Probability of the observation.
    #[serde(default)]
    pub probability: f64,
    /// Anomaly score when first written.
    #[serde(default)]
    pub initial_anomaly_score: f64,
    /// Normalized anomaly score, 0 to 100.
    #[serde(default)]
    pub anomaly_score: f64,
    /// Set for results calculated before the bucket closed.
    #[serde(default)]
    pub is_interim: bool,
}

/// Category produced by the categorization analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryDefinition {
    /// Category number, keyed `categoryDefinition` on the wire.
    #[serde(rename = "categoryDefinition")]
    pub category_id: u64,
    /// Terms common to the category.
    #[serde(default)]
    pub terms: String,
    /// Regex matching the category.
    #[serde(default)]
    pub regex: String,
    /// Longest message the category matches.
    #[serde(default)]
    pub max_matching_length: u64,
    /// Example messages.
    #[serde(default)]
    pub examples: Vec<String>,
}

/// Memory usage report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSizeStats {
    /// Memory used by the models.
    pub model_bytes: u64,
    /// Distinct by field values.
    #[serde(default)]
    pub total_by_field_count: u64,
    /// Distinct over field values.
    #[serde(default)]
    pub total_over_field_count: u64,
    /// Distinct partition field values.
    #[serde(default)]
    pub total_partition_field_count: u64,
    /// Buckets skipped for lack of memory.
    #[serde(default)]
    pub bucket_allocation_failures_count: u64,
    /// Memory status reported by the process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_status: Option<String>,
    /// Time the result was written.
    #[serde(default, with = "ts_seconds_option", skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Model bounds for plotting, written when model debug is enabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDebugOutput {
    /// Modelled feature the bounds belong to.
    pub debug_feature: String,
    /// Time the result was written.
    #[serde(default, with = "ts_seconds_option", skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Partition field of the detector.
    #[serde(default)]
    pub partition_field_name: Option<String>,
    /// Value of the partition field.
    #[serde(default)]
    pub partition_field_value: Option<String>,
    /// Over field of a population detector.
    #[serde(default)]
    pub over_field_name: Option<String>,
    /// Value of the over field.
    #[serde(default)]
    pub over_field_value: Option<String>,
    /// By field of the detector.
    #[serde(default)]
    pub by_field_name: Option<String>,
    /// Value of the by field.
    #[serde(default)]
    pub by_field_value: Option<String>,
    /// Lower model bound.
    #[serde(default)]
    pub debug_lower: f64,
    /// Upper model bound.
    #[serde(default)]
    pub debug_upper: f64,
    /// Model median.
    #[serde(default)]
    pub debug_median: f64,
    /// Observed values.
    #[serde(default)]
    pub actual: f64,
}

/// Saved model state descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSnapshot {
    /// Snapshot identifier.
    pub snapshot_id: String,
    /// Time the result was written.
    #[serde(default, with = "ts_seconds_option", skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Free text description.
    #[serde(default)]
    pub description: Option<String>,
    /// Priority when choosing a snapshot to restore.
    #[serde(default)]
    pub restore_priority: i64,
    /// Number of state documents in the snapshot.
    #[serde(default)]
    pub snapshot_doc_count: u64,
    /// Time of the latest input record covered.
    #[serde(default, with = "ts_seconds_option", skip_serializing_if = "Option::is_none")]
    pub latest_record_time_stamp: Option<DateTime<Utc>>,
    /// Time of the latest result covered.
    #[serde(default, with = "ts_seconds_option", skip_serializing_if = "Option::is_none")]
    pub latest_result_time_stamp: Option<DateTime<Utc>>,
}

/// Normalizer state. The payload is opaque to this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quantiles {
    /// Opaque normalizer state.
    pub quantile_state: serde_json::Value,
    /// Time the result was written.
    #[serde(default, with = "ts_seconds_option", skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Echo of a flush request id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushAcknowledgement {
    /// Id sent with the flush request.
    #[serde(rename = "flush")]
    pub id: String,
}

/// A classified output object.
#[derive(Debug, Clone, PartialEq)]
pub enum AutodetectResult {
    /// Echo of a flush request.
    FlushAcknowledgement(FlushAcknowledgement),
    /// Normalizer state.
    Quantiles(Quantiles),
    /// Memory usage report.
    ModelSizeStats(ModelSizeStats),
    /// New or updated category.
    CategoryDefinition(CategoryDefinition),
    /// Saved model state.
    ModelSnapshot(ModelSnapshot),
    /// Model bounds.
    ModelDebugOutput(ModelDebugOutput),
    /// Influencer score.
    Influencer(Influencer),
    /// Closed or interim bucket.
    Bucket(Bucket),
}

impl AutodetectResult {
    /// Short name used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            AutodetectResult::FlushAcknowledgement(_) => "flush_acknowledgement",
            AutodetectResult::Quantiles(_) => "quantiles",
            AutodetectResult::ModelSizeStats(_) => "model_size_stats",
            AutodetectResult::CategoryDefinition(_) => "category_definition",
            AutodetectResult::ModelSnapshot(_) => "model_snapshot",
            AutodetectResult::ModelDebugOutput(_) => "model_debug_output",
            AutodetectResult::Influencer(_) => "influencer",
            AutodetectResult::Bucket(_) => "bucket",
        }
    }
}
