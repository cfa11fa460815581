//! Command line for the native autodetect binary.

use crate::config::ProcessConfig;
use crate::job::JobContext;
use std::process::Stdio;
use tokio::process::Command;

/// Job id used in the process log.
pub const LOG_ID_ARG: &str = "--logid=";
/// Bucket span in seconds.
pub const BUCKET_SPAN_ARG: &str = "--bucketspan=";
/// Latency in seconds.
pub const LATENCY_ARG: &str = "--latency=";
/// Input uses the length-encoded wire format.
pub const LENGTH_ENCODED_INPUT_ARG: &str = "--lengthEncodedInput";
/// Cap on anomaly records per bucket.
pub const MAX_ANOMALY_RECORDS_ARG: &str = "--maxAnomalyRecords=";
/// Name of the time field.
pub const TIME_FIELD_ARG: &str = "--timefield=";
/// Seconds between background state persists.
pub const PERSIST_INTERVAL_ARG: &str = "--persistInterval=";
/// Longest gap between quantile writes, seconds.
pub const MAX_QUANTILE_INTERVAL_ARG: &str = "--maxQuantileInterval=";
/// Skip empty buckets after a gap in the data.
pub const IGNORE_DOWNTIME_ARG: &str = "--ignoreDowntime";

/// Arguments for running `job` under `config`, without the executable.
pub fn autodetect_args(job: &JobContext, config: &ProcessConfig) -> Vec<String> {
    let mut args = vec![format!("{LOG_ID_ARG}{}", job.job_id)];

    if let Some(span) = job.bucket_span_secs {
        args.push(format!("{BUCKET_SPAN_ARG}{span}"));
    }
    if let Some(latency) = job.latency_secs {
        args.push(format!("{LATENCY_ARG}{latency}"));
    }

    args.push(LENGTH_ENCODED_INPUT_ARG.to_string());
    args.push(format!(
        "{MAX_ANOMALY_RECORDS_ARG}{}",
        config.max_anomaly_records
    ));
    args.push(format!("{TIME_FIELD_ARG}{}", job.time_field));

    if let Some(interval) = config.persist_interval_secs {
        args.push(format!("{PERSIST_INTERVAL_ARG}{interval}"));
    }
    if let Some(interval) = config.max_quantile_interval_secs {
        args.push(format!("{MAX_QUANTILE_INTERVAL_ARG}{interval}"));
    }
    if config.ignore_downtime {
        args.push(IGNORE_DOWNTIME_ARG.to_string());
    }

    args.extend(config.extra_args.iter().cloned());
    args
}

/// A ready-to-spawn command with all three standard streams piped.
pub fn autodetect_command(job: &JobContext, config: &ProcessConfig) -> Command {
    let mut command = Command::new(&config.executable);
    command
        .args(autodetect_args(job, config))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    command
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_job_args() {
        let job = JobContext::new("farequote", ["time", "airline", "responsetime"]);
        let args = autodetect_args(&job, &ProcessConfig::default());
        assert_eq!(
            args,
            vec![
                "--logid=farequote",
                "--lengthEncodedInput",
                "--maxAnomalyRecords=500",
                "--timefield=time",
            ]
        );
    }

    #[test]
    fn optional_args_in_order() {
        let job = JobContext::new("farequote", ["ts", "airline"])
            .with_bucket_span(3600)
            .with_latency(300)
            .with_time_field("ts");
        let config = ProcessConfig {
            persist_interval_secs: Some(10_800),
            max_quantile_interval_secs: Some(21_600),
            ignore_downtime: true,
            extra_args: vec!["--info".to_string()],
            ..ProcessConfig::default()
        };

        let args = autodetect_args(&job, &config);
        assert_eq!(
            args,
            vec![
                "--logid=farequote",
                "--bucketspan=3600",
                "--latency=300",
                "--lengthEncodedInput",
                "--maxAnomalyRecords=500",
                "--timefield=ts",
                "--persistInterval=10800",
                "--maxQuantileInterval=21600",
                "--ignoreDowntime",
                "--info",
            ]
        );
    }
}
