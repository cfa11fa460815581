//! CLI Entry Point for autodetect-comm
//!
//! Drives one autodetect process by hand:
//! - `run` streams CSV from stdin to a freshly spawned process, flushes,
//!   and prints every result as a JSON line on stdout
//! - `config` prints the effective configuration as TOML
//!
//! Logs go to stderr.
//!
//! # Usage
//!
//! ```bash
//! autodetect-comm run --job-id farequote --fields time,airline,responsetime \
//!     --bucket-span 3600 < farequote.csv
//! AUTODETECT_FLUSH__TIMEOUT_MS=60000 autodetect-comm config
//! ```

use anyhow::{bail, Context, Result};
use autodetect_comm::{
    communicator::AutodetectCommunicator,
    config::AutodetectConfig,
    job::JobContext,
    logging,
    process::NativeProcess,
    protocol::{DataLoadParams, InterimResultsParams, TimeRange},
    results::JsonLinesPersister,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "autodetect-comm")]
#[command(about = "Feed records to an autodetect process and collect its results", long_about = None)]
struct Cli {
    /// Configuration file (missing file means defaults)
    #[arg(long, global = true, default_value = "config/autodetect.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload CSV records from stdin, flush once and close
    Run {
        /// Job identifier
        #[arg(long)]
        job_id: String,

        /// Analysis fields in wire order, matched against the CSV header
        #[arg(long, value_delimiter = ',', required = true)]
        fields: Vec<String>,

        /// Name of the time field
        #[arg(long, default_value = "time")]
        time_field: String,

        /// Bucket span in seconds
        #[arg(long)]
        bucket_span: Option<u64>,

        /// Latency in seconds
        #[arg(long)]
        latency: Option<u64>,

        /// Request interim results with the flush
        #[arg(long)]
        calc_interim: bool,

        /// Reset buckets in `START,END` (epoch seconds) before uploading
        #[arg(long, value_delimiter = ',', num_args = 2)]
        reset: Option<Vec<i64>>,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AutodetectConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Run {
            job_id,
            fields,
            time_field,
            bucket_span,
            latency,
            calc_interim,
            reset,
        } => {
            logging::init_from_config(&config).map_err(anyhow::Error::msg)?;

            let mut job = JobContext::new(job_id, fields).with_time_field(time_field);
            if let Some(secs) = bucket_span {
                job = job.with_bucket_span(secs);
            }
            if let Some(secs) = latency {
                job = job.with_latency(secs);
            }

            let load_params = match reset.as_deref() {
                Some(&[start, end]) => DataLoadParams::reset_buckets(TimeRange::new(start, end)?),
                Some(_) => bail!("--reset takes exactly two values"),
                None => DataLoadParams::none(),
            };
            let interim_params = if calc_interim {
                InterimResultsParams::calc_interim()
            } else {
                InterimResultsParams::none()
            };

            run_job(job, &config, load_params, interim_params).await
        }
    }
}

async fn run_job(
    job: JobContext,
    config: &AutodetectConfig,
    load_params: DataLoadParams,
    interim_params: InterimResultsParams,
) -> Result<()> {
    let records = read_csv_records(std::io::stdin().lock(), &job.analysis_fields)?;
    tracing::info!(records = records.len(), "read input records");

    let process = Arc::new(NativeProcess::spawn(&job, &config.process)?);
    let persister = Arc::new(JsonLinesPersister::new(std::io::stdout()));
    let communicator = AutodetectCommunicator::new(job, process, persister, config)?;

    let outcome = async {
        communicator.write_data(records, &load_params).await?;
        communicator.flush_job(&interim_params, None).await
    }
    .await;

    // Close even when the upload failed so the process does not linger.
    let closed = communicator.close().await;
    let flush_id = outcome?;
    closed?;

    tracing::info!(%flush_id, "job flushed and closed");
    Ok(())
}

/// Read CSV rows, reordering columns to `fields`.
fn read_csv_records<R: std::io::Read>(input: R, fields: &[String]) -> Result<Vec<Vec<String>>> {
    let mut reader = csv::Reader::from_reader(input);
    let headers = reader.headers()?.clone();

    let columns = fields
        .iter()
        .map(|field| {
            headers
                .iter()
                .position(|h| h == field)
                .with_context(|| format!("field '{field}' is not in the CSV header"))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row?;
        records.push(
            columns
                .iter()
                .map(|&i| row.get(i).unwrap_or_default().to_string())
                .collect(),
        );
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_columns_follow_field_order() {
        let csv = "airline,time,responsetime\nAAL,1359450000,132.2\nJZA,1359450001,990.4\n";
        let fields = vec![
            "time".to_string(),
            "airline".to_string(),
            "responsetime".to_string(),
        ];

        let records = read_csv_records(csv.as_bytes(), &fields).unwrap();
        assert_eq!(
            records,
            vec![
                vec!["1359450000", "AAL", "132.2"],
                vec!["1359450001", "JZA", "990.4"],
            ]
        );
    }

    #[test]
    fn missing_csv_column_is_reported() {
        let csv = "time,value\n1,2\n";
        let err = read_csv_records(csv.as_bytes(), &["airline".to_string()]).unwrap_err();
        assert!(err.to_string().contains("airline"));
    }
}
