//! The autodetect communicator
//!
//! One [`AutodetectCommunicator`] per job. It owns the process handle, the
//! writer for the process input and the reader task for its output, and it
//! is the only way callers talk to the process:
//! - `write_data` uploads records, optionally resetting buckets first
//! - `flush_job` sends a flush and waits for its acknowledgement
//! - `write_update_config_message` and `write_reset_buckets_control_message`
//!   send fire-and-forget control messages
//! - `close` shuts everything down
//!
//! All writes go through a single async mutex, so a record is never
//! interleaved with a control message. A flush holds that mutex only while
//! its messages are written, not while it waits.
//!
//! # Example
//! ```
//! use autodetect_comm::{
//!     communicator::AutodetectCommunicator,
//!     config::AutodetectConfig,
//!     job::JobContext,
//!     process::BlackHoleProcess,
//!     protocol::{DataLoadParams, InterimResultsParams},
//!     results::NoopPersister,
//! };
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let job = JobContext::new("farequote", ["time", "airline", "responsetime"]);
//! let communicator = AutodetectCommunicator::new(
//!     job,
//!     Arc::new(BlackHoleProcess::new()),
//!     Arc::new(NoopPersister),
//!     &AutodetectConfig::default(),
//! )
//! .unwrap();
//!
//! let record = vec!["1359450000".to_string(), "AAL".to_string(), "132.2".to_string()];
//! communicator.write_data(vec![record], &DataLoadParams::none()).await.unwrap();
//! let flush_id = communicator
//!     .flush_job(&InterimResultsParams::none(), None)
//!     .await
//!     .unwrap();
//! assert_eq!(flush_id, "1");
//! communicator.close().await.unwrap();
//! # })
//! ```

use crate::config::{AutodetectConfig, FlushOptions};
use crate::error::{AppResult, AutodetectError};
use crate::job::JobContext;
use crate::process::{AutodetectProcess, ProcessInput};
use crate::protocol::{
    ControlMessage, DataLoadParams, FlushIdGenerator, InterimResultsParams, WireWriter,
};
use crate::results::{
    AckOutcome, AlertObserver, AlertRegistry, ObserverId, ResultsPersister, ResultsReader,
};
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Lifecycle of a communicator. There is no way back to `Open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommunicatorState {
    /// Constructed, nothing written yet
    Open,
    /// At least one write accepted
    Active,
    /// Terminal
    Closed,
}

/// Entry point for talking to one job's analysis process.
pub struct AutodetectCommunicator {
    job: JobContext,
    process: Arc<dyn AutodetectProcess>,
    writer: tokio::sync::Mutex<Option<WireWriter<ProcessInput>>>,
    reader: ResultsReader,
    alerts: Arc<AlertRegistry>,
    flush_ids: FlushIdGenerator,
    state: Mutex<CommunicatorState>,
    flush_options: FlushOptions,
    close_timeout: Duration,
}

impl AutodetectCommunicator {
    /// Take over `process` and start reading its output.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(
        job: JobContext,
        process: Arc<dyn AutodetectProcess>,
        persister: Arc<dyn ResultsPersister>,
        config: &AutodetectConfig,
    ) -> AppResult<Self> {
        job.validate()?;

        let input = process.take_input().ok_or_else(|| stream_taken("input"))?;
        let output = process.take_output().ok_or_else(|| stream_taken("output"))?;

        let alerts = Arc::new(AlertRegistry::new());
        let reader = ResultsReader::spawn(output, &job.job_id, persister, Arc::clone(&alerts));
        let writer = WireWriter::new(input).with_padding(config.flush.padding_bytes);

        info!(
            job_id = %job.job_id,
            fields = job.field_count(),
            "autodetect communicator created"
        );

        Ok(Self {
            job,
            process,
            writer: tokio::sync::Mutex::new(Some(writer)),
            reader,
            alerts,
            flush_ids: FlushIdGenerator::new(),
            state: Mutex::new(CommunicatorState::Open),
            flush_options: config.flush.options(),
            close_timeout: config.process.close_timeout(),
        })
    }

    /// Replace the flush id source, e.g. to make ids predictable.
    pub fn with_flush_id_generator(mut self, flush_ids: FlushIdGenerator) -> Self {
        self.flush_ids = flush_ids;
        self
    }

    /// The job this communicator serves.
    pub fn job(&self) -> &JobContext {
        &self.job
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CommunicatorState {
        *self.state.lock()
    }

    /// Number of alert observers still registered.
    pub fn observer_count(&self) -> usize {
        self.alerts.len()
    }

    fn check_not_closed(&self) -> AppResult<()> {
        if self.state() == CommunicatorState::Closed {
            return Err(AutodetectError::Closed);
        }
        Ok(())
    }

    fn mark_active(&self) {
        let mut state = self.state.lock();
        if *state == CommunicatorState::Open {
            *state = CommunicatorState::Active;
        }
    }

    fn active_writer<'a>(
        &self,
        slot: &'a mut Option<WireWriter<ProcessInput>>,
    ) -> AppResult<&'a mut WireWriter<ProcessInput>> {
        self.check_not_closed()?;
        let writer = slot.as_mut().ok_or(AutodetectError::Closed)?;
        if !self.process.is_alive() {
            return Err(self.process_died(None));
        }
        Ok(writer)
    }

    async fn write_control(&self, message: ControlMessage) -> AppResult<()> {
        let mut slot = self.writer.lock().await;
        let writer = self.active_writer(&mut slot)?;
        writer
            .write_control_message(message)
            .await
            .map_err(AutodetectError::Write)?;
        self.mark_active();
        Ok(())
    }

    /// Upload `records`, first resetting buckets if `params` asks for it.
    ///
    /// Every record must have exactly one value per analysis field. Records
    /// are all checked before anything is written. Returns the number of
    /// records written.
    #[instrument(skip_all, fields(job_id = %self.job.job_id))]
    pub async fn write_data<I>(&self, records: I, params: &DataLoadParams) -> AppResult<usize>
    where
        I: IntoIterator<Item = Vec<String>>,
    {
        self.check_not_closed()?;

        let records: Vec<Vec<String>> = records.into_iter().collect();
        let expected = self.job.field_count();
        if let Some(bad) = records.iter().find(|r| r.len() != expected) {
            return Err(AutodetectError::InvalidRecord {
                expected,
                actual: bad.len(),
            });
        }

        let mut slot = self.writer.lock().await;
        let writer = self.active_writer(&mut slot)?;
        if let Some(range) = params.reset_range {
            writer
                .write_control_message(ControlMessage::ResetBuckets { range })
                .await
                .map_err(AutodetectError::Write)?;
        }
        let written = writer
            .write_records(records)
            .await
            .map_err(AutodetectError::Write)?;
        self.mark_active();

        debug!(written, "wrote data records");
        Ok(written)
    }

    /// Flush the job and wait for the acknowledgement.
    ///
    /// `options` overrides the configured poll interval and timeout. Returns
    /// the acknowledged flush id. A dead process is reported as
    /// [`AutodetectError::ProcessDied`], a live but silent one as
    /// [`AutodetectError::FlushTimeout`]; both carry the process error text.
    #[instrument(skip_all, fields(job_id = %self.job.job_id))]
    pub async fn flush_job(
        &self,
        params: &InterimResultsParams,
        options: Option<FlushOptions>,
    ) -> AppResult<String> {
        self.check_not_closed()?;
        if let Some(reason) = self.reader.failure() {
            return Err(AutodetectError::ReaderFailed(reason));
        }
        if !self.process.is_alive() {
            return Err(self.process_died(None));
        }

        let flush_id = {
            let mut slot = self.writer.lock().await;
            let writer = self.active_writer(&mut slot)?;
            // Taken under the lock so ids reach the wire in issue order.
            let flush_id = self.flush_ids.next_id();
            self.reader.expect_flush(&flush_id);
            if let Err(e) = write_flush(writer, params, &flush_id).await {
                self.reader.forget_flush(&flush_id);
                return Err(AutodetectError::Write(e));
            }
            flush_id
        };
        self.mark_active();
        info!(%flush_id, calc_interim = params.calc_interim, "flush requested");

        let options = options.unwrap_or(self.flush_options);
        let process = Arc::clone(&self.process);
        let outcome = self
            .reader
            .wait_for_flush(&flush_id, options, || process.is_alive())
            .await;

        match outcome {
            AckOutcome::Acknowledged => {
                info!(%flush_id, "flush acknowledged");
                Ok(flush_id)
            }
            AckOutcome::ProcessDied => Err(self.process_died(Some(&flush_id))),
            AckOutcome::StreamEnded => {
                if let Some(reason) = self.reader.failure() {
                    return Err(AutodetectError::ReaderFailed(reason));
                }
                self.check_not_closed()?;
                Err(self.process_died(Some(&flush_id)))
            }
            AckOutcome::TimedOut => {
                if !self.process.is_alive() {
                    return Err(self.process_died(Some(&flush_id)));
                }
                let text = self.process.read_error();
                warn!(%flush_id, timeout = ?options.timeout, error_text = %text, "timed out flushing job");
                Err(AutodetectError::FlushTimeout(text))
            }
        }
    }

    fn process_died(&self, flush_id: Option<&str>) -> AutodetectError {
        let text = self.process.read_error();
        error!(?flush_id, error_text = %text, "autodetect process died");
        AutodetectError::ProcessDied(text)
    }

    /// Send a configuration update. No acknowledgement is awaited.
    #[instrument(skip_all, fields(job_id = %self.job.job_id))]
    pub async fn write_update_config_message(&self, config: &str) -> AppResult<()> {
        self.write_control(ControlMessage::UpdateConfig {
            config: config.to_string(),
        })
        .await
    }

    /// Invalidate the buckets in the range `params` carries.
    ///
    /// Parameters without a reset range write nothing.
    #[instrument(skip_all, fields(job_id = %self.job.job_id))]
    pub async fn write_reset_buckets_control_message(
        &self,
        params: &DataLoadParams,
    ) -> AppResult<()> {
        let Some(range) = params.reset_range else {
            self.check_not_closed()?;
            debug!("no reset range given, nothing to write");
            return Ok(());
        };
        self.write_control(ControlMessage::ResetBuckets { range }).await
    }

    /// Register an observer for buckets crossing its thresholds.
    pub fn add_alert_observer(&self, observer: Arc<dyn AlertObserver>) -> ObserverId {
        self.alerts.add(observer)
    }

    /// Unregister an observer. Returns whether it was still registered.
    pub fn remove_alert_observer(&self, id: ObserverId) -> bool {
        self.alerts.remove(id)
    }

    /// Close the communicator and the process.
    ///
    /// Signals end-of-input, closes the process handle, then waits for the
    /// reader to drain the remaining output. A stream failure seen by the
    /// reader is returned here. Closing twice is a no-op.
    #[instrument(skip_all, fields(job_id = %self.job.job_id))]
    pub async fn close(&self) -> AppResult<()> {
        {
            let mut state = self.state.lock();
            if *state == CommunicatorState::Closed {
                debug!("communicator already closed");
                return Ok(());
            }
            *state = CommunicatorState::Closed;
        }
        info!("closing autodetect communicator");

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                // Expected when the process is already gone.
                debug!(error = %e, "could not signal end of input");
            }
        }

        let process_closed = self.process.close(self.close_timeout).await;
        let reader_joined = self.reader.join(self.close_timeout).await;
        process_closed?;
        if let Some(stats) = reader_joined? {
            info!(
                buckets = stats.buckets,
                acknowledgements = stats.acknowledgements,
                skipped = stats.skipped,
                "autodetect communicator closed"
            );
        }
        Ok(())
    }
}

async fn write_flush(
    writer: &mut WireWriter<ProcessInput>,
    params: &InterimResultsParams,
    flush_id: &str,
) -> io::Result<()> {
    if params.calc_interim {
        writer
            .write_control_message(ControlMessage::CalcInterim {
                range: params.range,
            })
            .await?;
    }
    writer.write_flush_message(flush_id).await
}

fn stream_taken(stream: &str) -> AutodetectError {
    AutodetectError::Spawn(io::Error::new(
        io::ErrorKind::Other,
        format!("process {stream} stream has already been taken"),
    ))
}
