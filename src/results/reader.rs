//! The results reader task.

use super::alert::AlertRegistry;
use super::codec::{OutputFrame, ResultsDecoder};
use super::flush::{AckOutcome, FlushAcknowledgements};
use super::model::AutodetectResult;
use super::parser::classify;
use super::persister::ResultsPersister;
use crate::config::FlushOptions;
use crate::error::{AppResult, AutodetectError, ResultParseError};
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info_span, warn, Instrument};

/// Counters collected over the life of one reader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderStats {
    /// Objects read from the stream, skipped ones included.
    pub objects: u64,
    /// Objects that could not be classified.
    pub skipped: u64,
    /// Buckets handed to the persister.
    pub buckets: u64,
    /// Flush acknowledgements read.
    pub acknowledgements: u64,
    /// Alert observers fired.
    pub alerts_fired: u64,
}

struct Dispatcher {
    persister: Arc<dyn ResultsPersister>,
    alerts: Arc<AlertRegistry>,
    acks: Arc<FlushAcknowledgements>,
    stats: ReaderStats,
}

impl Dispatcher {
    async fn dispatch(&mut self, result: AutodetectResult) {
        debug!(kind = result.kind(), "dispatching result");
        let persisted = match &result {
            AutodetectResult::FlushAcknowledgement(ack) => {
                if let Err(e) = self.persister.commit_writes().await {
                    warn!(error = %e, "commit before flush acknowledgement failed");
                }
                self.acks.acknowledge(&ack.id);
                self.stats.acknowledgements += 1;
                Ok(())
            }
            AutodetectResult::Bucket(bucket) => {
                let persisted = self.persister.persist_bucket(bucket).await;
                if persisted.is_ok() {
                    self.stats.buckets += 1;
                    if let Err(e) = self.persister.increment_bucket_count(1).await {
                        warn!(error = %e, "failed to increment bucket count");
                    }
                }
                let fired = self.alerts.notify(bucket);
                if fired > 0 {
                    warn!(
                        fired,
                        anomaly_score = bucket.anomaly_score,
                        max_normalized_probability = bucket.max_normalized_probability,
                        "alert observers fired"
                    );
                    self.stats.alerts_fired += fired as u64;
                }
                persisted
            }
            AutodetectResult::Influencer(influencer) => {
                self.persister.persist_influencer(influencer).await
            }
            AutodetectResult::CategoryDefinition(category) => {
                self.persister.persist_category_definition(category).await
            }
            AutodetectResult::Quantiles(quantiles) => {
                self.persister.persist_quantiles(quantiles).await
            }
            AutodetectResult::ModelSnapshot(snapshot) => {
                self.persister.persist_model_snapshot(snapshot).await
            }
            AutodetectResult::ModelSizeStats(stats) => {
                self.persister.persist_model_size_stats(stats).await
            }
            AutodetectResult::ModelDebugOutput(output) => {
                self.persister.persist_model_debug_output(output).await
            }
        };
        if let Err(e) = persisted {
            warn!(kind = result.kind(), error = %e, "failed to persist result");
        }
    }
}

/// Background task that parses the process output and dispatches results.
///
/// The task never touches the process input, so it cannot contend with
/// writers. It ends at end-of-stream or on stream corruption; either way all
/// flush waiters are released.
pub struct ResultsReader {
    acks: Arc<FlushAcknowledgements>,
    failure: Arc<Mutex<Option<String>>>,
    handle: Mutex<Option<JoinHandle<ReaderStats>>>,
}

impl ResultsReader {
    /// Start reading `output` on a new task.
    pub fn spawn<R>(
        output: R,
        job_id: &str,
        persister: Arc<dyn ResultsPersister>,
        alerts: Arc<AlertRegistry>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let acks = Arc::new(FlushAcknowledgements::new());
        let failure = Arc::new(Mutex::new(None));

        let mut dispatcher = Dispatcher {
            persister,
            alerts,
            acks: Arc::clone(&acks),
            stats: ReaderStats::default(),
        };
        let task_acks = Arc::clone(&acks);
        let task_failure = Arc::clone(&failure);

        let task = async move {
            let mut frames = FramedRead::new(output, ResultsDecoder::new());
            while let Some(frame) = frames.next().await {
                let parsed = match frame {
                    Ok(OutputFrame::Object(value)) => classify(value),
                    Ok(OutputFrame::Malformed(reason)) => Err(ResultParseError::Malformed(reason)),
                    Err(e) => {
                        error!(error = %e, "results stream is corrupt, reader stopping");
                        *task_failure.lock() = Some(e.to_string());
                        break;
                    }
                };
                dispatcher.stats.objects += 1;
                match parsed {
                    Ok(result) => dispatcher.dispatch(result).await,
                    Err(e) => {
                        dispatcher.stats.skipped += 1;
                        warn!(reason = %e, "skipping result object");
                    }
                }
            }
            task_acks.finish();
            debug!(stats = ?dispatcher.stats, "results reader finished");
            dispatcher.stats
        };

        let handle = tokio::spawn(task.instrument(info_span!("results_reader", job_id)));
        Self {
            acks,
            failure,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Register a flush id about to be written, so its acknowledgement is
    /// kept even if it arrives before anyone waits.
    pub fn expect_flush(&self, flush_id: &str) {
        self.acks.expect(flush_id);
    }

    /// Stop tracking a flush id that will never be waited for.
    pub fn forget_flush(&self, flush_id: &str) {
        self.acks.forget(flush_id);
    }

    /// Wait for `flush_id` without a liveness check; true if it arrived in time.
    pub async fn wait_for_flush_acknowledgement(&self, flush_id: &str, timeout: Duration) -> bool {
        let options = FlushOptions {
            poll_interval: timeout,
            timeout,
        };
        self.acks.wait(flush_id, options, || true).await == AckOutcome::Acknowledged
    }

    /// Wait for `flush_id`, re-checking `is_alive` every poll interval.
    pub async fn wait_for_flush<F>(
        &self,
        flush_id: &str,
        options: FlushOptions,
        is_alive: F,
    ) -> AckOutcome
    where
        F: Fn() -> bool,
    {
        self.acks.wait(flush_id, options, is_alive).await
    }

    /// The stream failure that stopped the reader, if any.
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    /// Whether the reader has reached the end of the stream.
    pub fn is_finished(&self) -> bool {
        self.acks.is_finished()
    }

    /// Wait for the task to end, up to `timeout`.
    ///
    /// A task still running at the deadline is aborted. A stream failure is
    /// returned as [`AutodetectError::ReaderFailed`]. Later calls return
    /// `Ok(None)`.
    pub async fn join(&self, timeout: Duration) -> AppResult<Option<ReaderStats>> {
        let handle = self.handle.lock().take();
        let Some(mut handle) = handle else {
            return Ok(None);
        };

        let stats = match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(stats)) => Some(stats),
            Ok(Err(e)) => return Err(AutodetectError::ReaderFailed(e.to_string())),
            Err(_) => {
                warn!(?timeout, "results reader did not finish, aborting it");
                handle.abort();
                self.acks.finish();
                None
            }
        };

        match self.failure() {
            Some(reason) => Err(AutodetectError::ReaderFailed(reason)),
            None => Ok(stats),
        }
    }
}

impl Drop for ResultsReader {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::alert::{AlertObserver, AlertTrigger};
    use crate::results::model::Bucket;
    use crate::results::persister::MemoryPersister;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::io::AsyncWriteExt;

    const METRIC_OUTPUT_SAMPLE: &str = concat!(
        r#"[{"timestamp":1359450000,"records":[],"maxNormalizedProbability":0,"anomalyScore":0,"#,
        r#""recordCount":0,"eventCount":806,"bucketInfluencers":[{"rawAnomalyScore":0, "probability":0.0,"#,
        r#""influencerFieldName":"bucketTime","initialAnomalyScore":0.0}]}"#,
        r#",{"quantileState":["normaliser 1.1", "normaliser 2.1"]}"#,
        r#",{"timestamp":1359453600,"records":[{"probability":0.0637541,"byFieldName":"airline","#,
        r#""byFieldValue":"JZA","typical":[1020.08],"actual":[1042.14],"fieldName":"responsetime","#,
        r#""function":"max","partitionFieldName":"","partitionFieldValue":""}],"#,
        r#""rawAnomalyScore":0.0140005, "anomalyScore":20.22688,"maxNormalizedProbability":10.5688,"#,
        r#""recordCount":4,"eventCount":820,"bucketInfluencers":[{"rawAnomalyScore":0.0140005,"#,
        r#""probability":0.01,"influencerFieldName":"bucketTime","initialAnomalyScore":20.22688},"#,
        r#"{"rawAnomalyScore":0.005, "probability":0.03,"influencerFieldName":"foo","initialAnomalyScore":10.5}]}"#,
        r#",{"quantileState":["normaliser 1.2", "normaliser 2.2"]}"#,
        r#",{"flush":"testing1"}"#,
        r#",{"quantileState":["normaliser 1.3", "normaliser 2.3"]}"#,
        "]"
    );

    struct Listener {
        triggers: Vec<AlertTrigger>,
        fired: AtomicBool,
    }

    impl AlertObserver for Listener {
        fn triggers(&self) -> &[AlertTrigger] {
            &self.triggers
        }

        fn fire(&self, _bucket: &Bucket, _trigger: &AlertTrigger) {
            self.fired.store(true, Ordering::SeqCst);
        }
    }

    fn spawn_reader(input: &'static str) -> (ResultsReader, Arc<MemoryPersister>, Arc<AlertRegistry>) {
        let persister = Arc::new(MemoryPersister::new());
        let alerts = Arc::new(AlertRegistry::new());
        let reader = ResultsReader::spawn(
            input.as_bytes(),
            "foo-job",
            persister.clone(),
            alerts.clone(),
        );
        (reader, persister, alerts)
    }

    #[tokio::test]
    async fn parses_metric_output() {
        let (reader, persister, _) = spawn_reader(METRIC_OUTPUT_SAMPLE);
        reader.expect_flush("testing1");

        assert!(
            reader
                .wait_for_flush_acknowledgement("testing1", Duration::from_secs(5))
                .await
        );
        let stats = reader.join(Duration::from_secs(5)).await.unwrap().unwrap();

        let buckets = persister.buckets();
        assert_eq!(buckets.len(), 2);
        assert_eq!(persister.bucket_count(), 2);
        assert_eq!(buckets[0].timestamp.timestamp(), 1_359_450_000);
        assert_eq!(buckets[0].event_count, 806);
        assert_eq!(buckets[1].record_count, 4);
        assert_eq!(buckets[1].bucket_influencers[1].score(), 10.5);
        assert_eq!(persister.quantiles().len(), 3);
        assert_eq!(persister.commit_count(), 1);
        assert_eq!(stats.acknowledgements, 1);
        assert_eq!(stats.skipped, 0);
    }

    #[tokio::test]
    async fn alert_fires_once_and_unregisters() {
        let (reader_input, mut writer) = tokio::io::duplex(64 * 1024);
        let persister = Arc::new(MemoryPersister::new());
        let alerts = Arc::new(AlertRegistry::new());
        let listener = Arc::new(Listener {
            triggers: vec![AlertTrigger::bucket(9.0, 100.0)],
            fired: AtomicBool::new(false),
        });
        alerts.add(listener.clone());

        let reader = ResultsReader::spawn(reader_input, "foo-job", persister, alerts.clone());
        writer.write_all(METRIC_OUTPUT_SAMPLE.as_bytes()).await.unwrap();
        drop(writer);
        let stats = reader.join(Duration::from_secs(5)).await.unwrap().unwrap();

        assert!(listener.fired.load(Ordering::SeqCst));
        assert_eq!(alerts.len(), 0);
        assert_eq!(stats.alerts_fired, 1);
    }

    #[tokio::test]
    async fn unknown_objects_are_skipped() {
        let (reader, persister, _) =
            spawn_reader(r#"[{"unknown":18},{"modelBytes":300},{"categoryDefinition":18}]"#);

        let stats = reader.join(Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(stats.skipped, 1);
        assert_eq!(persister.model_size_stats()[0].model_bytes, 300);
        assert_eq!(persister.category_definitions()[0].category_id, 18);
    }

    #[tokio::test]
    async fn malformed_objects_are_skipped() {
        let (reader, persister, _) =
            spawn_reader(r#"[{"modelBytes":300},{"modelBytes":},{"modelBytes":400}]"#);

        let stats = reader.join(Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(stats.objects, 3);
        assert_eq!(stats.skipped, 1);
        assert_eq!(persister.model_size_stats().len(), 2);
    }

    #[tokio::test]
    async fn corrupt_stream_is_reported() {
        let (reader, persister, _) = spawn_reader(r#"[{"modelBytes":300}, [[]]"#);

        let err = reader.join(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, AutodetectError::ReaderFailed(_)));
        assert!(err.to_string().contains("START_ARRAY"));
        assert_eq!(persister.model_size_stats().len(), 1);
        assert!(reader.is_finished());
    }

    #[tokio::test]
    async fn end_of_stream_releases_flush_waiter() {
        let (reader, _, _) = spawn_reader("[]");
        let outcome = reader
            .wait_for_flush("1", FlushOptions::from_millis(60_000, 60_000), || true)
            .await;
        assert_eq!(outcome, AckOutcome::StreamEnded);
    }

    #[tokio::test]
    async fn persister_failure_does_not_stop_reader() {
        let persister = Arc::new(MemoryPersister::new());
        persister.trigger_failure();
        let reader = ResultsReader::spawn(
            r#"{"timestamp":1}{"timestamp":2}{"flush":"1"}"#.as_bytes(),
            "foo-job",
            persister.clone(),
            Arc::new(AlertRegistry::new()),
        );

        let stats = reader.join(Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(persister.buckets().len(), 1);
        assert_eq!(stats.buckets, 1);
        assert_eq!(stats.acknowledgements, 1);
    }
}
