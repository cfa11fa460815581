//! Log output of the results reader and communicator
//!
//! Kept in its own test binary: `#[traced_test]` installs a subscriber per
//! test and must not race with `logging::init`.

use autodetect_comm::{
    communicator::AutodetectCommunicator,
    config::{AutodetectConfig, FlushOptions},
    job::JobContext,
    process::BlackHoleProcess,
    protocol::{DataLoadParams, InterimResultsParams, TimeRange},
    results::{AlertRegistry, MemoryPersister, ResultsReader},
};
use std::sync::Arc;
use std::time::Duration;
use tracing_test::traced_test;

#[tokio::test]
#[traced_test]
async fn test_skipped_objects_are_logged_with_reason() {
    let persister = Arc::new(MemoryPersister::new());
    let reader = ResultsReader::spawn(
        r#"[{"unknown":18},{"modelBytes":300},{"timestamp":"yesterday"}]"#.as_bytes(),
        "logging-job",
        persister.clone(),
        Arc::new(AlertRegistry::new()),
    );

    let stats = reader.join(Duration::from_secs(5)).await.unwrap().unwrap();

    assert_eq!(stats.skipped, 2);
    assert_eq!(persister.model_size_stats().len(), 1);
    assert!(logs_contain("skipping result object"));
    assert!(logs_contain("unexpected object parsed from output - first field unknown"));
}

#[tokio::test]
#[traced_test]
async fn test_flush_timeout_is_logged() {
    let process = Arc::new(BlackHoleProcess::stalled().with_error_output("Mock process has stalled"));
    let communicator = AutodetectCommunicator::new(
        JobContext::new("logging-job", ["time", "value"]),
        process,
        Arc::new(MemoryPersister::new()),
        &AutodetectConfig::default(),
    )
    .unwrap();

    let result = communicator
        .flush_job(
            &InterimResultsParams::none(),
            Some(FlushOptions::from_millis(1, 1)),
        )
        .await;
    communicator.close().await.unwrap();

    assert!(result.is_err());
    assert!(logs_contain("flush requested"));
    assert!(logs_contain("timed out flushing job"));
    assert!(logs_contain("Mock process has stalled"));
}

#[tokio::test]
#[traced_test]
async fn test_malformed_objects_are_logged_as_parse_errors() {
    let persister = Arc::new(MemoryPersister::new());
    let reader = ResultsReader::spawn(
        r#"[{"modelBytes":},{"modelBytes":300}]"#.as_bytes(),
        "logging-job",
        persister.clone(),
        Arc::new(AlertRegistry::new()),
    );

    let stats = reader.join(Duration::from_secs(5)).await.unwrap().unwrap();

    assert_eq!(stats.skipped, 1);
    assert!(logs_contain("skipping result object"));
    assert!(logs_contain("malformed JSON object"));
}

#[tokio::test]
#[traced_test]
async fn test_every_control_message_is_logged() {
    let process = Arc::new(BlackHoleProcess::new());
    let communicator = AutodetectCommunicator::new(
        JobContext::new("logging-job", ["time", "value"]),
        process,
        Arc::new(MemoryPersister::new()),
        &AutodetectConfig::default(),
    )
    .unwrap();
    let range = TimeRange::new(0, 3600).unwrap();

    communicator
        .write_data(
            vec![vec!["0".to_string(), "1.5".to_string()]],
            &DataLoadParams::reset_buckets(range),
        )
        .await
        .unwrap();
    communicator
        .flush_job(&InterimResultsParams::calc_interim_over(range), None)
        .await
        .unwrap();
    communicator.close().await.unwrap();

    assert!(logs_contain("writing control message"));
    for kind in ["reset_buckets", "calc_interim", "flush", "padding"] {
        assert!(logs_contain(&format!("kind=\"{kind}\"")), "no debug event for {kind}");
    }
}
