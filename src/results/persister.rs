//! Results persister interface and the implementations shipped with the crate
//!
//! The reader hands every typed result to a [`ResultsPersister`]. Storage is
//! the persister's business; this crate ships three implementations:
//! - [`NoopPersister`] drops everything
//! - [`MemoryPersister`] keeps everything in memory, with failure injection
//!   for tests
//! - [`JsonLinesPersister`] writes one tagged JSON line per result

use super::model::{
    Bucket, CategoryDefinition, Influencer, ModelDebugOutput, ModelSizeStats, ModelSnapshot,
    Quantiles,
};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

/// Sink for results read from the process.
///
/// Called from the reader task only, one result at a time. Errors are logged
/// by the reader and never stop it.
#[async_trait]
pub trait ResultsPersister: Send + Sync {
    /// Store a bucket with its records and bucket influencers.
    async fn persist_bucket(&self, bucket: &Bucket) -> anyhow::Result<()>;

    /// Store an influencer result.
    async fn persist_influencer(&self, influencer: &Influencer) -> anyhow::Result<()>;

    /// Store or replace a category definition.
    async fn persist_category_definition(
        &self,
        category: &CategoryDefinition,
    ) -> anyhow::Result<()>;

    /// Store normalizer state, replacing the previous one.
    async fn persist_quantiles(&self, quantiles: &Quantiles) -> anyhow::Result<()>;

    /// Store a model snapshot descriptor.
    async fn persist_model_snapshot(&self, snapshot: &ModelSnapshot) -> anyhow::Result<()>;

    /// Store a memory usage report.
    async fn persist_model_size_stats(&self, stats: &ModelSizeStats) -> anyhow::Result<()>;

    /// Store model debug bounds.
    async fn persist_model_debug_output(&self, output: &ModelDebugOutput) -> anyhow::Result<()>;

    /// Make everything persisted so far visible to readers of the store.
    ///
    /// Called before a flush acknowledgement is signalled.
    async fn commit_writes(&self) -> anyhow::Result<()>;

    /// Add to the job's processed bucket count.
    async fn increment_bucket_count(&self, count: u64) -> anyhow::Result<()>;
}

/// Persister that discards every result.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPersister;

#[async_trait]
impl ResultsPersister for NoopPersister {
    async fn persist_bucket(&self, _bucket: &Bucket) -> anyhow::Result<()> {
        Ok(())
    }

    async fn persist_influencer(&self, _influencer: &Influencer) -> anyhow::Result<()> {
        Ok(())
    }

    async fn persist_category_definition(
        &self,
        _category: &CategoryDefinition,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn persist_quantiles(&self, _quantiles: &Quantiles) -> anyhow::Result<()> {
        Ok(())
    }

    async fn persist_model_snapshot(&self, _snapshot: &ModelSnapshot) -> anyhow::Result<()> {
        Ok(())
    }

    async fn persist_model_size_stats(&self, _stats: &ModelSizeStats) -> anyhow::Result<()> {
        Ok(())
    }

    async fn persist_model_debug_output(
        &self,
        _output: &ModelDebugOutput,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn commit_writes(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn increment_bucket_count(&self, _count: u64) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Stored {
    buckets: Vec<Bucket>,
    influencers: Vec<Influencer>,
    categories: Vec<CategoryDefinition>,
    quantiles: Vec<Quantiles>,
    snapshots: Vec<ModelSnapshot>,
    size_stats: Vec<ModelSizeStats>,
    debug_output: Vec<ModelDebugOutput>,
    bucket_count: u64,
    commits: usize,
}

/// In-memory persister
///
/// # Example
///
/// ```
/// use autodetect_comm::results::{MemoryPersister, ResultsPersister};
///
/// # tokio_test::block_on(async {
/// let persister = MemoryPersister::new();
/// persister.commit_writes().await.unwrap();
/// assert_eq!(persister.commit_count(), 1);
/// # })
/// ```
#[derive(Debug, Default)]
pub struct MemoryPersister {
    stored: Mutex<Stored>,
    should_fail_next: AtomicBool,
}

impl MemoryPersister {
    /// Empty persister.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next persist call fail
    pub fn trigger_failure(&self) {
        self.should_fail_next.store(true, Ordering::SeqCst);
    }

    fn check_failure(&self, what: &str) -> anyhow::Result<()> {
        if self.should_fail_next.swap(false, Ordering::SeqCst) {
            return Err(anyhow!("injected failure persisting {what}"));
        }
        Ok(())
    }

    /// Buckets persisted so far, in order.
    pub fn buckets(&self) -> Vec<Bucket> {
        self.stored.lock().buckets.clone()
    }

    /// Influencers persisted so far.
    pub fn influencers(&self) -> Vec<Influencer> {
        self.stored.lock().influencers.clone()
    }

    /// Category definitions persisted so far.
    pub fn category_definitions(&self) -> Vec<CategoryDefinition> {
        self.stored.lock().categories.clone()
    }

    /// Quantiles persisted so far.
    pub fn quantiles(&self) -> Vec<Quantiles> {
        self.stored.lock().quantiles.clone()
    }

    /// Model snapshots persisted so far.
    pub fn model_snapshots(&self) -> Vec<ModelSnapshot> {
        self.stored.lock().snapshots.clone()
    }

    /// Model size stats persisted so far.
    pub fn model_size_stats(&self) -> Vec<ModelSizeStats> {
        self.stored.lock().size_stats.clone()
    }

    /// Model debug output persisted so far.
    pub fn model_debug_output(&self) -> Vec<ModelDebugOutput> {
        self.stored.lock().debug_output.clone()
    }

    /// Sum of all `increment_bucket_count` calls
    pub fn bucket_count(&self) -> u64 {
        self.stored.lock().bucket_count
    }

    /// Number of `commit_writes` calls
    pub fn commit_count(&self) -> usize {
        self.stored.lock().commits
    }
}

#[async_trait]
impl ResultsPersister for MemoryPersister {
    async fn persist_bucket(&self, bucket: &Bucket) -> anyhow::Result<()> {
        self.check_failure("bucket")?;
        self.stored.lock().buckets.push(bucket.clone());
        Ok(())
    }

    async fn persist_influencer(&self, influencer: &Influencer) -> anyhow::Result<()> {
        self.check_failure("influencer")?;
        self.stored.lock().influencers.push(influencer.clone());
        Ok(())
    }

    async fn persist_category_definition(
        &self,
        category: &CategoryDefinition,
    ) -> anyhow::Result<()> {
        self.check_failure("category definition")?;
        self.stored.lock().categories.push(category.clone());
        Ok(())
    }

    async fn persist_quantiles(&self, quantiles: &Quantiles) -> anyhow::Result<()> {
        self.check_failure("quantiles")?;
        self.stored.lock().quantiles.push(quantiles.clone());
        Ok(())
    }

    async fn persist_model_snapshot(&self, snapshot: &ModelSnapshot) -> anyhow::Result<()> {
        self.check_failure("model snapshot")?;
        self.stored.lock().snapshots.push(snapshot.clone());
        Ok(())
    }

    async fn persist_model_size_stats(&self, stats: &ModelSizeStats) -> anyhow::Result<()> {
        self.check_failure("model size stats")?;
        self.stored.lock().size_stats.push(stats.clone());
        Ok(())
    }

    async fn persist_model_debug_output(&self, output: &ModelDebugOutput) -> anyhow::Result<()> {
        self.check_failure("model debug output")?;
        self.stored.lock().debug_output.push(output.clone());
        Ok(())
    }

    async fn commit_writes(&self) -> anyhow::Result<()> {
        self.stored.lock().commits += 1;
        Ok(())
    }

    async fn increment_bucket_count(&self, count: u64) -> anyhow::Result<()> {
        self.stored.lock().bucket_count += count;
        Ok(())
    }
}

/// Writes each result as one JSON line, tagged with its kind.
///
/// A bucket becomes `{"bucket":{...}}`, model size stats become
/// `{"modelSizeStats":{...}}` and so on.
pub struct JsonLinesPersister<W> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonLinesPersister<W> {
    /// Persister writing to `out`.
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    /// Recover the underlying writer.
    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }

    fn write_line<T: Serialize>(&self, tag: &str, value: &T) -> anyhow::Result<()> {
        let mut line = serde_json::Map::new();
        line.insert(
            tag.to_string(),
            serde_json::to_value(value).with_context(|| format!("serializing {tag}"))?,
        );
        let mut out = self.out.lock();
        serde_json::to_writer(&mut *out, &line)?;
        out.write_all(b"\n")?;
        Ok(())
    }
}

#[async_trait]
impl<W: Write + Send> ResultsPersister for JsonLinesPersister<W> {
    async fn persist_bucket(&self, bucket: &Bucket) -> anyhow::Result<()> {
        self.write_line("bucket", bucket)
    }

    async fn persist_influencer(&self, influencer: &Influencer) -> anyhow::Result<()> {
        self.write_line("influencer", influencer)
    }

    async fn persist_category_definition(
        &self,
        category: &CategoryDefinition,
    ) -> anyhow::Result<()> {
        self.write_line("categoryDefinition", category)
    }

    async fn persist_quantiles(&self, quantiles: &Quantiles) -> anyhow::Result<()> {
        self.write_line("quantiles", quantiles)
    }

    async fn persist_model_snapshot(&self, snapshot: &ModelSnapshot) -> anyhow::Result<()> {
        self.write_line("modelSnapshot", snapshot)
    }

    async fn persist_model_size_stats(&self, stats: &ModelSizeStats) -> anyhow::Result<()> {
        self.write_line("modelSizeStats", stats)
    }

    async fn persist_model_debug_output(&self, output: &ModelDebugOutput) -> anyhow::Result<()> {
        self.write_line("modelDebugOutput", output)
    }

    async fn commit_writes(&self) -> anyhow::Result<()> {
        self.out.lock().flush().context("flushing results output")
    }

    async fn increment_bucket_count(&self, _count: u64) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(ts: i64) -> Bucket {
        serde_json::from_value(serde_json::json!({"timestamp": ts, "anomalyScore": 1.5})).unwrap()
    }

    #[tokio::test]
    async fn memory_persister_collects_results() {
        let persister = MemoryPersister::new();
        persister.persist_bucket(&bucket(1)).await.unwrap();
        persister.increment_bucket_count(1).await.unwrap();
        persister.commit_writes().await.unwrap();

        assert_eq!(persister.buckets().len(), 1);
        assert_eq!(persister.bucket_count(), 1);
        assert_eq!(persister.commit_count(), 1);
    }

    #[tokio::test]
    async fn injected_failure_hits_only_next_call() {
        let persister = MemoryPersister::new();
        persister.trigger_failure();

        assert!(persister.persist_bucket(&bucket(1)).await.is_err());
        assert!(persister.persist_bucket(&bucket(2)).await.is_ok());
        assert_eq!(persister.buckets().len(), 1);
    }

    #[tokio::test]
    async fn json_lines_are_tagged() {
        let persister = JsonLinesPersister::new(Vec::new());
        persister.persist_bucket(&bucket(1_359_450_000)).await.unwrap();
        let stats: ModelSizeStats =
            serde_json::from_value(serde_json::json!({"modelBytes": 300})).unwrap();
        persister.persist_model_size_stats(&stats).await.unwrap();
        persister.commit_writes().await.unwrap();

        let out = String::from_utf8(persister.into_inner()).unwrap();
        let lines: Vec<serde_json::Value> = out
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["bucket"]["timestamp"], 1_359_450_000);
        assert_eq!(lines[1]["modelSizeStats"]["modelBytes"], 300);
    }
}
