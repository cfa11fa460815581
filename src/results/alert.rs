//! Alert observers
//!
//! Observers register one or more [`AlertTrigger`]s. When the reader persists
//! a final (non-interim) bucket that meets any trigger of an observer, that
//! observer fires once and is removed from the registry.

use super::model::Bucket;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// What part of a bucket a trigger looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertType {
    /// Bucket anomaly score and max normalized probability
    Bucket,
    /// Anomaly scores of the bucket's influencers
    Influencer,
}

/// Threshold condition for firing an alert.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlertTrigger {
    /// Fire when max normalized probability reaches this value.
    pub normalized_probability_threshold: Option<f64>,
    /// Fire when the anomaly score reaches this value.
    pub anomaly_threshold: Option<f64>,
    /// Which scores the thresholds apply to.
    pub alert_type: AlertType,
}

impl AlertTrigger {
    /// Trigger with explicit thresholds.
    pub fn new(
        normalized_probability_threshold: Option<f64>,
        anomaly_threshold: Option<f64>,
        alert_type: AlertType,
    ) -> Self {
        Self {
            normalized_probability_threshold,
            anomaly_threshold,
            alert_type,
        }
    }

    /// Bucket trigger on both thresholds.
    pub fn bucket(normalized_probability_threshold: f64, anomaly_threshold: f64) -> Self {
        Self::new(
            Some(normalized_probability_threshold),
            Some(anomaly_threshold),
            AlertType::Bucket,
        )
    }

    /// Influencer trigger on the anomaly threshold.
    pub fn influencer(anomaly_threshold: f64) -> Self {
        Self::new(None, Some(anomaly_threshold), AlertType::Influencer)
    }

    /// Whether `bucket` meets this trigger.
    pub fn is_triggered_by(&self, bucket: &Bucket) -> bool {
        match self.alert_type {
            AlertType::Bucket => {
                let prob_hit = self
                    .normalized_probability_threshold
                    .is_some_and(|t| bucket.max_normalized_probability >= t);
                let score_hit = self
                    .anomaly_threshold
                    .is_some_and(|t| bucket.anomaly_score >= t);
                prob_hit || score_hit
            }
            AlertType::Influencer => self.anomaly_threshold.is_some_and(|t| {
                bucket
                    .bucket_influencers
                    .iter()
                    .filter(|bi| !bi.is_bucket_time())
                    .any(|bi| bi.score() >= t)
            }),
        }
    }
}

/// Callback for buckets that cross a threshold.
pub trait AlertObserver: Send + Sync {
    /// Conditions under which this observer fires.
    fn triggers(&self) -> &[AlertTrigger];

    /// Called once, from the reader task, with the first trigger that matched.
    fn fire(&self, bucket: &Bucket, trigger: &AlertTrigger);
}

/// Handle returned by registration, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(u64);

/// Thread-safe set of registered observers.
#[derive(Default)]
pub struct AlertRegistry {
    observers: Mutex<Vec<(ObserverId, Arc<dyn AlertObserver>)>>,
    next_id: AtomicU64,
}

impl AlertRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer until it fires or is removed.
    pub fn add(&self, observer: Arc<dyn AlertObserver>) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers.lock().push((id, observer));
        id
    }

    /// Returns whether the observer was still registered.
    pub fn remove(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.lock();
        let before = observers.len();
        observers.retain(|(registered, _)| *registered != id);
        observers.len() != before
    }

    /// Number of registered observers.
    pub fn len(&self) -> usize {
        self.observers.lock().len()
    }

    /// Whether no observer is registered.
    pub fn is_empty(&self) -> bool {
        self.observers.lock().is_empty()
    }

    /// Fire and unregister every observer the bucket triggers.
    ///
    /// Interim buckets never notify. Observers run with the registry lock
    /// released, so they may register or remove observers themselves.
    /// Returns the number of observers fired.
    pub fn notify(&self, bucket: &Bucket) -> usize {
        if bucket.is_interim {
            return 0;
        }

        let fired: Vec<(Arc<dyn AlertObserver>, AlertTrigger)> = {
            let mut observers = self.observers.lock();
            let mut fired = Vec::new();
            observers.retain(|(_, observer)| {
                match observer
                    .triggers()
                    .iter()
                    .find(|t| t.is_triggered_by(bucket))
                {
                    Some(trigger) => {
                        fired.push((Arc::clone(observer), *trigger));
                        false
                    }
                    None => true,
                }
            });
            fired
        };

        for (observer, trigger) in &fired {
            observer.fire(bucket, trigger);
        }
        fired.len()
    }
}
