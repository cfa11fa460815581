//! Flush acknowledgement tracking shared by the reader and flushing callers.

use crate::config::FlushOptions;
use parking_lot::Mutex;
use std::collections::HashSet;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

/// How a wait for one flush id ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The matching acknowledgement was read
    Acknowledged,
    /// The liveness check reported the process gone
    ProcessDied,
    /// The results stream ended without the acknowledgement
    StreamEnded,
    /// The deadline passed with the process still alive
    TimedOut,
}

#[derive(Debug, Default)]
struct AckState {
    pending: HashSet<String>,
    acknowledged: HashSet<String>,
    finished: bool,
}

/// Issued and observed flush ids plus a wakeup for waiters.
///
/// Only acknowledgements for pending ids are kept. An id leaves the tracker
/// when its waiter consumes it or gives up, so late, duplicate or
/// unsolicited acknowledgements are dropped.
#[derive(Debug, Default)]
pub struct FlushAcknowledgements {
    state: Mutex<AckState>,
    notify: Notify,
}

impl FlushAcknowledgements {
    /// Tracker with nothing pending.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `flush_id` as issued. Call before the flush is written.
    pub fn expect(&self, flush_id: &str) {
        let mut state = self.state.lock();
        if !state.finished {
            state.pending.insert(flush_id.to_string());
        }
    }

    /// Stop tracking `flush_id`, dropping its acknowledgement if one arrived.
    pub fn forget(&self, flush_id: &str) {
        let mut state = self.state.lock();
        state.pending.remove(flush_id);
        state.acknowledged.remove(flush_id);
    }

    /// Record an acknowledgement read from the process and wake waiters.
    ///
    /// Returns false if nobody expects `flush_id`; the acknowledgement is
    /// then dropped.
    pub fn acknowledge(&self, flush_id: &str) -> bool {
        let accepted = {
            let mut state = self.state.lock();
            if state.pending.remove(flush_id) {
                state.acknowledged.insert(flush_id.to_string());
                true
            } else {
                false
            }
        };
        if accepted {
            self.notify.notify_waiters();
        } else {
            debug!(flush_id, "dropping acknowledgement nobody is waiting for");
        }
        accepted
    }

    /// Mark the results stream as ended; every current and future waiter
    /// returns without an acknowledgement.
    pub fn finish(&self) {
        {
            let mut state = self.state.lock();
            state.finished = true;
            state.pending.clear();
        }
        self.notify.notify_waiters();
    }

    /// Whether the results stream has ended.
    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    /// Acknowledgements read but not yet consumed by a waiter.
    pub fn unclaimed(&self) -> usize {
        self.state.lock().acknowledged.len()
    }

    /// Wait until `flush_id` is acknowledged, the stream ends, `is_alive`
    /// reports false, or the timeout passes.
    ///
    /// An id not yet registered with [`expect`](Self::expect) is registered
    /// here; acknowledgements read before that are lost.
    ///
    /// The waiter sleeps on a notification and wakes at least every
    /// `poll_interval` to re-run the liveness check. Death is checked before
    /// the deadline, so a process found dead at the deadline reports
    /// [`AckOutcome::ProcessDied`].
    pub async fn wait<F>(&self, flush_id: &str, options: FlushOptions, is_alive: F) -> AckOutcome
    where
        F: Fn() -> bool,
    {
        let deadline = Instant::now() + options.timeout;
        {
            let mut state = self.state.lock();
            if !state.finished && !state.acknowledged.contains(flush_id) {
                state.pending.insert(flush_id.to_string());
            }
        }
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.acknowledged.remove(flush_id) {
                    return AckOutcome::Acknowledged;
                }
                if state.finished {
                    return AckOutcome::StreamEnded;
                }
            }

            if !is_alive() {
                self.forget(flush_id);
                return AckOutcome::ProcessDied;
            }

            let now = Instant::now();
            if now >= deadline {
                self.forget(flush_id);
                return AckOutcome::TimedOut;
            }

            let nap = options.poll_interval.min(deadline - now);
            let _ = tokio::time::timeout(nap, notified).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn options(poll_ms: u64, timeout_ms: u64) -> FlushOptions {
        FlushOptions::from_millis(poll_ms, timeout_ms)
    }

    #[tokio::test]
    async fn acknowledgement_before_wait_is_consumed() {
        let acks = FlushAcknowledgements::new();
        acks.expect("1");
        assert!(acks.acknowledge("1"));

        let outcome = acks.wait("1", options(10, 1000), || true).await;
        assert_eq!(outcome, AckOutcome::Acknowledged);
        assert_eq!(acks.unclaimed(), 0);
    }

    #[tokio::test]
    async fn acknowledgement_wakes_waiter() {
        let acks = Arc::new(FlushAcknowledgements::new());
        let waiter = {
            let acks = Arc::clone(&acks);
            tokio::spawn(async move { acks.wait("7", options(5_000, 10_000), || true).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!acks.acknowledge("6"));
        assert!(acks.acknowledge("7"));

        assert_eq!(waiter.await.unwrap(), AckOutcome::Acknowledged);
        assert_eq!(acks.unclaimed(), 0);
    }

    #[tokio::test]
    async fn times_out_when_alive_and_silent() {
        let acks = FlushAcknowledgements::new();
        let started = std::time::Instant::now();

        let outcome = acks.wait("1", options(1, 1), || true).await;
        assert_eq!(outcome, AckOutcome::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn death_beats_timeout() {
        let acks = FlushAcknowledgements::new();
        let outcome = acks.wait("1", options(1, 1), || false).await;
        assert_eq!(outcome, AckOutcome::ProcessDied);
    }

    #[tokio::test]
    async fn finish_releases_waiters() {
        let acks = Arc::new(FlushAcknowledgements::new());
        let waiter = {
            let acks = Arc::clone(&acks);
            tokio::spawn(async move { acks.wait("1", options(60_000, 60_000), || true).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        acks.finish();

        let outcome = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, AckOutcome::StreamEnded);
    }

    #[tokio::test]
    async fn late_acknowledgement_is_dropped() {
        let acks = FlushAcknowledgements::new();
        assert_eq!(
            acks.wait("1", options(1, 1), || true).await,
            AckOutcome::TimedOut
        );

        assert!(!acks.acknowledge("1"));
        assert_eq!(acks.unclaimed(), 0);
    }

    #[test]
    fn unsolicited_and_duplicate_acknowledgements_are_not_kept() {
        let acks = FlushAcknowledgements::new();
        for id in 0..100 {
            assert!(!acks.acknowledge(&id.to_string()));
        }
        assert_eq!(acks.unclaimed(), 0);

        acks.expect("5");
        assert!(acks.acknowledge("5"));
        assert!(!acks.acknowledge("5"));
        assert_eq!(acks.unclaimed(), 1);

        acks.forget("5");
        assert_eq!(acks.unclaimed(), 0);
    }
}
