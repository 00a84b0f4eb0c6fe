//! Periodic performance snapshots of every stage copy.
//!
//! The sampler is a cancellable ticker thread: a crossbeam `tick` channel
//! drives captures and a stop channel ends the loop. Snapshots are kept per
//! copy, oldest evicted first once the size limit is exceeded.

use crate::pipeline::id::CopyKey;
use crate::pipeline::metrics::CounterSet;
use crate::pipeline::runtime::StageRuntime;
use crate::pipeline::status::PipelineStatus;
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, select, tick, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Counters of one stage copy at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceSnapshot {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub key: CopyKey,
    pub totals: CounterSet,
    /// Change since the previous snapshot of this copy
    pub deltas: CounterSet,
    pub input_buffer_size: usize,
    pub output_buffer_size: usize,
}

/// Retained snapshots, keyed by stage copy.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    seq: AtomicU64,
    /// 0 = unlimited
    limit: usize,
    by_copy: Mutex<HashMap<CopyKey, VecDeque<PerformanceSnapshot>>>,
}

impl SnapshotStore {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }

    /// Capture one snapshot per copy.
    ///
    /// While the pipeline is paused or stopped, copies that already have a
    /// snapshot are skipped.
    pub fn capture(&self, stages: &[Arc<StageRuntime>], paused_or_stopped: bool) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let now = Utc::now();
        let mut by_copy = self.by_copy.lock();

        for rt in stages {
            let list = by_copy.entry(rt.key().clone()).or_default();
            if paused_or_stopped && !list.is_empty() {
                continue;
            }

            let totals = rt.counter_set();
            let deltas = match list.back() {
                Some(prev) => totals.delta(&prev.totals),
                None => totals,
            };
            list.push_back(PerformanceSnapshot {
                seq,
                timestamp: now,
                key: rt.key().clone(),
                totals,
                deltas,
                input_buffer_size: rt.input_buffer_size(),
                output_buffer_size: rt.output_buffer_size(),
            });

            if self.limit > 0 {
                while list.len() > self.limit {
                    list.pop_front();
                }
            }
        }
    }

    pub fn snapshots(&self, key: &CopyKey) -> Vec<PerformanceSnapshot> {
        self.by_copy
            .lock()
            .get(key)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn all(&self) -> HashMap<CopyKey, Vec<PerformanceSnapshot>> {
        self.by_copy
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.iter().cloned().collect()))
            .collect()
    }

    pub fn last_seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }
}

/// Handle of a running sampler thread.
pub struct PerformanceSampler {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl PerformanceSampler {
    pub fn start(
        interval: Duration,
        store: Arc<SnapshotStore>,
        stages: Vec<Arc<StageRuntime>>,
        status: Arc<PipelineStatus>,
    ) -> std::io::Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = std::thread::Builder::new()
            .name("performance-sampler".into())
            .spawn(move || {
                let ticker = tick(interval);
                loop {
                    select! {
                        recv(stop_rx) -> _ => break,
                        recv(ticker) -> _ => {
                            let idle = status.is_paused() || status.is_stopped();
                            store.capture(&stages, idle);
                        }
                    }
                }
                tracing::debug!("Performance sampler stopped");
            })?;

        Ok(Self {
            stop_tx,
            handle: Some(handle),
        })
    }

    /// Cancel the ticker and wait for the thread.
    pub fn stop(mut self) {
        let _ = self.stop_tx.try_send(());
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() != std::thread::current().id() && handle.join().is_err() {
                tracing::warn!("Performance sampler thread panicked");
            }
        }
    }
}

impl Drop for PerformanceSampler {
    fn drop(&mut self) {
        let _ = self.stop_tx.try_send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::definition::StageDefinition;
    use crate::pipeline::error::PipelineResult;
    use crate::pipeline::id::StageId;
    use crate::pipeline::log::LogChannel;
    use crate::pipeline::metrics::StageCounters;
    use crate::pipeline::runtime::RuntimeParams;
    use crate::pipeline::stage::{Stage, StageIo};

    struct Idle;

    impl Stage for Idle {
        fn process_row(&mut self, _io: &mut StageIo) -> PipelineResult<bool> {
            Ok(false)
        }
    }

    fn runtime(name: &str) -> Arc<StageRuntime> {
        Arc::new(StageRuntime::new(RuntimeParams {
            stage_id: StageId(0),
            key: CopyKey::new(name, 0),
            definition: Arc::new(StageDefinition::new(name, "idle")),
            copies: 1,
            partition_id: None,
            stage: Box::new(Idle),
            log: LogChannel::tracing("test"),
            threaded: true,
            feedback: None,
        }))
    }

    #[test]
    fn test_deltas_against_previous() {
        let store = SnapshotStore::new(0);
        let rt = runtime("A");
        let stages = vec![rt.clone()];

        for _ in 0..5 {
            StageCounters::inc(&rt.counters().read);
        }
        store.capture(&stages, false);
        for _ in 0..3 {
            StageCounters::inc(&rt.counters().read);
        }
        store.capture(&stages, false);

        let snaps = store.snapshots(rt.key());
        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps[0].deltas.read, 5);
        assert_eq!(snaps[1].totals.read, 8);
        assert_eq!(snaps[1].deltas.read, 3);
        assert_eq!(snaps[1].seq, 2);
    }

    #[test]
    fn test_limit_evicts_oldest() {
        let store = SnapshotStore::new(3);
        let stages = vec![runtime("A")];
        for _ in 0..5 {
            store.capture(&stages, false);
        }
        let snaps = store.snapshots(stages[0].key());
        assert_eq!(snaps.len(), 3);
        assert_eq!(snaps[0].seq, 3);
        assert_eq!(snaps[2].seq, 5);
    }

    #[test]
    fn test_skip_while_paused_once_captured() {
        let store = SnapshotStore::new(0);
        let stages = vec![runtime("A")];
        store.capture(&stages, true);
        store.capture(&stages, true);
        assert_eq!(store.snapshots(stages[0].key()).len(), 1);
    }

    #[test]
    fn test_sampler_thread_captures_and_stops() {
        let store = Arc::new(SnapshotStore::new(0));
        let stages = vec![runtime("A")];
        let status = Arc::new(PipelineStatus::new());
        let sampler =
            PerformanceSampler::start(Duration::from_millis(5), store.clone(), stages, status)
                .unwrap();
        std::thread::sleep(Duration::from_millis(60));
        sampler.stop();
        let seen = store.last_seq();
        assert!(seen >= 1);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(store.last_seq(), seen);
    }
}
