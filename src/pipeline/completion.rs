//! Completion tracking and error propagation.
//!
//! [`CompletionTracker`] counts finished stage copies and reports the moment
//! the last one finishes, exactly once, no matter how many copies race.
//! [`ErrorPropagator`] is the kill path: the first copy reporting errors stops
//! every copy from a separate thread and never waits for them.

use crate::pipeline::log::LogChannel;
use crate::pipeline::runtime::StageRuntime;
use crate::pipeline::status::PipelineStatus;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Fire-once "all copies finished" detector.
#[derive(Debug, Default)]
pub struct CompletionTracker {
    total: AtomicUsize,
    finished: AtomicUsize,
    fired: AtomicBool,
}

impl CompletionTracker {
    pub fn new(total: usize) -> Self {
        Self {
            total: AtomicUsize::new(total),
            finished: AtomicUsize::new(0),
            fired: AtomicBool::new(false),
        }
    }

    pub fn reset(&self, total: usize) {
        self.total.store(total, Ordering::SeqCst);
        self.finished.store(0, Ordering::SeqCst);
        self.fired.store(false, Ordering::SeqCst);
    }

    /// Count one finished copy. True for exactly one caller: the one that
    /// completes the set.
    pub fn stage_finished(&self) -> bool {
        let done = self.finished.fetch_add(1, Ordering::SeqCst) + 1;
        done >= self.total.load(Ordering::SeqCst) && self.fire()
    }

    /// Claim the completion. True only the first time.
    pub fn fire(&self) -> bool {
        !self.fired.swap(true, Ordering::SeqCst)
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    pub fn finished_count(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

/// Stops every stage copy once any of them reports errors.
pub struct ErrorPropagator {
    fired: AtomicBool,
    targets: RwLock<Vec<Weak<StageRuntime>>>,
    status: Option<Arc<PipelineStatus>>,
    log: LogChannel,
}

impl ErrorPropagator {
    pub fn new(log: LogChannel) -> Self {
        Self {
            fired: AtomicBool::new(false),
            targets: RwLock::new(Vec::new()),
            status: None,
            log,
        }
    }

    /// Also raise the pipeline's STOPPED flag when killing.
    pub fn with_status(mut self, status: Arc<PipelineStatus>) -> Self {
        self.status = Some(status);
        self
    }

    pub fn set_targets(&self, stages: &[Arc<StageRuntime>]) {
        *self.targets.write() = stages.iter().map(Arc::downgrade).collect();
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Signal every copy to stop without waiting. Only the first call acts;
    /// returns whether this call did.
    pub fn kill_all_no_wait(&self, origin: impl std::fmt::Display) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }

        self.log.error(format!(
            "Errors detected in {}, stopping all stage copies",
            origin
        ));
        if let Some(status) = &self.status {
            status.set(PipelineStatus::STOPPED, true);
        }

        let targets: Vec<Arc<StageRuntime>> = self
            .targets
            .read()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();

        let spawned = std::thread::Builder::new()
            .name("kill-all".into())
            .spawn({
                let targets = targets.clone();
                move || targets.iter().for_each(|rt| rt.stop())
            });
        if let Err(e) = spawned {
            self.log
                .warn(format!("Unable to spawn kill thread ({}), stopping inline", e));
            targets.iter().for_each(|rt| rt.stop());
        }
        true
    }
}

impl std::fmt::Debug for ErrorPropagator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorPropagator")
            .field("fired", &self.is_fired())
            .field("targets", &self.targets.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::id::CopyKey;
    use std::sync::Barrier;

    #[test]
    fn test_tracker_fires_on_last() {
        let tracker = CompletionTracker::new(3);
        assert!(!tracker.stage_finished());
        assert!(!tracker.stage_finished());
        assert!(tracker.stage_finished());
        assert!(tracker.is_fired());
        assert!(!tracker.stage_finished());
    }

    #[test]
    fn test_tracker_fires_once_under_race() {
        const N: usize = 64;
        for _ in 0..20 {
            let tracker = Arc::new(CompletionTracker::new(N));
            let barrier = Arc::new(Barrier::new(N));
            let fired = Arc::new(AtomicUsize::new(0));

            let handles: Vec<_> = (0..N)
                .map(|_| {
                    let tracker = tracker.clone();
                    let barrier = barrier.clone();
                    let fired = fired.clone();
                    std::thread::spawn(move || {
                        barrier.wait();
                        if tracker.stage_finished() {
                            fired.fetch_add(1, Ordering::SeqCst);
                        }
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }

            assert_eq!(fired.load(Ordering::SeqCst), 1);
            assert_eq!(tracker.finished_count(), N);
        }
    }

    #[test]
    fn test_zero_total_fires_on_claim() {
        let tracker = CompletionTracker::new(0);
        assert!(tracker.fire());
        assert!(!tracker.fire());
    }

    #[test]
    fn test_propagator_acts_once() {
        let status = Arc::new(PipelineStatus::new());
        let p = ErrorPropagator::new(LogChannel::tracing("t")).with_status(status.clone());
        assert!(p.kill_all_no_wait(&CopyKey::new("A", 0)));
        assert!(!p.kill_all_no_wait(&CopyKey::new("B", 0)));
        assert!(p.is_fired());
        assert!(status.is_stopped());
    }
}
