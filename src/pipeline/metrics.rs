//! Counters, per-copy metrics and the aggregate execution result.

use crate::pipeline::id::CopyKey;
use crate::pipeline::row::Row;
use crate::pipeline::sampler::PerformanceSnapshot;
use crate::pipeline::status::StageStatus;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

/// Plain copy of a stage copy's line counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSet {
    /// Rows read from input channels
    pub read: u64,
    /// Rows written to output channels
    pub written: u64,
    /// Lines read from outside the pipeline (files, databases)
    pub input: u64,
    /// Lines written outside the pipeline
    pub output: u64,
    pub updated: u64,
    pub rejected: u64,
    pub errors: u64,
}

impl CounterSet {
    /// Difference against an earlier reading.
    pub fn delta(&self, previous: &CounterSet) -> CounterSet {
        CounterSet {
            read: self.read.saturating_sub(previous.read),
            written: self.written.saturating_sub(previous.written),
            input: self.input.saturating_sub(previous.input),
            output: self.output.saturating_sub(previous.output),
            updated: self.updated.saturating_sub(previous.updated),
            rejected: self.rejected.saturating_sub(previous.rejected),
            errors: self.errors.saturating_sub(previous.errors),
        }
    }

    /// Field-wise maximum.
    pub fn max(&self, other: &CounterSet) -> CounterSet {
        CounterSet {
            read: self.read.max(other.read),
            written: self.written.max(other.written),
            input: self.input.max(other.input),
            output: self.output.max(other.output),
            updated: self.updated.max(other.updated),
            rejected: self.rejected.max(other.rejected),
            errors: self.errors.max(other.errors),
        }
    }
}

/// Live counters of one stage copy.
#[derive(Debug, Default)]
pub struct StageCounters {
    pub read: AtomicU64,
    pub written: AtomicU64,
    pub input: AtomicU64,
    pub output: AtomicU64,
    pub updated: AtomicU64,
    pub rejected: AtomicU64,
    pub errors: AtomicU64,
}

impl StageCounters {
    #[inline]
    pub fn inc(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::SeqCst)
    }

    pub fn add_errors(&self, n: u64) {
        self.errors.fetch_add(n, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> CounterSet {
        CounterSet {
            read: self.read.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            input: self.input.load(Ordering::Relaxed),
            output: self.output.load(Ordering::Relaxed),
            updated: self.updated.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::SeqCst),
        }
    }
}

/// Metrics of one stage copy as returned by `Pipeline::engine_metrics`.
#[derive(Debug, Clone, Serialize)]
pub struct EngineMetrics {
    pub key: CopyKey,
    pub status: StageStatus,
    pub status_description: String,
    pub counters: CounterSet,
    pub input_buffer_size: usize,
    pub output_buffer_size: usize,
    pub running: bool,
    pub snapshots: Vec<PerformanceSnapshot>,
}

/// Aggregate outcome of a pipeline run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionResult {
    /// Sum of the error counts of every stage copy
    pub errors: u64,
    /// Per-metric maximum across stage copies (errors excluded)
    pub lines: CounterSet,
    pub rows: Vec<Row>,
    pub files: Vec<PathBuf>,
    pub stopped: bool,
    /// True when the run finished without errors
    pub result: bool,
    pub log_channel_id: String,
    pub batch_id: u64,
}
