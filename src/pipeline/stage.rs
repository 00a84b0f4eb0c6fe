//! The stage contract.
//!
//! - **`Stage` trait**: what every stage kind implements. The engine only
//!   ever talks to `Box<dyn Stage>`; it never branches on the concrete kind.
//! - **`StageFactory` trait**: creates the executable instance for one copy
//!   of a stage definition.
//! - **`StageIo`**: the handle a stage uses while processing: read rows,
//!   write rows, report errors and counters.

use crate::config::VariableResolver;
use crate::pipeline::definition::StageDefinition;
use crate::pipeline::error::PipelineResult;
use crate::pipeline::id::CopyKey;
use crate::pipeline::log::LogChannel;
use crate::pipeline::metrics::StageCounters;
use crate::pipeline::row::Row;
use crate::pipeline::runtime::StageRuntime;
use std::path::PathBuf;
use std::sync::atomic::Ordering;

/// Context passed to [`Stage::init`].
pub struct StageContext<'a> {
    pub key: &'a CopyKey,
    pub definition: &'a StageDefinition,
    /// Total copies of this stage
    pub copies: usize,
    /// Partition id of this copy when the stage is partitioned
    pub partition_id: Option<&'a str>,
    pub variables: &'a dyn VariableResolver,
    pub log: &'a LogChannel,
    pub safe_mode: bool,
}

/// One executable stage kind.
pub trait Stage: Send {
    /// Called once per copy, on its own thread, before any row flows.
    fn init(&mut self, _ctx: &StageContext) -> PipelineResult<()> {
        Ok(())
    }

    /// Process one unit of work. Return `Ok(false)` when this copy is done.
    fn process_row(&mut self, io: &mut StageIo) -> PipelineResult<bool>;

    /// Release resources. Called exactly once per copy on every exit path.
    fn dispose(&mut self) {}

    /// Hard stop requested while the stage is idle between rows.
    fn stop_running(&mut self) {}
}

/// Creates stage instances from definitions.
pub trait StageFactory: Send + Sync {
    fn create(&self, definition: &StageDefinition, copy: usize) -> PipelineResult<Box<dyn Stage>>;
}

/// Row and counter access for a running stage copy.
pub struct StageIo<'a> {
    rt: &'a StageRuntime,
}

impl<'a> StageIo<'a> {
    pub(crate) fn new(rt: &'a StageRuntime) -> Self {
        Self { rt }
    }

    /// Next input row. `None` once every input is done and drained, when the
    /// copy has no inputs, or after a hard stop.
    ///
    /// In a single-threaded pipeline this never waits; the driver only calls
    /// the stage when a row is available or all inputs are finished.
    pub fn get_row(&mut self) -> Option<Row> {
        self.rt.get_row()
    }

    /// Send a row to the next stages.
    pub fn put_row(&mut self, row: Row) -> PipelineResult<()> {
        self.rt.put_row(row)
    }

    /// Send a row to the error target, or count an error if there is none.
    pub fn put_error(&mut self, row: Row, description: &str) -> PipelineResult<()> {
        self.rt.put_error(row, description)
    }

    pub fn key(&self) -> &CopyKey {
        self.rt.key()
    }

    pub fn copy(&self) -> usize {
        self.rt.key().copy
    }

    pub fn copies(&self) -> usize {
        self.rt.copies()
    }

    pub fn partition_id(&self) -> Option<&str> {
        self.rt.partition_id()
    }

    pub fn log(&self) -> &LogChannel {
        self.rt.log()
    }

    pub fn has_inputs(&self) -> bool {
        self.rt.has_inputs()
    }

    /// True after a hard or safe stop. Sources should stop producing.
    pub fn is_stopped(&self) -> bool {
        self.rt.is_stopped()
    }

    pub fn is_paused(&self) -> bool {
        self.rt.is_paused()
    }

    /// Block while the copy is paused (returns early on stop).
    pub fn wait_while_paused(&self) {
        self.rt.wait_while_paused();
    }

    pub fn inc_input(&self) {
        StageCounters::inc(&self.rt.counters().input);
    }

    pub fn inc_output(&self) {
        StageCounters::inc(&self.rt.counters().output);
    }

    pub fn inc_updated(&self) {
        StageCounters::inc(&self.rt.counters().updated);
    }

    pub fn inc_rejected(&self) {
        StageCounters::inc(&self.rt.counters().rejected);
    }

    pub fn rows_read(&self) -> u64 {
        self.rt.counters().read.load(Ordering::Relaxed)
    }

    pub fn add_result_row(&self, row: Row) {
        self.rt.add_result_row(row);
    }

    pub fn add_result_file(&self, path: impl Into<PathBuf>) {
        self.rt.add_result_file(path.into());
    }
}
