//! Stage runtimes: one executable copy of a stage with its channels.
//!
//! A [`StageRuntime`] is created during `prepare_execution()` and shared
//! (`Arc`) between its worker thread, the lifecycle controller (stop/pause
//! signals), the error propagator and the performance sampler. Only the
//! worker touches the boxed [`Stage`]; everyone else goes through atomics.
//!
//! # Worker loop
//!
//! ```text
//! loop {
//!     stopped? -> done
//!     wait while paused
//!     stage.process_row(io)   Ok(true) -> again, Ok(false) -> done, Err -> errors += 1
//!     errors > 0? -> kill every copy, done
//! }
//! outputs done -> dispose -> status -> finished listeners
//! ```

use crate::config::VariableResolver;
use crate::pipeline::channel::Channel;
use crate::pipeline::completion::ErrorPropagator;
use crate::pipeline::definition::{PartitionMethod, StageDefinition};
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::id::{CopyKey, StageId};
use crate::pipeline::log::LogChannel;
use crate::pipeline::metrics::{CounterSet, StageCounters};
use crate::pipeline::row::Row;
use crate::pipeline::stage::{Stage, StageContext, StageIo};
use crate::pipeline::status::{AtomicStageStatus, StageStatus};
use parking_lot::{Condvar, Mutex, RwLock};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How long a blocked `get` waits before re-checking stop flags.
const GET_POLL: Duration = Duration::from_millis(20);

/// How long a blocked `put` waits before re-checking stop flags.
const PUT_POLL: Duration = Duration::from_millis(50);

/// Called when a stage copy finishes.
pub type StageListener = Arc<dyn Fn(&Arc<StageRuntime>) + Send + Sync>;

/// How a producer copy spreads rows over the channels to one target stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routing {
    RoundRobin,
    Copy,
    /// Partition by integer field value modulo the channel count
    Mod { field: usize },
    Mirror,
}

impl Routing {
    pub fn partition_method(self) -> PartitionMethod {
        match self {
            Routing::Mod { .. } => PartitionMethod::Mod,
            Routing::Mirror => PartitionMethod::Mirror,
            _ => PartitionMethod::None,
        }
    }
}

/// Output channels of one producer copy towards one target stage.
struct OutputGroup {
    target: String,
    channels: Vec<Arc<Channel>>,
    routing: Routing,
    next: AtomicUsize,
}

/// Result of one `process_row` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    Done,
}

/// Construction parameters for a [`StageRuntime`].
pub struct RuntimeParams {
    pub stage_id: StageId,
    pub key: CopyKey,
    pub definition: Arc<StageDefinition>,
    pub copies: usize,
    pub partition_id: Option<String>,
    pub stage: Box<dyn Stage>,
    pub log: LogChannel,
    /// Worker threads block on channels; single-threaded copies never wait
    pub threaded: bool,
    /// Log a progress line every N rows read
    pub feedback: Option<u64>,
}

/// One running copy of a stage.
pub struct StageRuntime {
    stage_id: StageId,
    key: CopyKey,
    definition: Arc<StageDefinition>,
    copies: usize,
    partition_id: Option<String>,
    threaded: bool,
    feedback: Option<u64>,
    log: LogChannel,

    stage: Mutex<Box<dyn Stage>>,
    status: AtomicStageStatus,
    stopped: AtomicBool,
    safe_stopped: AtomicBool,
    paused: Mutex<bool>,
    pause_changed: Condvar,
    init_ok: AtomicBool,
    disposed: AtomicBool,
    counters: StageCounters,

    inputs: RwLock<Vec<Arc<Channel>>>,
    next_input: AtomicUsize,
    outputs: RwLock<Vec<OutputGroup>>,
    error_outputs: RwLock<Vec<Arc<Channel>>>,
    next_error: AtomicUsize,

    listeners: Mutex<Vec<StageListener>>,
    result_rows: Mutex<Vec<Row>>,
    result_files: Mutex<Vec<PathBuf>>,
}

impl StageRuntime {
    pub fn new(params: RuntimeParams) -> Self {
        Self {
            stage_id: params.stage_id,
            key: params.key,
            definition: params.definition,
            copies: params.copies,
            partition_id: params.partition_id,
            threaded: params.threaded,
            feedback: params.feedback.filter(|n| *n > 0),
            log: params.log,
            stage: Mutex::new(params.stage),
            status: AtomicStageStatus::default(),
            stopped: AtomicBool::new(false),
            safe_stopped: AtomicBool::new(false),
            paused: Mutex::new(false),
            pause_changed: Condvar::new(),
            init_ok: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            counters: StageCounters::default(),
            inputs: RwLock::new(Vec::new()),
            next_input: AtomicUsize::new(0),
            outputs: RwLock::new(Vec::new()),
            error_outputs: RwLock::new(Vec::new()),
            next_error: AtomicUsize::new(0),
            listeners: Mutex::new(Vec::new()),
            result_rows: Mutex::new(Vec::new()),
            result_files: Mutex::new(Vec::new()),
        }
    }

    // ── Identity ──

    pub fn key(&self) -> &CopyKey {
        &self.key
    }

    pub fn stage_id(&self) -> StageId {
        self.stage_id
    }

    pub fn name(&self) -> &str {
        &self.key.stage
    }

    pub fn copy(&self) -> usize {
        self.key.copy
    }

    pub fn copies(&self) -> usize {
        self.copies
    }

    pub fn definition(&self) -> &StageDefinition {
        &self.definition
    }

    pub fn partition_id(&self) -> Option<&str> {
        self.partition_id.as_deref()
    }

    pub fn log(&self) -> &LogChannel {
        &self.log
    }

    // ── Wiring (prepare only) ──

    pub(crate) fn add_input(&self, channel: Arc<Channel>) {
        self.inputs.write().push(channel);
    }

    pub(crate) fn add_output(&self, target: &str, channel: Arc<Channel>, routing: Routing) {
        let mut outputs = self.outputs.write();
        match outputs
            .iter_mut()
            .find(|g| g.target.eq_ignore_ascii_case(target))
        {
            Some(group) => group.channels.push(channel),
            None => outputs.push(OutputGroup {
                target: target.to_string(),
                channels: vec![channel],
                routing,
                next: AtomicUsize::new(0),
            }),
        }
    }

    pub(crate) fn add_error_output(&self, channel: Arc<Channel>) {
        self.error_outputs.write().push(channel);
    }

    pub fn input_channels(&self) -> Vec<Arc<Channel>> {
        self.inputs.read().clone()
    }

    pub fn output_channels(&self) -> Vec<Arc<Channel>> {
        self.outputs
            .read()
            .iter()
            .flat_map(|g| g.channels.iter().cloned())
            .collect()
    }

    pub fn error_channels(&self) -> Vec<Arc<Channel>> {
        self.error_outputs.read().clone()
    }

    pub fn has_inputs(&self) -> bool {
        !self.inputs.read().is_empty()
    }

    /// Routing towards `target`, if this copy feeds it.
    pub fn routing_to(&self, target: &str) -> Option<Routing> {
        self.outputs
            .read()
            .iter()
            .find(|g| g.target.eq_ignore_ascii_case(target))
            .map(|g| g.routing)
    }

    /// Partition method applied to outgoing rows, if any output repartitions.
    pub fn repartitioning(&self) -> PartitionMethod {
        self.outputs
            .read()
            .iter()
            .map(|g| g.routing.partition_method())
            .find(|m| *m != PartitionMethod::None)
            .unwrap_or(PartitionMethod::None)
    }

    pub fn input_buffer_size(&self) -> usize {
        self.inputs.read().iter().map(|c| c.size()).sum()
    }

    pub fn output_buffer_size(&self) -> usize {
        let outputs: usize = self
            .outputs
            .read()
            .iter()
            .flat_map(|g| g.channels.iter())
            .map(|c| c.size())
            .sum();
        outputs + self.error_outputs.read().iter().map(|c| c.size()).sum::<usize>()
    }

    // ── State ──

    pub fn status(&self) -> StageStatus {
        self.status.load()
    }

    pub(crate) fn set_status(&self, status: StageStatus) {
        self.status.store(status);
    }

    pub fn counters(&self) -> &StageCounters {
        &self.counters
    }

    pub fn counter_set(&self) -> CounterSet {
        self.counters.snapshot()
    }

    pub fn errors(&self) -> u64 {
        self.counters.errors()
    }

    pub fn is_initialized(&self) -> bool {
        self.init_ok.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn is_safe_stopped(&self) -> bool {
        self.safe_stopped.load(Ordering::SeqCst)
    }

    /// Stopped without the safe flag: outputs are discarded.
    fn is_hard_stopped(&self) -> bool {
        self.is_stopped() && !self.is_safe_stopped()
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.lock()
    }

    pub fn is_running(&self) -> bool {
        self.status() == StageStatus::Running
    }

    pub fn pause(&self) {
        *self.paused.lock() = true;
    }

    pub fn resume(&self) {
        let mut paused = self.paused.lock();
        *paused = false;
        self.pause_changed.notify_all();
    }

    pub fn wait_while_paused(&self) {
        let mut paused = self.paused.lock();
        while *paused && !self.is_stopped() {
            self.pause_changed.wait_for(&mut paused, Duration::from_millis(100));
        }
    }

    /// Hard stop: stop now, discard pending output.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.resume();
        // The worker holds the lock while inside process_row; it will see the flag.
        if let Some(mut stage) = self.stage.try_lock() {
            stage.stop_running();
        }
    }

    /// Soft stop: stop producing, let what is already buffered drain.
    pub fn safe_stop(&self) {
        self.safe_stopped.store(true, Ordering::SeqCst);
        self.stopped.store(true, Ordering::SeqCst);
        self.resume();
    }

    // ── Listeners ──

    pub fn add_finished_listener(&self, listener: StageListener) {
        self.listeners.lock().push(listener);
    }

    /// Run `listener` before every listener registered so far.
    pub fn insert_finished_listener_first(&self, listener: StageListener) {
        self.listeners.lock().insert(0, listener);
    }

    // ── Results ──

    pub(crate) fn add_result_row(&self, row: Row) {
        self.result_rows.lock().push(row);
    }

    pub(crate) fn add_result_file(&self, path: PathBuf) {
        self.result_files.lock().push(path);
    }

    pub fn result_rows(&self) -> Vec<Row> {
        self.result_rows.lock().clone()
    }

    pub fn result_files(&self) -> Vec<PathBuf> {
        self.result_files.lock().clone()
    }

    // ── Lifecycle ──

    /// Run the stage's `init`. Returns false on failure, which is logged.
    pub(crate) fn initialize(&self, variables: &dyn VariableResolver, safe_mode: bool) -> bool {
        let ctx = StageContext {
            key: &self.key,
            definition: &self.definition,
            copies: self.copies,
            partition_id: self.partition_id.as_deref(),
            variables,
            log: &self.log,
            safe_mode,
        };

        let outcome = {
            let mut stage = self.stage.lock();
            catch_unwind(AssertUnwindSafe(|| stage.init(&ctx)))
        };

        let ok = match outcome {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                self.log.error(format!("Error initializing stage: {}", e));
                false
            }
            Err(_) => {
                self.log.error("Stage panicked during initialization");
                false
            }
        };
        self.init_ok.store(ok, Ordering::SeqCst);
        ok
    }

    /// Dispose the stage if that has not happened yet.
    pub(crate) fn dispose_once(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            let mut stage = self.stage.lock();
            if catch_unwind(AssertUnwindSafe(|| stage.dispose())).is_err() {
                self.log.error("Stage panicked during dispose");
            }
        }
    }

    /// One call of the stage's `process_row`.
    pub(crate) fn process_once(&self, propagator: &ErrorPropagator) -> Step {
        if self.is_stopped() {
            return Step::Done;
        }
        self.wait_while_paused();
        if self.is_stopped() {
            return Step::Done;
        }

        let outcome = {
            let mut stage = self.stage.lock();
            let mut io = StageIo::new(self);
            catch_unwind(AssertUnwindSafe(|| stage.process_row(&mut io)))
        };

        let step = match outcome {
            Ok(Ok(true)) => Step::Continue,
            Ok(Ok(false)) => Step::Done,
            Ok(Err(e)) => {
                self.log.error(format!("Unexpected error: {}", e));
                self.counters.add_errors(1);
                Step::Done
            }
            Err(_) => {
                self.log.error("Stage panicked while processing");
                self.counters.add_errors(1);
                Step::Done
            }
        };

        if self.errors() > 0 {
            propagator.kill_all_no_wait(&self.key);
            return Step::Done;
        }
        step
    }

    /// Tear down after the last `process_row`: close outputs, dispose, set
    /// the final status and notify finished listeners.
    pub(crate) fn finish(self: &Arc<Self>) {
        self.set_output_done();
        self.dispose_once();

        if self.is_stopped() {
            self.set_status(StageStatus::Stopped);
        } else {
            self.set_status(StageStatus::Finished);
        }

        let c = self.counters.snapshot();
        self.log.debug(format!(
            "Finished processing (I={}, O={}, R={}, W={}, U={}, E={})",
            c.input, c.output, c.read, c.written, c.updated, c.errors
        ));

        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            listener(self);
        }
    }

    /// Worker thread body.
    pub(crate) fn run(self: &Arc<Self>, propagator: &ErrorPropagator) {
        self.set_status(StageStatus::Running);
        self.log.debug("Starting to run...");
        while self.process_once(propagator) == Step::Continue {}
        self.finish();
    }

    fn set_output_done(&self) {
        let outputs = self.output_channels();
        let errors = self.error_channels();
        for channel in outputs.iter().chain(errors.iter()) {
            while !channel.flush_wait(PUT_POLL) {
                if self.is_hard_stopped() {
                    channel.clear();
                    break;
                }
            }
            channel.set_done();
        }
    }

    // ── Row traffic (called through StageIo) ──

    pub(crate) fn get_row(&self) -> Option<Row> {
        let inputs = self.inputs.read();
        let n = inputs.len();
        if n == 0 {
            return None;
        }

        loop {
            if self.is_hard_stopped() {
                return None;
            }

            let start = self.next_input.load(Ordering::Relaxed) % n;
            let mut waiting_on = None;
            for i in 0..n {
                let idx = (start + i) % n;
                let channel = &inputs[idx];
                if let Some(row) = channel.get_row() {
                    self.next_input.store(idx + 1, Ordering::Relaxed);
                    self.on_row_read();
                    return Some(row);
                }
                if waiting_on.is_none() && !channel.is_finished() {
                    waiting_on = Some(idx);
                }
            }

            let Some(idx) = waiting_on else {
                return None;
            };
            if !self.threaded {
                return None;
            }

            let timeout = if n == 1 { GET_POLL } else { Duration::from_millis(1) };
            if let Some(row) = inputs[idx].get_row_wait(timeout) {
                self.next_input.store(idx + 1, Ordering::Relaxed);
                self.on_row_read();
                return Some(row);
            }
        }
    }

    /// True if a row is ready or every input is finished.
    pub(crate) fn has_input_ready(&self) -> bool {
        let inputs = self.inputs.read();
        inputs.iter().any(|c| c.size() > 0) || inputs.iter().all(|c| c.is_finished())
    }

    fn on_row_read(&self) {
        let n = StageCounters::inc(&self.counters.read);
        if let Some(every) = self.feedback {
            if n % every == 0 {
                self.log.info(format!("linenr {}", n));
            }
        }
    }

    pub(crate) fn put_row(&self, row: Row) -> PipelineResult<()> {
        if self.is_hard_stopped() {
            return Ok(());
        }

        let outputs = self.outputs.read();
        let mut targets: Vec<&Arc<Channel>> = Vec::new();
        for group in outputs.iter() {
            let len = group.channels.len();
            match group.routing {
                Routing::RoundRobin => {
                    let idx = group.next.fetch_add(1, Ordering::Relaxed) % len;
                    targets.push(&group.channels[idx]);
                }
                Routing::Copy | Routing::Mirror => targets.extend(group.channels.iter()),
                Routing::Mod { field } => {
                    let value = row.get(field).ok_or(PipelineError::FieldOutOfRange {
                        index: field,
                        len: row.len(),
                    })?;
                    let key = value.as_int().ok_or_else(|| {
                        PipelineError::stage(
                            &self.key,
                            format!("partition field {} is not an integer: {}", field, value),
                        )
                    })?;
                    let idx = key.rem_euclid(len as i64) as usize;
                    targets.push(&group.channels[idx]);
                }
            }
        }

        if targets.is_empty() {
            return Ok(());
        }

        let last = targets.len() - 1;
        let mut row = Some(row);
        for (i, channel) in targets.into_iter().enumerate() {
            let out = if i == last {
                row.take()
            } else {
                row.clone()
            };
            if let Some(out) = out {
                self.send(channel, out);
            }
        }
        StageCounters::inc(&self.counters.written);
        Ok(())
    }

    pub(crate) fn put_error(&self, row: Row, description: &str) -> PipelineResult<()> {
        let errors = self.error_outputs.read();
        if errors.is_empty() {
            self.log
                .error(format!("Error row without error target: {}", description));
            self.counters.add_errors(1);
            return Ok(());
        }
        if self.is_hard_stopped() {
            return Ok(());
        }
        let idx = self.next_error.fetch_add(1, Ordering::Relaxed) % errors.len();
        self.send(&errors[idx], row);
        StageCounters::inc(&self.counters.rejected);
        Ok(())
    }

    fn send(&self, channel: &Channel, row: Row) {
        let mut row = row;
        loop {
            match channel.put_row_wait(row, PUT_POLL) {
                Ok(()) => return,
                Err(back) => {
                    if self.is_hard_stopped() {
                        return;
                    }
                    row = back;
                }
            }
        }
    }
}

impl std::fmt::Debug for StageRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRuntime")
            .field("key", &self.key)
            .field("status", &self.status())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
