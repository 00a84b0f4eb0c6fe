//! Pipeline lifecycle controller.
//!
//! A [`Pipeline`] is a cheap-to-clone handle over shared engine state. It
//! drives one run of a [`PipelineDefinition`]:
//!
//! 1. `prepare_execution()` resolves copies, allocate channels under the
//!    sync root, creates one [`StageRuntime`] per copy and initializes them
//!    all in parallel.
//! 2. `start_threads()` spawns one worker thread per copy (none in a
//!    single-threaded pipeline).
//! 3. Workers run until their inputs are drained; the last one to finish
//!    fires the finished listeners through the completion tracker.
//!
//! Pause/resume, hard stop and safe stop can be issued from any thread.
//! `wait_until_finished()` polls a single-slot completion signal and follows
//! a stopped parent.

use crate::config::{ChannelKind, EngineConfig, PipelineType, VariableResolver, Variables};
use crate::error::{EngineError, Result};
use crate::pipeline::channel::{Channel, ChannelFlavor, RowProducer};
use crate::pipeline::completion::{CompletionTracker, ErrorPropagator};
use crate::pipeline::definition::PipelineDefinition;
use crate::pipeline::dispatch;
use crate::pipeline::hooks::{HookPoint, HookRegistry, HookSubject};
use crate::pipeline::id::{ChannelId, CopyKey};
use crate::pipeline::listeners::ListenerList;
use crate::pipeline::log::{BufferedLogSink, LogChannel, LogSink, TracingSink};
use crate::pipeline::metrics::{CounterSet, EngineMetrics, ExecutionResult};
use crate::pipeline::parent::{ExecutionParent, SyncRoot};
use crate::pipeline::runtime::{RuntimeParams, StageRuntime};
use crate::pipeline::sampler::{PerformanceSampler, PerformanceSnapshot, SnapshotStore};
use crate::pipeline::stage::StageFactory;
use crate::pipeline::status::{ExecutionState, PipelineStatus, StageStatus};
use crate::pipeline::topology::{self, SortStats};
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Poll interval of `wait_until_finished`.
const WAIT_POLL: Duration = Duration::from_millis(50);

/// Start and end of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionDates {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

/// Channel settings fixed at prepare time.
#[derive(Debug, Clone, Copy)]
struct Allocation {
    flavor: ChannelFlavor,
    rowset_size: usize,
    capture_delay: Duration,
}

struct PipelineInner {
    id: String,
    definition: PipelineDefinition,
    config: EngineConfig,
    variables: Arc<dyn VariableResolver>,
    factory: Arc<dyn StageFactory>,
    log: LogChannel,
    parent: RwLock<Option<Arc<dyn ExecutionParent>>>,
    sync_root: SyncRoot,

    status: Arc<PipelineStatus>,
    prepared: AtomicBool,
    ready_to_start: AtomicBool,
    already_stopped: AtomicBool,

    stages: RwLock<Vec<Arc<StageRuntime>>>,
    channels: RwLock<Vec<Arc<Channel>>>,
    allocation: Mutex<Option<Allocation>>,
    sort_stats: Mutex<Option<SortStats>>,

    started_listeners: ListenerList,
    finished_listeners: ListenerList,
    stopped_listeners: ListenerList,
    hooks: HookRegistry,

    completion: CompletionTracker,
    propagator: ErrorPropagator,
    completed: AtomicBool,
    completed_tx: Sender<()>,
    completed_rx: Receiver<()>,

    snapshots: RwLock<Arc<SnapshotStore>>,
    sampler: Mutex<Option<PerformanceSampler>>,

    dates: Mutex<ExecutionDates>,
    batch_id: AtomicU64,
    active_sub_pipelines: Mutex<BTreeMap<String, Pipeline>>,
}

/// Builder for [`Pipeline`].
pub struct PipelineBuilder {
    definition: PipelineDefinition,
    factory: Arc<dyn StageFactory>,
    config: EngineConfig,
    variables: Arc<dyn VariableResolver>,
    log_sink: Option<Arc<dyn LogSink>>,
    log_channel_id: Option<String>,
    parent: Option<Arc<dyn ExecutionParent>>,
}

impl PipelineBuilder {
    pub fn new(definition: PipelineDefinition, factory: Arc<dyn StageFactory>) -> Self {
        Self {
            definition,
            factory,
            config: EngineConfig::default(),
            variables: Arc::new(Variables::new()),
            log_sink: None,
            log_channel_id: None,
            parent: None,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn variables(mut self, variables: Arc<dyn VariableResolver>) -> Self {
        self.variables = variables;
        self
    }

    pub fn log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = Some(sink);
        self
    }

    /// Root log channel id; defaults to the pipeline name.
    pub fn log_channel_id(mut self, id: impl Into<String>) -> Self {
        self.log_channel_id = Some(id.into());
        self
    }

    pub fn parent(mut self, parent: Arc<dyn ExecutionParent>) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn build(self) -> Pipeline {
        let id = self
            .log_channel_id
            .unwrap_or_else(|| self.definition.name.clone());

        let mut sink = self.log_sink.unwrap_or_else(|| Arc::new(TracingSink));
        if self.config.preview && sink.text(&id).is_none() {
            sink = Arc::new(BufferedLogSink::new(sink));
        }
        let log = LogChannel::new(id.clone(), sink);

        let status = Arc::new(PipelineStatus::new());
        let propagator = ErrorPropagator::new(log.clone()).with_status(status.clone());
        let (completed_tx, completed_rx) = bounded(1);

        Pipeline {
            inner: Arc::new(PipelineInner {
                id,
                definition: self.definition,
                config: self.config,
                variables: self.variables,
                factory: self.factory,
                log,
                parent: RwLock::new(self.parent),
                sync_root: SyncRoot::new(),
                status,
                prepared: AtomicBool::new(false),
                ready_to_start: AtomicBool::new(false),
                already_stopped: AtomicBool::new(false),
                stages: RwLock::new(Vec::new()),
                channels: RwLock::new(Vec::new()),
                allocation: Mutex::new(None),
                sort_stats: Mutex::new(None),
                started_listeners: ListenerList::new("execution started"),
                finished_listeners: ListenerList::new("execution finished"),
                stopped_listeners: ListenerList::new("execution stopped"),
                hooks: HookRegistry::new(),
                completion: CompletionTracker::default(),
                propagator,
                completed: AtomicBool::new(false),
                completed_tx,
                completed_rx,
                snapshots: RwLock::new(Arc::new(SnapshotStore::new(0))),
                sampler: Mutex::new(None),
                dates: Mutex::new(ExecutionDates::default()),
                batch_id: AtomicU64::new(0),
                active_sub_pipelines: Mutex::new(BTreeMap::new()),
            }),
        }
    }
}

/// Handle on one pipeline run.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

impl Pipeline {
    pub fn builder(definition: PipelineDefinition, factory: Arc<dyn StageFactory>) -> PipelineBuilder {
        PipelineBuilder::new(definition, factory)
    }

    // ── Identity & wiring ──

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.definition.name
    }

    pub fn definition(&self) -> &PipelineDefinition {
        &self.inner.definition
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn log(&self) -> &LogChannel {
        &self.inner.log
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.inner.hooks
    }

    pub fn set_parent(&self, parent: Arc<dyn ExecutionParent>) {
        *self.inner.parent.write() = Some(parent);
    }

    pub fn parent(&self) -> Option<Arc<dyn ExecutionParent>> {
        self.inner.parent.read().clone()
    }

    /// The lock channel allocation runs under: the parent's if nested.
    pub fn sync_root(&self) -> SyncRoot {
        match self.parent() {
            Some(parent) => parent.sync_root(),
            None => self.inner.sync_root.clone(),
        }
    }

    pub fn add_started_listener<F>(&self, listener: F)
    where
        F: Fn(&Pipeline) -> Result<()> + Send + Sync + 'static,
    {
        self.inner.started_listeners.add(Arc::new(listener));
    }

    pub fn add_finished_listener<F>(&self, listener: F)
    where
        F: Fn(&Pipeline) -> Result<()> + Send + Sync + 'static,
    {
        self.inner.finished_listeners.add(Arc::new(listener));
    }

    pub fn add_stopped_listener<F>(&self, listener: F)
    where
        F: Fn(&Pipeline) -> Result<()> + Send + Sync + 'static,
    {
        self.inner.stopped_listeners.add(Arc::new(listener));
    }

    // ── Prepare ──

    /// Allocate channels, create and initialize every stage copy.
    ///
    /// May be called once. Fails with [`EngineError::InitFailed`] if any copy
    /// failed to initialize; every copy is disposed in that case.
    pub fn prepare_execution(&self) -> Result<()> {
        if self.inner.prepared.swap(true, Ordering::SeqCst) {
            return Err(EngineError::IllegalState(format!(
                "pipeline '{}' has already been prepared",
                self.name()
            )));
        }

        self.inner.log.info("Preparing for execution");
        self.inner.dates.lock().start = Some(Utc::now());
        self.inner.status.set(PipelineStatus::PREPARING, true);

        let result = self.prepare_inner();
        self.inner.status.set(PipelineStatus::PREPARING, false);
        self.inner.status.set(PipelineStatus::INITIALIZING, false);
        result
    }

    fn prepare_inner(&self) -> Result<()> {
        let inner = &self.inner;
        inner.definition.validate()?;
        inner
            .hooks
            .call(HookPoint::PipelinePrepareExecution, HookSubject::Pipeline(self))?;

        let config = &inner.config;
        let vars = inner.variables.as_ref();
        let flavor = channel_flavor(config)?;
        let rowset_size = config.resolve_rowset_size(vars)?;
        let (capture_delay, snapshot_limit) = if config.performance.capturing {
            (
                config.resolve_capture_delay(vars)?,
                config.resolve_snapshot_limit(vars)?,
            )
        } else {
            (Duration::ZERO, 0)
        };
        *inner.snapshots.write() = Arc::new(SnapshotStore::new(snapshot_limit));
        *inner.allocation.lock() = Some(Allocation {
            flavor,
            rowset_size,
            capture_delay,
        });

        let plan = {
            let root = self.sync_root();
            let mut sequence = root.lock();
            let plan = dispatch::plan(&inner.definition, vars)?;
            inner
                .batch_id
                .store(sequence.next_batch_id(), Ordering::SeqCst);
            plan
        };

        for hop in &plan.hops {
            inner.log.debug(format!(
                "{} -> {}: {} dispatch{}, {} channel(s)",
                inner.definition.get(hop.from).name,
                inner.definition.get(hop.to).name,
                hop.kind,
                if hop.repartitioning { " (repartitioning)" } else { "" },
                hop.channels
            ));
        }

        let mut stages = self.create_runtimes(&plan)?;

        let by_key: HashMap<&CopyKey, &Arc<StageRuntime>> =
            stages.iter().map(|rt| (rt.key(), rt)).collect();
        let mut channels = Vec::with_capacity(plan.channels.len());
        for (i, planned) in plan.channels.iter().enumerate() {
            let (Some(producer), Some(consumer)) = (by_key.get(&planned.from), by_key.get(&planned.to))
            else {
                continue;
            };
            let channel = Arc::new(Channel::new(
                ChannelId(i as u32),
                flavor,
                planned.from.clone(),
                planned.to.clone(),
                rowset_size,
            ));
            if planned.error {
                producer.add_error_output(channel.clone());
            } else {
                producer.add_output(&planned.to.stage, channel.clone(), planned.routing);
            }
            consumer.add_input(channel.clone());
            channels.push(channel);
        }
        drop(by_key);

        inner.status.set(PipelineStatus::PREPARING, false);
        inner.status.set(PipelineStatus::INITIALIZING, true);

        if config.sort_stages_topologically {
            self.sort_topologically(&mut stages);
        }

        inner.propagator.set_targets(&stages);
        *inner.channels.write() = channels;
        *inner.stages.write() = stages.clone();

        inner.log.info(format!(
            "Initializing {} stage copies with {} channels",
            stages.len(),
            inner.channels.read().len()
        ));

        let outcomes: Vec<bool> = std::thread::scope(|scope| {
            let handles: Vec<_> = stages
                .iter()
                .map(|rt| {
                    std::thread::Builder::new()
                        .name(format!("init-{}", rt.key()))
                        .spawn_scoped(scope, move || self.init_stage(rt))
                })
                .collect();

            handles
                .into_iter()
                .zip(stages.iter())
                .map(|(handle, rt)| match handle {
                    Ok(handle) => handle.join().unwrap_or_else(|_| {
                        rt.log().error("Initialization thread panicked");
                        false
                    }),
                    Err(e) => {
                        rt.log()
                            .warn(format!("Unable to spawn init thread ({}), initializing inline", e));
                        self.init_stage(rt)
                    }
                })
                .collect()
        });

        inner.status.set(PipelineStatus::INITIALIZING, false);

        let failed: Vec<CopyKey> = stages
            .iter()
            .zip(outcomes.iter())
            .filter(|(_, ok)| !**ok)
            .map(|(rt, _)| rt.key().clone())
            .collect();

        if !failed.is_empty() {
            return Err(self.abort_initialization(&stages, failed));
        }

        inner.ready_to_start.store(true, Ordering::SeqCst);
        inner.log.info(format!(
            "Pipeline has allocated {} threads and {} channels",
            stages.len(),
            inner.channels.read().len()
        ));
        Ok(())
    }

    fn create_runtimes(&self, plan: &dispatch::DispatchPlan) -> Result<Vec<Arc<StageRuntime>>> {
        let inner = &self.inner;
        let config = &inner.config;
        let threaded = config.pipeline_type == PipelineType::Normal;
        let feedback = config.feedback_shown.then_some(config.feedback_size);

        let mut stages = Vec::new();
        for id in inner.definition.hop_stages() {
            let definition = Arc::new(inner.definition.get(id).clone());
            let copies = plan.copies_of(id);
            for copy in 0..copies {
                let stage = match inner.factory.create(&definition, copy) {
                    Ok(stage) => stage,
                    Err(e) => {
                        stages.iter().for_each(|rt: &Arc<StageRuntime>| rt.dispose_once());
                        return Err(EngineError::from(e).with_context(format!(
                            "creating stage '{}' copy {}",
                            definition.name, copy
                        )));
                    }
                };
                let key = CopyKey::new(definition.name.clone(), copy);
                let partition_id = definition
                    .active_partitioning()
                    .and_then(|p| p.schema.partition_ids.get(copy).cloned());
                stages.push(Arc::new(StageRuntime::new(RuntimeParams {
                    stage_id: id,
                    log: inner.log.child(&key),
                    key,
                    definition: definition.clone(),
                    copies,
                    partition_id,
                    stage,
                    threaded,
                    feedback,
                })));
            }
        }
        Ok(stages)
    }

    fn sort_topologically(&self, stages: &mut [Arc<StageRuntime>]) {
        let limit = self.inner.config.topology_sort_limit;
        if stages.len() >= limit {
            self.inner.log.debug(format!(
                "Skipping topology sort: {} stage copies (limit {})",
                stages.len(),
                limit
            ));
            return;
        }
        let reach = self.inner.definition.reachability();
        let stats = topology::cocktail_sort(stages, |a, b| {
            topology::copy_precedes(&reach, (a.stage_id(), a.copy()), (b.stage_id(), b.copy()))
        });
        self.inner.log.debug(format!(
            "Topology sort: {} iterations, {} swaps",
            stats.iterations, stats.swaps
        ));
        *self.inner.sort_stats.lock() = Some(stats);
    }

    fn init_stage(&self, rt: &StageRuntime) -> bool {
        let hooks = &self.inner.hooks;
        if let Err(e) = hooks.call(HookPoint::StageBeforeInitialize, HookSubject::Stage(rt)) {
            rt.log().error(e.to_string());
            return false;
        }
        if !rt.initialize(self.inner.variables.as_ref(), self.inner.config.safe_mode) {
            return false;
        }
        if let Err(e) = hooks.call(HookPoint::StageAfterInitialize, HookSubject::Stage(rt)) {
            rt.log().error(e.to_string());
            return false;
        }
        true
    }

    /// Dispose every copy after a failed initialization and build the error.
    fn abort_initialization(&self, stages: &[Arc<StageRuntime>], failed: Vec<CopyKey>) -> EngineError {
        let inner = &self.inner;
        for rt in stages {
            rt.dispose_once();
            if rt.is_initialized() {
                rt.set_status(StageStatus::Halted);
            } else {
                rt.counters().add_errors(1);
                rt.set_status(StageStatus::Stopped);
            }
        }

        for key in &failed {
            inner
                .log
                .error(format!("Stage {} failed to initialize", key));
        }

        inner.dates.lock().end = Some(Utc::now());
        inner.status.set(PipelineStatus::FINISHED, true);
        if let Err(e) = self.fire_execution_finished() {
            inner
                .log
                .warn(format!("Ignoring listener failure after init error: {}", e));
        }

        let log_text = if inner.config.preview {
            inner.log.text()
        } else {
            None
        };
        EngineError::InitFailed { failed, log_text }
    }

    // ── Start ──

    /// Spawn one worker per stage copy.
    pub fn start_threads(&self) -> Result<()> {
        let inner = &self.inner;
        if !inner.ready_to_start.swap(false, Ordering::SeqCst) {
            return Err(EngineError::IllegalState(format!(
                "pipeline '{}' is not ready to start",
                self.name()
            )));
        }

        let stages = self.stage_runtimes();
        if let Err(e) = inner
            .hooks
            .call(HookPoint::PipelineStartThreads, HookSubject::Pipeline(self))
        {
            return Err(self.abort_start(&stages, e));
        }
        inner.completion.reset(stages.len());

        for rt in &stages {
            let weak = Arc::downgrade(&self.inner);
            rt.insert_finished_listener_first(Arc::new(move |rt: &Arc<StageRuntime>| {
                if let Some(inner) = weak.upgrade() {
                    Pipeline { inner }.on_stage_finished(rt);
                }
            }));
        }

        inner.status.set(PipelineStatus::RUNNING, true);
        self.start_sampler(&stages);

        if let Err(e) = inner.started_listeners.fire(self, &inner.log) {
            return Err(self.abort_start(&stages, e));
        }

        for rt in &stages {
            if let Err(e) = inner
                .hooks
                .call(HookPoint::StageBeforeStart, HookSubject::Stage(rt.as_ref()))
            {
                return Err(self.abort_start(&stages, e));
            }
        }

        match inner.config.pipeline_type {
            PipelineType::Normal => {
                for rt in &stages {
                    self.spawn_worker(rt);
                }
            }
            PipelineType::SingleThreaded => {
                for rt in &stages {
                    rt.set_status(StageStatus::Running);
                }
            }
        }

        if stages.is_empty() && inner.completion.fire() {
            self.on_all_stages_finished();
        }

        inner
            .hooks
            .call(HookPoint::PipelineStart, HookSubject::Pipeline(self))?;

        inner.log.info(format!(
            "Pipeline started ({}, {} stage copies)",
            inner.config.pipeline_type,
            stages.len()
        ));
        Ok(())
    }

    /// Tear down a run that failed before any worker was spawned.
    ///
    /// Every copy is disposed and left Halted; completion is signalled so
    /// waiters return.
    fn abort_start(&self, stages: &[Arc<StageRuntime>], error: EngineError) -> EngineError {
        let inner = &self.inner;
        inner.log.error(format!("Unable to start pipeline: {}", error));

        inner.completion.fire();
        for rt in stages {
            rt.dispose_once();
            rt.set_status(StageStatus::Halted);
        }

        inner.dates.lock().end = Some(Utc::now());
        if let Err(e) = self.fire_execution_finished() {
            inner
                .log
                .warn(format!("Ignoring listener failure after start error: {}", e));
        }
        error
    }

    fn spawn_worker(&self, rt: &Arc<StageRuntime>) {
        let worker_rt = rt.clone();
        let inner = self.inner.clone();
        let spawned = std::thread::Builder::new()
            .name(rt.key().to_string())
            .spawn(move || worker_rt.run(&inner.propagator));

        if let Err(e) = spawned {
            rt.log().error(format!("Unable to start worker thread: {}", e));
            rt.counters().add_errors(1);
            self.inner.propagator.kill_all_no_wait(rt.key());
            rt.finish();
        }
    }

    /// Prepare and start in one call.
    pub fn execute(&self) -> Result<()> {
        self.prepare_execution()?;
        self.start_threads()
    }

    fn start_sampler(&self, stages: &[Arc<StageRuntime>]) {
        let inner = &self.inner;
        if !inner.config.performance.capturing || stages.is_empty() {
            return;
        }
        let Some(allocation) = *inner.allocation.lock() else {
            return;
        };
        let store = inner.snapshots.read().clone();
        match PerformanceSampler::start(
            allocation.capture_delay,
            store,
            stages.to_vec(),
            inner.status.clone(),
        ) {
            Ok(sampler) => *inner.sampler.lock() = Some(sampler),
            Err(e) => inner
                .log
                .warn(format!("Unable to start performance sampler: {}", e)),
        }
    }

    fn stop_sampler(&self) {
        let sampler = self.inner.sampler.lock().take();
        if let Some(sampler) = sampler {
            sampler.stop();
        }
    }

    // ── Completion ──

    fn on_stage_finished(&self, rt: &Arc<StageRuntime>) {
        let inner = &self.inner;
        if let Err(e) = inner
            .hooks
            .call(HookPoint::StageFinished, HookSubject::Stage(rt.as_ref()))
        {
            rt.log().error(e.to_string());
        }
        if rt.errors() > 0 {
            inner.propagator.kill_all_no_wait(rt.key());
        }
        if inner.completion.stage_finished() {
            self.on_all_stages_finished();
        }
    }

    fn on_all_stages_finished(&self) {
        let inner = &self.inner;
        inner.status.set(PipelineStatus::FINISHED, true);

        if inner.config.performance.capturing {
            let stages = self.stage_runtimes();
            inner.snapshots.read().capture(&stages, false);
        }
        inner.dates.lock().end = Some(Utc::now());

        let errors = self.errors();
        if errors > 0 {
            inner
                .log
                .error(format!("Pipeline finished with {} error(s)", errors));
        } else {
            inner.log.info("Pipeline finished");
        }

        if let Err(e) = inner
            .hooks
            .call(HookPoint::PipelineFinish, HookSubject::Pipeline(self))
        {
            inner.log.error(e.to_string());
        }
        if let Err(e) = self.fire_execution_finished() {
            inner.log.error(format!("Finished listeners failed: {}", e));
        }
    }

    /// Stop the sampler, run the finished listeners, then signal completion.
    fn fire_execution_finished(&self) -> Result<()> {
        let inner = &self.inner;
        self.stop_sampler();
        inner.status.set(PipelineStatus::FINISHED, true);
        inner.status.set(PipelineStatus::RUNNING, false);

        let listeners = inner.finished_listeners.fire(self, &inner.log);

        inner.completed.store(true, Ordering::SeqCst);
        let _ = inner.completed_tx.try_send(());
        let hook = inner
            .hooks
            .call(HookPoint::PipelineCompleted, HookSubject::Pipeline(self));

        listeners.and(hook)
    }

    /// Block until the run completes. Follows a stopped parent.
    pub fn wait_until_finished(&self) {
        while !self.wait_until_finished_timeout(Duration::from_secs(60)) {}
    }

    /// Like [`wait_until_finished`](Self::wait_until_finished) with an upper
    /// bound. Returns whether the run completed.
    pub fn wait_until_finished_timeout(&self, timeout: Duration) -> bool {
        let inner = &self.inner;
        let deadline = Instant::now() + timeout;
        loop {
            if inner.completed.load(Ordering::SeqCst) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            if inner
                .completed_rx
                .recv_timeout(WAIT_POLL.min(deadline - now))
                .is_ok()
            {
                return true;
            }
            if let Some(parent) = self.parent() {
                if parent.is_stopped() && !inner.already_stopped.load(Ordering::SeqCst) {
                    inner.log.info(format!(
                        "Parent '{}' was stopped, stopping this pipeline",
                        parent.name()
                    ));
                    if let Err(e) = self.stop_all() {
                        inner.log.warn(format!("Stopped listeners failed: {}", e));
                    }
                }
            }
        }
    }

    // ── Control ──

    pub fn pause_execution(&self) {
        if self.inner.propagator.is_fired() {
            return;
        }
        self.inner.status.set(PipelineStatus::PAUSED, true);
        for rt in self.stage_runtimes() {
            rt.pause();
        }
    }

    pub fn resume_execution(&self) {
        self.inner.status.set(PipelineStatus::PAUSED, false);
        for rt in self.stage_runtimes() {
            rt.resume();
        }
    }

    /// Hard stop. Idempotent; stopped listeners fire once.
    pub fn stop_all(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.already_stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        inner.log.info("Stopping all stage copies");

        inner.status.set(PipelineStatus::PAUSED, false);
        inner.status.set(PipelineStatus::STOPPED, true);
        for rt in self.stage_runtimes() {
            rt.stop();
        }

        let subs: Vec<Pipeline> = inner.active_sub_pipelines.lock().values().cloned().collect();
        for sub in subs {
            if let Err(e) = sub.stop_all() {
                inner
                    .log
                    .warn(format!("Stopping sub-pipeline '{}' failed: {}", sub.name(), e));
            }
        }

        self.fire_stopped_listeners()
    }

    /// Soft stop: only source stages stop; buffered rows drain downstream.
    ///
    /// Stopped listeners fire on every call, and again on a later hard stop.
    pub fn safe_stop(&self) -> Result<()> {
        let inner = &self.inner;
        inner.log.info("Safely stopping source stages");
        for rt in self.stage_runtimes() {
            if inner.definition.is_input_stage(rt.stage_id()) {
                rt.safe_stop();
            }
        }
        self.fire_stopped_listeners()
    }

    /// Error path: stop every copy without waiting.
    pub fn kill_all_no_wait(&self) -> bool {
        self.inner.propagator.kill_all_no_wait(self.id())
    }

    fn fire_stopped_listeners(&self) -> Result<()> {
        let inner = &self.inner;
        inner.stopped_listeners.fire(self, &inner.log)
    }

    // ── Status ──

    pub fn status(&self) -> ExecutionState {
        ExecutionState::from_status(&self.inner.status, self.errors())
    }

    pub fn status_flags(&self) -> &PipelineStatus {
        &self.inner.status
    }

    pub fn is_preparing(&self) -> bool {
        self.inner.status.is_preparing()
    }

    pub fn is_initializing(&self) -> bool {
        self.inner.status.is_initializing()
    }

    pub fn is_ready_to_start(&self) -> bool {
        self.inner.ready_to_start.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.inner.status.is_running()
    }

    pub fn is_paused(&self) -> bool {
        self.inner.status.is_paused()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.status.is_stopped()
    }

    pub fn is_finished(&self) -> bool {
        self.inner.status.is_finished()
    }

    /// Completion has been signalled.
    pub fn is_completed(&self) -> bool {
        self.inner.completed.load(Ordering::SeqCst)
    }

    pub fn errors(&self) -> u64 {
        self.inner.stages.read().iter().map(|rt| rt.errors()).sum()
    }

    pub fn has_halted_components(&self) -> bool {
        self.inner
            .stages
            .read()
            .iter()
            .any(|rt| rt.status() == StageStatus::Halted)
    }

    pub fn execution_dates(&self) -> ExecutionDates {
        *self.inner.dates.lock()
    }

    pub fn batch_id(&self) -> u64 {
        self.inner.batch_id.load(Ordering::SeqCst)
    }

    pub fn sort_stats(&self) -> Option<SortStats> {
        *self.inner.sort_stats.lock()
    }

    /// Aggregate result of the run so far.
    pub fn result(&self) -> ExecutionResult {
        let stages = self.stage_runtimes();
        let errors = stages.iter().map(|rt| rt.errors()).sum();
        let mut lines = stages
            .iter()
            .fold(CounterSet::default(), |acc, rt| acc.max(&rt.counter_set()));
        lines.errors = 0;

        ExecutionResult {
            errors,
            lines,
            rows: stages.iter().flat_map(|rt| rt.result_rows()).collect(),
            files: stages.iter().flat_map(|rt| rt.result_files()).collect(),
            stopped: self.is_stopped(),
            result: errors == 0,
            log_channel_id: self.inner.log.id().to_string(),
            batch_id: self.batch_id(),
        }
    }

    // ── Introspection ──

    pub fn stage_runtimes(&self) -> Vec<Arc<StageRuntime>> {
        self.inner.stages.read().clone()
    }

    pub fn find_stage_runtime(&self, name: &str, copy: usize) -> Option<Arc<StageRuntime>> {
        self.inner
            .stages
            .read()
            .iter()
            .find(|rt| rt.key().matches(name, copy))
            .cloned()
    }

    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.inner.channels.read().clone()
    }

    /// Channel from `from.from_copy` to `to.to_copy`, names case-insensitive.
    pub fn find_channel(&self, from: &str, from_copy: usize, to: &str, to_copy: usize) -> Option<Arc<Channel>> {
        self.inner
            .channels
            .read()
            .iter()
            .find(|c| c.origin().matches(from, from_copy) && c.destination().matches(to, to_copy))
            .cloned()
    }

    pub fn engine_metrics(&self, name: &str, copy: usize) -> Option<EngineMetrics> {
        let rt = self.find_stage_runtime(name, copy)?;
        Some(self.metrics_of(&rt))
    }

    pub fn all_engine_metrics(&self) -> Vec<EngineMetrics> {
        self.stage_runtimes()
            .iter()
            .map(|rt| self.metrics_of(rt))
            .collect()
    }

    fn metrics_of(&self, rt: &StageRuntime) -> EngineMetrics {
        let status = rt.status();
        let mut description = status.description().to_string();
        if status == StageStatus::Running && rt.is_paused() {
            description.push_str(" (paused)");
        }
        EngineMetrics {
            key: rt.key().clone(),
            status,
            status_description: description,
            counters: rt.counter_set(),
            input_buffer_size: rt.input_buffer_size(),
            output_buffer_size: rt.output_buffer_size(),
            running: rt.is_running(),
            snapshots: self.inner.snapshots.read().snapshots(rt.key()),
        }
    }

    pub fn performance_snapshots(&self) -> HashMap<CopyKey, Vec<PerformanceSnapshot>> {
        self.inner.snapshots.read().all()
    }

    /// Attach an extra input channel to a prepared stage copy.
    pub fn add_row_producer(&self, stage: &str, copy: usize) -> Result<RowProducer> {
        let allocation = (*self.inner.allocation.lock()).ok_or_else(|| {
            EngineError::IllegalState("add_row_producer() requires a prepared pipeline".into())
        })?;
        let rt = self.find_stage_runtime(stage, copy).ok_or_else(|| {
            EngineError::Definition(format!("no stage copy {}.{} to feed", stage, copy))
        })?;

        let mut channels = self.inner.channels.write();
        let channel = Arc::new(Channel::new(
            ChannelId(channels.len() as u32),
            allocation.flavor,
            CopyKey::new("RowProducer", 0),
            rt.key().clone(),
            allocation.rowset_size,
        ));
        rt.add_input(channel.clone());
        channels.push(channel.clone());
        Ok(RowProducer::new(channel))
    }

    // ── Nested runs ──

    pub fn add_active_sub_pipeline(&self, name: impl Into<String>, pipeline: Pipeline) {
        self.inner
            .active_sub_pipelines
            .lock()
            .insert(name.into(), pipeline);
    }

    pub fn active_sub_pipeline(&self, name: &str) -> Option<Pipeline> {
        self.inner.active_sub_pipelines.lock().get(name).cloned()
    }

    pub fn remove_active_sub_pipeline(&self, name: &str) -> Option<Pipeline> {
        self.inner.active_sub_pipelines.lock().remove(name)
    }

    pub(crate) fn propagator(&self) -> &ErrorPropagator {
        &self.inner.propagator
    }
}

impl ExecutionParent for Pipeline {
    fn name(&self) -> String {
        self.inner.definition.name.clone()
    }

    fn is_stopped(&self) -> bool {
        self.inner.status.is_stopped()
    }

    fn sync_root(&self) -> SyncRoot {
        Pipeline::sync_root(self)
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .field("stages", &self.inner.stages.read().len())
            .finish()
    }
}

/// Pick the channel transport for a pipeline configuration.
fn channel_flavor(config: &EngineConfig) -> Result<ChannelFlavor> {
    match (config.pipeline_type, config.channel_kind) {
        (PipelineType::Normal, ChannelKind::Blocking) => Ok(ChannelFlavor::Blocking),
        (PipelineType::Normal, ChannelKind::Batching) => Ok(ChannelFlavor::Batching {
            batch_size: config.batch_size,
        }),
        (PipelineType::SingleThreaded, ChannelKind::Blocking) => Ok(ChannelFlavor::Queue),
        (PipelineType::SingleThreaded, ChannelKind::Batching) => Err(EngineError::Config(
            "the batching channel cannot be used in a single-threaded pipeline".into(),
        )),
    }
}
