//! Multi-threaded pipeline execution engine.
//!
//! A [`PipelineDefinition`] is a directed graph of stages joined by hops.
//! Each stage runs as one or more copies; every copy gets its own worker
//! thread and talks to its neighbours over bounded row channels.
//!
//! # Architecture
//!
//! ```text
//!                     prepare_execution()
//! PipelineDefinition ─────────────────────► DispatchPlan ──► Channels
//!                                                │
//!                                                ▼
//!                    [A.0] ──► ch ──► [B.0] ──► ch ──► [C.0]
//!                    [A.1] ──► ch ──►   ▲
//!                          start_threads()       CompletionTracker
//!                                                ErrorPropagator
//! ```
//!
//! # Design
//!
//! - **Trait objects at the seams**: the engine talks to `Box<dyn Stage>`
//!   only; built-in stage kinds use enum dispatch behind the factory.
//! - **Shared runtimes**: every copy is an `Arc<StageRuntime>` so control
//!   calls (stop, pause) work from any thread while the worker runs.
//! - **Fire-once completion**: the last copy to finish triggers the finished
//!   listeners exactly once; the first copy with errors stops all others.
//! - **Single-threaded mode**: same runtimes, driven by
//!   [`SingleThreadedExecutor`] over unbounded queues.

pub mod channel;
pub mod completion;
pub mod definition;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod hooks;
pub mod id;
pub mod listeners;
pub mod log;
pub mod metrics;
pub mod parent;
pub mod row;
pub mod runtime;
pub mod sampler;
pub mod single_threaded;
pub mod stage;
pub mod status;
pub mod topology;

pub use channel::{Channel, ChannelFlavor, RowProducer};
pub use completion::{CompletionTracker, ErrorPropagator};
pub use definition::{
    Hop, PartitionMethod, PartitionSchema, PartitioningSpec, PipelineDefinition, RowDistribution,
    StageDefinition,
};
pub use dispatch::{DispatchPlan, DispatchType};
pub use error::{PipelineError, PipelineResult};
pub use executor::{ExecutionDates, Pipeline, PipelineBuilder};
pub use hooks::{ExtensionHook, HookPoint, HookRegistry, HookSubject};
pub use id::{ChannelId, CopyKey, StageId};
pub use listeners::PipelineListener;
pub use log::{BufferedLogSink, LogChannel, LogSink, TracingSink};
pub use metrics::{CounterSet, EngineMetrics, ExecutionResult};
pub use parent::{ExecutionParent, SyncRoot};
pub use row::{Row, Value};
pub use runtime::{Routing, StageRuntime};
pub use sampler::{PerformanceSnapshot, SnapshotStore};
pub use single_threaded::SingleThreadedExecutor;
pub use stage::{Stage, StageContext, StageFactory, StageIo};
pub use status::{ExecutionState, PipelineStatus, StageStatus};
pub use topology::SortStats;
