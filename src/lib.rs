//! # flowrun: multi-threaded row pipeline engine
//!
//! Runs a directed graph of stages as a set of worker threads connected by
//! bounded row channels. Every stage may run as several copies; the
//! dispatcher decides how copies are wired (1:1, 1:N, N:1, N:N, N:M or
//! partition-aware repartitioning).
//!
//! ## Architecture
//!
//! - **Definition**: [`PipelineDefinition`] holds stages and hops, loaded
//!   from a [`PipelineFile`] or built in code
//! - **Engine**: [`Pipeline`] prepares channels and runtimes, starts one
//!   thread per copy and tracks completion, errors, pause and stop
//! - **Stages**: anything implementing [`Stage`], created per copy by a
//!   [`StageFactory`]; [`stages::BuiltinStageFactory`] ships a few kinds
//! - **Communication**: crossbeam channels between copies
//!
//! ## Example
//!
//! ```ignore
//! use flowrun::{
//!     pipeline::{PipelineDefinition, StageDefinition},
//!     stages::BuiltinStageFactory,
//!     Pipeline,
//! };
//! use std::sync::Arc;
//!
//! let def = PipelineDefinition::new("demo")
//!     .stage(StageDefinition::new("gen", "generate_rows").with_setting("limit", 1000))
//!     .stage(StageDefinition::new("out", "collect").with_copies(2))
//!     .hop("gen", "out");
//!
//! let engine = Pipeline::builder(def, Arc::new(BuiltinStageFactory::new())).build();
//! engine.execute()?;
//! engine.wait_until_finished();
//! assert_eq!(engine.result().rows.len(), 1000);
//! ```

pub mod config;
pub mod error;
pub mod pipeline;
pub mod stages;

// Re-export commonly used types
pub use config::{EngineConfig, PipelineFile, Variables};
pub use error::{EngineError, Result};
pub use pipeline::{
    ExecutionResult, Pipeline, PipelineBuilder, PipelineDefinition, Row, Stage, StageDefinition,
    StageFactory, Value,
};
pub use stages::BuiltinStageFactory;
