//! Configuration module for flowrun
//!
//! This module handles engine configuration including:
//! - Engine tunables (channel size and kind, pipeline type, topology sort)
//! - Performance snapshot capturing settings
//! - Pipeline files (`.json` / `.toml`) bundling config, variables and graph
//!
//! Numeric settings that may come from the environment are written as
//! [`IntExpr`] values: either a literal (`10000`) or an expression
//! (`"${ROWSET_SIZE}"`) resolved through a [`VariableResolver`] when the
//! engine prepares.
//!
//! # Example
//!
//! ```ignore
//! use flowrun::config::PipelineFile;
//!
//! let file = PipelineFile::load("etl.toml")?;
//! let engine = file.into_engine(std::sync::Arc::new(flowrun::stages::BuiltinStageFactory::new()));
//! engine.execute()?;
//! engine.wait_until_finished();
//! ```

pub mod variables;

pub use variables::{VariableResolver, Variables};

use crate::error::{EngineError, Result};
use crate::pipeline::definition::PipelineDefinition;
use crate::pipeline::executor::{Pipeline, PipelineBuilder};
use crate::pipeline::stage::StageFactory;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Default number of rows a channel buffers before `put` blocks
pub const DEFAULT_ROWSET_SIZE: i64 = 10_000;

/// Default number of rows gathered per batch by the batching channel
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Above this many stage copies the topology sort is skipped
pub const DEFAULT_TOPOLOGY_SORT_LIMIT: usize = 150;

/// Default performance snapshot interval in milliseconds
pub const DEFAULT_CAPTURE_DELAY_MS: i64 = 1000;

/// Default number of rows between progress log lines
pub const DEFAULT_FEEDBACK_SIZE: u64 = 50_000;

// ==================== Integer expressions ====================

/// An integer setting written either literally or as a variable expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IntExpr {
    Value(i64),
    Expr(String),
}

impl IntExpr {
    /// Resolve to a concrete integer. An empty expression resolves to `None`.
    pub fn resolve_opt(&self, vars: &dyn VariableResolver) -> Result<Option<i64>> {
        match self {
            IntExpr::Value(v) => Ok(Some(*v)),
            IntExpr::Expr(expr) => {
                let resolved = vars.resolve(expr);
                let trimmed = resolved.trim();
                if trimmed.is_empty() {
                    return Ok(None);
                }
                trimmed.parse::<i64>().map(Some).map_err(|_| {
                    EngineError::Config(format!(
                        "'{}' resolved to '{}' which is not an integer",
                        expr, resolved
                    ))
                })
            }
        }
    }

    /// Resolve to a concrete integer, failing on empty expressions.
    pub fn resolve(&self, vars: &dyn VariableResolver) -> Result<i64> {
        self.resolve_opt(vars)?
            .ok_or_else(|| EngineError::Config(format!("'{}' resolved to an empty value", self)))
    }
}

impl Default for IntExpr {
    fn default() -> Self {
        IntExpr::Value(1)
    }
}

impl From<i64> for IntExpr {
    fn from(v: i64) -> Self {
        IntExpr::Value(v)
    }
}

impl From<i32> for IntExpr {
    fn from(v: i32) -> Self {
        IntExpr::Value(v as i64)
    }
}

impl From<&str> for IntExpr {
    fn from(v: &str) -> Self {
        IntExpr::Expr(v.to_string())
    }
}

impl fmt::Display for IntExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntExpr::Value(v) => write!(f, "{}", v),
            IntExpr::Expr(e) => write!(f, "{}", e),
        }
    }
}

// ==================== Engine Config ====================

/// Which channel implementation connects stage copies in a normal pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Capacity-bounded blocking queue
    #[default]
    Blocking,
    /// Blocking queue that moves rows in batches for throughput
    Batching,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Blocking => write!(f, "blocking"),
            ChannelKind::Batching => write!(f, "batching"),
        }
    }
}

/// Threading model of a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PipelineType {
    /// One worker thread per stage copy
    #[default]
    Normal,
    /// No worker threads; an external driver pumps the stages
    SingleThreaded,
}

impl fmt::Display for PipelineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineType::Normal => write!(f, "Normal"),
            PipelineType::SingleThreaded => write!(f, "Single threaded"),
        }
    }
}

/// Settings of the periodic per-stage performance sampler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Whether snapshots are captured at all
    pub capturing: bool,

    /// Interval between snapshots in milliseconds
    pub delay_ms: IntExpr,

    /// Maximum snapshots retained per stage copy (empty or 0 = unlimited)
    pub size_limit: IntExpr,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            capturing: false,
            delay_ms: IntExpr::Value(DEFAULT_CAPTURE_DELAY_MS),
            size_limit: IntExpr::Expr(String::new()),
        }
    }
}

/// Engine configuration for one pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Channel capacity in rows
    pub rowset_size: IntExpr,

    /// Channel implementation for normal pipelines
    pub channel_kind: ChannelKind,

    /// Rows per batch for the batching channel
    pub batch_size: usize,

    /// Threading model
    pub pipeline_type: PipelineType,

    /// Sort stage copies producers-first after preparation
    pub sort_stages_topologically: bool,

    /// Skip the sort when there are this many stage copies or more
    pub topology_sort_limit: usize,

    /// Preview runs attach buffered log text to init failures
    pub preview: bool,

    /// Safe mode: stages may validate row layouts more strictly
    pub safe_mode: bool,

    /// Log a progress line every `feedback_size` rows per stage copy
    pub feedback_shown: bool,

    /// Rows between progress lines
    pub feedback_size: u64,

    /// Performance snapshot capturing
    pub performance: PerformanceConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rowset_size: IntExpr::Value(DEFAULT_ROWSET_SIZE),
            channel_kind: ChannelKind::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            pipeline_type: PipelineType::default(),
            sort_stages_topologically: false,
            topology_sort_limit: DEFAULT_TOPOLOGY_SORT_LIMIT,
            preview: false,
            safe_mode: false,
            feedback_shown: false,
            feedback_size: DEFAULT_FEEDBACK_SIZE,
            performance: PerformanceConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the channel capacity. Must be at least 1.
    pub fn resolve_rowset_size(&self, vars: &dyn VariableResolver) -> Result<usize> {
        let size = self.rowset_size.resolve(vars)?;
        if size < 1 {
            return Err(EngineError::Config(format!(
                "rowset size must be at least 1, got {}",
                size
            )));
        }
        Ok(size as usize)
    }

    /// Resolve the sampler interval. Must be at least 1 ms.
    pub fn resolve_capture_delay(&self, vars: &dyn VariableResolver) -> Result<std::time::Duration> {
        let ms = self.performance.delay_ms.resolve(vars)?;
        if ms < 1 {
            return Err(EngineError::Config(format!(
                "performance capture delay must be at least 1 ms, got {}",
                ms
            )));
        }
        Ok(std::time::Duration::from_millis(ms as u64))
    }

    /// Resolve the snapshot retention limit. `0` means unlimited.
    pub fn resolve_snapshot_limit(&self, vars: &dyn VariableResolver) -> Result<usize> {
        Ok(self
            .performance
            .size_limit
            .resolve_opt(vars)?
            .map(|v| v.max(0) as usize)
            .unwrap_or(0))
    }
}

// ==================== Pipeline File ====================

/// Current pipeline file format version
pub const PIPELINE_FILE_VERSION: u32 = 1;

fn default_file_version() -> u32 {
    PIPELINE_FILE_VERSION
}

/// A complete runnable pipeline: engine settings, variables and the graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineFile {
    /// File format version for future compatibility
    #[serde(default = "default_file_version")]
    pub version: u32,

    /// Engine configuration
    #[serde(default)]
    pub config: EngineConfig,

    /// Variables available to `${...}` expressions
    #[serde(default)]
    pub variables: Variables,

    /// The stage graph
    pub pipeline: PipelineDefinition,
}

impl PipelineFile {
    pub fn new(pipeline: PipelineDefinition) -> Self {
        Self {
            version: PIPELINE_FILE_VERSION,
            config: EngineConfig::default(),
            variables: Variables::default(),
            pipeline,
        }
    }

    /// Load a pipeline file from disk. `.toml` files are parsed as TOML,
    /// everything else as JSON.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("Failed to read pipeline file {:?}: {}", path, e))
        })?;

        let is_toml = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("toml"))
            .unwrap_or(false);

        let file: PipelineFile = if is_toml {
            toml::from_str(&content).map_err(|e| {
                EngineError::Serialization(format!("Failed to parse {:?}: {}", path, e))
            })?
        } else {
            serde_json::from_str(&content).map_err(|e| {
                EngineError::Serialization(format!("Failed to parse {:?}: {}", path, e))
            })?
        };

        file.pipeline.validate()?;
        Ok(file)
    }

    /// Build an engine for this file's graph, settings and variables
    pub fn into_engine(self, factory: Arc<dyn StageFactory>) -> Pipeline {
        PipelineBuilder::new(self.pipeline, factory)
            .config(self.config)
            .variables(Arc::new(self.variables))
            .build()
    }

    /// Save as pretty-printed JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    EngineError::Config(format!("Failed to create directory {:?}: {}", parent, e))
                })?;
            }
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| EngineError::Serialization(format!("Failed to serialize: {}", e)))?;

        std::fs::write(path, content).map_err(|e| {
            EngineError::Config(format!("Failed to write pipeline file {:?}: {}", path, e))
        })
    }
}
