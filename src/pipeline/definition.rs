//! Pipeline definitions: the immutable graph the engine executes.
//!
//! A [`PipelineDefinition`] is a list of [`StageDefinition`]s connected by
//! directed [`Hop`]s. It is loaded once (usually from a
//! [`PipelineFile`](crate::config::PipelineFile)) and never mutated by the
//! engine.

use crate::config::{IntExpr, VariableResolver};
use crate::error::{EngineError, Result};
use crate::pipeline::id::StageId;
use crate::pipeline::row::Value;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet, VecDeque};

/// How rows are assigned to partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PartitionMethod {
    #[default]
    None,
    /// Integer value of the key field modulo the number of partitions
    Mod,
    /// Every partition receives every row
    Mirror,
}

/// A named set of partition ids. One stage copy runs per id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PartitionSchema {
    pub name: String,
    #[serde(default)]
    pub partition_ids: Vec<String>,
}

impl PartitionSchema {
    pub fn new(name: impl Into<String>, partitions: usize) -> Self {
        let name = name.into();
        let partition_ids = (0..partitions).map(|i| format!("P{}", i + 1)).collect();
        Self {
            name,
            partition_ids,
        }
    }
}

/// Partitioning descriptor of a stage: method + schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PartitioningSpec {
    #[serde(default)]
    pub method: PartitionMethod,
    #[serde(default)]
    pub schema: PartitionSchema,
    /// Row field holding the partition key (for `Mod`)
    #[serde(default)]
    pub field: usize,
}

impl PartitioningSpec {
    pub fn new(method: PartitionMethod, schema: PartitionSchema, field: usize) -> Self {
        Self {
            method,
            schema,
            field,
        }
    }

    pub fn is_partitioned(&self) -> bool {
        self.method != PartitionMethod::None
    }
}

/// How a stage spreads rows over the copies of one target stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RowDistribution {
    /// Rows rotate across the copies of each target stage
    #[default]
    RoundRobin,
    /// Every copy of each target stage receives every row
    Copy,
}

fn default_copies() -> IntExpr {
    IntExpr::Value(1)
}

fn default_true() -> bool {
    true
}

/// One stage in the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDefinition {
    /// Unique name within the pipeline
    pub name: String,

    /// Registered stage kind, resolved by the stage factory
    pub stage_type: String,

    /// Number of copies to run (may be a `${VAR}` expression)
    #[serde(default = "default_copies")]
    pub copies: IntExpr,

    /// Partitioning of this stage's copies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partitioning: Option<PartitioningSpec>,

    /// Explicit partitioning override for rows leaving this stage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_partitioning: Option<PartitioningSpec>,

    /// Name of the next stage that receives this stage's error rows
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_target: Option<String>,

    #[serde(default)]
    pub distribution: RowDistribution,

    /// Embedding stages manage their own channels
    #[serde(default)]
    pub embedding: bool,

    /// Stage-specific settings
    #[serde(default)]
    pub settings: BTreeMap<String, Value>,
}

impl StageDefinition {
    pub fn new(name: impl Into<String>, stage_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stage_type: stage_type.into(),
            copies: default_copies(),
            partitioning: None,
            target_partitioning: None,
            error_target: None,
            distribution: RowDistribution::default(),
            embedding: false,
            settings: BTreeMap::new(),
        }
    }

    pub fn with_copies(mut self, copies: impl Into<IntExpr>) -> Self {
        self.copies = copies.into();
        self
    }

    pub fn with_partitioning(mut self, spec: PartitioningSpec) -> Self {
        self.partitioning = Some(spec);
        self
    }

    pub fn with_target_partitioning(mut self, spec: PartitioningSpec) -> Self {
        self.target_partitioning = Some(spec);
        self
    }

    pub fn with_error_target(mut self, target: impl Into<String>) -> Self {
        self.error_target = Some(target.into());
        self
    }

    pub fn with_distribution(mut self, distribution: RowDistribution) -> Self {
        self.distribution = distribution;
        self
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }

    pub fn embedding(mut self) -> Self {
        self.embedding = true;
        self
    }

    pub fn is_partitioned(&self) -> bool {
        self.partitioning
            .as_ref()
            .map(PartitioningSpec::is_partitioned)
            .unwrap_or(false)
    }

    /// Partitioning spec, only if it actually partitions.
    pub fn active_partitioning(&self) -> Option<&PartitioningSpec> {
        self.partitioning.as_ref().filter(|p| p.is_partitioned())
    }

    pub fn is_doing_error_handling(&self) -> bool {
        self.error_target.is_some()
    }

    /// Resolve the copy count. A partitioned stage runs one copy per
    /// partition id. The value may be negative if a variable resolved badly;
    /// callers decide whether that is fatal.
    pub fn resolve_copies(&self, vars: &dyn VariableResolver) -> Result<i64> {
        if let Some(spec) = self.active_partitioning() {
            if !spec.schema.partition_ids.is_empty() {
                return Ok(spec.schema.partition_ids.len() as i64);
            }
        }
        self.copies.resolve(vars).map_err(|e| {
            e.with_context(format!("copies of stage '{}'", self.name))
        })
    }

    pub fn setting(&self, key: &str) -> Option<&Value> {
        self.settings.get(key)
    }
}

/// A directed data-flow edge between two stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hop {
    pub from: String,
    pub to: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Hop {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            enabled: true,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// The whole stage graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PipelineDefinition {
    pub name: String,
    #[serde(default)]
    pub stages: Vec<StageDefinition>,
    #[serde(default)]
    pub hops: Vec<Hop>,
}

impl PipelineDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            hops: Vec::new(),
        }
    }

    pub fn add_stage(&mut self, stage: StageDefinition) -> StageId {
        let id = StageId(self.stages.len() as u32);
        self.stages.push(stage);
        id
    }

    pub fn add_hop(&mut self, hop: Hop) {
        self.hops.push(hop);
    }

    /// Builder-style `add_stage`.
    pub fn stage(mut self, stage: StageDefinition) -> Self {
        self.add_stage(stage);
        self
    }

    /// Builder-style `add_hop`.
    pub fn hop(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.add_hop(Hop::new(from, to));
        self
    }

    /// Check the graph invariants: unique stage names, hops and error
    /// targets reference existing stages.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for stage in &self.stages {
            if stage.name.is_empty() {
                return Err(EngineError::Definition("stage with empty name".into()));
            }
            if !seen.insert(stage.name.to_ascii_lowercase()) {
                return Err(EngineError::Definition(format!(
                    "stage '{}' appears more than once",
                    stage.name
                )));
            }
        }

        for hop in &self.hops {
            for end in [&hop.from, &hop.to] {
                if self.find_stage(end).is_none() {
                    return Err(EngineError::Definition(format!(
                        "hop {} -> {} references unknown stage '{}'",
                        hop.from, hop.to, end
                    )));
                }
            }
        }

        for (i, stage) in self.stages.iter().enumerate() {
            if let Some(target) = &stage.error_target {
                let connected = self
                    .next_stages(StageId(i as u32))
                    .any(|id| self.stages[id.index()].name.eq_ignore_ascii_case(target));
                if !connected {
                    return Err(EngineError::Definition(format!(
                        "error target '{}' of stage '{}' is not a next stage",
                        target, stage.name
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn stage_id(&self, name: &str) -> Option<StageId> {
        self.stages
            .iter()
            .position(|s| s.name.eq_ignore_ascii_case(name))
            .map(|i| StageId(i as u32))
    }

    pub fn find_stage(&self, name: &str) -> Option<&StageDefinition> {
        self.stage_id(name).map(|id| &self.stages[id.index()])
    }

    pub fn get(&self, id: StageId) -> &StageDefinition {
        &self.stages[id.index()]
    }

    /// Targets of the enabled hops leaving `id`, in hop order.
    pub fn next_stages(&self, id: StageId) -> impl Iterator<Item = StageId> + '_ {
        let name = &self.stages[id.index()].name;
        self.hops
            .iter()
            .filter(move |h| h.enabled && h.from.eq_ignore_ascii_case(name))
            .filter_map(move |h| self.stage_id(&h.to))
    }

    /// Sources of the enabled hops entering `id`, in hop order.
    pub fn previous_stages(&self, id: StageId) -> impl Iterator<Item = StageId> + '_ {
        let name = &self.stages[id.index()].name;
        self.hops
            .iter()
            .filter(move |h| h.enabled && h.to.eq_ignore_ascii_case(name))
            .filter_map(move |h| self.stage_id(&h.from))
    }

    /// A stage with no upstream producer.
    pub fn is_input_stage(&self, id: StageId) -> bool {
        self.previous_stages(id).next().is_none()
    }

    /// Stages that take part in data flow: connected by at least one enabled
    /// hop, or standalone stages without any hop at all.
    pub fn hop_stages(&self) -> Vec<StageId> {
        (0..self.stages.len())
            .map(|i| StageId(i as u32))
            .filter(|&id| {
                let name = &self.stages[id.index()].name;
                let any_hop = self
                    .hops
                    .iter()
                    .any(|h| h.from.eq_ignore_ascii_case(name) || h.to.eq_ignore_ascii_case(name));
                !any_hop
                    || self.next_stages(id).next().is_some()
                    || self.previous_stages(id).next().is_some()
            })
            .collect()
    }

    /// Transitive reachability over enabled hops.
    pub fn reachability(&self) -> Reachability {
        Reachability::new(self)
    }
}

/// Precomputed "is `a` upstream of `b`" matrix.
#[derive(Debug, Clone)]
pub struct Reachability {
    n: usize,
    reach: Vec<bool>,
}

impl Reachability {
    pub fn new(def: &PipelineDefinition) -> Self {
        let n = def.stages.len();
        let mut reach = vec![false; n * n];
        for start in 0..n {
            let mut queue = VecDeque::from([StageId(start as u32)]);
            let mut visited = vec![false; n];
            while let Some(cur) = queue.pop_front() {
                for next in def.next_stages(cur) {
                    if !visited[next.index()] {
                        visited[next.index()] = true;
                        reach[start * n + next.index()] = true;
                        queue.push_back(next);
                    }
                }
            }
        }
        Self { n, reach }
    }

    /// True if rows can flow from `upstream` to `downstream`.
    pub fn is_upstream(&self, upstream: StageId, downstream: StageId) -> bool {
        let (a, b) = (upstream.index(), downstream.index());
        a < self.n && b < self.n && self.reach[a * self.n + b]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Variables;

    fn linear() -> PipelineDefinition {
        PipelineDefinition::new("linear")
            .stage(StageDefinition::new("A", "generate_rows"))
            .stage(StageDefinition::new("B", "dummy"))
            .stage(StageDefinition::new("C", "dummy"))
            .hop("A", "B")
            .hop("B", "C")
    }

    #[test]
    fn test_validate_ok() {
        assert!(linear().validate().is_ok());
    }

    #[test]
    fn test_validate_duplicate_names() {
        let def = PipelineDefinition::new("dup")
            .stage(StageDefinition::new("A", "dummy"))
            .stage(StageDefinition::new("a", "dummy"));
        assert!(matches!(def.validate(), Err(EngineError::Definition(_))));
    }

    #[test]
    fn test_validate_unknown_hop_target() {
        let def = PipelineDefinition::new("bad")
            .stage(StageDefinition::new("A", "dummy"))
            .hop("A", "Z");
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_validate_error_target_must_be_next() {
        let def = PipelineDefinition::new("err")
            .stage(StageDefinition::new("A", "dummy").with_error_target("C"))
            .stage(StageDefinition::new("B", "dummy"))
            .stage(StageDefinition::new("C", "dummy"))
            .hop("A", "B");
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_next_previous_and_inputs() {
        let def = linear();
        let a = def.stage_id("A").unwrap();
        let b = def.stage_id("b").unwrap();
        assert_eq!(def.next_stages(a).collect::<Vec<_>>(), vec![b]);
        assert_eq!(def.previous_stages(b).collect::<Vec<_>>(), vec![a]);
        assert!(def.is_input_stage(a));
        assert!(!def.is_input_stage(b));
    }

    #[test]
    fn test_disabled_hop_ignored() {
        let mut def = linear();
        def.hops[1] = Hop::new("B", "C").disabled();
        let b = def.stage_id("B").unwrap();
        let c = def.stage_id("C").unwrap();
        assert_eq!(def.next_stages(b).count(), 0);
        assert!(def.is_input_stage(c));
        assert!(!def.hop_stages().contains(&c));
    }

    #[test]
    fn test_reachability_is_transitive() {
        let def = linear();
        let r = def.reachability();
        let (a, b, c) = (StageId(0), StageId(1), StageId(2));
        assert!(r.is_upstream(a, b));
        assert!(r.is_upstream(a, c));
        assert!(!r.is_upstream(c, a));
        assert!(!r.is_upstream(a, a));
    }

    #[test]
    fn test_partitioned_copies_follow_schema() {
        let vars = Variables::new();
        let stage = StageDefinition::new("P", "dummy")
            .with_copies(7)
            .with_partitioning(PartitioningSpec::new(
                PartitionMethod::Mod,
                PartitionSchema::new("s", 3),
                0,
            ));
        assert_eq!(stage.resolve_copies(&vars).unwrap(), 3);
    }

    #[test]
    fn test_copies_from_variable() {
        let vars = Variables::new().with("N", "-1");
        let stage = StageDefinition::new("X", "dummy").with_copies("${N}");
        assert_eq!(stage.resolve_copies(&vars).unwrap(), -1);
    }
}
