//! Test data builders for creating pipelines

use super::mock_helpers::{tracked_factory, TrackedCounters};
use flowrun::config::{EngineConfig, IntExpr};
use flowrun::pipeline::{Pipeline, PipelineDefinition, StageDefinition};
use flowrun::stages::BuiltinStageFactory;
use std::sync::Arc;

/// Builder for linear test pipelines: each added stage is hopped from the
/// previous one.
pub struct LinearBuilder {
    def: PipelineDefinition,
    last: Option<String>,
    config: EngineConfig,
    factory: BuiltinStageFactory,
}

impl LinearBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            def: PipelineDefinition::new(name),
            last: None,
            config: EngineConfig {
                rowset_size: IntExpr::Value(100),
                ..Default::default()
            },
            factory: BuiltinStageFactory::new(),
        }
    }

    pub fn then(mut self, stage: StageDefinition) -> Self {
        let name = stage.name.clone();
        self.def.add_stage(stage);
        if let Some(prev) = self.last.take() {
            self.def = self.def.hop(prev, name.clone());
        }
        self.last = Some(name);
        self
    }

    pub fn config(mut self, f: impl FnOnce(&mut EngineConfig)) -> Self {
        f(&mut self.config);
        self
    }

    pub fn factory(mut self, factory: BuiltinStageFactory) -> Self {
        self.factory = factory;
        self
    }

    pub fn definition(&self) -> &PipelineDefinition {
        &self.def
    }

    pub fn build(self) -> Pipeline {
        Pipeline::builder(self.def, Arc::new(self.factory))
            .config(self.config)
            .build()
    }
}

/// `generate_rows` emitting `1..=limit`
pub fn generator(name: &str, limit: i64) -> StageDefinition {
    StageDefinition::new(name, "generate_rows")
        .with_setting("limit", limit)
        .with_setting("start", 1i64)
}

/// A source that runs until stopped
pub fn endless(name: &str) -> StageDefinition {
    generator(name, i64::MAX)
}

pub fn collector(name: &str) -> StageDefinition {
    StageDefinition::new(name, "collect")
}

pub fn dummy(name: &str) -> StageDefinition {
    StageDefinition::new(name, "dummy")
}

/// Factory knowing `tracked` stages backed by `counters`
pub fn factory_with_tracked(counters: Arc<TrackedCounters>) -> BuiltinStageFactory {
    tracked_factory(BuiltinStageFactory::new(), counters)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_builder_hops() {
        let b = LinearBuilder::new("t")
            .then(generator("a", 1))
            .then(dummy("b"))
            .then(collector("c"));
        let def = b.definition();
        assert_eq!(def.stages.len(), 3);
        assert_eq!(def.hops.len(), 2);
        assert!(def.validate().is_ok());
    }
}
