//! Built-in stage kinds and the default factory.
//!
//! Two-layer design, same as any [`Stage`]:
//! - **`BuiltinStage` enum**: all stage kinds shipped with the crate. The
//!   match arms inline, so the hot `process_row` call does no extra virtual
//!   dispatch beyond the engine's `Box<dyn Stage>`.
//! - **Custom constructors**: registered on [`BuiltinStageFactory`] by type
//!   name for stage kinds defined outside the crate.
//!
//! | type            | settings                     |
//! |-----------------|------------------------------|
//! | `generate_rows` | `limit`, `start`             |
//! | `dummy`         |                              |
//! | `filter_rows`   | `field`, `equals`            |
//! | `abort`         | `after`                      |
//! | `delay`         | `delay_ms`                   |
//! | `collect`       |                              |

pub mod abort;
pub mod collect;
pub mod delay;
pub mod dummy;
pub mod filter_rows;
pub mod generate_rows;

pub use abort::AbortStage;
pub use collect::CollectStage;
pub use delay::DelayStage;
pub use dummy::DummyStage;
pub use filter_rows::FilterRowsStage;
pub use generate_rows::GenerateRowsStage;

use crate::config::VariableResolver;
use crate::pipeline::definition::StageDefinition;
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::row::Value;
use crate::pipeline::stage::{Stage, StageContext, StageFactory, StageIo};
use std::collections::HashMap;
use std::sync::Arc;

/// Enum dispatch for built-in stages.
pub enum BuiltinStage {
    GenerateRows(GenerateRowsStage),
    Dummy(DummyStage),
    FilterRows(FilterRowsStage),
    Abort(AbortStage),
    Delay(DelayStage),
    Collect(CollectStage),
}

impl BuiltinStage {
    /// Instance for a stage type name, case-insensitive.
    pub fn from_type(stage_type: &str) -> Option<Self> {
        let stage = match stage_type.to_ascii_lowercase().as_str() {
            "generate_rows" => BuiltinStage::GenerateRows(GenerateRowsStage::new()),
            "dummy" => BuiltinStage::Dummy(DummyStage),
            "filter_rows" => BuiltinStage::FilterRows(FilterRowsStage::new()),
            "abort" => BuiltinStage::Abort(AbortStage::new()),
            "delay" => BuiltinStage::Delay(DelayStage::new()),
            "collect" => BuiltinStage::Collect(CollectStage),
            _ => return None,
        };
        Some(stage)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            BuiltinStage::GenerateRows(_) => "generate_rows",
            BuiltinStage::Dummy(_) => "dummy",
            BuiltinStage::FilterRows(_) => "filter_rows",
            BuiltinStage::Abort(_) => "abort",
            BuiltinStage::Delay(_) => "delay",
            BuiltinStage::Collect(_) => "collect",
        }
    }
}

impl Stage for BuiltinStage {
    fn init(&mut self, ctx: &StageContext) -> PipelineResult<()> {
        match self {
            BuiltinStage::GenerateRows(s) => s.init(ctx),
            BuiltinStage::Dummy(s) => s.init(ctx),
            BuiltinStage::FilterRows(s) => s.init(ctx),
            BuiltinStage::Abort(s) => s.init(ctx),
            BuiltinStage::Delay(s) => s.init(ctx),
            BuiltinStage::Collect(s) => s.init(ctx),
        }
    }

    fn process_row(&mut self, io: &mut StageIo) -> PipelineResult<bool> {
        match self {
            BuiltinStage::GenerateRows(s) => s.process_row(io),
            BuiltinStage::Dummy(s) => s.process_row(io),
            BuiltinStage::FilterRows(s) => s.process_row(io),
            BuiltinStage::Abort(s) => s.process_row(io),
            BuiltinStage::Delay(s) => s.process_row(io),
            BuiltinStage::Collect(s) => s.process_row(io),
        }
    }

    fn dispose(&mut self) {
        match self {
            BuiltinStage::GenerateRows(s) => s.dispose(),
            BuiltinStage::Dummy(s) => s.dispose(),
            BuiltinStage::FilterRows(s) => s.dispose(),
            BuiltinStage::Abort(s) => s.dispose(),
            BuiltinStage::Delay(s) => s.dispose(),
            BuiltinStage::Collect(s) => s.dispose(),
        }
    }
}

/// Constructor for a custom stage type.
pub type StageConstructor =
    Arc<dyn Fn(&StageDefinition, usize) -> PipelineResult<Box<dyn Stage>> + Send + Sync>;

/// Factory for the built-in stage kinds plus registered custom ones.
///
/// Custom registrations win over built-ins of the same name.
#[derive(Clone, Default)]
pub struct BuiltinStageFactory {
    custom: HashMap<String, StageConstructor>,
}

impl BuiltinStageFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor for `stage_type` (case-insensitive).
    pub fn with_stage<F>(mut self, stage_type: &str, constructor: F) -> Self
    where
        F: Fn(&StageDefinition, usize) -> PipelineResult<Box<dyn Stage>> + Send + Sync + 'static,
    {
        self.custom
            .insert(stage_type.to_ascii_lowercase(), Arc::new(constructor));
        self
    }

    pub fn is_registered(&self, stage_type: &str) -> bool {
        self.custom.contains_key(&stage_type.to_ascii_lowercase())
            || BuiltinStage::from_type(stage_type).is_some()
    }
}

impl StageFactory for BuiltinStageFactory {
    fn create(&self, definition: &StageDefinition, copy: usize) -> PipelineResult<Box<dyn Stage>> {
        if let Some(constructor) = self.custom.get(&definition.stage_type.to_ascii_lowercase()) {
            return constructor(definition, copy);
        }
        BuiltinStage::from_type(&definition.stage_type)
            .map(|s| Box::new(s) as Box<dyn Stage>)
            .ok_or_else(|| PipelineError::UnknownStageType(definition.stage_type.clone()))
    }
}

impl std::fmt::Debug for BuiltinStageFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.custom.keys().collect();
        names.sort();
        f.debug_struct("BuiltinStageFactory")
            .field("custom", &names)
            .finish()
    }
}

// ── Setting helpers ──

/// Integer setting; string values go through variable substitution first.
pub(crate) fn int_setting(
    definition: &StageDefinition,
    variables: &dyn VariableResolver,
    key: &str,
    default: i64,
) -> PipelineResult<i64> {
    match definition.setting(key) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Int(v)) => Ok(*v),
        Some(Value::String(s)) => {
            let resolved = variables.resolve(s);
            resolved.trim().parse().map_err(|_| {
                PipelineError::setting(key, format!("'{}' is not an integer", resolved))
            })
        }
        Some(other) => Err(PipelineError::setting(
            key,
            format!("expected an integer, got {}", other),
        )),
    }
}

/// Non-negative integer setting.
pub(crate) fn count_setting(
    definition: &StageDefinition,
    variables: &dyn VariableResolver,
    key: &str,
    default: u64,
) -> PipelineResult<u64> {
    let value = int_setting(definition, variables, key, default as i64)?;
    u64::try_from(value).map_err(|_| PipelineError::setting(key, "must not be negative"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Variables;

    struct Nop;

    impl Stage for Nop {
        fn process_row(&mut self, _io: &mut StageIo) -> PipelineResult<bool> {
            Ok(false)
        }
    }

    #[test]
    fn test_builtin_types_are_case_insensitive() {
        let stage = BuiltinStage::from_type("Generate_Rows").unwrap();
        assert_eq!(stage.type_name(), "generate_rows");
        assert!(BuiltinStage::from_type("nope").is_none());
    }

    #[test]
    fn test_unknown_type_is_an_error() {
        let factory = BuiltinStageFactory::new();
        let def = StageDefinition::new("X", "does_not_exist");
        assert!(matches!(
            factory.create(&def, 0),
            Err(PipelineError::UnknownStageType(t)) if t == "does_not_exist"
        ));
    }

    #[test]
    fn test_custom_stage_registration() {
        let factory = BuiltinStageFactory::new()
            .with_stage("nop", |_, _| Ok(Box::new(Nop) as Box<dyn Stage>));
        assert!(factory.is_registered("NOP"));
        assert!(factory.create(&StageDefinition::new("n", "Nop"), 0).is_ok());
    }

    #[test]
    fn test_int_setting_resolves_variables() {
        let vars = Variables::new().with("N", "42");
        let def = StageDefinition::new("g", "generate_rows")
            .with_setting("limit", "${N}")
            .with_setting("start", 7)
            .with_setting("bad", true);
        assert_eq!(int_setting(&def, &vars, "limit", 0).unwrap(), 42);
        assert_eq!(int_setting(&def, &vars, "start", 0).unwrap(), 7);
        assert_eq!(int_setting(&def, &vars, "missing", 5).unwrap(), 5);
        assert!(int_setting(&def, &vars, "bad", 0).is_err());
    }

    #[test]
    fn test_count_setting_rejects_negative() {
        let vars = Variables::new();
        let def = StageDefinition::new("g", "generate_rows").with_setting("limit", -1);
        assert!(count_setting(&def, &vars, "limit", 0).is_err());
    }
}
