//! Mock construction helpers

use flowrun::pipeline::{
    ExecutionParent, PipelineError, PipelineResult, Stage, StageContext, StageIo, SyncRoot,
};
use flowrun::stages::BuiltinStageFactory;
use mockall::mock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

mock! {
    pub Parent {}

    impl ExecutionParent for Parent {
        fn name(&self) -> String;
        fn is_stopped(&self) -> bool;
        fn sync_root(&self) -> SyncRoot;
    }
}

/// A parent that reports itself stopped from the start
pub fn stopped_parent() -> MockParent {
    let mut parent = MockParent::new();
    parent.expect_name().return_const("parent".to_string());
    parent.expect_is_stopped().return_const(true);
    parent.expect_sync_root().returning(SyncRoot::new);
    parent
}

/// Lifecycle counters shared by every `tracked` stage copy
#[derive(Debug, Default)]
pub struct TrackedCounters {
    pub inits: AtomicUsize,
    pub disposes: AtomicUsize,
    pub rows: AtomicUsize,
}

impl TrackedCounters {
    pub fn inits(&self) -> usize {
        self.inits.load(Ordering::SeqCst)
    }

    pub fn disposes(&self) -> usize {
        self.disposes.load(Ordering::SeqCst)
    }

    pub fn rows(&self) -> usize {
        self.rows.load(Ordering::SeqCst)
    }
}

/// Pass-through stage counting its lifecycle calls.
///
/// Settings: `fail_init` (bool), `panic` (bool, panics on the first row).
pub struct TrackedStage {
    counters: Arc<TrackedCounters>,
    panic: bool,
}

impl Stage for TrackedStage {
    fn init(&mut self, ctx: &StageContext) -> PipelineResult<()> {
        self.counters.inits.fetch_add(1, Ordering::SeqCst);
        let flag = |key: &str| {
            ctx.definition
                .setting(key)
                .and_then(|v| v.as_bool())
                .unwrap_or(false)
        };
        self.panic = flag("panic");
        if flag("fail_init") {
            return Err(PipelineError::Init(ctx.key.clone(), "tracked stage told to fail".into()));
        }
        Ok(())
    }

    fn process_row(&mut self, io: &mut StageIo) -> PipelineResult<bool> {
        let Some(row) = io.get_row() else {
            return Ok(false);
        };
        if self.panic {
            panic!("tracked stage panic");
        }
        self.counters.rows.fetch_add(1, Ordering::SeqCst);
        io.put_row(row)?;
        Ok(true)
    }

    fn dispose(&mut self) {
        self.counters.disposes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Register the `tracked` stage type on a factory
pub fn tracked_factory(factory: BuiltinStageFactory, counters: Arc<TrackedCounters>) -> BuiltinStageFactory {
    factory.with_stage("tracked", move |_, _| {
        Ok(Box::new(TrackedStage {
            counters: counters.clone(),
            panic: false,
        }) as Box<dyn Stage>)
    })
}
