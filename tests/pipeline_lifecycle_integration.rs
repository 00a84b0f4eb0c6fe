//! Integration tests for the pipeline lifecycle
//!
//! These tests validate the complete engine workflow:
//! - Prepare, start and completion of a run
//! - Initialization failure handling
//! - Listeners and extension hooks
//! - Illegal lifecycle calls

mod common;

use common::builders::{collector, dummy, factory_with_tracked, generator, LinearBuilder};
use common::mock_helpers::TrackedCounters;
use common::{first_ints, ints_in_order, test_timeout};
use flowrun::pipeline::{
    ExecutionState, HookPoint, HookSubject, PipelineDefinition, StageDefinition, StageStatus,
};
use flowrun::{BuiltinStageFactory, EngineError, Pipeline};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

#[test]
fn test_rows_flow_from_source_to_sink() {
    let engine = LinearBuilder::new("round-trip")
        .then(generator("gen", 3))
        .then(collector("out"))
        .build();

    assert_eq!(engine.status(), ExecutionState::Waiting);
    engine.execute().unwrap();
    assert!(engine.wait_until_finished_timeout(test_timeout()));

    let result = engine.result();
    assert_eq!(ints_in_order(&result.rows), vec![1, 2, 3]);
    assert_eq!(result.errors, 0);
    assert!(result.result);
    assert_eq!(result.lines.read, 3);
    assert_eq!(result.lines.written, 3);
    assert_eq!(engine.status(), ExecutionState::Finished);
    assert!(!engine.is_running());

    for rt in engine.stage_runtimes() {
        assert_eq!(rt.status(), StageStatus::Finished);
        assert!(rt.is_disposed());
    }

    let dates = engine.execution_dates();
    assert!(dates.start.is_some());
    assert!(dates.end >= dates.start);
}

#[test]
fn test_prepare_twice_is_illegal() {
    let engine = LinearBuilder::new("twice")
        .then(generator("gen", 1))
        .then(collector("out"))
        .build();

    engine.prepare_execution().unwrap();
    assert!(engine.is_ready_to_start());
    assert!(matches!(
        engine.prepare_execution(),
        Err(EngineError::IllegalState(_))
    ));

    engine.start_threads().unwrap();
    assert!(matches!(engine.start_threads(), Err(EngineError::IllegalState(_))));
    assert!(engine.wait_until_finished_timeout(test_timeout()));
}

#[test]
fn test_start_without_prepare_is_illegal() {
    let engine = LinearBuilder::new("unprepared")
        .then(generator("gen", 1))
        .build();
    assert!(matches!(engine.start_threads(), Err(EngineError::IllegalState(_))));
}

#[test]
fn test_empty_pipeline_completes_immediately() {
    let engine = Pipeline::builder(
        PipelineDefinition::new("empty"),
        Arc::new(BuiltinStageFactory::new()),
    )
    .build();

    let finished = Arc::new(AtomicUsize::new(0));
    let counter = finished.clone();
    engine.add_finished_listener(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    engine.execute().unwrap();
    assert!(engine.wait_until_finished_timeout(test_timeout()));
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert_eq!(engine.status(), ExecutionState::Finished);
    assert!(engine.result().result);
}

#[test]
fn test_init_failure_disposes_every_copy() {
    let counters = Arc::new(TrackedCounters::default());
    let engine = LinearBuilder::new("bad-init")
        .then(generator("gen", 5))
        .then(
            StageDefinition::new("tracked", "tracked")
                .with_copies(2)
                .with_setting("fail_init", true),
        )
        .factory(factory_with_tracked(counters.clone()))
        .build();

    let finished = Arc::new(AtomicBool::new(false));
    let flag = finished.clone();
    engine.add_finished_listener(move |_| {
        flag.store(true, Ordering::SeqCst);
        Ok(())
    });

    let err = engine.prepare_execution().unwrap_err();
    match &err {
        EngineError::InitFailed { failed, log_text } => {
            assert_eq!(failed.len(), 2);
            assert!(failed.iter().all(|k| k.stage == "tracked"));
            assert!(log_text.is_none());
        }
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(counters.inits(), 2);
    assert_eq!(counters.disposes(), 2);

    let gen = engine.find_stage_runtime("gen", 0).unwrap();
    assert_eq!(gen.status(), StageStatus::Halted);
    assert!(gen.is_disposed());
    for copy in 0..2 {
        let rt = engine.find_stage_runtime("tracked", copy).unwrap();
        assert_eq!(rt.status(), StageStatus::Stopped);
        assert_eq!(rt.errors(), 1);
    }

    assert!(engine.has_halted_components());
    assert!(engine.is_finished());
    assert!(engine.is_completed());
    assert!(finished.load(Ordering::SeqCst));
    assert!(matches!(engine.start_threads(), Err(EngineError::IllegalState(_))));
}

#[test]
fn test_preview_attaches_log_text_to_init_failure() {
    let counters = Arc::new(TrackedCounters::default());
    let engine = LinearBuilder::new("preview")
        .then(generator("gen", 5))
        .then(StageDefinition::new("tracked", "tracked").with_setting("fail_init", true))
        .factory(factory_with_tracked(counters))
        .config(|c| c.preview = true)
        .build();

    match engine.prepare_execution() {
        Err(EngineError::InitFailed { log_text, .. }) => {
            let text = log_text.expect("preview run keeps log text");
            assert!(text.contains("tracked stage told to fail"), "log was: {text}");
            assert!(text.contains("failed to initialize"), "log was: {text}");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[test]
fn test_finished_listeners_are_isolated() {
    let engine = LinearBuilder::new("listeners")
        .then(generator("gen", 2))
        .then(collector("out"))
        .build();

    let second_ran = Arc::new(AtomicBool::new(false));
    let flag = second_ran.clone();
    engine.add_finished_listener(|_| Err(EngineError::Listener("boom".into())));
    engine.add_finished_listener(move |p| {
        assert!(p.is_finished());
        flag.store(true, Ordering::SeqCst);
        Ok(())
    });

    engine.execute().unwrap();
    assert!(engine.wait_until_finished_timeout(test_timeout()));
    assert!(second_ran.load(Ordering::SeqCst));
}

#[test]
fn test_failing_started_listener_aborts_start() {
    let counters = Arc::new(TrackedCounters::default());
    let engine = LinearBuilder::new("bad-start")
        .then(generator("gen", 2))
        .then(StageDefinition::new("tracked", "tracked"))
        .then(collector("out"))
        .factory(factory_with_tracked(counters.clone()))
        .build();
    engine.add_started_listener(|_| Err(EngineError::Listener("no".into())));

    engine.prepare_execution().unwrap();
    assert!(matches!(engine.start_threads(), Err(EngineError::Listener(_))));
    assert!(!engine.is_running());
    assert!(engine.wait_until_finished_timeout(test_timeout()));

    assert_eq!(counters.inits(), 1);
    assert_eq!(counters.disposes(), counters.inits());
    assert_eq!(counters.rows(), 0);
    for rt in engine.stage_runtimes() {
        assert!(rt.is_disposed());
        assert_eq!(rt.status(), StageStatus::Halted);
    }
    assert!(engine.is_finished());
}

#[test]
fn test_failing_stage_start_hook_disposes_every_copy() {
    let counters = Arc::new(TrackedCounters::default());
    let engine = LinearBuilder::new("bad-stage-start")
        .then(generator("gen", 2))
        .then(StageDefinition::new("tracked", "tracked").with_copies(2))
        .factory(factory_with_tracked(counters.clone()))
        .build();
    engine.hooks().register(
        HookPoint::StageBeforeStart,
        Arc::new(|_: HookPoint, _: HookSubject<'_>| -> Result<(), String> {
            Err("refused".into())
        }),
    );

    let finished = Arc::new(AtomicUsize::new(0));
    let counter = finished.clone();
    engine.add_finished_listener(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    assert!(matches!(engine.execute(), Err(EngineError::Hook { .. })));
    assert!(!engine.is_running());
    assert!(engine.wait_until_finished_timeout(test_timeout()));
    assert_eq!(counters.disposes(), 2);
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert!(engine.has_halted_components());
}

#[test]
fn test_invalid_definition_fails_prepare() {
    let def = PipelineDefinition::new("dupes")
        .stage(StageDefinition::new("A", "generate_rows").with_setting("limit", 3))
        .stage(StageDefinition::new("A", "generate_rows").with_setting("limit", 5))
        .stage(StageDefinition::new("out", "collect"))
        .hop("A", "out")
        .hop("A", "Missing");
    let engine = Pipeline::builder(def, Arc::new(BuiltinStageFactory::new())).build();

    assert!(matches!(
        engine.prepare_execution(),
        Err(EngineError::Definition(_))
    ));
    assert!(engine.stage_runtimes().is_empty());
    assert!(engine.channels().is_empty());

    let dangling = PipelineDefinition::new("dangling")
        .stage(StageDefinition::new("gen", "generate_rows"))
        .hop("gen", "nowhere");
    let engine = Pipeline::builder(dangling, Arc::new(BuiltinStageFactory::new())).build();
    assert!(matches!(engine.execute(), Err(EngineError::Definition(_))));
}

#[test]
fn test_hooks_see_every_stage_copy() {
    let engine = LinearBuilder::new("hooks")
        .then(generator("gen", 10))
        .then(dummy("mid").with_copies(3))
        .then(collector("out"))
        .build();

    let stage_finished = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));
    {
        let stage_finished = stage_finished.clone();
        engine.hooks().register(
            HookPoint::StageFinished,
            Arc::new(move |_: HookPoint, subject: HookSubject<'_>| -> Result<(), String> {
                assert!(matches!(subject, HookSubject::Stage(_)));
                stage_finished.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        let completed = completed.clone();
        engine.hooks().register(
            HookPoint::PipelineCompleted,
            Arc::new(move |_: HookPoint, _: HookSubject<'_>| -> Result<(), String> {
                completed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
    }

    engine.execute().unwrap();
    assert!(engine.wait_until_finished_timeout(test_timeout()));
    assert_eq!(stage_finished.load(Ordering::SeqCst), 5);
    assert_eq!(completed.load(Ordering::SeqCst), 1);
    assert_eq!(engine.result().rows.len(), 10);
}

#[test]
fn test_failing_prepare_hook_aborts_prepare() {
    let engine = LinearBuilder::new("hook-fail")
        .then(generator("gen", 1))
        .build();
    engine.hooks().register(
        HookPoint::PipelinePrepareExecution,
        Arc::new(|_: HookPoint, _: HookSubject<'_>| -> Result<(), String> {
            Err("not today".into())
        }),
    );

    match engine.prepare_execution() {
        Err(EngineError::Hook { message, .. }) => assert_eq!(message, "not today"),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(!engine.is_preparing());
}

#[test]
fn test_topology_sort_orders_copies() {
    let engine = LinearBuilder::new("sorted")
        .then(generator("gen", 4))
        .then(dummy("mid").with_copies(2))
        .then(collector("out"))
        .config(|c| c.sort_stages_topologically = true)
        .build();

    engine.prepare_execution().unwrap();
    let stats = engine.sort_stats().expect("sort ran");
    assert!(stats.sorted);

    let order: Vec<String> = engine
        .stage_runtimes()
        .iter()
        .map(|rt| rt.name().to_string())
        .collect();
    let pos = |name: &str| order.iter().position(|n| n == name).unwrap();
    assert!(pos("gen") < pos("mid"));
    assert!(order.iter().rposition(|n| n == "mid").unwrap() < pos("out"));

    engine.start_threads().unwrap();
    assert!(engine.wait_until_finished_timeout(test_timeout()));
}
