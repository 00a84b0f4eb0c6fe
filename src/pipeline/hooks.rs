//! Extension hooks called at fixed lifecycle points.
//!
//! Hooks run synchronously on the thread that reaches the point. A hook error
//! becomes an [`EngineError::Hook`] and fails the operation that called it.

use crate::error::{EngineError, Result};
use crate::pipeline::executor::Pipeline;
use crate::pipeline::runtime::StageRuntime;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// Named lifecycle points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    PipelinePrepareExecution,
    StageBeforeInitialize,
    StageAfterInitialize,
    PipelineStartThreads,
    StageBeforeStart,
    StageFinished,
    PipelineStart,
    PipelineFinish,
    PipelineCompleted,
}

impl HookPoint {
    pub fn as_str(self) -> &'static str {
        match self {
            HookPoint::PipelinePrepareExecution => "PipelinePrepareExecution",
            HookPoint::StageBeforeInitialize => "StageBeforeInitialize",
            HookPoint::StageAfterInitialize => "StageAfterInitialize",
            HookPoint::PipelineStartThreads => "PipelineStartThreads",
            HookPoint::StageBeforeStart => "StageBeforeStart",
            HookPoint::StageFinished => "StageFinished",
            HookPoint::PipelineStart => "PipelineStart",
            HookPoint::PipelineFinish => "PipelineFinish",
            HookPoint::PipelineCompleted => "PipelineCompleted",
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a hook is called about.
#[derive(Clone, Copy)]
pub enum HookSubject<'a> {
    Pipeline(&'a Pipeline),
    Stage(&'a StageRuntime),
}

/// A plugin subscribed to hook points.
pub trait ExtensionHook: Send + Sync {
    fn call(&self, point: HookPoint, subject: HookSubject<'_>) -> std::result::Result<(), String>;
}

impl<F> ExtensionHook for F
where
    F: Fn(HookPoint, HookSubject<'_>) -> std::result::Result<(), String> + Send + Sync,
{
    fn call(&self, point: HookPoint, subject: HookSubject<'_>) -> std::result::Result<(), String> {
        self(point, subject)
    }
}

/// Registered hooks, per point, in registration order.
#[derive(Default)]
pub struct HookRegistry {
    hooks: RwLock<Vec<(HookPoint, Arc<dyn ExtensionHook>)>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, point: HookPoint, hook: Arc<dyn ExtensionHook>) {
        self.hooks.write().push((point, hook));
    }

    pub fn len(&self) -> usize {
        self.hooks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.read().is_empty()
    }

    /// Call every hook registered for `point`; the first failure stops the
    /// chain and is returned.
    pub fn call(&self, point: HookPoint, subject: HookSubject<'_>) -> Result<()> {
        let hooks: Vec<Arc<dyn ExtensionHook>> = self
            .hooks
            .read()
            .iter()
            .filter(|(p, _)| *p == point)
            .map(|(_, h)| h.clone())
            .collect();

        for hook in hooks {
            hook.call(point, subject).map_err(|message| EngineError::Hook {
                point: point.to_string(),
                message,
            })?;
        }
        Ok(())
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistry")
            .field("hooks", &self.len())
            .finish()
    }
}
