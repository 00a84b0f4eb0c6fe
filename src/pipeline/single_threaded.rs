//! Single-threaded driver.
//!
//! A pipeline of type `SingleThreaded` gets no worker threads. The caller
//! drives it instead: each iteration gives every unfinished copy, in
//! topological order, one `process_row` call if it has input ready (or has
//! no inputs at all). Channels are unbounded queues, so a put never blocks
//! the only thread there is.
//!
//! ```text
//! while executor.one_iteration()? {}
//! executor.dispose();
//! ```

use crate::config::PipelineType;
use crate::error::{EngineError, Result};
use crate::pipeline::executor::Pipeline;
use crate::pipeline::runtime::{StageRuntime, Step};
use crate::pipeline::topology;
use std::sync::Arc;

pub struct SingleThreadedExecutor {
    pipeline: Pipeline,
    stages: Vec<Arc<StageRuntime>>,
    done: Vec<bool>,
    iterations: u64,
}

impl SingleThreadedExecutor {
    /// Wrap a started single-threaded pipeline.
    pub fn new(pipeline: Pipeline) -> Result<Self> {
        if pipeline.config().pipeline_type != PipelineType::SingleThreaded {
            return Err(EngineError::Config(format!(
                "pipeline '{}' is not single-threaded",
                pipeline.name()
            )));
        }
        if !pipeline.is_running() && !pipeline.is_completed() {
            return Err(EngineError::IllegalState(format!(
                "pipeline '{}' must be started before it can be driven",
                pipeline.name()
            )));
        }

        let mut stages = pipeline.stage_runtimes();
        let reach = pipeline.definition().reachability();
        let stats = topology::cocktail_sort(&mut stages, |a, b| {
            topology::copy_precedes(&reach, (a.stage_id(), a.copy()), (b.stage_id(), b.copy()))
        });
        if !stats.sorted {
            pipeline
                .log()
                .warn("Stage order could not be fully sorted; rows may take extra iterations");
        }

        let done = stages.iter().map(|rt| rt.status().is_terminal()).collect();
        Ok(Self {
            pipeline,
            stages,
            done,
            iterations: 0,
        })
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Execution order of the copies.
    pub fn stages(&self) -> &[Arc<StageRuntime>] {
        &self.stages
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    /// Run one round over all copies. Returns false once every copy is done.
    pub fn one_iteration(&mut self) -> Result<bool> {
        if self.done.iter().all(|d| *d) {
            return Ok(false);
        }
        self.iterations += 1;

        let propagator = self.pipeline.propagator();
        for (rt, done) in self.stages.iter().zip(self.done.iter_mut()) {
            if *done {
                continue;
            }
            if rt.is_stopped() {
                *done = true;
                rt.finish();
                continue;
            }
            if rt.has_inputs() && !rt.has_input_ready() {
                continue;
            }
            if rt.process_once(propagator) == Step::Done {
                *done = true;
                rt.finish();
            }
        }

        Ok(self.done.iter().any(|d| !*d))
    }

    /// Drive until every copy is done.
    pub fn run(&mut self) -> Result<()> {
        while self.one_iteration()? {}
        Ok(())
    }

    /// Stop and finish whatever is still open. Safe to call more than once.
    pub fn dispose(&mut self) {
        for (rt, done) in self.stages.iter().zip(self.done.iter_mut()) {
            if !*done {
                rt.stop();
                *done = true;
                rt.finish();
            }
        }
    }
}

impl Drop for SingleThreadedExecutor {
    fn drop(&mut self) {
        self.dispose();
    }
}
