//! DelayStage: passes rows through, sleeping `delay_ms` before each one.
//!
//! The sleep is sliced so stop and pause requests are honoured promptly.

use crate::pipeline::error::PipelineResult;
use crate::pipeline::stage::{Stage, StageContext, StageIo};
use crate::stages::count_setting;
use std::time::{Duration, Instant};

const SLICE: Duration = Duration::from_millis(10);

#[derive(Debug)]
pub struct DelayStage {
    delay: Duration,
}

impl DelayStage {
    pub fn new() -> Self {
        Self {
            delay: Duration::from_millis(100),
        }
    }

    fn sleep(&self, io: &StageIo) -> bool {
        let deadline = Instant::now() + self.delay;
        loop {
            if io.is_stopped() {
                return false;
            }
            io.wait_while_paused();
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(SLICE.min(deadline - now));
        }
    }
}

impl Default for DelayStage {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for DelayStage {
    fn init(&mut self, ctx: &StageContext) -> PipelineResult<()> {
        let ms = count_setting(ctx.definition, ctx.variables, "delay_ms", 100)?;
        self.delay = Duration::from_millis(ms);
        Ok(())
    }

    fn process_row(&mut self, io: &mut StageIo) -> PipelineResult<bool> {
        let Some(row) = io.get_row() else {
            return Ok(false);
        };
        if !self.sleep(io) {
            return Ok(false);
        }
        io.put_row(row)?;
        Ok(true)
    }
}
