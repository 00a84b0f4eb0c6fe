//! AbortStage: fails the pipeline once more than `after` rows arrived.
//!
//! Rows up to the threshold pass through. The failure goes through the
//! normal error path, so every other copy gets stopped.

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::stage::{Stage, StageContext, StageIo};
use crate::stages::count_setting;

#[derive(Debug, Default)]
pub struct AbortStage {
    after: u64,
    seen: u64,
}

impl AbortStage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Stage for AbortStage {
    fn init(&mut self, ctx: &StageContext) -> PipelineResult<()> {
        self.after = count_setting(ctx.definition, ctx.variables, "after", 0)?;
        self.seen = 0;
        Ok(())
    }

    fn process_row(&mut self, io: &mut StageIo) -> PipelineResult<bool> {
        let Some(row) = io.get_row() else {
            return Ok(false);
        };
        self.seen += 1;
        if self.seen > self.after {
            return Err(PipelineError::Aborted(self.after));
        }
        io.put_row(row)?;
        Ok(true)
    }
}
