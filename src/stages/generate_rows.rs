//! GenerateRowsStage: source stage emitting a counted sequence.
//!
//! Each copy emits `limit` rows `[start], [start + 1], ...` and then stops.
//! A stop request ends the sequence early.

use crate::pipeline::error::PipelineResult;
use crate::pipeline::row::Row;
use crate::pipeline::stage::{Stage, StageContext, StageIo};
use crate::row;
use crate::stages::{count_setting, int_setting};

const DEFAULT_LIMIT: u64 = 10;

pub struct GenerateRowsStage {
    limit: u64,
    start: i64,
    produced: u64,
}

impl GenerateRowsStage {
    pub fn new() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            start: 1,
            produced: 0,
        }
    }

    fn next_row(&self) -> Row {
        row![self.start + self.produced as i64]
    }
}

impl Default for GenerateRowsStage {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for GenerateRowsStage {
    fn init(&mut self, ctx: &StageContext) -> PipelineResult<()> {
        self.limit = count_setting(ctx.definition, ctx.variables, "limit", DEFAULT_LIMIT)?;
        self.start = int_setting(ctx.definition, ctx.variables, "start", 1)?;
        self.produced = 0;
        ctx.log.debug(format!("Generating {} rows from {}", self.limit, self.start));
        Ok(())
    }

    fn process_row(&mut self, io: &mut StageIo) -> PipelineResult<bool> {
        if io.is_stopped() || self.produced >= self.limit {
            return Ok(false);
        }
        io.put_row(self.next_row())?;
        self.produced += 1;
        Ok(self.produced < self.limit)
    }
}
