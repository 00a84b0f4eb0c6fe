//! FilterRowsStage: keeps rows whose `field` equals `equals`.
//!
//! Rows that do not match go to the error target when the stage has one and
//! are counted as rejected otherwise. Without an `equals` setting every row
//! passes (passthrough mode).

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::row::{Row, Value};
use crate::pipeline::stage::{Stage, StageContext, StageIo};
use crate::stages::count_setting;

#[derive(Debug, Default)]
pub struct FilterRowsStage {
    field: usize,
    equals: Option<Value>,
    error_handling: bool,
}

impl FilterRowsStage {
    pub fn new() -> Self {
        Self::default()
    }

    fn matches(&self, row: &Row) -> PipelineResult<bool> {
        let Some(expected) = &self.equals else {
            return Ok(true);
        };
        let value = row.get(self.field).ok_or(PipelineError::FieldOutOfRange {
            index: self.field,
            len: row.len(),
        })?;
        // Int and Number compare by numeric value.
        Ok(match (value.as_float(), expected.as_float()) {
            (Some(a), Some(b)) => a == b,
            _ => value == expected,
        })
    }
}

impl Stage for FilterRowsStage {
    fn init(&mut self, ctx: &StageContext) -> PipelineResult<()> {
        self.field = count_setting(ctx.definition, ctx.variables, "field", 0)? as usize;
        self.equals = ctx
            .definition
            .setting("equals")
            .filter(|v| !v.is_null())
            .cloned();
        self.error_handling = ctx.definition.is_doing_error_handling();
        Ok(())
    }

    fn process_row(&mut self, io: &mut StageIo) -> PipelineResult<bool> {
        let Some(row) = io.get_row() else {
            return Ok(false);
        };
        if self.matches(&row)? {
            io.put_row(row)?;
        } else if self.error_handling {
            io.put_error(row, "row did not match filter")?;
        } else {
            io.inc_rejected();
        }
        Ok(true)
    }
}
