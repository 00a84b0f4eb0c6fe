//! CollectStage: keeps every row as a result row and passes it on.

use crate::pipeline::error::PipelineResult;
use crate::pipeline::stage::{Stage, StageIo};

#[derive(Debug, Default)]
pub struct CollectStage;

impl Stage for CollectStage {
    fn process_row(&mut self, io: &mut StageIo) -> PipelineResult<bool> {
        let Some(row) = io.get_row() else {
            return Ok(false);
        };
        io.add_result_row(row.clone());
        io.put_row(row)?;
        Ok(true)
    }
}
