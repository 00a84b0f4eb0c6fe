//! DummyStage: passes every row through unchanged.

use crate::pipeline::error::PipelineResult;
use crate::pipeline::stage::{Stage, StageIo};

#[derive(Debug, Default)]
pub struct DummyStage;

impl Stage for DummyStage {
    fn process_row(&mut self, io: &mut StageIo) -> PipelineResult<bool> {
        match io.get_row() {
            Some(row) => {
                io.put_row(row)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
