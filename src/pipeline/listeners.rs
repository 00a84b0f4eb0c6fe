//! Pipeline-level listener lists.

use crate::error::Result;
use crate::pipeline::executor::Pipeline;
use crate::pipeline::log::LogChannel;
use parking_lot::Mutex;
use std::sync::Arc;

/// Callback on a pipeline lifecycle event.
pub type PipelineListener = Arc<dyn Fn(&Pipeline) -> Result<()> + Send + Sync>;

/// An ordered list of listeners for one event.
///
/// Firing isolates listeners from each other: every listener runs even if
/// an earlier one failed, and the first failure is returned afterwards.
pub struct ListenerList {
    event: &'static str,
    items: Mutex<Vec<PipelineListener>>,
}

impl ListenerList {
    pub fn new(event: &'static str) -> Self {
        Self {
            event,
            items: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, listener: PipelineListener) {
        self.items.lock().push(listener);
    }

    pub fn insert_first(&self, listener: PipelineListener) {
        self.items.lock().insert(0, listener);
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn fire(&self, pipeline: &Pipeline, log: &LogChannel) -> Result<()> {
        let items = self.items.lock().clone();
        let mut first_error = None;
        for listener in items {
            if let Err(e) = listener(pipeline) {
                log.error(format!("Error in {} listener: {}", self.event, e));
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for ListenerList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerList")
            .field("event", &self.event)
            .field("len", &self.len())
            .finish()
    }
}
