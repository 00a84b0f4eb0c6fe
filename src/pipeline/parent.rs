//! Ancestor execution contexts and the shared allocation lock.

use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

/// Counter state protected by the sync root.
#[derive(Debug, Default)]
pub struct BatchSequence {
    last_batch_id: u64,
}

impl BatchSequence {
    /// Draw the next batch id.
    pub fn next_batch_id(&mut self) -> u64 {
        self.last_batch_id += 1;
        self.last_batch_id
    }

    pub fn last_batch_id(&self) -> u64 {
        self.last_batch_id
    }
}

/// Lock shared by a pipeline and everything nested inside it.
///
/// Channel allocation and batch id assignment run under this lock, so sibling
/// runs started at the same moment never draw the same id.
#[derive(Debug, Clone, Default)]
pub struct SyncRoot(Arc<Mutex<BatchSequence>>);

impl SyncRoot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, BatchSequence> {
        self.0.lock()
    }

    pub fn same_as(&self, other: &SyncRoot) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// A parent pipeline or workflow this run is nested in.
pub trait ExecutionParent: Send + Sync {
    fn name(&self) -> String;

    /// The parent was stopped; nested runs must stop too.
    fn is_stopped(&self) -> bool;

    /// Lock to allocate under. Nested runs share their ancestor's.
    fn sync_root(&self) -> SyncRoot;
}
