//! Pipeline and stage status types.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Pipeline status flags. Independent bits in one atomic word.
#[derive(Debug, Default)]
pub struct PipelineStatus(AtomicU8);

impl PipelineStatus {
    pub const RUNNING: u8 = 1;
    pub const INITIALIZING: u8 = 1 << 1;
    pub const PREPARING: u8 = 1 << 2;
    pub const STOPPED: u8 = 1 << 3;
    pub const FINISHED: u8 = 1 << 4;
    pub const PAUSED: u8 = 1 << 5;

    pub fn new() -> Self {
        Self::default()
    }

    /// Set or clear one flag. Returns the previous word.
    pub fn set(&self, flag: u8, on: bool) -> u8 {
        if on {
            self.0.fetch_or(flag, Ordering::SeqCst)
        } else {
            self.0.fetch_and(!flag, Ordering::SeqCst)
        }
    }

    pub fn is(&self, flag: u8) -> bool {
        self.0.load(Ordering::SeqCst) & flag != 0
    }

    pub fn bits(&self) -> u8 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.is(Self::RUNNING)
    }

    pub fn is_initializing(&self) -> bool {
        self.is(Self::INITIALIZING)
    }

    pub fn is_preparing(&self) -> bool {
        self.is(Self::PREPARING)
    }

    pub fn is_stopped(&self) -> bool {
        self.is(Self::STOPPED)
    }

    pub fn is_finished(&self) -> bool {
        self.is(Self::FINISHED)
    }

    pub fn is_paused(&self) -> bool {
        self.is(Self::PAUSED)
    }
}

/// Status of one stage copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum StageStatus {
    Idle = 0,
    Running = 1,
    Finished = 2,
    Halted = 3,
    Stopped = 4,
}

impl StageStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => StageStatus::Running,
            2 => StageStatus::Finished,
            3 => StageStatus::Halted,
            4 => StageStatus::Stopped,
            _ => StageStatus::Idle,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            StageStatus::Idle => "Idle",
            StageStatus::Running => "Running",
            StageStatus::Finished => "Finished",
            StageStatus::Halted => "Halted",
            StageStatus::Stopped => "Stopped",
        }
    }

    /// The copy will not run (again).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StageStatus::Finished | StageStatus::Halted | StageStatus::Stopped
        )
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Atomic cell for a [`StageStatus`].
#[derive(Debug, Default)]
pub struct AtomicStageStatus(AtomicU8);

impl AtomicStageStatus {
    pub fn load(&self) -> StageStatus {
        StageStatus::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub fn store(&self, status: StageStatus) {
        self.0.store(status as u8, Ordering::SeqCst);
    }
}

/// Human-readable pipeline state as reported by `Pipeline::status()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExecutionState {
    Running,
    Paused,
    Halting,
    Finished,
    FinishedWithErrors,
    Stopped,
    Preparing,
    Initializing,
    Waiting,
}

impl ExecutionState {
    /// Derive the state from the status word and the aggregate error count.
    pub fn from_status(status: &PipelineStatus, errors: u64) -> Self {
        if status.is_running() {
            if status.is_stopped() {
                ExecutionState::Halting
            } else if status.is_paused() {
                ExecutionState::Paused
            } else {
                ExecutionState::Running
            }
        } else if status.is_finished() {
            if errors > 0 {
                ExecutionState::FinishedWithErrors
            } else {
                ExecutionState::Finished
            }
        } else if status.is_stopped() {
            ExecutionState::Stopped
        } else if status.is_preparing() {
            ExecutionState::Preparing
        } else if status.is_initializing() {
            ExecutionState::Initializing
        } else {
            ExecutionState::Waiting
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ExecutionState::Running => "Running",
            ExecutionState::Paused => "Paused",
            ExecutionState::Halting => "Halting",
            ExecutionState::Finished => "Finished",
            ExecutionState::FinishedWithErrors => "Finished (with errors)",
            ExecutionState::Stopped => "Stopped",
            ExecutionState::Preparing => "Preparing executing",
            ExecutionState::Initializing => "Initializing",
            ExecutionState::Waiting => "Waiting",
        };
        f.write_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_are_independent() {
        let status = PipelineStatus::new();
        status.set(PipelineStatus::RUNNING, true);
        status.set(PipelineStatus::PAUSED, true);
        assert!(status.is_running());
        assert!(status.is_paused());
        status.set(PipelineStatus::PAUSED, false);
        assert!(status.is_running());
        assert!(!status.is_paused());
    }

    #[test]
    fn test_stopped_and_finished_coexist() {
        let status = PipelineStatus::new();
        status.set(PipelineStatus::STOPPED, true);
        status.set(PipelineStatus::FINISHED, true);
        assert_eq!(
            status.bits(),
            PipelineStatus::STOPPED | PipelineStatus::FINISHED
        );
        assert_eq!(ExecutionState::from_status(&status, 0), ExecutionState::Finished);
    }

    #[test]
    fn test_execution_state_text() {
        let status = PipelineStatus::new();
        assert_eq!(ExecutionState::from_status(&status, 0).to_string(), "Waiting");

        status.set(PipelineStatus::PREPARING, true);
        assert_eq!(
            ExecutionState::from_status(&status, 0).to_string(),
            "Preparing executing"
        );
        status.set(PipelineStatus::PREPARING, false);

        status.set(PipelineStatus::RUNNING, true);
        status.set(PipelineStatus::STOPPED, true);
        assert_eq!(ExecutionState::from_status(&status, 0), ExecutionState::Halting);

        status.set(PipelineStatus::RUNNING, false);
        status.set(PipelineStatus::FINISHED, true);
        assert_eq!(
            ExecutionState::from_status(&status, 3).to_string(),
            "Finished (with errors)"
        );
    }

    #[test]
    fn test_stage_status_round_trip() {
        let cell = AtomicStageStatus::default();
        assert_eq!(cell.load(), StageStatus::Idle);
        for s in [
            StageStatus::Running,
            StageStatus::Finished,
            StageStatus::Halted,
            StageStatus::Stopped,
        ] {
            cell.store(s);
            assert_eq!(cell.load(), s);
        }
        assert!(StageStatus::Halted.is_terminal());
        assert!(!StageStatus::Running.is_terminal());
    }
}
