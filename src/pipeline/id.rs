//! Identity types for the pipeline system.
//!
//! `StageId` and `ChannelId` are newtypes over `u32` that serve as direct array
//! indices into their respective storage vectors. `CopyKey` names one concrete
//! stage copy, `(stage name, copy index)`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Index into `PipelineDefinition::stages`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct StageId(pub u32);

impl StageId {
    pub const INVALID: StageId = StageId(u32::MAX);

    #[inline]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "StageId(INVALID)")
        } else {
            write!(f, "StageId({})", self.0)
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Index into the engine's allocated channel list.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub u32);

impl ChannelId {
    pub const INVALID: ChannelId = ChannelId(u32::MAX);

    #[inline]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "ChannelId(INVALID)")
        } else {
            write!(f, "ChannelId({})", self.0)
        }
    }
}

/// One concrete stage copy: the stage name plus its copy index.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CopyKey {
    pub stage: String,
    pub copy: usize,
}

impl CopyKey {
    pub fn new(stage: impl Into<String>, copy: usize) -> Self {
        Self {
            stage: stage.into(),
            copy,
        }
    }

    /// Case-insensitive match on the stage name, exact match on the copy.
    pub fn matches(&self, stage: &str, copy: usize) -> bool {
        self.copy == copy && self.stage.eq_ignore_ascii_case(stage)
    }
}

impl fmt::Debug for CopyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CopyKey({}.{})", self.stage, self.copy)
    }
}

impl fmt::Display for CopyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.stage, self.copy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_id() {
        let id = StageId(42);
        assert!(id.is_valid());
        assert_eq!(id.index(), 42);
        assert!(!StageId::INVALID.is_valid());
    }

    #[test]
    fn test_channel_id() {
        let id = ChannelId(5);
        assert!(id.is_valid());
        assert!(!ChannelId::INVALID.is_valid());
        assert_eq!(format!("{:?}", ChannelId::INVALID), "ChannelId(INVALID)");
    }

    #[test]
    fn test_copy_key_display_and_match() {
        let key = CopyKey::new("Lookup", 3);
        assert_eq!(key.to_string(), "Lookup.3");
        assert!(key.matches("lookup", 3));
        assert!(!key.matches("lookup", 2));
    }

    #[test]
    fn test_copy_key_ordering() {
        let mut keys = vec![
            CopyKey::new("b", 0),
            CopyKey::new("a", 1),
            CopyKey::new("a", 0),
        ];
        keys.sort();
        assert_eq!(keys[0], CopyKey::new("a", 0));
        assert_eq!(keys[1], CopyKey::new("a", 1));
        assert_eq!(keys[2], CopyKey::new("b", 0));
    }
}
