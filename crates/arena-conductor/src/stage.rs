use serde::{Deserialize, Serialize};
use std::fmt;

/// Grading stages in the order they are visited. The derived ordering is the
/// stage order, so a run's stage sequence must be non-decreasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Detection,
    Localization,
    Mitigation,
    Done,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Detection => "detection",
            Stage::Localization => "localization",
            Stage::Mitigation => "mitigation",
            Stage::Done => "done",
        }
    }

    pub fn is_terminal(self) -> bool {
        self == Stage::Done
    }

    /// Session results key the stage's oracle output is stored under.
    pub fn results_key(self) -> Option<&'static str> {
        match self {
            Stage::Detection => Some("Detection Results"),
            Stage::Localization => Some("Localization Results"),
            Stage::Mitigation => Some("Mitigation Results"),
            Stage::Done => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage after a graded submission.
///
/// A failed detection skips localization and goes straight to mitigation.
/// That shortcut is part of the grading protocol and is kept as is pending
/// product confirmation.
pub fn next_stage(stage: Stage, success: bool) -> Stage {
    match stage {
        Stage::Detection if success => Stage::Localization,
        Stage::Detection => Stage::Mitigation,
        Stage::Localization => Stage::Mitigation,
        Stage::Mitigation => Stage::Done,
        Stage::Done => Stage::Done,
    }
}
