use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle stages of one job run, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetching,
    Provisioning,
    Running,
    Completed,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Fetching => "fetching",
            Stage::Provisioning => "provisioning",
            Stage::Running => "running",
            Stage::Completed => "completed",
        }
    }

    /// The stage that legally follows this one, if any.
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Fetching => Some(Stage::Provisioning),
            Stage::Provisioning => Some(Stage::Running),
            Stage::Running => Some(Stage::Completed),
            Stage::Completed => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
