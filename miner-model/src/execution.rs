use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why a run was stopped by the agent rather than finishing on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptReason {
    Cancelled,
    TimedOut,
}

/// How the training script ended.
///
/// Only [`ExitStatus::Crashed`] means the script never ran; every other
/// variant is a legitimate job outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExitStatus {
    Success,
    Failure { code: i32 },
    /// Killed by a signal the agent did not send.
    Terminated { signal: Option<i32> },
    Interrupted { reason: InterruptReason },
    /// The interpreter could not be spawned.
    Crashed { reason: String },
}

impl ExitStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ExitStatus::Success)
    }

    pub fn is_crashed(&self) -> bool {
        matches!(self, ExitStatus::Crashed { .. })
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            ExitStatus::Success => Some(0),
            ExitStatus::Failure { code } => Some(*code),
            _ => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            ExitStatus::Success => "success".to_string(),
            ExitStatus::Failure { code } => format!("failed with exit code {code}"),
            ExitStatus::Terminated { signal: Some(sig) } => {
                format!("terminated by signal {sig}")
            }
            ExitStatus::Terminated { signal: None } => {
                "terminated without exit code".to_string()
            }
            ExitStatus::Interrupted {
                reason: InterruptReason::Cancelled,
            } => "cancelled".to_string(),
            ExitStatus::Interrupted {
                reason: InterruptReason::TimedOut,
            } => "timed out".to_string(),
            ExitStatus::Crashed { reason } => format!("crashed: {reason}"),
        }
    }
}

/// One captured output stream, stored next to the result summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedStream {
    pub file_name: String,
    pub bytes: u64,
}

/// Outcome of a single script run. Written once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub doc_id: String,
    pub exit_status: ExitStatus,
    /// `None` when the process never started.
    pub stdout: Option<CapturedStream>,
    pub stderr: Option<CapturedStream>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionResult {
    pub fn crashed(
        doc_id: impl Into<String>,
        reason: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            doc_id: doc_id.into(),
            exit_status: ExitStatus::Crashed {
                reason: reason.into(),
            },
            stdout: None,
            stderr: None,
            started_at,
            finished_at: Utc::now(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_status.is_success()
    }

    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }
}
