use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{ArtifactKind, JobSpec};

/// A downloaded artifact as recorded in the workspace metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRecord {
    pub kind: ArtifactKind,
    pub file_name: String,
    pub bytes: u64,
    /// Lowercase hex sha256 of the file contents.
    pub sha256: String,
}

/// Contents of `metadata.json`. Its presence marks a fully fetched job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceMetadata {
    pub spec: JobSpec,
    pub artifacts: Vec<ArtifactRecord>,
    pub fetched_at: DateTime<Utc>,
}

impl WorkspaceMetadata {
    pub fn artifact(&self, kind: ArtifactKind) -> Option<&ArtifactRecord> {
        self.artifacts.iter().find(|record| record.kind == kind)
    }
}
