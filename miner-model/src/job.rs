use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use url::Url;

/// URL schemes an artifact location may use.
pub const SUPPORTED_SCHEMES: &[&str] = &["http", "https", "file"];

/// A training job as assigned by the backend.
///
/// The wire shape follows the backend's camelCase payload. Unknown fields are
/// kept in [`JobSpec::extra`] so the copy persisted in the workspace is a
/// faithful record of what was received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    #[serde(rename = "docId", default)]
    pub doc_id: String,
    #[serde(rename = "scriptUrl", alias = "scriptLocation")]
    pub script_location: Url,
    #[serde(rename = "trainingFileUrl", alias = "trainingDataLocation")]
    pub training_data_location: Url,
    #[serde(rename = "validationFileUrl", alias = "validationDataLocation")]
    pub validation_data_location: Url,
    /// Packages to install, in order.
    #[serde(
        rename = "dependencies",
        alias = "dependencyList",
        alias = "requirements",
        default
    )]
    pub dependency_list: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobSpecError {
    #[error("job payload is for `{actual}` but `{expected}` was requested")]
    DocIdMismatch { expected: String, actual: String },

    #[error("{kind} location `{url}` uses unsupported scheme `{scheme}`")]
    UnsupportedScheme {
        kind: ArtifactKind,
        url: String,
        scheme: String,
    },

    #[error("dependency #{index} is empty")]
    EmptyDependency { index: usize },
}

impl JobSpec {
    /// Bind a backend payload to the job id it was requested for.
    ///
    /// Payloads that omit the id get the requested one; payloads naming a
    /// different job are rejected. Locations and dependencies are validated.
    pub fn bind_to(mut self, doc_id: &str) -> Result<Self, JobSpecError> {
        if self.doc_id.is_empty() {
            self.doc_id = doc_id.to_string();
        } else if self.doc_id != doc_id {
            return Err(JobSpecError::DocIdMismatch {
                expected: doc_id.to_string(),
                actual: self.doc_id,
            });
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), JobSpecError> {
        for kind in ArtifactKind::ALL {
            let url = self.location(kind);
            if !SUPPORTED_SCHEMES.contains(&url.scheme()) {
                return Err(JobSpecError::UnsupportedScheme {
                    kind,
                    url: url.to_string(),
                    scheme: url.scheme().to_string(),
                });
            }
        }
        if let Some(index) = self
            .dependency_list
            .iter()
            .position(|dep| dep.trim().is_empty())
        {
            return Err(JobSpecError::EmptyDependency { index });
        }
        Ok(())
    }

    /// Remote location of one of the job's artifacts.
    pub fn location(&self, kind: ArtifactKind) -> &Url {
        match kind {
            ArtifactKind::Script => &self.script_location,
            ArtifactKind::TrainingData => &self.training_data_location,
            ArtifactKind::ValidationData => &self.validation_data_location,
        }
    }
}

/// The three files every job brings along.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Script,
    TrainingData,
    ValidationData,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 3] = [
        ArtifactKind::Script,
        ArtifactKind::TrainingData,
        ArtifactKind::ValidationData,
    ];

    /// File name inside the job workspace.
    pub fn file_name(self) -> &'static str {
        match self {
            ArtifactKind::Script => "script.py",
            ArtifactKind::TrainingData => "trainingData",
            ArtifactKind::ValidationData => "validationData",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactKind::Script => "script",
            ArtifactKind::TrainingData => "training data",
            ArtifactKind::ValidationData => "validation data",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entry of the backend's pending-jobs listing.
///
/// Only the id is interpreted; everything else is passed through for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    #[serde(rename = "docId", alias = "id", default)]
    pub doc_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
