use std::path::PathBuf;

use miner_model::Stage;
use thiserror::Error;

use crate::{
    backend::BackendError, credentials::CredentialError,
    execution::ExecutionError, fetcher::FetchError, provision::ProvisionError,
    workspace::WorkspaceError,
};

/// Failures talking to the backend or pulling an artifact.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("request to {url} failed")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} responded with {status}: {message}")]
    Status {
        url: String,
        status: u16,
        message: String,
    },

    #[error("backend rejected the stored credentials")]
    Unauthorized,

    #[error("artifact source {path} is unreadable")]
    LocalSource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Infrastructure failures of the agent.
///
/// A training script exiting non-zero is not represented here; that is a
/// normal [`miner_model::ExecutionResult`].
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("not authenticated; log in first")]
    NotAuthenticated,

    #[error("stored credentials are unusable ({0}); log in again")]
    CorruptedCredentials(String),

    #[error("backend URL is not configured; set MINER_API_URL")]
    BackendNotConfigured,

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("invalid job specification: {0}")]
    InvalidJobSpec(String),

    #[error("invalid job id `{0}`")]
    InvalidJobId(String),

    #[error("provisioning failed: {0}")]
    ProvisioningFailed(#[from] ProvisionError),

    #[error("could not start the training script: {0}")]
    SpawnFailed(String),

    #[error("job {doc_id} is already in progress ({holder})")]
    JobInProgress { doc_id: String, holder: String },

    #[error("workspace for {doc_id} is unusable: {reason}")]
    WorkspaceCorrupted { doc_id: String, reason: String },

    #[error("interrupted by the operator")]
    Cancelled,

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl AgentError {
    /// Whether the operator has to log in again to recover.
    pub fn needs_login(&self) -> bool {
        matches!(
            self,
            AgentError::NotAuthenticated
                | AgentError::CorruptedCredentials(_)
                | AgentError::Network(NetworkError::Unauthorized)
        )
    }
}

impl From<CredentialError> for AgentError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::NotAuthenticated => AgentError::NotAuthenticated,
            CredentialError::Corrupted(reason) => {
                AgentError::CorruptedCredentials(reason)
            }
            CredentialError::Io { path, source } => {
                AgentError::CorruptedCredentials(format!(
                    "cannot access {}: {source}",
                    path.display()
                ))
            }
        }
    }
}

impl From<FetchError> for AgentError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Network(err) => AgentError::Network(err),
            FetchError::UnsupportedScheme(scheme) => AgentError::InvalidJobSpec(
                format!("unsupported artifact URL scheme `{scheme}`"),
            ),
            FetchError::Io { path, source } => AgentError::Io {
                context: format!("failed to write {}", path.display()),
                source,
            },
        }
    }
}

impl From<BackendError> for AgentError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Network(err) => AgentError::Network(err),
            BackendError::Protocol(reason) => AgentError::InvalidJobSpec(reason),
        }
    }
}

impl From<WorkspaceError> for AgentError {
    fn from(err: WorkspaceError) -> Self {
        match err {
            WorkspaceError::InvalidJobId(id) => AgentError::InvalidJobId(id),
            WorkspaceError::JobInProgress { doc_id, holder } => {
                AgentError::JobInProgress { doc_id, holder }
            }
            WorkspaceError::Corrupted { doc_id, reason } => {
                AgentError::WorkspaceCorrupted { doc_id, reason }
            }
            WorkspaceError::Io { path, source } => AgentError::Io {
                context: format!("workspace I/O failed at {}", path.display()),
                source,
            },
        }
    }
}

impl From<ExecutionError> for AgentError {
    fn from(err: ExecutionError) -> Self {
        match err {
            ExecutionError::Io {
                context,
                path,
                source,
            } => AgentError::Io {
                context: format!("{context} ({})", path.display()),
                source,
            },
        }
    }
}

/// `Failed(stage, cause)`: the typed outcome of a lifecycle run that did not
/// reach `Completed`.
#[derive(Debug, Error)]
#[error("job {doc_id} failed during {stage}")]
pub struct LifecycleFailure {
    pub doc_id: String,
    pub stage: Stage,
    #[source]
    pub cause: AgentError,
}

impl LifecycleFailure {
    pub fn new(doc_id: impl Into<String>, stage: Stage, cause: impl Into<AgentError>) -> Self {
        Self {
            doc_id: doc_id.into(),
            stage,
            cause: cause.into(),
        }
    }
}
