//! Job lifecycle engine for the miner agent.
//!
//! The [`lifecycle::LifecycleManager`] drives one job through
//! `Fetching -> Provisioning -> Running -> Completed`, delegating to the
//! components below. Each component sits behind a trait so the pipeline
//! ordering can be exercised without a network, an interpreter or a backend.
//!
//! - [`credentials`]: token + miner id persistence
//! - [`fetcher`]: streaming artifact downloads
//! - [`workspace`]: on-disk layout, metadata, results, job lock
//! - [`provision`]: isolated interpreter environments
//! - [`execution`]: child-process execution and output capture
//! - [`backend`]: the job backend's REST surface

pub mod backend;
pub mod command;
pub mod context;
pub mod credentials;
pub mod error;
pub mod execution;
pub mod fetcher;
mod fsio;
pub mod lifecycle;
pub mod provision;
pub mod workspace;

pub use backend::{BackendError, HttpBackend, JobBackend};
pub use context::{AgentContext, CredentialState};
pub use credentials::{CredentialError, CredentialStore};
pub use error::{AgentError, LifecycleFailure, NetworkError};
pub use execution::{ExecutionEngine, ExecutionError, ExecutionRequest, ProcessEngine};
pub use fetcher::{ArtifactFetcher, FetchError, FetchedArtifact, HttpFetcher};
pub use lifecycle::{LifecycleManager, LifecycleReport, RunOptions};
pub use provision::{
    EnvLayout, EnvironmentHandle, EnvironmentProvisioner, ProvisionError,
    ProvisionStage, VenvProvisioner,
};
pub use workspace::{JobEntry, JobLock, JobWorkspace, WorkspaceError, WorkspacePaths};
