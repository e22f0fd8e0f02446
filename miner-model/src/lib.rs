//! Core data model definitions shared across the miner crates.
//!
//! Everything here is plain data: serde-derived payloads exchanged with the
//! job backend and the documents persisted inside a job workspace. No type
//! in this crate touches the filesystem or the network.

pub mod backend;
pub mod credentials;
pub mod execution;
pub mod job;
pub mod stage;
pub mod system;
pub mod workspace;

pub use backend::{LoginRequest, LoginResponse, RegisterMinerRequest, StartTrainingRequest};
pub use credentials::Credentials;
pub use execution::{CapturedStream, ExecutionResult, ExitStatus, InterruptReason};
pub use job::{ArtifactKind, JobSpec, JobSpecError, JobSummary};
pub use stage::Stage;
pub use system::{CpuDetails, GpuDetails, NetworkDetails, OsDetails, SystemDetails};
pub use workspace::{ArtifactRecord, WorkspaceMetadata};
