//! The job lifecycle state machine.
//!
//! A run walks `Fetching -> Provisioning -> Running -> Completed`. Each stage
//! is a method that consumes the previous stage's output ([`Fetched`],
//! [`Provisioned`]), so a stage cannot start unless the one before it
//! succeeded. Any infrastructure failure becomes a [`LifecycleFailure`]
//! naming the stage it happened in. A script that runs and exits non-zero is
//! not a failure; it is the job's result.

use std::{fmt, future::Future, sync::Arc, time::Duration};

use chrono::Utc;
use miner_model::{
    ArtifactKind, ArtifactRecord, ExecutionResult, ExitStatus, JobSpec, Stage,
    SystemDetails, WorkspaceMetadata,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    backend::JobBackend,
    context::AgentContext,
    error::{AgentError, LifecycleFailure},
    execution::{ExecutionEngine, ExecutionRequest, ProcessEngine},
    fetcher::{ArtifactFetcher, FetchError, FetchedArtifact, HttpFetcher},
    provision::{EnvironmentHandle, EnvironmentProvisioner, VenvProvisioner},
    workspace::{JobWorkspace, WorkspacePaths},
};

/// Per-run knobs of [`LifecycleManager::start_training`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Skip downloads when the stored metadata matches the backend's job and
    /// every artifact still verifies.
    pub reuse_artifacts: bool,
    pub system_details: SystemDetails,
    pub cancel: CancellationToken,
}

/// Outcome of a run that reached `Completed`.
#[derive(Debug, Clone)]
pub struct LifecycleReport {
    pub doc_id: String,
    pub transitions: Vec<Stage>,
    pub result: ExecutionResult,
}

/// Output of the fetch stage: artifacts on disk, metadata written.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub paths: WorkspacePaths,
    pub metadata: WorkspaceMetadata,
}

/// Output of the provisioning stage.
#[derive(Debug, Clone)]
pub struct Provisioned {
    pub paths: WorkspacePaths,
    pub metadata: WorkspaceMetadata,
    pub environment: EnvironmentHandle,
}

pub struct LifecycleManager {
    workspace: JobWorkspace,
    backend: Option<Arc<dyn JobBackend>>,
    fetcher: Arc<dyn ArtifactFetcher>,
    provisioner: Arc<dyn EnvironmentProvisioner>,
    engine: Arc<dyn ExecutionEngine>,
    default_dependencies: Vec<String>,
    execution_timeout: Option<Duration>,
}

impl fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("workspace", &self.workspace)
            .field("has_backend", &self.backend.is_some())
            .field("default_dependencies", &self.default_dependencies)
            .field("execution_timeout", &self.execution_timeout)
            .finish_non_exhaustive()
    }
}

impl LifecycleManager {
    pub fn new(
        workspace: JobWorkspace,
        fetcher: Arc<dyn ArtifactFetcher>,
        provisioner: Arc<dyn EnvironmentProvisioner>,
        engine: Arc<dyn ExecutionEngine>,
    ) -> Self {
        Self {
            workspace,
            backend: None,
            fetcher,
            provisioner,
            engine,
            default_dependencies: Vec::new(),
            execution_timeout: None,
        }
    }

    /// Production wiring: HTTP backend (when a URL is configured), reqwest
    /// fetcher, venv provisioner and process engine.
    pub fn from_context(ctx: &AgentContext) -> Result<Self, AgentError> {
        let config = ctx.config();
        let fetcher = HttpFetcher::new(config.request_timeout)?;
        let mut manager = Self::new(
            ctx.workspace(),
            Arc::new(fetcher),
            Arc::new(VenvProvisioner::new(config.python.clone())),
            Arc::new(ProcessEngine::new()),
        )
        .with_default_dependencies(config.default_dependencies.clone())
        .with_execution_timeout(config.execution_timeout);

        match ctx.backend() {
            Ok(backend) => manager = manager.with_backend(Arc::new(backend)),
            Err(AgentError::BackendNotConfigured) => {}
            Err(err) => return Err(err),
        }
        Ok(manager)
    }

    pub fn with_backend(mut self, backend: Arc<dyn JobBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_default_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.default_dependencies = dependencies;
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.execution_timeout = timeout;
        self
    }

    pub fn workspace(&self) -> &JobWorkspace {
        &self.workspace
    }

    /// Claim the job with the backend and take it all the way to `Completed`.
    pub async fn start_training(
        &self,
        ctx: &AgentContext,
        doc_id: &str,
        options: RunOptions,
    ) -> Result<LifecycleReport, LifecycleFailure> {
        let progress = Progress::begin(doc_id);

        let credentials = ctx.require_credentials().map_err(|e| progress.fail(e))?;
        let _lock = self.workspace.lock(doc_id).map_err(|e| progress.fail(e))?;
        let backend = self.backend().map_err(|e| progress.fail(e))?;

        let fetch = async {
            let payload = backend
                .start_training(credentials, doc_id, &options.system_details)
                .await?;
            let spec = bind_spec(payload, doc_id)?;
            Ok::<_, AgentError>(self.fetch(spec, options.reuse_artifacts).await?)
        };
        let fetched = self
            .fetch_stage(doc_id, &options.cancel, fetch)
            .await
            .map_err(|e| progress.fail(e))?;

        self.finish(progress, fetched, options.cancel).await
    }

    /// Fetch stage only: request the job details and stage the artifacts.
    pub async fn fetch_job(
        &self,
        ctx: &AgentContext,
        doc_id: &str,
        reuse_artifacts: bool,
        cancel: CancellationToken,
    ) -> Result<WorkspaceMetadata, LifecycleFailure> {
        let progress = Progress::begin(doc_id);

        let credentials = ctx.require_credentials().map_err(|e| progress.fail(e))?;
        let _lock = self.workspace.lock(doc_id).map_err(|e| progress.fail(e))?;
        let backend = self.backend().map_err(|e| progress.fail(e))?;

        let fetch = async {
            let payload = backend.job_details(credentials, doc_id).await?;
            let spec = bind_spec(payload, doc_id)?;
            Ok::<_, AgentError>(self.fetch(spec, reuse_artifacts).await?)
        };
        let fetched = self
            .fetch_stage(doc_id, &cancel, fetch)
            .await
            .map_err(|e| progress.fail(e))?;
        Ok(fetched.metadata)
    }

    /// Resume a job that was fetched earlier, without talking to the backend.
    ///
    /// The fetch stage is satisfied from disk: the metadata must be present
    /// and every artifact must still match its recorded digest.
    pub async fn execute_job(
        &self,
        doc_id: &str,
        cancel: CancellationToken,
    ) -> Result<LifecycleReport, LifecycleFailure> {
        let progress = Progress::begin(doc_id);

        let _lock = self.workspace.lock(doc_id).map_err(|e| progress.fail(e))?;
        let fetched = until_cancelled(&cancel, self.load_fetched(doc_id))
            .await
            .map_err(|e| progress.fail(e))?;
        info!(doc_id, "resuming from previously fetched artifacts");

        self.finish(progress, fetched, cancel).await
    }

    async fn finish(
        &self,
        mut progress: Progress,
        fetched: Fetched,
        cancel: CancellationToken,
    ) -> Result<LifecycleReport, LifecycleFailure> {
        progress.enter(Stage::Provisioning);
        let provisioned = until_cancelled(&cancel, self.provision(fetched))
            .await
            .map_err(|e| progress.fail(e))?;
        if cancel.is_cancelled() {
            return Err(progress.fail(AgentError::Cancelled));
        }

        progress.enter(Stage::Running);
        let result = self
            .run(&provisioned, cancel)
            .await
            .map_err(|e| progress.fail(e))?;

        progress.enter(Stage::Completed);
        info!(
            doc_id = %progress.doc_id,
            outcome = %result.exit_status.describe(),
            "job completed"
        );
        Ok(LifecycleReport {
            doc_id: progress.doc_id,
            transitions: progress.transitions,
            result,
        })
    }

    /// Run the fetch stage. An interrupted fetch leaves neither metadata
    /// nor artifacts behind.
    async fn fetch_stage(
        &self,
        doc_id: &str,
        cancel: &CancellationToken,
        fetch: impl Future<Output = Result<Fetched, AgentError>>,
    ) -> Result<Fetched, AgentError> {
        let outcome = until_cancelled(cancel, fetch).await;
        if matches!(outcome, Err(AgentError::Cancelled)) {
            let cleanup = self
                .workspace
                .invalidate(doc_id)
                .and_then(|()| self.workspace.remove_artifacts(doc_id));
            if let Err(err) = cleanup {
                warn!(doc_id, error = %err, "failed to clean up interrupted download");
            }
        }
        outcome
    }

    async fn fetch(&self, spec: JobSpec, reuse_artifacts: bool) -> Result<Fetched, AgentError> {
        let doc_id = spec.doc_id.clone();
        let paths = self.workspace.materialize(&doc_id)?;

        if reuse_artifacts
            && let Some(fetched) = self.reusable(&paths, &spec).await
        {
            info!(%doc_id, "artifacts unchanged; skipping download");
            return Ok(fetched);
        }

        self.workspace.invalidate(&doc_id)?;

        let (script, training, validation) = tokio::join!(
            self.fetch_one(&spec, &paths, ArtifactKind::Script),
            self.fetch_one(&spec, &paths, ArtifactKind::TrainingData),
            self.fetch_one(&spec, &paths, ArtifactKind::ValidationData),
        );

        let artifacts = match (script, training, validation) {
            (Ok(script), Ok(training), Ok(validation)) => {
                vec![script, training, validation]
            }
            (script, training, validation) => {
                if let Err(err) = self.workspace.remove_artifacts(&doc_id) {
                    warn!(%doc_id, error = %err, "failed to clean up partial artifacts");
                }
                let err = [script, training, validation]
                    .into_iter()
                    .find_map(Result::err)
                    .map(AgentError::from)
                    .unwrap_or_else(|| AgentError::InvalidJobSpec("download failed".into()));
                return Err(err);
            }
        };

        let metadata = WorkspaceMetadata {
            spec,
            artifacts,
            fetched_at: Utc::now(),
        };
        self.workspace.write_metadata(&metadata)?;
        Ok(Fetched { paths, metadata })
    }

    async fn fetch_one(
        &self,
        spec: &JobSpec,
        paths: &WorkspacePaths,
        kind: ArtifactKind,
    ) -> Result<ArtifactRecord, FetchError> {
        let FetchedArtifact { bytes, sha256 } = self
            .fetcher
            .fetch(spec.location(kind), &paths.artifact(kind))
            .await?;
        Ok(ArtifactRecord {
            kind,
            file_name: kind.file_name().to_string(),
            bytes,
            sha256,
        })
    }

    /// Stored fetch output that can stand in for a new download.
    async fn reusable(&self, paths: &WorkspacePaths, spec: &JobSpec) -> Option<Fetched> {
        let metadata = self.workspace.load_metadata(&paths.doc_id).ok()?;
        if &metadata.spec != spec {
            info!(doc_id = %paths.doc_id, "job changed since last fetch; downloading again");
            return None;
        }
        match self.verify(metadata.clone()).await {
            Ok(()) => Some(Fetched {
                paths: paths.clone(),
                metadata,
            }),
            Err(err) => {
                warn!(doc_id = %paths.doc_id, error = %err, "stored artifacts failed verification");
                None
            }
        }
    }

    async fn load_fetched(&self, doc_id: &str) -> Result<Fetched, AgentError> {
        let paths = self.workspace.paths(doc_id)?;
        let metadata = self.workspace.load_metadata(doc_id)?;
        self.verify(metadata.clone()).await?;
        Ok(Fetched { paths, metadata })
    }

    /// Hash the artifacts off the async runtime; data files can be large.
    async fn verify(&self, metadata: WorkspaceMetadata) -> Result<(), AgentError> {
        let workspace = self.workspace.clone();
        let doc_id = metadata.spec.doc_id.clone();
        tokio::task::spawn_blocking(move || workspace.verify_artifacts(&metadata))
            .await
            .map_err(|err| AgentError::WorkspaceCorrupted {
                doc_id,
                reason: format!("verification did not finish: {err}"),
            })??;
        Ok(())
    }

    async fn provision(&self, fetched: Fetched) -> Result<Provisioned, AgentError> {
        let Fetched { paths, metadata } = fetched;
        let dependencies = self.effective_dependencies(&metadata.spec);
        self.workspace
            .write_requirements(&paths.doc_id, &dependencies)?;

        let environment = self.provisioner.provision(&paths, &dependencies).await?;
        Ok(Provisioned {
            paths,
            metadata,
            environment,
        })
    }

    async fn run(
        &self,
        provisioned: &Provisioned,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, AgentError> {
        let doc_id = provisioned.paths.doc_id.as_str();
        let staging = self.workspace.prepare_results(doc_id)?;
        let request = ExecutionRequest::for_workspace(
            &provisioned.paths,
            staging,
            self.execution_timeout,
        );

        let result = match self
            .engine
            .run(&provisioned.environment, &request, cancel)
            .await
        {
            Ok(result) => result,
            Err(err) => {
                self.discard(doc_id);
                return Err(err.into());
            }
        };

        if let ExitStatus::Crashed { reason } = &result.exit_status {
            self.discard(doc_id);
            return Err(AgentError::SpawnFailed(reason.clone()));
        }

        self.workspace.commit_results(doc_id)?;
        Ok(result)
    }

    fn discard(&self, doc_id: &str) {
        if let Err(err) = self.workspace.discard_results(doc_id) {
            warn!(doc_id, error = %err, "failed to discard staged results");
        }
    }

    fn effective_dependencies(&self, spec: &JobSpec) -> Vec<String> {
        if spec.dependency_list.is_empty() {
            self.default_dependencies.clone()
        } else {
            spec.dependency_list.clone()
        }
    }

    fn backend(&self) -> Result<&dyn JobBackend, AgentError> {
        self.backend
            .as_deref()
            .ok_or(AgentError::BackendNotConfigured)
    }
}

/// Abandon `work` as soon as `cancel` fires. Dropping the future stops any
/// download in flight and kills child processes spawned with `kill_on_drop`.
async fn until_cancelled<T>(
    cancel: &CancellationToken,
    work: impl Future<Output = Result<T, AgentError>>,
) -> Result<T, AgentError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AgentError::Cancelled),
        outcome = work => outcome,
    }
}

fn bind_spec(payload: Value, doc_id: &str) -> Result<JobSpec, AgentError> {
    let spec: JobSpec = serde_json::from_value(payload)
        .map_err(|err| AgentError::InvalidJobSpec(err.to_string()))?;
    spec.bind_to(doc_id)
        .map_err(|err| AgentError::InvalidJobSpec(err.to_string()))
}

/// Stage bookkeeping for one run.
#[derive(Debug)]
struct Progress {
    doc_id: String,
    transitions: Vec<Stage>,
}

impl Progress {
    fn begin(doc_id: &str) -> Self {
        let mut progress = Self {
            doc_id: doc_id.to_string(),
            transitions: Vec::with_capacity(4),
        };
        progress.enter(Stage::Fetching);
        progress
    }

    fn current(&self) -> Stage {
        self.transitions.last().copied().unwrap_or(Stage::Fetching)
    }

    fn enter(&mut self, stage: Stage) {
        debug_assert!(
            self.transitions.last().is_none_or(|last| last.next() == Some(stage)),
            "illegal transition to {stage}"
        );
        info!(doc_id = %self.doc_id, stage = %stage, "lifecycle transition");
        self.transitions.push(stage);
    }

    fn fail(&self, cause: impl Into<AgentError>) -> LifecycleFailure {
        let failure = LifecycleFailure::new(&self.doc_id, self.current(), cause);
        error!(
            doc_id = %failure.doc_id,
            stage = %failure.stage,
            error = %failure.cause,
            "lifecycle failed"
        );
        failure
    }
}
