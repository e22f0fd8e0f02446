//! Running the job script as a child process.
//!
//! Both output streams are copied straight into files of the results staging
//! directory while the child runs. The engine waits for exactly one of: the
//! child exiting, the cancellation token, or the deadline. `result.json` is
//! always the last file written.

use std::{
    io,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use miner_model::{ArtifactKind, CapturedStream, ExecutionResult, ExitStatus, InterruptReason};
use thiserror::Error;
use tokio::{io::AsyncRead, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    command::{CommandSpec, to_command},
    fsio::write_atomically,
    provision::EnvironmentHandle,
    workspace::{RESULT_FILE, STDERR_FILE, STDOUT_FILE, WorkspacePaths},
};

pub const ENV_JOB_ID: &str = "MINER_JOB_ID";
pub const ENV_TRAINING_DATA: &str = "MINER_TRAINING_DATA";
pub const ENV_VALIDATION_DATA: &str = "MINER_VALIDATION_DATA";
pub const ENV_RESULTS_DIR: &str = "MINER_RESULTS_DIR";

/// How long output capture may outlive the job's processes.
const CAPTURE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("{context} ({path})")]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Everything the engine needs to run one job script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub doc_id: String,
    pub script: PathBuf,
    pub working_dir: PathBuf,
    pub training_data: PathBuf,
    pub validation_data: PathBuf,
    /// Where stdout, stderr and `result.json` go.
    pub results_dir: PathBuf,
    pub timeout: Option<Duration>,
}

impl ExecutionRequest {
    pub fn for_workspace(
        paths: &WorkspacePaths,
        results_dir: PathBuf,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            doc_id: paths.doc_id.clone(),
            script: paths.script(),
            working_dir: paths.root.clone(),
            training_data: paths.artifact(ArtifactKind::TrainingData),
            validation_data: paths.artifact(ArtifactKind::ValidationData),
            results_dir,
            timeout,
        }
    }

    pub fn command(&self, env: &EnvironmentHandle) -> CommandSpec {
        env.run_command(&self.script)
            .current_dir(&self.working_dir)
            .env(ENV_JOB_ID, self.doc_id.clone())
            .env(ENV_TRAINING_DATA, path_value(&self.training_data))
            .env(ENV_VALIDATION_DATA, path_value(&self.validation_data))
            .env(ENV_RESULTS_DIR, path_value(&self.results_dir))
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// A script that cannot be started yields `Ok` with
    /// [`ExitStatus::Crashed`]; `Err` is reserved for failures to record the
    /// outcome at all.
    async fn run(
        &self,
        env: &EnvironmentHandle,
        request: &ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, ExecutionError>;
}

#[derive(Debug, Clone, Default)]
pub struct ProcessEngine;

impl ProcessEngine {
    pub fn new() -> Self {
        Self
    }
}

enum Outcome {
    Exited(io::Result<std::process::ExitStatus>),
    Interrupted(InterruptReason),
}

#[async_trait]
impl ExecutionEngine for ProcessEngine {
    async fn run(
        &self,
        env: &EnvironmentHandle,
        request: &ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, ExecutionError> {
        let results_dir = &request.results_dir;
        tokio::fs::create_dir_all(results_dir)
            .await
            .map_err(|source| ExecutionError::Io {
                context: "creating results directory",
                path: results_dir.clone(),
                source,
            })?;

        let spec = request.command(env);
        let started_at = Utc::now();
        info!(doc_id = %request.doc_id, command = %spec, "starting job script");

        let mut command = to_command(&spec);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // The script and everything it forks share one group, killed as a unit.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!(doc_id = %request.doc_id, error = %err, "job script failed to start");
                let result = ExecutionResult::crashed(
                    &request.doc_id,
                    format!("failed to start `{spec}`: {err}"),
                    started_at,
                );
                write_result(results_dir, &result)?;
                return Ok(result);
            }
        };
        let group = child.id();

        let stdout = spawn_capture(child.stdout.take(), results_dir.join(STDOUT_FILE));
        let stderr = spawn_capture(child.stderr.take(), results_dir.join(STDERR_FILE));

        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            _ = cancel.cancelled() => Outcome::Interrupted(InterruptReason::Cancelled),
            _ = deadline(request.timeout) => Outcome::Interrupted(InterruptReason::TimedOut),
        };

        let exit_status = match outcome {
            Outcome::Exited(Ok(status)) => classify(status),
            Outcome::Exited(Err(err)) => ExitStatus::Crashed {
                reason: format!("lost track of the job process: {err}"),
            },
            Outcome::Interrupted(reason) => {
                warn!(doc_id = %request.doc_id, ?reason, "stopping job script");
                kill_group(group);
                if let Err(err) = child.start_kill() {
                    debug!(error = %err, "job script already gone");
                }
                if let Err(err) = child.wait().await {
                    warn!(error = %err, "failed to reap job script");
                }
                ExitStatus::Interrupted { reason }
            }
        };

        // Background processes the script left behind would hold the output
        // pipes open.
        if kill_group(group) {
            warn!(doc_id = %request.doc_id, "killed processes left behind by the job script");
        }

        let (stdout, stderr) = tokio::join!(
            finish_capture(stdout, STDOUT_FILE, results_dir),
            finish_capture(stderr, STDERR_FILE, results_dir),
        );
        let (stdout, stderr) = (stdout?, stderr?);

        let result = ExecutionResult {
            doc_id: request.doc_id.clone(),
            exit_status,
            stdout: Some(stdout),
            stderr: Some(stderr),
            started_at,
            finished_at: Utc::now(),
        };
        write_result(results_dir, &result)?;

        info!(
            doc_id = %request.doc_id,
            status = %result.exit_status.describe(),
            elapsed = ?result.duration(),
            "job script finished"
        );
        Ok(result)
    }
}

fn spawn_capture<R>(reader: Option<R>, path: PathBuf) -> JoinHandle<io::Result<u64>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut file = tokio::fs::File::create(&path).await?;
        let Some(mut reader) = reader else {
            return Ok(0);
        };
        let bytes = tokio::io::copy(&mut reader, &mut file).await?;
        file.sync_all().await?;
        Ok(bytes)
    })
}

async fn finish_capture(
    mut task: JoinHandle<io::Result<u64>>,
    file_name: &str,
    results_dir: &Path,
) -> Result<CapturedStream, ExecutionError> {
    let path = results_dir.join(file_name);
    let joined = match tokio::time::timeout(CAPTURE_GRACE, &mut task).await {
        Ok(joined) => joined,
        Err(_) => {
            warn!(stream = file_name, "output still open after the job ended; closing it");
            task.abort();
            let bytes = tokio::fs::metadata(&path)
                .await
                .map(|meta| meta.len())
                .unwrap_or_default();
            return Ok(CapturedStream {
                file_name: file_name.to_string(),
                bytes,
            });
        }
    };
    let bytes = match joined {
        Ok(result) => result,
        Err(join) => Err(io::Error::other(join)),
    }
    .map_err(|source| ExecutionError::Io {
        context: "capturing output",
        path,
        source,
    })?;
    Ok(CapturedStream {
        file_name: file_name.to_string(),
        bytes,
    })
}

fn write_result(results_dir: &Path, result: &ExecutionResult) -> Result<(), ExecutionError> {
    let path = results_dir.join(RESULT_FILE);
    let body = serde_json::to_vec_pretty(result).map_err(|err| ExecutionError::Io {
        context: "encoding result",
        path: path.clone(),
        source: io::Error::other(err),
    })?;
    write_atomically(&path, &body).map_err(|source| ExecutionError::Io {
        context: "writing result",
        path,
        source,
    })
}

async fn deadline(timeout: Option<Duration>) {
    match timeout {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending().await,
    }
}

fn classify(status: std::process::ExitStatus) -> ExitStatus {
    if status.success() {
        ExitStatus::Success
    } else if let Some(code) = status.code() {
        ExitStatus::Failure { code }
    } else {
        ExitStatus::Terminated {
            signal: signal_of(status),
        }
    }
}

#[cfg(unix)]
fn signal_of(status: std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn signal_of(_status: std::process::ExitStatus) -> Option<i32> {
    None
}

/// SIGKILL the job's process group. `false` when nothing was left to kill.
#[cfg(unix)]
fn kill_group(group: Option<u32>) -> bool {
    use nix::{
        errno::Errno,
        sys::signal::{Signal, killpg},
        unistd::Pid,
    };

    let Some(id) = group.and_then(|id| i32::try_from(id).ok()) else {
        return false;
    };
    match killpg(Pid::from_raw(id), Signal::SIGKILL) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(err) => {
            warn!(group = id, error = %err, "failed to signal job process group");
            false
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_group: Option<u32>) -> bool {
    false
}

fn path_value(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
