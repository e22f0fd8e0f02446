//! On-disk layout of job workspaces.
//!
//! One directory per job id under the configured jobs dir. `metadata.json` is
//! the completeness marker for the fetch stage and is only ever written after
//! every artifact has landed. Results are staged in `results.partial/` and
//! moved onto `results/` in one rename.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use miner_model::{ArtifactKind, ExecutionResult, WorkspaceMetadata};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    fetcher::part_path,
    fsio::{remove_dir_if_exists, remove_file_if_exists, write_atomically},
};

pub const LOCK_FILE: &str = ".lock";
pub const METADATA_FILE: &str = "metadata.json";
pub const REQUIREMENTS_FILE: &str = "requirements.txt";
pub const PROVISION_LOG: &str = "provision.log";
pub const ENV_DIR: &str = "env";
pub const RESULTS_DIR: &str = "results";
pub const STAGING_DIR: &str = "results.partial";
pub const RESULT_FILE: &str = "result.json";
pub const STDOUT_FILE: &str = "stdout";
pub const STDERR_FILE: &str = "stderr";

const RETIRED_RESULTS_DIR: &str = "results.old";

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("`{0}` is not a valid job id")]
    InvalidJobId(String),

    #[error("job {doc_id} is locked by {holder}")]
    JobInProgress { doc_id: String, holder: String },

    #[error("workspace for {doc_id} is corrupted: {reason}")]
    Corrupted { doc_id: String, reason: String },

    #[error("workspace I/O failed at {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl WorkspaceError {
    fn io(path: &Path, source: io::Error) -> Self {
        WorkspaceError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn corrupted(doc_id: &str, reason: impl Into<String>) -> Self {
        WorkspaceError::Corrupted {
            doc_id: doc_id.to_string(),
            reason: reason.into(),
        }
    }
}

/// Resolved paths of one job directory. Pure path arithmetic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspacePaths {
    pub doc_id: String,
    pub root: PathBuf,
}

impl WorkspacePaths {
    pub fn artifact(&self, kind: ArtifactKind) -> PathBuf {
        self.root.join(kind.file_name())
    }

    pub fn script(&self) -> PathBuf {
        self.artifact(ArtifactKind::Script)
    }

    pub fn metadata(&self) -> PathBuf {
        self.root.join(METADATA_FILE)
    }

    pub fn lock(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    pub fn requirements(&self) -> PathBuf {
        self.root.join(REQUIREMENTS_FILE)
    }

    pub fn provision_log(&self) -> PathBuf {
        self.root.join(PROVISION_LOG)
    }

    pub fn env_dir(&self) -> PathBuf {
        self.root.join(ENV_DIR)
    }

    pub fn results_dir(&self) -> PathBuf {
        self.root.join(RESULTS_DIR)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    pub fn result_file(&self) -> PathBuf {
        self.results_dir().join(RESULT_FILE)
    }
}

/// Overview of one job directory, as listed by [`JobWorkspace::list_jobs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobEntry {
    pub doc_id: String,
    pub fetched: bool,
    pub completed: bool,
    pub locked: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LockRecord {
    pid: u32,
    acquired_at: DateTime<Utc>,
}

/// Exclusive claim on one job directory, released on drop.
#[derive(Debug)]
pub struct JobLock {
    doc_id: String,
    path: PathBuf,
}

impl Drop for JobLock {
    fn drop(&mut self) {
        match remove_file_if_exists(&self.path) {
            Ok(_) => debug!(doc_id = %self.doc_id, "released job lock"),
            Err(err) => warn!(
                doc_id = %self.doc_id,
                error = %err,
                "failed to release job lock"
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobWorkspace {
    jobs_dir: PathBuf,
}

impl JobWorkspace {
    pub fn new(jobs_dir: impl Into<PathBuf>) -> Self {
        Self {
            jobs_dir: jobs_dir.into(),
        }
    }

    pub fn jobs_dir(&self) -> &Path {
        &self.jobs_dir
    }

    pub fn paths(&self, doc_id: &str) -> Result<WorkspacePaths, WorkspaceError> {
        validate_doc_id(doc_id)?;
        Ok(WorkspacePaths {
            doc_id: doc_id.to_string(),
            root: self.jobs_dir.join(doc_id),
        })
    }

    /// Create the job directory if needed.
    pub fn materialize(&self, doc_id: &str) -> Result<WorkspacePaths, WorkspaceError> {
        let paths = self.paths(doc_id)?;
        fs::create_dir_all(&paths.root)
            .map_err(|source| WorkspaceError::io(&paths.root, source))?;
        Ok(paths)
    }

    /// Claim the job directory. A lock whose recorded process has exited is
    /// taken over once; anything else makes the claim fail.
    pub fn lock(&self, doc_id: &str) -> Result<JobLock, WorkspaceError> {
        let paths = self.materialize(doc_id)?;
        let path = paths.lock();
        let mut file = match create_lock_file(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                let Some(stale) = read_lock_record(&path).filter(|r| !pid_alive(r.pid)) else {
                    return Err(WorkspaceError::JobInProgress {
                        doc_id: doc_id.to_string(),
                        holder: describe_holder(&path),
                    });
                };
                warn!(doc_id, pid = stale.pid, "taking over lock of exited process");
                remove_file_if_exists(&path)
                    .map_err(|source| WorkspaceError::io(&path, source))?;
                match create_lock_file(&path) {
                    Ok(file) => file,
                    Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                        return Err(WorkspaceError::JobInProgress {
                            doc_id: doc_id.to_string(),
                            holder: describe_holder(&path),
                        });
                    }
                    Err(source) => return Err(WorkspaceError::io(&path, source)),
                }
            }
            Err(source) => return Err(WorkspaceError::io(&path, source)),
        };

        let lock = JobLock {
            doc_id: doc_id.to_string(),
            path: path.clone(),
        };
        let record = LockRecord {
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        let body = serde_json::to_vec(&record).unwrap_or_default();
        file.write_all(&body)
            .map_err(|source| WorkspaceError::io(&path, source))?;
        debug!(doc_id, "acquired job lock");
        Ok(lock)
    }

    /// Remove a lock left behind by a process that no longer runs.
    pub fn break_lock(&self, doc_id: &str) -> Result<bool, WorkspaceError> {
        let path = self.paths(doc_id)?.lock();
        let removed = remove_file_if_exists(&path)
            .map_err(|source| WorkspaceError::io(&path, source))?;
        if removed {
            warn!(doc_id, "removed job lock by operator request");
        }
        Ok(removed)
    }

    pub fn is_locked(&self, doc_id: &str) -> Result<bool, WorkspaceError> {
        Ok(self.paths(doc_id)?.lock().exists())
    }

    pub fn has_metadata(&self, doc_id: &str) -> Result<bool, WorkspaceError> {
        Ok(self.paths(doc_id)?.metadata().is_file())
    }

    /// Drop the completeness marker ahead of a re-fetch.
    pub fn invalidate(&self, doc_id: &str) -> Result<(), WorkspaceError> {
        let path = self.paths(doc_id)?.metadata();
        if remove_file_if_exists(&path)
            .map_err(|source| WorkspaceError::io(&path, source))?
        {
            debug!(doc_id, "invalidated workspace metadata");
        }
        Ok(())
    }

    pub fn write_metadata(&self, metadata: &WorkspaceMetadata) -> Result<(), WorkspaceError> {
        let doc_id = metadata.spec.doc_id.as_str();
        let path = self.paths(doc_id)?.metadata();
        let body = serde_json::to_vec_pretty(metadata).map_err(|err| {
            WorkspaceError::corrupted(doc_id, format!("unserializable metadata: {err}"))
        })?;
        write_atomically(&path, &body)
            .map_err(|source| WorkspaceError::io(&path, source))?;
        info!(doc_id, "workspace metadata written");
        Ok(())
    }

    pub fn load_metadata(&self, doc_id: &str) -> Result<WorkspaceMetadata, WorkspaceError> {
        let path = self.paths(doc_id)?.metadata();
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(WorkspaceError::corrupted(
                    doc_id,
                    "metadata.json is missing; fetch the job first",
                ));
            }
            Err(source) => return Err(WorkspaceError::io(&path, source)),
        };
        let metadata: WorkspaceMetadata = serde_json::from_slice(&raw)
            .map_err(|err| {
                WorkspaceError::corrupted(doc_id, format!("metadata.json: {err}"))
            })?;
        if metadata.spec.doc_id != doc_id {
            return Err(WorkspaceError::corrupted(
                doc_id,
                format!("metadata.json describes job `{}`", metadata.spec.doc_id),
            ));
        }
        Ok(metadata)
    }

    /// Check every recorded artifact against its recorded size and digest.
    pub fn verify_artifacts(&self, metadata: &WorkspaceMetadata) -> Result<(), WorkspaceError> {
        let doc_id = metadata.spec.doc_id.as_str();
        let paths = self.paths(doc_id)?;
        for kind in ArtifactKind::ALL {
            let record = metadata.artifact(kind).ok_or_else(|| {
                WorkspaceError::corrupted(doc_id, format!("no record for {kind}"))
            })?;
            let path = paths.root.join(&record.file_name);
            let (bytes, sha256) = match digest_file(&path) {
                Ok(found) => found,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    return Err(WorkspaceError::corrupted(
                        doc_id,
                        format!("{} is missing", record.file_name),
                    ));
                }
                Err(source) => return Err(WorkspaceError::io(&path, source)),
            };
            if bytes != record.bytes || sha256 != record.sha256 {
                return Err(WorkspaceError::corrupted(
                    doc_id,
                    format!("{} does not match its recorded digest", record.file_name),
                ));
            }
        }
        Ok(())
    }

    pub fn remove_artifacts(&self, doc_id: &str) -> Result<(), WorkspaceError> {
        let paths = self.paths(doc_id)?;
        for kind in ArtifactKind::ALL {
            let path = paths.artifact(kind);
            for path in [part_path(&path), path] {
                remove_file_if_exists(&path)
                    .map_err(|source| WorkspaceError::io(&path, source))?;
            }
        }
        Ok(())
    }

    pub fn write_requirements(
        &self,
        doc_id: &str,
        dependencies: &[String],
    ) -> Result<(), WorkspaceError> {
        let path = self.paths(doc_id)?.requirements();
        let mut body = dependencies.join("\n");
        if !body.is_empty() {
            body.push('\n');
        }
        write_atomically(&path, body.as_bytes())
            .map_err(|source| WorkspaceError::io(&path, source))
    }

    /// Start a fresh staging directory and return its path.
    pub fn prepare_results(&self, doc_id: &str) -> Result<PathBuf, WorkspaceError> {
        let staging = self.paths(doc_id)?.staging_dir();
        remove_dir_if_exists(&staging)
            .map_err(|source| WorkspaceError::io(&staging, source))?;
        fs::create_dir_all(&staging)
            .map_err(|source| WorkspaceError::io(&staging, source))?;
        Ok(staging)
    }

    /// Replace `results/` with the staging directory.
    pub fn commit_results(&self, doc_id: &str) -> Result<PathBuf, WorkspaceError> {
        let paths = self.paths(doc_id)?;
        let staging = paths.staging_dir();
        let results = paths.results_dir();
        let retired = paths.root.join(RETIRED_RESULTS_DIR);

        if !staging.join(RESULT_FILE).is_file() {
            return Err(WorkspaceError::corrupted(
                doc_id,
                "staging directory has no result.json",
            ));
        }
        remove_dir_if_exists(&retired)
            .map_err(|source| WorkspaceError::io(&retired, source))?;
        if results.exists() {
            fs::rename(&results, &retired)
                .map_err(|source| WorkspaceError::io(&results, source))?;
        }
        fs::rename(&staging, &results)
            .map_err(|source| WorkspaceError::io(&staging, source))?;
        remove_dir_if_exists(&retired)
            .map_err(|source| WorkspaceError::io(&retired, source))?;
        info!(doc_id, results = %results.display(), "results committed");
        Ok(results)
    }

    pub fn discard_results(&self, doc_id: &str) -> Result<(), WorkspaceError> {
        let staging = self.paths(doc_id)?.staging_dir();
        remove_dir_if_exists(&staging)
            .map_err(|source| WorkspaceError::io(&staging, source))?;
        Ok(())
    }

    pub fn has_completed_results(&self, doc_id: &str) -> Result<bool, WorkspaceError> {
        match self.read_result(doc_id) {
            Ok(_) => Ok(true),
            Err(WorkspaceError::Corrupted { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub fn read_result(&self, doc_id: &str) -> Result<ExecutionResult, WorkspaceError> {
        let path = self.paths(doc_id)?.result_file();
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(WorkspaceError::corrupted(doc_id, "no committed results"));
            }
            Err(source) => return Err(WorkspaceError::io(&path, source)),
        };
        serde_json::from_slice(&raw).map_err(|err| {
            WorkspaceError::corrupted(doc_id, format!("result.json: {err}"))
        })
    }

    /// Every job directory under the jobs dir, sorted by id.
    pub fn list_jobs(&self) -> Result<Vec<JobEntry>, WorkspaceError> {
        let entries = match fs::read_dir(&self.jobs_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(WorkspaceError::io(&self.jobs_dir, source)),
        };

        let mut jobs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| WorkspaceError::io(&self.jobs_dir, source))?;
            if !entry.path().is_dir() {
                continue;
            }
            let Some(doc_id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let Ok(paths) = self.paths(&doc_id) else {
                continue;
            };
            jobs.push(JobEntry {
                fetched: paths.metadata().is_file(),
                completed: self.has_completed_results(&doc_id)?,
                locked: paths.lock().exists(),
                doc_id,
            });
        }
        jobs.sort_by(|a, b| a.doc_id.cmp(&b.doc_id));
        Ok(jobs)
    }

    /// Delete every job workspace.
    pub fn remove_all(&self) -> Result<(), WorkspaceError> {
        if remove_dir_if_exists(&self.jobs_dir)
            .map_err(|source| WorkspaceError::io(&self.jobs_dir, source))?
        {
            info!(jobs_dir = %self.jobs_dir.display(), "removed all job workspaces");
        }
        Ok(())
    }
}

fn validate_doc_id(doc_id: &str) -> Result<(), WorkspaceError> {
    let valid = !doc_id.is_empty()
        && doc_id != "."
        && doc_id != ".."
        && doc_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(WorkspaceError::InvalidJobId(doc_id.to_string()))
    }
}

fn create_lock_file(path: &Path) -> io::Result<File> {
    OpenOptions::new().write(true).create_new(true).open(path)
}

fn read_lock_record(lock_path: &Path) -> Option<LockRecord> {
    let raw = fs::read(lock_path).ok()?;
    serde_json::from_slice(&raw).ok()
}

/// Signal 0 checks for existence without delivering anything. EPERM means
/// the process exists under another user.
#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    use nix::{errno::Errno, sys::signal::kill, unistd::Pid};

    let Ok(raw) = i32::try_from(pid) else {
        return true;
    };
    !matches!(kill(Pid::from_raw(raw), None), Err(Errno::ESRCH))
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}

fn describe_holder(lock_path: &Path) -> String {
    read_lock_record(lock_path)
        .map(|record| {
            format!(
                "pid {} since {}",
                record.pid,
                record.acquired_at.format("%Y-%m-%d %H:%M:%S UTC")
            )
        })
        .unwrap_or_else(|| "another process".to_string())
}

fn digest_file(path: &Path) -> io::Result<(u64, String)> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let bytes = io::copy(&mut file, &mut hasher)?;
    Ok((bytes, hex::encode(hasher.finalize())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use miner_model::{ArtifactRecord, ExitStatus, JobSpec};
    use serde_json::json;
    use tempfile::TempDir;

    fn workspace() -> (TempDir, JobWorkspace) {
        let dir = TempDir::new().unwrap();
        let ws = JobWorkspace::new(dir.path().join("jobs"));
        (dir, ws)
    }

    fn spec(doc_id: &str) -> JobSpec {
        serde_json::from_value(json!({
            "docId": doc_id,
            "scriptUrl": "file:///src/script.py",
            "trainingFileUrl": "file:///src/train",
            "validationFileUrl": "file:///src/val"
        }))
        .unwrap()
    }

    fn stage_artifacts(ws: &JobWorkspace, doc_id: &str) -> WorkspaceMetadata {
        let paths = ws.materialize(doc_id).unwrap();
        let artifacts = ArtifactKind::ALL
            .into_iter()
            .map(|kind| {
                let body = format!("{kind} contents");
                fs::write(paths.artifact(kind), &body).unwrap();
                ArtifactRecord {
                    kind,
                    file_name: kind.file_name().to_string(),
                    bytes: body.len() as u64,
                    sha256: hex::encode(Sha256::digest(body.as_bytes())),
                }
            })
            .collect();
        WorkspaceMetadata {
            spec: spec(doc_id),
            artifacts,
            fetched_at: Utc::now(),
        }
    }

    fn stage_result(ws: &JobWorkspace, doc_id: &str, code: i32) {
        let staging = ws.prepare_results(doc_id).unwrap();
        let result = ExecutionResult {
            doc_id: doc_id.to_string(),
            exit_status: if code == 0 {
                ExitStatus::Success
            } else {
                ExitStatus::Failure { code }
            },
            stdout: None,
            stderr: None,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        };
        fs::write(
            staging.join(RESULT_FILE),
            serde_json::to_vec(&result).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn rejects_path_like_job_ids() {
        let (_dir, ws) = workspace();
        for bad in ["", ".", "..", "a/b", "../x", "a b", "x\\y"] {
            assert!(
                matches!(ws.paths(bad), Err(WorkspaceError::InvalidJobId(_))),
                "{bad:?} should be rejected"
            );
        }
        assert!(ws.paths("65f1c2.job_1-a").is_ok());
    }

    #[test]
    fn paths_are_deterministic() {
        let (dir, ws) = workspace();
        let paths = ws.paths("job-1").unwrap();
        assert_eq!(paths.root, dir.path().join("jobs").join("job-1"));
        assert_eq!(paths.script(), paths.root.join("script.py"));
        assert_eq!(
            paths.artifact(ArtifactKind::TrainingData),
            paths.root.join("trainingData")
        );
        assert_eq!(paths.result_file(), paths.root.join("results/result.json"));
    }

    #[test]
    fn metadata_roundtrips_and_invalidate_removes_marker() {
        let (_dir, ws) = workspace();
        let metadata = stage_artifacts(&ws, "job-1");
        ws.write_metadata(&metadata).unwrap();
        assert!(ws.has_metadata("job-1").unwrap());
        assert_eq!(ws.load_metadata("job-1").unwrap(), metadata);

        ws.invalidate("job-1").unwrap();
        assert!(!ws.has_metadata("job-1").unwrap());
        ws.invalidate("job-1").unwrap();
    }

    #[test]
    fn missing_or_garbled_metadata_is_corrupted() {
        let (_dir, ws) = workspace();
        let paths = ws.materialize("job-1").unwrap();
        assert!(matches!(
            ws.load_metadata("job-1"),
            Err(WorkspaceError::Corrupted { .. })
        ));

        fs::write(paths.metadata(), b"{not json").unwrap();
        assert!(matches!(
            ws.load_metadata("job-1"),
            Err(WorkspaceError::Corrupted { .. })
        ));
    }

    #[test]
    fn verify_detects_tampered_artifact() {
        let (_dir, ws) = workspace();
        let metadata = stage_artifacts(&ws, "job-1");
        ws.verify_artifacts(&metadata).unwrap();

        let paths = ws.paths("job-1").unwrap();
        fs::write(paths.artifact(ArtifactKind::ValidationData), b"changed").unwrap();
        assert!(matches!(
            ws.verify_artifacts(&metadata),
            Err(WorkspaceError::Corrupted { .. })
        ));

        fs::remove_file(paths.script()).unwrap();
        let err = ws.verify_artifacts(&metadata).unwrap_err();
        assert!(err.to_string().contains("corrupted"));
    }

    #[test]
    fn second_lock_is_rejected_until_first_is_dropped() {
        let (_dir, ws) = workspace();
        let first = ws.lock("job-1").unwrap();
        assert!(ws.is_locked("job-1").unwrap());

        let err = ws.lock("job-1").unwrap_err();
        match err {
            WorkspaceError::JobInProgress { doc_id, holder } => {
                assert_eq!(doc_id, "job-1");
                assert!(holder.starts_with("pid "), "{holder}");
            }
            other => panic!("unexpected {other:?}"),
        }

        let other_job = ws.lock("job-2").unwrap();
        drop(other_job);

        drop(first);
        assert!(!ws.is_locked("job-1").unwrap());
        let _again = ws.lock("job-1").unwrap();
    }

    #[test]
    fn break_lock_clears_stale_lock() {
        let (_dir, ws) = workspace();
        let paths = ws.materialize("job-1").unwrap();
        fs::write(paths.lock(), b"garbage").unwrap();

        let err = ws.lock("job-1").unwrap_err();
        assert!(matches!(
            err,
            WorkspaceError::JobInProgress { ref holder, .. } if holder == "another process"
        ));
        assert!(ws.break_lock("job-1").unwrap());
        assert!(!ws.break_lock("job-1").unwrap());
        let _lock = ws.lock("job-1").unwrap();
    }

    fn write_lock_record(ws: &JobWorkspace, doc_id: &str, pid: u32) {
        let paths = ws.materialize(doc_id).unwrap();
        let record = LockRecord {
            pid,
            acquired_at: Utc::now(),
        };
        fs::write(paths.lock(), serde_json::to_vec(&record).unwrap()).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn lock_of_exited_process_is_taken_over() {
        let (_dir, ws) = workspace();
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        write_lock_record(&ws, "job-1", pid);

        let lock = ws.lock("job-1").unwrap();
        let record = read_lock_record(&ws.paths("job-1").unwrap().lock()).unwrap();
        assert_eq!(record.pid, std::process::id());
        drop(lock);
        assert!(!ws.is_locked("job-1").unwrap());
    }

    #[test]
    fn lock_of_running_process_is_kept() {
        let (_dir, ws) = workspace();
        write_lock_record(&ws, "job-1", std::process::id());

        let err = ws.lock("job-1").unwrap_err();
        assert!(matches!(err, WorkspaceError::JobInProgress { .. }));
        assert!(ws.is_locked("job-1").unwrap());
    }

    #[test]
    fn commit_replaces_previous_results() {
        let (_dir, ws) = workspace();
        ws.materialize("job-1").unwrap();
        assert!(!ws.has_completed_results("job-1").unwrap());

        stage_result(&ws, "job-1", 1);
        ws.commit_results("job-1").unwrap();
        assert_eq!(
            ws.read_result("job-1").unwrap().exit_status,
            ExitStatus::Failure { code: 1 }
        );

        stage_result(&ws, "job-1", 0);
        let paths = ws.paths("job-1").unwrap();
        fs::write(paths.staging_dir().join(STDOUT_FILE), b"done").unwrap();
        ws.commit_results("job-1").unwrap();

        assert!(ws.has_completed_results("job-1").unwrap());
        assert!(ws.read_result("job-1").unwrap().succeeded());
        assert!(!paths.staging_dir().exists());
        assert!(!paths.root.join(RETIRED_RESULTS_DIR).exists());
        assert_eq!(fs::read(paths.results_dir().join(STDOUT_FILE)).unwrap(), b"done");
    }

    #[test]
    fn commit_without_result_file_is_refused() {
        let (_dir, ws) = workspace();
        ws.materialize("job-1").unwrap();
        ws.prepare_results("job-1").unwrap();
        assert!(ws.commit_results("job-1").is_err());
        ws.discard_results("job-1").unwrap();
        assert!(!ws.paths("job-1").unwrap().staging_dir().exists());
    }

    #[test]
    fn lists_jobs_and_removes_all() {
        let (_dir, ws) = workspace();
        assert!(ws.list_jobs().unwrap().is_empty());

        let metadata = stage_artifacts(&ws, "b-job");
        ws.write_metadata(&metadata).unwrap();
        ws.materialize("a-job").unwrap();
        let _lock = ws.lock("a-job").unwrap();

        let jobs = ws.list_jobs().unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].doc_id, "a-job");
        assert!(jobs[0].locked && !jobs[0].fetched);
        assert!(jobs[1].fetched && !jobs[1].completed);

        ws.remove_all().unwrap();
        assert!(!ws.jobs_dir().exists());
        ws.remove_all().unwrap();
    }

    #[test]
    fn requirements_file_lists_dependencies() {
        let (_dir, ws) = workspace();
        ws.materialize("job-1").unwrap();
        ws.write_requirements("job-1", &["numpy".into(), "torch==2.3".into()])
            .unwrap();
        let body = fs::read_to_string(ws.paths("job-1").unwrap().requirements()).unwrap();
        assert_eq!(body, "numpy\ntorch==2.3\n");
    }
}
