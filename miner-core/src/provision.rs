//! Isolated interpreter environments for job scripts.
//!
//! The environment lives in `env/` of the job workspace and is built with the
//! configured interpreter's `venv` module, then populated one dependency at a
//! time. A marker file records what was installed so an unchanged job can be
//! re-run without reinstalling.

use std::{
    fmt,
    io,
    path::{Path, PathBuf},
    process::Output,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::{
    command::{CommandSpec, run_spec_with_output},
    workspace::WorkspacePaths,
};

pub const PROVISIONED_MARKER: &str = ".provisioned.json";

const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionStage {
    CreateEnvironment,
    InstallDependencies,
}

impl fmt::Display for ProvisionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProvisionStage::CreateEnvironment => "create-environment",
            ProvisionStage::InstallDependencies => "install-dependencies",
        })
    }
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("{stage}: could not run `{command}`: {source}")]
    Spawn {
        stage: ProvisionStage,
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("{stage}: `{command}` exited with {status}\n{stderr_tail}")]
    CommandFailed {
        stage: ProvisionStage,
        command: String,
        status: String,
        stderr_tail: String,
    },

    #[error("{stage}: {context}: {source}")]
    Io {
        stage: ProvisionStage,
        context: String,
        #[source]
        source: io::Error,
    },
}

impl ProvisionError {
    pub fn stage(&self) -> ProvisionStage {
        match self {
            ProvisionError::Spawn { stage, .. }
            | ProvisionError::CommandFailed { stage, .. }
            | ProvisionError::Io { stage, .. } => *stage,
        }
    }

    fn io(stage: ProvisionStage, context: impl Into<String>, source: io::Error) -> Self {
        ProvisionError::Io {
            stage,
            context: context.into(),
            source,
        }
    }
}

/// Directory layout of a virtual environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvLayout {
    Posix,
    Windows,
}

impl EnvLayout {
    pub fn host() -> Self {
        if cfg!(windows) {
            EnvLayout::Windows
        } else {
            EnvLayout::Posix
        }
    }
}

/// A provisioned environment. Knows how to invoke its own interpreter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentHandle {
    root: PathBuf,
    layout: EnvLayout,
}

impl EnvironmentHandle {
    pub fn new(root: impl Into<PathBuf>, layout: EnvLayout) -> Self {
        Self {
            root: root.into(),
            layout,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn interpreter_path(&self) -> PathBuf {
        match self.layout {
            EnvLayout::Posix => self.root.join("bin").join("python"),
            EnvLayout::Windows => self.root.join("Scripts").join("python.exe"),
        }
    }

    pub fn install_command(&self, dependency: &str) -> CommandSpec {
        CommandSpec::from_path(&self.interpreter_path())
            .arg("-m")
            .arg("pip")
            .arg("install")
            .arg(dependency)
            .env("PIP_DISABLE_PIP_VERSION_CHECK", "1")
            .env("VIRTUAL_ENV", self.root.to_string_lossy().into_owned())
    }

    /// `{interpreter} {script}`; the caller adds cwd and job variables.
    pub fn run_command(&self, script: &Path) -> CommandSpec {
        CommandSpec::from_path(&self.interpreter_path())
            .path_arg(script)
            .env("VIRTUAL_ENV", self.root.to_string_lossy().into_owned())
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EnvironmentProvisioner: Send + Sync {
    async fn provision(
        &self,
        paths: &WorkspacePaths,
        dependencies: &[String],
    ) -> Result<EnvironmentHandle, ProvisionError>;
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProvisionedMarker {
    dependencies: Vec<String>,
    provisioned_at: DateTime<Utc>,
}

/// Builds environments with `{python} -m venv` and `pip install`.
#[derive(Debug, Clone)]
pub struct VenvProvisioner {
    python: String,
    layout: EnvLayout,
}

impl VenvProvisioner {
    pub fn new(python: impl Into<String>) -> Self {
        Self {
            python: python.into(),
            layout: EnvLayout::host(),
        }
    }

    pub fn with_layout(mut self, layout: EnvLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn create_command(&self, env_dir: &Path) -> CommandSpec {
        CommandSpec::new(self.python.clone())
            .arg("-m")
            .arg("venv")
            .path_arg(env_dir)
    }

    async fn is_current(&self, handle: &EnvironmentHandle, dependencies: &[String]) -> bool {
        if !handle.interpreter_path().is_file() {
            return false;
        }
        let Ok(raw) = tokio::fs::read(handle.root().join(PROVISIONED_MARKER)).await else {
            return false;
        };
        match serde_json::from_slice::<ProvisionedMarker>(&raw) {
            Ok(marker) => marker.dependencies == dependencies,
            Err(err) => {
                warn!(error = %err, "ignoring unreadable provisioning marker");
                false
            }
        }
    }
}

#[async_trait]
impl EnvironmentProvisioner for VenvProvisioner {
    async fn provision(
        &self,
        paths: &WorkspacePaths,
        dependencies: &[String],
    ) -> Result<EnvironmentHandle, ProvisionError> {
        let env_dir = paths.env_dir();
        let handle = EnvironmentHandle::new(&env_dir, self.layout);

        if self.is_current(&handle, dependencies).await {
            info!(doc_id = %paths.doc_id, "environment already provisioned; reusing");
            return Ok(handle);
        }

        let create = ProvisionStage::CreateEnvironment;
        match tokio::fs::remove_dir_all(&env_dir).await {
            Ok(()) => debug!(doc_id = %paths.doc_id, "removed stale environment"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(ProvisionError::io(create, "removing stale environment", source));
            }
        }

        let mut log = ProvisionLog::open(&paths.provision_log()).await?;

        let spec = self.create_command(&env_dir).current_dir(&paths.root);
        info!(doc_id = %paths.doc_id, command = %spec, "creating environment");
        run_step(create, &spec, &mut log).await?;

        let install = ProvisionStage::InstallDependencies;
        for dependency in dependencies {
            let spec = handle.install_command(dependency).current_dir(&paths.root);
            info!(doc_id = %paths.doc_id, dependency, "installing dependency");
            run_step(install, &spec, &mut log).await?;
        }

        let marker = ProvisionedMarker {
            dependencies: dependencies.to_vec(),
            provisioned_at: Utc::now(),
        };
        let body = serde_json::to_vec_pretty(&marker).map_err(|err| {
            ProvisionError::io(install, "encoding marker", io::Error::other(err))
        })?;
        tokio::fs::write(env_dir.join(PROVISIONED_MARKER), body)
            .await
            .map_err(|source| ProvisionError::io(install, "writing marker", source))?;

        info!(
            doc_id = %paths.doc_id,
            dependencies = dependencies.len(),
            "environment provisioned"
        );
        Ok(handle)
    }
}

async fn run_step(
    stage: ProvisionStage,
    spec: &CommandSpec,
    log: &mut ProvisionLog,
) -> Result<(), ProvisionError> {
    let output = run_spec_with_output(spec)
        .await
        .map_err(|source| ProvisionError::Spawn {
            stage,
            command: spec.to_string(),
            source,
        })?;
    log.record(stage, spec, &output).await?;

    if output.status.success() {
        return Ok(());
    }
    let status = match output.status.code() {
        Some(code) => format!("exit code {code}"),
        None => "no exit code".to_string(),
    };
    Err(ProvisionError::CommandFailed {
        stage,
        command: spec.to_string(),
        status,
        stderr_tail: tail(&output.stderr, STDERR_TAIL_LINES),
    })
}

/// Append-only `provision.log`.
struct ProvisionLog {
    file: tokio::fs::File,
}

impl ProvisionLog {
    async fn open(path: &Path) -> Result<Self, ProvisionError> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|source| {
                ProvisionError::io(
                    ProvisionStage::CreateEnvironment,
                    format!("opening {}", path.display()),
                    source,
                )
            })?;
        Ok(Self { file })
    }

    async fn record(
        &mut self,
        stage: ProvisionStage,
        spec: &CommandSpec,
        output: &Output,
    ) -> Result<(), ProvisionError> {
        let header = format!(
            "==> [{}] {} ({})\n",
            Utc::now().to_rfc3339(),
            spec,
            output.status
        );
        let write = async {
            self.file.write_all(header.as_bytes()).await?;
            self.file.write_all(&output.stdout).await?;
            self.file.write_all(&output.stderr).await?;
            self.file.flush().await
        };
        write
            .await
            .map_err(|source| ProvisionError::io(stage, "writing provision.log", source))
    }
}

fn tail(bytes: &[u8], lines: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    let collected: Vec<&str> = text.lines().rev().take(lines).collect();
    collected.into_iter().rev().collect::<Vec<_>>().join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interpreter_path_follows_layout() {
        let posix = EnvironmentHandle::new("/jobs/a/env", EnvLayout::Posix);
        assert_eq!(posix.interpreter_path(), PathBuf::from("/jobs/a/env/bin/python"));

        let windows = EnvironmentHandle::new("C:/jobs/a/env", EnvLayout::Windows);
        assert!(windows.interpreter_path().ends_with("Scripts/python.exe"));
    }

    #[test]
    fn install_command_uses_environment_pip() {
        let handle = EnvironmentHandle::new("/jobs/a/env", EnvLayout::Posix);
        let spec = handle.install_command("torch==2.3.0");
        assert_eq!(spec.program, "/jobs/a/env/bin/python");
        assert_eq!(spec.args, ["-m", "pip", "install", "torch==2.3.0"]);
        assert_eq!(spec.env_value("PIP_DISABLE_PIP_VERSION_CHECK"), Some("1"));
        assert_eq!(spec.env_value("VIRTUAL_ENV"), Some("/jobs/a/env"));
    }

    #[test]
    fn create_command_uses_configured_python() {
        let provisioner = VenvProvisioner::new("python3.11");
        let spec = provisioner.create_command(Path::new("/jobs/a/env"));
        assert_eq!(spec.to_string(), "python3.11 -m venv /jobs/a/env");
    }

    #[test]
    fn tail_keeps_last_lines() {
        assert_eq!(tail(b"a\nb\nc\nd\n", 2), "c\nd");
        assert_eq!(tail(b"", 5), "");
    }

    #[cfg(unix)]
    mod venv {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use tempfile::TempDir;

        use crate::workspace::JobWorkspace;

        /// Stand-in interpreter: `-m venv DIR` creates `DIR/bin/python`, whose
        /// `-m pip install X` appends X to `DIR/installed.txt`.
        const FAKE_PYTHON: &str = r#"#!/bin/sh
if [ "$1" = "-m" ] && [ "$2" = "venv" ]; then
  mkdir -p "$3/bin"
  cat > "$3/bin/python" <<'EOF'
#!/bin/sh
if [ "$1" = "-m" ] && [ "$2" = "pip" ]; then
  if [ "$4" = "missing-package" ]; then
    echo "ERROR: No matching distribution found for $4" >&2
    exit 1
  fi
  echo "$4" >> "$(dirname "$0")/../installed.txt"
  echo "Successfully installed $4"
  exit 0
fi
exec /bin/sh "$@"
EOF
  chmod +x "$3/bin/python"
  exit 0
fi
echo "unexpected invocation: $*" >&2
exit 2
"#;

        struct Fixture {
            _dir: TempDir,
            paths: WorkspacePaths,
            provisioner: VenvProvisioner,
        }

        fn fixture() -> Fixture {
            let dir = TempDir::new().unwrap();
            let python = dir.path().join("fake-python");
            std::fs::write(&python, FAKE_PYTHON).unwrap();
            std::fs::set_permissions(&python, std::fs::Permissions::from_mode(0o755))
                .unwrap();
            let ws = JobWorkspace::new(dir.path().join("jobs"));
            let paths = ws.materialize("job-1").unwrap();
            Fixture {
                provisioner: VenvProvisioner::new(python.to_string_lossy())
                    .with_layout(EnvLayout::Posix),
                paths,
                _dir: dir,
            }
        }

        fn installed(paths: &WorkspacePaths) -> Vec<String> {
            std::fs::read_to_string(paths.env_dir().join("installed.txt"))
                .unwrap_or_default()
                .lines()
                .map(str::to_string)
                .collect()
        }

        #[tokio::test]
        async fn installs_dependencies_in_order() {
            let fx = fixture();
            let deps = vec!["numpy".to_string(), "pandas".to_string()];
            let handle = fx.provisioner.provision(&fx.paths, &deps).await.unwrap();

            assert!(handle.interpreter_path().is_file());
            assert_eq!(installed(&fx.paths), deps);
            assert!(fx.paths.env_dir().join(PROVISIONED_MARKER).is_file());

            let log = std::fs::read_to_string(fx.paths.provision_log()).unwrap();
            assert!(log.contains("-m venv"));
            assert!(log.contains("Successfully installed pandas"));
        }

        #[tokio::test]
        async fn unchanged_dependencies_skip_reprovisioning() {
            let fx = fixture();
            let deps = vec!["numpy".to_string()];
            fx.provisioner.provision(&fx.paths, &deps).await.unwrap();
            let sentinel = fx.paths.env_dir().join("sentinel");
            std::fs::write(&sentinel, b"kept").unwrap();

            fx.provisioner.provision(&fx.paths, &deps).await.unwrap();
            assert!(sentinel.exists());
            assert_eq!(installed(&fx.paths), deps);

            let changed = vec!["numpy".to_string(), "scipy".to_string()];
            fx.provisioner.provision(&fx.paths, &changed).await.unwrap();
            assert!(!sentinel.exists());
            assert_eq!(installed(&fx.paths), changed);
        }

        #[tokio::test]
        async fn failed_install_reports_stage_and_leaves_no_marker() {
            let fx = fixture();
            let deps = vec!["numpy".to_string(), "missing-package".to_string()];
            let err = fx.provisioner.provision(&fx.paths, &deps).await.unwrap_err();

            assert_eq!(err.stage(), ProvisionStage::InstallDependencies);
            match &err {
                ProvisionError::CommandFailed { stderr_tail, .. } => {
                    assert!(stderr_tail.contains("No matching distribution"));
                }
                other => panic!("unexpected {other:?}"),
            }
            assert!(!fx.paths.env_dir().join(PROVISIONED_MARKER).exists());

            // Next attempt rebuilds from scratch.
            let deps = vec!["numpy".to_string()];
            fx.provisioner.provision(&fx.paths, &deps).await.unwrap();
            assert_eq!(installed(&fx.paths), deps);
        }

        #[tokio::test]
        async fn missing_interpreter_fails_environment_creation() {
            let fx = fixture();
            let provisioner = VenvProvisioner::new("/nonexistent/python3")
                .with_layout(EnvLayout::Posix);
            let err = provisioner.provision(&fx.paths, &[]).await.unwrap_err();
            assert_eq!(err.stage(), ProvisionStage::CreateEnvironment);
            assert!(matches!(err, ProvisionError::Spawn { .. }));
        }
    }
}
