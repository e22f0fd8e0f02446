pub mod sources;

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use url::Url;

use crate::constants::{
    DEFAULT_DEPENDENCIES, DEFAULT_EDITOR, DEFAULT_PYTHON, DEFAULT_REQUEST_TIMEOUT,
    JOBS_DIR_NAME,
};

#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the job backend. Only backend commands require it.
    pub api_url: Option<Url>,
    /// Holds the credential files.
    pub data_dir: PathBuf,
    /// Parent of every job workspace.
    pub jobs_dir: PathBuf,
    /// Interpreter used to create job environments.
    pub python: String,
    pub execution_timeout: Option<Duration>,
    pub request_timeout: Duration,
    pub default_dependencies: Vec<String>,
    pub reuse_artifacts: bool,
    pub editor: String,
    pub metadata: ConfigMetadata,
}

impl Config {
    /// Defaults for everything except the data directory.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            api_url: None,
            jobs_dir: data_dir.join(JOBS_DIR_NAME),
            data_dir,
            python: DEFAULT_PYTHON.to_string(),
            execution_timeout: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            default_dependencies: DEFAULT_DEPENDENCIES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            reuse_artifacts: false,
            editor: DEFAULT_EDITOR.to_string(),
            metadata: ConfigMetadata::default(),
        }
    }

    pub fn credentials_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn jobs_dir(&self) -> &Path {
        &self.jobs_dir
    }

    pub fn ensure_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(&self.jobs_dir)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}
