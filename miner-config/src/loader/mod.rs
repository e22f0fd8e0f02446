pub mod error;

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use directories::ProjectDirs;
use tracing::debug;
use url::Url;

use crate::{
    constants::{
        APP_NAME, APP_ORGANIZATION, APP_QUALIFIER, DEFAULT_DEPENDENCIES,
        DEFAULT_EDITOR, DEFAULT_PYTHON, DEFAULT_REQUEST_TIMEOUT,
        JOBS_DIR_NAME,
    },
    models::{
        Config, ConfigMetadata,
        sources::{EnvConfig, FileConfig},
    },
    util::parse_optional_duration,
};

use error::ConfigLoadError;

#[derive(Debug, Clone, Default)]
pub struct ConfigLoaderOptions {
    /// TOML file to overlay on the defaults. Missing is an error when set.
    pub config_path: Option<PathBuf>,
    /// `.env` file to load; `None` looks for `.env` in the working directory.
    pub env_file: Option<PathBuf>,
    /// Skip `.env` loading entirely (tests).
    pub skip_env_file: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

impl ConfigLoader {
    pub fn new(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn load(&self) -> Result<Config, ConfigLoadError> {
        let env_file_loaded = self.load_env_file()?;

        let file = match &self.options.config_path {
            Some(path) => read_file_config(path)?,
            None => FileConfig::default(),
        };
        let env = EnvConfig::gather()?;

        let default_data_dir = ProjectDirs::from(
            APP_QUALIFIER,
            APP_ORGANIZATION,
            APP_NAME,
        )
        .map(|dirs| dirs.data_dir().to_path_buf());

        let mut config = resolve(file, env, default_data_dir)?;
        config.metadata = ConfigMetadata {
            config_path: self.options.config_path.clone(),
            env_file_loaded,
        };
        debug!(
            data_dir = %config.data_dir.display(),
            jobs_dir = %config.jobs_dir.display(),
            api_url = ?config.api_url.as_ref().map(Url::as_str),
            "configuration loaded"
        );
        Ok(config)
    }

    fn load_env_file(&self) -> Result<bool, ConfigLoadError> {
        if self.options.skip_env_file {
            return Ok(false);
        }
        let result = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| ()),
            None => dotenvy::dotenv().map(|_| ()),
        };
        match result {
            Ok(()) => Ok(true),
            Err(err) if err.not_found() => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

pub fn read_file_config(path: &Path) -> Result<FileConfig, ConfigLoadError> {
    let raw = std::fs::read_to_string(path).map_err(|source| {
        ConfigLoadError::ConfigFileIo {
            path: path.to_path_buf(),
            source,
        }
    })?;
    toml::from_str(&raw).map_err(|source| ConfigLoadError::ConfigFileParse {
        path: path.to_path_buf(),
        source,
    })
}

/// Merge file and environment layers over the defaults.
pub fn resolve(
    file: FileConfig,
    env: EnvConfig,
    default_data_dir: Option<PathBuf>,
) -> Result<Config, ConfigLoadError> {
    let api_url = match env.api_url.or(file.api_url) {
        Some(raw) => Some(parse_api_url(&raw)?),
        None => None,
    };

    let data_dir = env
        .data_dir
        .or(file.data_dir)
        .or(default_data_dir)
        .ok_or(ConfigLoadError::NoDataDir)?;
    let jobs_dir = env
        .jobs_dir
        .or(file.jobs_dir)
        .unwrap_or_else(|| data_dir.join(JOBS_DIR_NAME));

    let execution_timeout = match env.execution_timeout.or(file.execution_timeout)
    {
        Some(raw) => duration_value("execution_timeout", &raw)?,
        None => None,
    };
    let request_timeout = match env.request_timeout.or(file.request_timeout) {
        Some(raw) => duration_value("request_timeout", &raw)?
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT),
        None => DEFAULT_REQUEST_TIMEOUT,
    };

    let default_dependencies = env
        .default_dependencies
        .or(file.default_dependencies)
        .unwrap_or_else(|| {
            DEFAULT_DEPENDENCIES.iter().map(|s| s.to_string()).collect()
        });

    Ok(Config {
        api_url,
        data_dir,
        jobs_dir,
        python: env
            .python
            .or(file.python)
            .unwrap_or_else(|| DEFAULT_PYTHON.to_string()),
        execution_timeout,
        request_timeout,
        default_dependencies,
        reuse_artifacts: env
            .reuse_artifacts
            .or(file.reuse_artifacts)
            .unwrap_or(false),
        editor: env
            .editor
            .or(file.editor)
            .unwrap_or_else(|| DEFAULT_EDITOR.to_string()),
        metadata: ConfigMetadata::default(),
    })
}

fn parse_api_url(raw: &str) -> Result<Url, ConfigLoadError> {
    let url = Url::parse(raw.trim()).map_err(|err| {
        ConfigLoadError::InvalidValue {
            key: "api_url".into(),
            value: raw.to_string(),
            reason: err.to_string(),
        }
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigLoadError::InvalidValue {
            key: "api_url".into(),
            value: raw.to_string(),
            reason: "expected an http or https URL".into(),
        });
    }
    Ok(url)
}

fn duration_value(key: &str, raw: &str) -> Result<Option<Duration>, ConfigLoadError> {
    parse_optional_duration(raw).map_err(|err| ConfigLoadError::InvalidValue {
        key: key.to_string(),
        value: raw.to_string(),
        reason: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_dir() -> Option<PathBuf> {
        Some(PathBuf::from("/var/lib/miner"))
    }

    #[test]
    fn defaults_apply_without_sources() {
        let config =
            resolve(FileConfig::default(), EnvConfig::default(), base_dir())
                .unwrap();
        assert!(config.api_url.is_none());
        assert_eq!(config.jobs_dir, PathBuf::from("/var/lib/miner/jobs"));
        assert_eq!(config.python, DEFAULT_PYTHON);
        assert_eq!(config.request_timeout, DEFAULT_REQUEST_TIMEOUT);
        assert!(config.execution_timeout.is_none());
        assert_eq!(config.default_dependencies.len(), DEFAULT_DEPENDENCIES.len());
        assert!(!config.reuse_artifacts);
    }

    #[test]
    fn environment_overrides_file() {
        let file = FileConfig {
            python: Some("python3.11".into()),
            execution_timeout: Some("2h".into()),
            ..FileConfig::default()
        };
        let env = EnvConfig {
            python: Some("/opt/py/bin/python".into()),
            ..EnvConfig::default()
        };
        let config = resolve(file, env, base_dir()).unwrap();
        assert_eq!(config.python, "/opt/py/bin/python");
        assert_eq!(config.execution_timeout, Some(Duration::from_secs(7200)));
    }

    #[test]
    fn jobs_dir_follows_overridden_data_dir() {
        let env = EnvConfig {
            data_dir: Some(PathBuf::from("/tmp/agent")),
            ..EnvConfig::default()
        };
        let config = resolve(FileConfig::default(), env, base_dir()).unwrap();
        assert_eq!(config.jobs_dir, PathBuf::from("/tmp/agent/jobs"));
    }

    #[test]
    fn rejects_non_http_api_url() {
        let env = EnvConfig {
            api_url: Some("ftp://backend".into()),
            ..EnvConfig::default()
        };
        let err = resolve(FileConfig::default(), env, base_dir()).unwrap_err();
        assert!(matches!(err, ConfigLoadError::InvalidValue { ref key, .. } if key == "api_url"));
    }

    #[test]
    fn rejects_bad_duration() {
        let file = FileConfig {
            execution_timeout: Some("eventually".into()),
            ..FileConfig::default()
        };
        let err =
            resolve(file, EnvConfig::default(), base_dir()).unwrap_err();
        assert!(err.to_string().contains("execution_timeout"));
    }

    #[test]
    fn missing_data_dir_is_an_error() {
        let err = resolve(FileConfig::default(), EnvConfig::default(), None)
            .unwrap_err();
        assert!(matches!(err, ConfigLoadError::NoDataDir));
    }

    #[test]
    fn reads_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("miner.toml");
        std::fs::write(
            &path,
            "api_url = \"https://backend.example.com\"\n\
             default_dependencies = [\"numpy\"]\n\
             reuse_artifacts = true\n",
        )
        .unwrap();
        let file = read_file_config(&path).unwrap();
        let config = resolve(file, EnvConfig::default(), base_dir()).unwrap();
        assert_eq!(
            config.api_url.as_ref().map(Url::as_str),
            Some("https://backend.example.com/")
        );
        assert_eq!(config.default_dependencies, vec!["numpy".to_string()]);
        assert!(config.reuse_artifacts);
    }
}
