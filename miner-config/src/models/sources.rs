use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::{
    loader::error::ConfigLoadError,
    util::{parse_bool, parse_csv},
};

/// Raw configuration as defined in a TOML file.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct FileConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jobs_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub python: Option<String>,
    /// Human duration, e.g. `"6h"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_timeout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_dependencies: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reuse_artifacts: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub editor: Option<String>,
}

/// Environment-derived configuration values.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub api_url: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub jobs_dir: Option<PathBuf>,
    pub python: Option<String>,
    pub execution_timeout: Option<String>,
    pub request_timeout: Option<String>,
    pub default_dependencies: Option<Vec<String>>,
    pub reuse_artifacts: Option<bool>,
    pub editor: Option<String>,
}

impl EnvConfig {
    pub fn gather() -> Result<Self, ConfigLoadError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigLoadError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let reuse_artifacts = match var("MINER_REUSE_ARTIFACTS") {
            Some(raw) => Some(parse_bool(&raw).ok_or_else(|| {
                ConfigLoadError::InvalidValue {
                    key: "MINER_REUSE_ARTIFACTS".into(),
                    value: raw.clone(),
                    reason: "expected a boolean".into(),
                }
            })?),
            None => None,
        };

        Ok(Self {
            api_url: var("MINER_API_URL").or_else(|| var("API_URL")),
            data_dir: var("MINER_DATA_DIR").map(PathBuf::from),
            jobs_dir: var("MINER_JOBS_DIR").map(PathBuf::from),
            python: var("MINER_PYTHON"),
            execution_timeout: var("MINER_EXECUTION_TIMEOUT"),
            request_timeout: var("MINER_REQUEST_TIMEOUT"),
            default_dependencies: var("MINER_DEFAULT_DEPENDENCIES")
                .map(|raw| parse_csv(&raw)),
            reuse_artifacts,
            editor: var("EDITOR"),
        })
    }
}
