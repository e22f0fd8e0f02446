use std::time::Duration;

pub const APP_QUALIFIER: &str = "";
pub const APP_ORGANIZATION: &str = "miner";
pub const APP_NAME: &str = "miner-agent";

pub const JOBS_DIR_NAME: &str = "jobs";

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_EDITOR: &str = "vim";

#[cfg(windows)]
pub const DEFAULT_PYTHON: &str = "python";
#[cfg(not(windows))]
pub const DEFAULT_PYTHON: &str = "python3";

/// Installed when a job does not declare its own dependencies.
pub const DEFAULT_DEPENDENCIES: &[&str] = &[
    "torch",
    "transformers",
    "datasets",
    "numpy",
    "pandas",
    "scikit-learn",
];
