use miner_config::Config;
use miner_model::Credentials;
use tracing::{debug, warn};

use crate::{
    backend::HttpBackend,
    credentials::{CredentialError, CredentialStore},
    error::AgentError,
    workspace::JobWorkspace,
};

/// What the credential store held when the process started.
#[derive(Debug, Clone)]
pub enum CredentialState {
    Present(Credentials),
    Missing,
    Corrupted(String),
}

/// Process-wide state handed to lifecycle operations: the resolved config and
/// the credentials read once at startup.
#[derive(Debug, Clone)]
pub struct AgentContext {
    config: Config,
    credentials: CredentialState,
}

impl AgentContext {
    pub fn new(config: Config, credentials: CredentialState) -> Self {
        Self {
            config,
            credentials,
        }
    }

    /// Read the credential store named by `config`.
    pub fn load(config: Config) -> Self {
        let store = CredentialStore::new(config.credentials_dir());
        let credentials = match store.load() {
            Ok(credentials) => {
                debug!(miner_id = credentials.miner_id(), "credentials loaded");
                CredentialState::Present(credentials)
            }
            Err(CredentialError::NotAuthenticated) => CredentialState::Missing,
            Err(err) => {
                warn!(error = %err, "stored credentials are unusable");
                CredentialState::Corrupted(err.to_string())
            }
        };
        Self::new(config, credentials)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn credentials(&self) -> &CredentialState {
        &self.credentials
    }

    pub fn require_credentials(&self) -> Result<&Credentials, AgentError> {
        match &self.credentials {
            CredentialState::Present(credentials) => Ok(credentials),
            CredentialState::Missing => Err(AgentError::NotAuthenticated),
            CredentialState::Corrupted(reason) => {
                Err(AgentError::CorruptedCredentials(reason.clone()))
            }
        }
    }

    pub fn credential_store(&self) -> CredentialStore {
        CredentialStore::new(self.config.credentials_dir())
    }

    pub fn workspace(&self) -> JobWorkspace {
        JobWorkspace::new(self.config.jobs_dir())
    }

    pub fn backend(&self) -> Result<HttpBackend, AgentError> {
        let base = self
            .config
            .api_url
            .clone()
            .ok_or(AgentError::BackendNotConfigured)?;
        Ok(HttpBackend::new(base, self.config.request_timeout)?)
    }
}
