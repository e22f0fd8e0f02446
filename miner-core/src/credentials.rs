//! Local persistence for the auth token and miner id.
//!
//! Two files in the data directory, each replaced atomically. A save first
//! retires the old token, then writes the miner id, then the new token. A
//! crash at any point leaves a miner id with no token, which
//! [`CredentialStore::load`] reports as corrupted instead of pairing a new id
//! with a stale token.

use std::{
    io,
    path::{Path, PathBuf},
};

use miner_model::Credentials;
use thiserror::Error;
use tracing::{debug, info};

use crate::fsio::{remove_file_if_exists, write_atomically};

pub const TOKEN_FILE: &str = ".token";
pub const MINER_ID_FILE: &str = ".minerId";

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("not authenticated")]
    NotAuthenticated,

    #[error("{0}")]
    Corrupted(String),

    #[error("credential file {path} is inaccessible")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct CredentialStore {
    dir: PathBuf,
}

impl CredentialStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn token_path(&self) -> PathBuf {
        self.dir.join(TOKEN_FILE)
    }

    pub fn miner_id_path(&self) -> PathBuf {
        self.dir.join(MINER_ID_FILE)
    }

    pub fn save(&self, credentials: &Credentials) -> Result<(), CredentialError> {
        if credentials.token().trim().is_empty()
            || credentials.miner_id().trim().is_empty()
        {
            return Err(CredentialError::Corrupted(
                "refusing to store an empty token or miner id".into(),
            ));
        }
        self.retire_token()?;
        write_secret(&self.miner_id_path(), credentials.miner_id())?;
        write_secret(&self.token_path(), credentials.token())?;
        info!(
            miner_id = credentials.miner_id(),
            dir = %self.dir.display(),
            "credentials saved"
        );
        Ok(())
    }

    /// The token goes first so no older token can outlive a half-done save.
    fn retire_token(&self) -> Result<(), CredentialError> {
        let path = self.token_path();
        remove_file_if_exists(&path)
            .map(|_| ())
            .map_err(|source| CredentialError::Io { path, source })
    }

    pub fn load(&self) -> Result<Credentials, CredentialError> {
        let token = read_part(&self.token_path())?;
        let miner_id = read_part(&self.miner_id_path())?;

        match (token, miner_id) {
            (Some(token), Some(miner_id)) => Ok(Credentials::new(token, miner_id)),
            (None, None) => Err(CredentialError::NotAuthenticated),
            (Some(_), None) => Err(CredentialError::Corrupted(
                "token present without a miner id".into(),
            )),
            (None, Some(_)) => Err(CredentialError::Corrupted(
                "miner id present without a token".into(),
            )),
        }
    }

    /// Remove both files. Clearing absent credentials is not an error.
    pub fn clear(&self) -> Result<(), CredentialError> {
        for path in [self.token_path(), self.miner_id_path()] {
            let removed = remove_file_if_exists(&path).map_err(|source| {
                CredentialError::Io {
                    path: path.clone(),
                    source,
                }
            })?;
            if removed {
                debug!(path = %path.display(), "removed credential file");
            }
        }
        Ok(())
    }
}

fn write_secret(path: &Path, value: &str) -> Result<(), CredentialError> {
    write_atomically(path, value.as_bytes()).map_err(|source| {
        CredentialError::Io {
            path: path.to_path_buf(),
            source,
        }
    })?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(|source| CredentialError::Io {
                path: path.to_path_buf(),
                source,
            })?;
    }
    Ok(())
}

/// `Ok(None)` when the file is absent; an empty file counts as corrupted.
fn read_part(path: &Path) -> Result<Option<String>, CredentialError> {
    match std::fs::read_to_string(path) {
        Ok(raw) => {
            let value = raw.trim();
            if value.is_empty() {
                Err(CredentialError::Corrupted(format!(
                    "{} is empty",
                    path.display()
                )))
            } else {
                Ok(Some(value.to_string()))
            }
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(CredentialError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}
