use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::Credential;
use crate::error::PersistenceError;
use crate::persistence::write_atomic;

/// Credential file on disk
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the stored credential. Missing or unreadable files yield `None`.
    pub fn load(&self) -> Option<Credential> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No credential file");
                return None;
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read credential file");
                return None;
            }
        };

        match serde_json::from_str::<Credential>(&content) {
            Ok(credential) => {
                info!(path = %self.path.display(), "Loaded tokens");
                Some(credential)
            }
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Corrupt credential file, re-authorization required"
                );
                None
            }
        }
    }

    /// Replace the stored credential atomically
    pub fn save(&self, credential: &Credential) -> Result<(), PersistenceError> {
        let json = serde_json::to_string_pretty(credential)
            .map_err(|e| PersistenceError::Serialize(e.to_string()))?;
        write_atomic(&self.path, json.as_bytes())?;
        info!(path = %self.path.display(), "Saved tokens");
        Ok(())
    }
}
