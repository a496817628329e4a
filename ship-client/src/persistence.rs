//! Persistence for the bearer credentials.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

impl Credentials {
    pub fn is_authenticated(&self) -> bool {
        self.token.as_deref().is_some_and(|t| !t.is_empty())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Credential store lock poisoned")]
    LockPoisoned,
}

pub fn load(path: &Path) -> Result<Option<Credentials>, PersistenceError> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path)?;
    let credentials = serde_json::from_str::<Credentials>(&contents)?;
    Ok(Some(credentials))
}

pub fn save(path: &Path, credentials: &Credentials) -> Result<(), PersistenceError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let contents = serde_json::to_string_pretty(credentials)?;
    std::fs::write(path, contents)?;
    Ok(())
}

/// In-memory credentials backed by a JSON file.
#[derive(Debug)]
pub struct CredentialStore {
    path: PathBuf,
    current: RwLock<Credentials>,
}

impl CredentialStore {
    /// Open the store, reading the file if it exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let path = path.into();
        let current = load(&path)?.unwrap_or_default();
        Ok(Self {
            path,
            current: RwLock::new(current),
        })
    }

    pub fn snapshot(&self) -> Result<Credentials, PersistenceError> {
        self.current
            .read()
            .map(|c| c.clone())
            .map_err(|_| PersistenceError::LockPoisoned)
    }

    pub fn access_token(&self) -> Option<String> {
        self.snapshot().ok().and_then(|c| c.token)
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.snapshot().ok().and_then(|c| c.refresh_token)
    }

    pub fn is_authenticated(&self) -> bool {
        self.snapshot().map(|c| c.is_authenticated()).unwrap_or(false)
    }

    /// Replace the access token, keeping the refresh token.
    pub fn set_access_token(&self, token: impl Into<String>) -> Result<(), PersistenceError> {
        self.update(|c| c.token = Some(token.into()))
    }

    pub fn set(&self, credentials: Credentials) -> Result<(), PersistenceError> {
        self.update(|c| *c = credentials)
    }

    /// Forget both tokens.
    pub fn clear(&self) -> Result<(), PersistenceError> {
        self.update(|c| *c = Credentials::default())
    }

    fn update(&self, apply: impl FnOnce(&mut Credentials)) -> Result<(), PersistenceError> {
        let snapshot = {
            let mut current = self
                .current
                .write()
                .map_err(|_| PersistenceError::LockPoisoned)?;
            apply(&mut current);
            current.clone()
        };
        save(&self.path, &snapshot)
    }
}
