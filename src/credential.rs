//! Decrypt-on-demand credential access.
//!
//! The credential store is external. The engine asks for a decrypted view
//! right before each connection attempt and drops it when the attempt ends.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use crate::error::{BackupError, Result};
use crate::model::CredentialProfileId;

/// Secret material that never prints itself.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Exposes the secret for the single place that writes it to a device.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/// Decrypted, scoped view of a credential profile for one attempt.
#[derive(Debug, Clone)]
pub struct CredentialView {
    pub username: String,
    pub secret: Secret,
    pub enable_secret: Option<Secret>,
    /// Privilege escalation command; `enable` when unset.
    pub enable_command: Option<String>,
}

impl CredentialView {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: Secret::new(secret),
            enable_secret: None,
            enable_command: None,
        }
    }

    pub fn with_enable(mut self, enable_secret: impl Into<String>) -> Self {
        self.enable_secret = Some(Secret::new(enable_secret));
        self
    }

    pub fn with_enable_command(mut self, command: impl Into<String>) -> Self {
        self.enable_command = Some(command.into());
        self
    }
}

/// External credential store.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Decrypts one profile. Any failure is reported as `AuthFailed`.
    async fn decrypt(&self, profile: &CredentialProfileId) -> Result<CredentialView>;
}

/// In-memory credential store for tests and embedding.
#[derive(Debug, Default)]
pub struct StaticCredentialStore {
    profiles: RwLock<HashMap<CredentialProfileId, CredentialView>>,
}

impl StaticCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, profile: impl Into<String>, view: CredentialView) {
        if let Ok(mut guard) = self.profiles.write() {
            guard.insert(CredentialProfileId(profile.into()), view);
        }
    }

    pub fn with(self, profile: impl Into<String>, view: CredentialView) -> Self {
        self.insert(profile, view);
        self
    }
}

#[async_trait]
impl CredentialStore for StaticCredentialStore {
    async fn decrypt(&self, profile: &CredentialProfileId) -> Result<CredentialView> {
        let guard = self
            .profiles
            .read()
            .map_err(|_| BackupError::AuthFailed("credential store unavailable".to_string()))?;
        guard.get(profile).cloned().ok_or_else(|| {
            BackupError::AuthFailed(format!("credential profile '{profile}' not found"))
        })
    }
}
