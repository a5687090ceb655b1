//! Secret provider interface
//!
//! Platform credential stores (Keychain, Credential Manager, Secret
//! Service, Keystore) live outside this crate; the core only talks to
//! them through the `SecretProvider` trait. Retrieved material travels as
//! an opaque `CredentialHandle` that an adapter holds for the duration of
//! one handshake and drops immediately after.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{VpnError, VpnResult};

/// Secret material for one connection attempt. Never logged and never
/// persisted by the core; `Debug` redacts the payload.
#[derive(Clone)]
pub struct CredentialHandle {
    profile_id: String,
    secret: Arc<String>,
}

impl CredentialHandle {
    pub fn new(profile_id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            profile_id: profile_id.into(),
            secret: Arc::new(secret.into()),
        }
    }

    pub fn profile_id(&self) -> &str {
        &self.profile_id
    }

    /// Plaintext secret, exposed only to the adapter writing an auth file
    pub(crate) fn reveal(&self) -> &str {
        &self.secret
    }
}

impl std::fmt::Debug for CredentialHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialHandle")
            .field("profile_id", &self.profile_id)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Interface to a secure credential store
#[async_trait]
pub trait SecretProvider: Send + Sync {
    /// Retrieve the secret for a profile
    async fn get_credential(&self, profile_id: &str) -> VpnResult<CredentialHandle>;

    /// Store (or replace) the secret for a profile
    async fn store_credential(&self, profile_id: &str, secret: &str) -> VpnResult<()>;

    /// Remove the secret for a profile
    async fn delete_credential(&self, profile_id: &str) -> VpnResult<()>;
}

/// In-memory provider for embedders without a platform store, and for
/// tests. Secrets do not survive the process.
#[derive(Default)]
pub struct MemorySecretProvider {
    entries: RwLock<HashMap<String, String>>,
}

impl MemorySecretProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecretProvider for MemorySecretProvider {
    async fn get_credential(&self, profile_id: &str) -> VpnResult<CredentialHandle> {
        let entries = self.entries.read().await;
        match entries.get(profile_id) {
            Some(secret) => Ok(CredentialHandle::new(profile_id, secret.clone())),
            None => Err(VpnError::Credential(format!(
                "no credential stored for profile '{}'",
                profile_id
            ))),
        }
    }

    async fn store_credential(&self, profile_id: &str, secret: &str) -> VpnResult<()> {
        let mut entries = self.entries.write().await;
        entries.insert(profile_id.to_string(), secret.to_string());
        debug!("Stored credential for profile {}", profile_id);
        Ok(())
    }

    async fn delete_credential(&self, profile_id: &str) -> VpnResult<()> {
        let mut entries = self.entries.write().await;
        entries.remove(profile_id);
        debug!("Deleted credential for profile {}", profile_id);
        Ok(())
    }
}
