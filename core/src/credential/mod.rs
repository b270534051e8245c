//! Credential Store (§4.B): persists per-connection passwords and private
//! key passphrases to the OS keyring, or to a local encrypted collection
//! when no keyring is available (e.g. inside a container).

mod encrypted;
mod keyring_backend;

pub use encrypted::EncryptedStore;
pub use keyring_backend::KeyringStore;

use crate::errors::CredentialError;

/// Secrets associated with a single connection.
#[derive(Debug, Clone, Default)]
pub struct Credential {
    pub password: Option<String>,
    pub passphrase: Option<String>,
}

impl Credential {
    pub fn is_empty(&self) -> bool {
        self.password.is_none() && self.passphrase.is_none()
    }
}

/// Backend-agnostic credential persistence.
///
/// Retrieval failures are never fatal to callers: `connect` and the PTY
/// sudo autofill path must fall back to whatever secret material the
/// caller supplied directly.
pub trait CredentialBackend: Send + Sync {
    fn save(&self, connection_id: &str, credential: &Credential) -> Result<(), CredentialError>;
    fn load(&self, connection_id: &str) -> Result<Credential, CredentialError>;
    fn delete(&self, connection_id: &str) -> Result<(), CredentialError>;
}

/// Service names the keyring backend stores entries under, kept distinct so
/// a password and a key passphrase for the same connection id don't collide.
pub const KEYRING_SERVICE_PASSWORD: &str = "mcp-ssh";
pub const KEYRING_SERVICE_PASSPHRASE: &str = "mcp-ssh-passphrase";

/// Selects and wraps the appropriate backend at startup.
pub struct CredentialStore {
    backend: Box<dyn CredentialBackend>,
}

impl CredentialStore {
    /// Use the OS keyring if it responds to a probe read, otherwise fall
    /// back to a local encrypted collection under `data_dir`.
    pub fn auto(data_dir: &std::path::Path) -> Self {
        if KeyringStore::is_available() {
            tracing::info!("credential store: using OS keyring");
            Self {
                backend: Box::new(KeyringStore::new()),
            }
        } else {
            tracing::info!("credential store: keyring unavailable, using encrypted local store");
            Self {
                backend: Box::new(EncryptedStore::new(data_dir.join("credentials.enc"))),
            }
        }
    }

    pub fn with_backend(backend: Box<dyn CredentialBackend>) -> Self {
        Self { backend }
    }

    pub fn save(&self, connection_id: &str, credential: &Credential) -> Result<(), CredentialError> {
        let result = self.backend.save(connection_id, credential);
        if let Err(ref e) = result {
            tracing::warn!(connection_id, error = %e, "failed to persist credential");
        }
        result
    }

    /// Never fatal: returns an empty [`Credential`] on any backend error so
    /// callers fall back to config-supplied secrets.
    pub fn load(&self, connection_id: &str) -> Credential {
        match self.backend.load(connection_id) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(connection_id, error = %e, "credential lookup failed, falling back");
                Credential::default()
            }
        }
    }

    pub fn delete(&self, connection_id: &str) -> Result<(), CredentialError> {
        self.backend.delete(connection_id)
    }
}
