//! Local encrypted credential collection, used when the process has no OS
//! keyring to talk to (e.g. running inside a container).
//!
//! Each connection's secrets are sealed with [`crate::credential::crypto`]
//! under a per-install machine key generated on first use and stored
//! alongside the collection with restricted permissions.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use super::crypto::{self, EncryptedEnvelope};
use super::{Credential, CredentialBackend};
use crate::errors::CredentialError;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct StoredCredential {
    password: Option<EncryptedEnvelope>,
    passphrase: Option<EncryptedEnvelope>,
}

pub struct EncryptedStore {
    path: PathBuf,
    key_path: PathBuf,
    entries: RwLock<HashMap<String, StoredCredential>>,
}

impl EncryptedStore {
    pub fn new(path: PathBuf) -> Self {
        let key_path = path.with_extension("key");
        let entries = load_collection(&path).unwrap_or_default();
        Self {
            path,
            key_path,
            entries: RwLock::new(entries),
        }
    }

    fn machine_secret(&self) -> Result<String, CredentialError> {
        if let Ok(existing) = std::fs::read_to_string(&self.key_path) {
            if !existing.trim().is_empty() {
                return Ok(existing.trim().to_string());
            }
        }
        if let Some(parent) = self.key_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        let secret = BASE64.encode(bytes);
        write_restricted(&self.key_path, &secret)?;
        Ok(secret)
    }

    fn persist(&self) -> Result<(), CredentialError> {
        let entries = self.entries.read().expect("credential map lock poisoned");
        let json = serde_json::to_string_pretty(&*entries)?;
        write_restricted(&self.path, &json)?;
        Ok(())
    }
}

fn write_restricted(path: &Path, contents: &str) -> std::io::Result<()> {
    std::fs::write(path, contents)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

fn load_collection(path: &Path) -> Option<HashMap<String, StoredCredential>> {
    let contents = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&contents).ok()
}

impl From<serde_json::Error> for CredentialError {
    fn from(e: serde_json::Error) -> Self {
        CredentialError::Store(e.to_string())
    }
}

impl CredentialBackend for EncryptedStore {
    fn save(&self, connection_id: &str, credential: &Credential) -> Result<(), CredentialError> {
        let secret = self.machine_secret()?;
        let password = credential
            .password
            .as_ref()
            .map(|p| crypto::encrypt(&secret, p.as_bytes()))
            .transpose()?;
        let passphrase = credential
            .passphrase
            .as_ref()
            .map(|p| crypto::encrypt(&secret, p.as_bytes()))
            .transpose()?;

        {
            let mut entries = self.entries.write().expect("credential map lock poisoned");
            let entry = entries.entry(connection_id.to_string()).or_default();
            if password.is_some() {
                entry.password = password;
            }
            if passphrase.is_some() {
                entry.passphrase = passphrase;
            }
        }
        self.persist()
    }

    fn load(&self, connection_id: &str) -> Result<Credential, CredentialError> {
        let secret = self.machine_secret()?;
        let entries = self.entries.read().expect("credential map lock poisoned");
        let Some(stored) = entries.get(connection_id) else {
            return Ok(Credential::default());
        };

        let password = stored
            .password
            .as_ref()
            .map(|e| crypto::decrypt(&secret, e))
            .transpose()?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned());
        let passphrase = stored
            .passphrase
            .as_ref()
            .map(|e| crypto::decrypt(&secret, e))
            .transpose()?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned());

        Ok(Credential { password, passphrase })
    }

    fn delete(&self, connection_id: &str) -> Result<(), CredentialError> {
        {
            let mut entries = self.entries.write().expect("credential map lock poisoned");
            entries.remove(connection_id);
        }
        self.persist()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trips_password_and_passphrase() {
        let dir = tempdir().unwrap();
        let store = EncryptedStore::new(dir.path().join("credentials.enc"));
        let cred = Credential {
            password: Some("p@ss".into()),
            passphrase: Some("phrase".into()),
        };
        store.save("conn-1", &cred).unwrap();

        let loaded = store.load("conn-1").unwrap();
        assert_eq!(loaded.password.as_deref(), Some("p@ss"));
        assert_eq!(loaded.passphrase.as_deref(), Some("phrase"));
    }

    #[test]
    fn survives_reload_from_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("credentials.enc");
        {
            let store = EncryptedStore::new(path.clone());
            store
                .save("conn-2", &Credential { password: Some("abc".into()), passphrase: None })
                .unwrap();
        }
        let reopened = EncryptedStore::new(path);
        let loaded = reopened.load("conn-2").unwrap();
        assert_eq!(loaded.password.as_deref(), Some("abc"));
    }

    #[test]
    fn delete_removes_entry() {
        let dir = tempdir().unwrap();
        let store = EncryptedStore::new(dir.path().join("credentials.enc"));
        store
            .save("conn-3", &Credential { password: Some("x".into()), passphrase: None })
            .unwrap();
        store.delete("conn-3").unwrap();
        let loaded = store.load("conn-3").unwrap();
        assert!(loaded.is_empty());
    }
}
