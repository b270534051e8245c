//! OS keyring credential backend, grounded on the keychain store the
//! desktop stack already uses — here keyed per-connection under two
//! service names, one for passwords and one for key passphrases.

use keyring::Entry;

use super::{Credential, CredentialBackend, KEYRING_SERVICE_PASSPHRASE, KEYRING_SERVICE_PASSWORD};
use crate::errors::CredentialError;

pub struct KeyringStore;

impl KeyringStore {
    pub fn new() -> Self {
        Self
    }

    /// Probe the keyring with a sentinel entry; `true` if it responds at
    /// all (even "no entry"), `false` if there's no secret service to talk to.
    pub fn is_available() -> bool {
        Entry::new(KEYRING_SERVICE_PASSWORD, "_probe")
            .and_then(|e| match e.get_password() {
                Ok(_) | Err(keyring::Error::NoEntry) => Ok(()),
                Err(e) => Err(e),
            })
            .is_ok()
    }

    fn entry(service: &str, connection_id: &str) -> Result<Entry, CredentialError> {
        Entry::new(service, connection_id)
            .map_err(|e| CredentialError::KeyringUnavailable(e.to_string()))
    }

    fn get(service: &str, connection_id: &str) -> Result<Option<String>, CredentialError> {
        let entry = Self::entry(service, connection_id)?;
        match entry.get_password() {
            Ok(v) => Ok(Some(v)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(CredentialError::KeyringUnavailable(e.to_string())),
        }
    }

    fn set(service: &str, connection_id: &str, value: &str) -> Result<(), CredentialError> {
        let entry = Self::entry(service, connection_id)?;
        entry
            .set_password(value)
            .map_err(|e| CredentialError::KeyringUnavailable(e.to_string()))
    }

    fn delete(service: &str, connection_id: &str) -> Result<(), CredentialError> {
        let entry = Self::entry(service, connection_id)?;
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(CredentialError::KeyringUnavailable(e.to_string())),
        }
    }
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialBackend for KeyringStore {
    fn save(&self, connection_id: &str, credential: &Credential) -> Result<(), CredentialError> {
        if let Some(password) = &credential.password {
            Self::set(KEYRING_SERVICE_PASSWORD, connection_id, password)?;
        }
        if let Some(passphrase) = &credential.passphrase {
            Self::set(KEYRING_SERVICE_PASSPHRASE, connection_id, passphrase)?;
        }
        Ok(())
    }

    fn load(&self, connection_id: &str) -> Result<Credential, CredentialError> {
        Ok(Credential {
            password: Self::get(KEYRING_SERVICE_PASSWORD, connection_id)?,
            passphrase: Self::get(KEYRING_SERVICE_PASSPHRASE, connection_id)?,
        })
    }

    fn delete(&self, connection_id: &str) -> Result<(), CredentialError> {
        Self::delete(KEYRING_SERVICE_PASSWORD, connection_id)?;
        Self::delete(KEYRING_SERVICE_PASSPHRASE, connection_id)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Exercises real OS keyring/D-Bus secret service state; not run in CI sandboxes.
    #[test]
    #[ignore]
    fn round_trips_through_real_keyring() {
        let store = KeyringStore::new();
        let id = "test-connection-keyring";
        let cred = Credential {
            password: Some("hunter2".into()),
            passphrase: None,
        };
        store.save(id, &cred).unwrap();
        let loaded = store.load(id).unwrap();
        assert_eq!(loaded.password.as_deref(), Some("hunter2"));
        store.delete(id).unwrap();
    }
}
