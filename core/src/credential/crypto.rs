//! Argon2id + AES-256-GCM envelope encryption, used by [`super::EncryptedStore`]
//! when no OS keyring is available.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use argon2::Argon2;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::errors::CredentialError;

const ARGON2_MEMORY_COST: u32 = 65536;
const ARGON2_TIME_COST: u32 = 3;
const ARGON2_PARALLELISM: u32 = 1;
const SALT_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const ENVELOPE_VERSION: u32 = 1;
const AAD: &[u8] = &[1];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedEnvelope {
    pub version: u32,
    pub kdf_salt: String,
    pub nonce: String,
    pub data: String,
}

fn derive_key(secret: &str, salt: &[u8]) -> Result<[u8; 32], CredentialError> {
    let params = argon2::Params::new(ARGON2_MEMORY_COST, ARGON2_TIME_COST, ARGON2_PARALLELISM, Some(32))
        .map_err(|e| CredentialError::Store(format!("invalid argon2 params: {e}")))?;
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

    let mut key = [0u8; 32];
    argon2
        .hash_password_into(secret.as_bytes(), salt, &mut key)
        .map_err(|e| CredentialError::Store(format!("key derivation failed: {e}")))?;
    Ok(key)
}

pub fn encrypt(secret: &str, plaintext: &[u8]) -> Result<EncryptedEnvelope, CredentialError> {
    let mut salt = vec![0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);

    let key = derive_key(secret, &salt)?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);

    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| CredentialError::Store(format!("cipher init failed: {e}")))?;
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, aes_gcm::aead::Payload { msg: plaintext, aad: AAD })
        .map_err(|e| CredentialError::Store(format!("encryption failed: {e}")))?;

    Ok(EncryptedEnvelope {
        version: ENVELOPE_VERSION,
        kdf_salt: BASE64.encode(&salt),
        nonce: BASE64.encode(nonce_bytes),
        data: BASE64.encode(&ciphertext),
    })
}

pub fn decrypt(secret: &str, envelope: &EncryptedEnvelope) -> Result<Vec<u8>, CredentialError> {
    if envelope.version != ENVELOPE_VERSION {
        return Err(CredentialError::Store(format!(
            "unsupported envelope version {}",
            envelope.version
        )));
    }

    let salt = BASE64
        .decode(&envelope.kdf_salt)
        .map_err(|e| CredentialError::Store(format!("invalid salt encoding: {e}")))?;
    let nonce_bytes = BASE64
        .decode(&envelope.nonce)
        .map_err(|e| CredentialError::Store(format!("invalid nonce encoding: {e}")))?;
    let ciphertext = BASE64
        .decode(&envelope.data)
        .map_err(|e| CredentialError::Store(format!("invalid ciphertext encoding: {e}")))?;

    let key = derive_key(secret, &salt)?;
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| CredentialError::Store(format!("cipher init failed: {e}")))?;
    let nonce = Nonce::from_slice(&nonce_bytes);

    let mut plaintext = cipher
        .decrypt(nonce, aes_gcm::aead::Payload { msg: &ciphertext, aad: AAD })
        .map_err(|_| CredentialError::Store("decryption failed: wrong key or corrupted data".into()))?;

    let result = plaintext.clone();
    plaintext.zeroize();
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let envelope = encrypt("machine-secret", b"hello").unwrap();
        let plaintext = decrypt("machine-secret", &envelope).unwrap();
        assert_eq!(plaintext, b"hello");
    }

    #[test]
    fn wrong_secret_fails() {
        let envelope = encrypt("right", b"hello").unwrap();
        assert!(decrypt("wrong", &envelope).is_err());
    }
}
