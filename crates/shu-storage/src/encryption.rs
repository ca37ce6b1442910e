// AES-256-GCM encryption with key rotation for sensitive columns
// (provider API keys, identity token material).
//
// Keys are versioned strings in the format "key_id:base64_key". The primary
// key encrypts; every known key can decrypt, so rotation is: add a new
// primary, keep the old one in SHU_SECRETS_ENCRYPTION_KEY_PREVIOUS, and
// re-encrypt lazily.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;
const PAYLOAD_VERSION: u8 = 1;
const ALGORITHM: &str = "AES-256-GCM";

/// Encrypted payload stored in the database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedPayload {
    pub version: u8,
    pub alg: String,
    /// Key ID of the key that produced this ciphertext
    pub key_id: String,
    /// Base64-encoded nonce
    pub nonce: String,
    /// Base64-encoded ciphertext (includes auth tag)
    pub ciphertext: String,
}

#[derive(Clone)]
struct VersionedKey {
    id: String,
    cipher: Aes256Gcm,
}

/// Encryption service with key rotation. Thread-safe, cheap to clone.
#[derive(Clone)]
pub struct EncryptionService {
    primary_key: Arc<VersionedKey>,
    keys: Arc<HashMap<String, Aes256Gcm>>,
}

impl EncryptionService {
    /// Create from versioned key strings. The first key encrypts; all keys
    /// decrypt.
    pub fn new(primary_key: &str, previous_keys: &[&str]) -> Result<Self> {
        let (primary_id, primary_cipher) = Self::parse_versioned_key(primary_key)?;

        let mut keys = HashMap::new();
        keys.insert(primary_id.clone(), primary_cipher.clone());

        for key_str in previous_keys {
            let (id, cipher) = Self::parse_versioned_key(key_str)?;
            if keys.contains_key(&id) {
                anyhow::bail!("Duplicate key ID: {}", id);
            }
            keys.insert(id, cipher);
        }

        Ok(Self {
            primary_key: Arc::new(VersionedKey {
                id: primary_id,
                cipher: primary_cipher,
            }),
            keys: Arc::new(keys),
        })
    }

    /// Create from environment variables:
    /// - SHU_SECRETS_ENCRYPTION_KEY: primary key (required)
    /// - SHU_SECRETS_ENCRYPTION_KEY_PREVIOUS: previous key for rotation
    pub fn from_env() -> Result<Self> {
        let primary = std::env::var("SHU_SECRETS_ENCRYPTION_KEY")
            .context("SHU_SECRETS_ENCRYPTION_KEY environment variable not set")?;

        let previous: Vec<String> = std::env::var("SHU_SECRETS_ENCRYPTION_KEY_PREVIOUS")
            .ok()
            .into_iter()
            .collect();
        let previous_refs: Vec<&str> = previous.iter().map(String::as_str).collect();

        Self::new(&primary, &previous_refs)
    }

    fn parse_versioned_key(key_str: &str) -> Result<(String, Aes256Gcm)> {
        let Some((key_id, encoded)) = key_str.split_once(':') else {
            anyhow::bail!("Invalid key format, expected 'key_id:base64_key'");
        };

        let key_bytes = BASE64
            .decode(encoded)
            .context("Failed to decode key from base64")?;
        if key_bytes.len() != KEY_SIZE {
            anyhow::bail!(
                "Key must be {} bytes, got {} bytes for key_id '{}'",
                KEY_SIZE,
                key_bytes.len(),
                key_id
            );
        }

        let cipher = Aes256Gcm::new_from_slice(&key_bytes)
            .map_err(|e| anyhow::anyhow!("Failed to create cipher for key '{}': {}", key_id, e))?;

        Ok((key_id.to_string(), cipher))
    }

    /// Encrypt plaintext with the primary key. Returns a JSON payload.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .primary_key
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| anyhow::anyhow!("Encryption failed: {}", e))?;

        let payload = EncryptedPayload {
            version: PAYLOAD_VERSION,
            alg: ALGORITHM.to_string(),
            key_id: self.primary_key.id.clone(),
            nonce: BASE64.encode(nonce_bytes),
            ciphertext: BASE64.encode(&ciphertext),
        };

        serde_json::to_vec(&payload).context("Failed to serialize encrypted payload")
    }

    /// Decrypt data using the key referenced in the payload.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        let payload: EncryptedPayload =
            serde_json::from_slice(data).context("Failed to parse encrypted payload")?;

        if payload.version != PAYLOAD_VERSION {
            anyhow::bail!("Unsupported payload version: {}", payload.version);
        }
        if payload.alg != ALGORITHM {
            anyhow::bail!("Unsupported algorithm: {}", payload.alg);
        }

        let cipher = self
            .keys
            .get(&payload.key_id)
            .ok_or_else(|| anyhow::anyhow!("Unknown key_id '{}'", payload.key_id))?;

        let nonce_bytes = BASE64
            .decode(&payload.nonce)
            .context("Failed to decode nonce")?;
        let ciphertext = BASE64
            .decode(&payload.ciphertext)
            .context("Failed to decode ciphertext")?;

        cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|e| anyhow::anyhow!("Decryption failed (data may be corrupted): {}", e))
    }

    pub fn encrypt_string(&self, plaintext: &str) -> Result<Vec<u8>> {
        self.encrypt(plaintext.as_bytes())
    }

    pub fn decrypt_to_string(&self, data: &[u8]) -> Result<String> {
        let plaintext = self.decrypt(data)?;
        String::from_utf8(plaintext).context("Decrypted data is not valid UTF-8")
    }

    /// Key id referenced by an encrypted blob, without decrypting.
    pub fn get_key_id(data: &[u8]) -> Result<String> {
        let payload: EncryptedPayload =
            serde_json::from_slice(data).context("Failed to parse encrypted payload")?;
        Ok(payload.key_id)
    }

    /// Re-encrypt under the primary key; None when already current.
    pub fn reencrypt(&self, data: &[u8]) -> Result<Option<Vec<u8>>> {
        if Self::get_key_id(data)? == self.primary_key.id {
            return Ok(None);
        }
        let plaintext = self.decrypt(data)?;
        Ok(Some(self.encrypt(&plaintext)?))
    }

    pub fn primary_key_id(&self) -> &str {
        &self.primary_key.id
    }
}

/// Generate a new random key in versioned format: "key_id:base64_key"
pub fn generate_encryption_key(key_id: &str) -> String {
    let mut key = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut key);
    format!("{}:{}", key_id, BASE64.encode(key))
}
