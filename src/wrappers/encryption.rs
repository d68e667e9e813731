//! Encryption wrapper - AES-256-GCM at rest
//!
//! Authenticated encryption of every value with a per-value random 96-bit
//! nonce prepended to the ciphertext. The key is validated at startup;
//! enabling encryption without usable key material fails the process. Sits
//! innermost in the chain, directly above the backend.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use async_trait::async_trait;
use bytes::Bytes;
use rand::RngCore;

use crate::error::{CacheError, CacheResult};
use crate::stats::CacheStatistics;
use crate::traits::CacheContract;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Decode configured key material: 64 hex characters or exactly 32 raw
/// bytes.
fn decode_key(material: &str) -> CacheResult<[u8; KEY_LEN]> {
    let material = material.trim();
    if material.is_empty() {
        return Err(CacheError::configuration(
            "features.encryption.key: required when encryption is enabled",
        ));
    }

    if material.len() == KEY_LEN * 2 && material.chars().all(|c| c.is_ascii_hexdigit()) {
        let mut key = [0u8; KEY_LEN];
        for (i, chunk) in material.as_bytes().chunks_exact(2).enumerate() {
            let hex = std::str::from_utf8(chunk)
                .map_err(|_| CacheError::configuration("features.encryption.key: invalid hex"))?;
            let byte = u8::from_str_radix(hex, 16)
                .map_err(|_| CacheError::configuration("features.encryption.key: invalid hex"))?;
            if let Some(slot) = key.get_mut(i) {
                *slot = byte;
            }
        }
        return Ok(key);
    }

    let bytes = material.as_bytes();
    if bytes.len() == KEY_LEN {
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(bytes);
        return Ok(key);
    }

    Err(CacheError::configuration(
        "features.encryption.key: expected 64 hex characters or 32 raw bytes",
    ))
}

/// Startup validation of configured key material without building a cipher.
pub(crate) fn validate_key(material: &str) -> CacheResult<()> {
    decode_key(material).map(|_| ())
}

pub struct EncryptionWrapper {
    inner: Arc<dyn CacheContract>,
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for EncryptionWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionWrapper").finish()
    }
}

impl EncryptionWrapper {
    /// Build the wrapper, validating the key material. Called during chain
    /// assembly at startup; an invalid key fails the process.
    pub fn new(inner: Arc<dyn CacheContract>, key_material: &str) -> CacheResult<Self> {
        let key = decode_key(key_material)?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|_| CacheError::configuration("features.encryption.key: invalid length"))?;
        Ok(Self { inner, cipher })
    }

    fn encrypt(&self, plaintext: &[u8]) -> CacheResult<Bytes> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CacheError::Backend {
                operation: "encrypt",
                key: String::new(),
                message: "AES-GCM encryption failed".to_string(),
            })?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(Bytes::from(out))
    }

    fn decrypt(&self, key: &str, data: &[u8]) -> CacheResult<Bytes> {
        if data.len() < NONCE_LEN {
            return Err(CacheError::Backend {
                operation: "decrypt",
                key: key.to_string(),
                message: "stored value is too short to carry a nonce".to_string(),
            });
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CacheError::Backend {
                operation: "decrypt",
                key: key.to_string(),
                message: "AES-GCM authentication failed".to_string(),
            })?;
        Ok(Bytes::from(plaintext))
    }
}

#[async_trait]
impl CacheContract for EncryptionWrapper {
    async fn put(&self, key: &str, value: Bytes) -> CacheResult<()> {
        let encrypted = self.encrypt(&value)?;
        self.inner.put(key, encrypted).await
    }

    async fn put_with_ttl(&self, key: &str, value: Bytes, ttl: Duration) -> CacheResult<()> {
        let encrypted = self.encrypt(&value)?;
        self.inner.put_with_ttl(key, encrypted, ttl).await
    }

    async fn get(&self, key: &str) -> CacheResult<Option<Bytes>> {
        match self.inner.get(key).await? {
            Some(value) => Ok(Some(self.decrypt(key, &value)?)),
            None => Ok(None),
        }
    }

    async fn remove(&self, key: &str) -> CacheResult<()> {
        self.inner.remove(key).await
    }

    async fn clear(&self) -> CacheResult<()> {
        self.inner.clear().await
    }

    async fn contains_key(&self, key: &str) -> CacheResult<bool> {
        self.inner.contains_key(key).await
    }

    async fn put_all(&self, entries: Vec<(String, Bytes)>) -> CacheResult<()> {
        let encrypted = entries
            .into_iter()
            .map(|(key, value)| Ok((key, self.encrypt(&value)?)))
            .collect::<CacheResult<Vec<_>>>()?;
        self.inner.put_all(encrypted).await
    }

    async fn get_all(&self, keys: &[String]) -> CacheResult<HashMap<String, Bytes>> {
        let results = self.inner.get_all(keys).await?;
        results
            .into_iter()
            .map(|(key, value)| {
                let plaintext = self.decrypt(&key, &value)?;
                Ok((key, plaintext))
            })
            .collect()
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> CacheResult<bool> {
        let encrypted = self.encrypt(&value)?;
        self.inner.put_if_absent(key, encrypted, ttl).await
    }

    // Counters operate on backend-native integers; encrypting them would
    // break remote atomicity.
    async fn increment(&self, key: &str, delta: i64) -> CacheResult<i64> {
        self.inner.increment(key, delta).await
    }

    async fn decrement(&self, key: &str, delta: i64) -> CacheResult<i64> {
        self.inner.decrement(key, delta).await
    }

    async fn remove_matching(&self, pattern: &str) -> CacheResult<u64> {
        self.inner.remove_matching(pattern).await
    }

    fn statistics(&self) -> CacheStatistics {
        self.inner.statistics()
    }

    fn backend_name(&self) -> &'static str {
        "encryption"
    }
}
