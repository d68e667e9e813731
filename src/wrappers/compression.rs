//! Compression wrapper - threshold-gated gzip
//!
//! Payloads at or above the configured threshold are gzip-compressed on the
//! write path and transparently decompressed on reads. Every stored value
//! carries a one-byte header flag so small payloads that skipped compression
//! are never fed to the decompressor. Sits above encryption in the chain:
//! ciphertext is not compressible.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{CacheError, CacheResult};
use crate::stats::CacheStatistics;
use crate::traits::CacheContract;

const FLAG_RAW: u8 = 0;
const FLAG_GZIP: u8 = 1;

pub struct CompressionWrapper {
    inner: Arc<dyn CacheContract>,
    threshold: usize,
}

impl CompressionWrapper {
    #[must_use]
    pub fn new(inner: Arc<dyn CacheContract>, threshold: usize) -> Self {
        Self { inner, threshold }
    }

    fn encode(&self, value: &Bytes) -> CacheResult<Bytes> {
        if value.len() >= self.threshold {
            let mut encoder = GzEncoder::new(Vec::with_capacity(value.len() / 2 + 1), Compression::default());
            encoder
                .write_all(value)
                .map_err(|err| CacheError::serialization(format!("gzip failed: {err}")))?;
            let mut out = encoder
                .finish()
                .map_err(|err| CacheError::serialization(format!("gzip failed: {err}")))?;
            out.insert(0, FLAG_GZIP);
            Ok(Bytes::from(out))
        } else {
            let mut out = Vec::with_capacity(value.len() + 1);
            out.push(FLAG_RAW);
            out.extend_from_slice(value);
            Ok(Bytes::from(out))
        }
    }

    fn decode(value: Bytes) -> CacheResult<Bytes> {
        match value.split_first() {
            Some((&FLAG_RAW, rest)) => Ok(Bytes::copy_from_slice(rest)),
            Some((&FLAG_GZIP, rest)) => {
                let mut decoder = GzDecoder::new(rest);
                let mut out = Vec::new();
                decoder
                    .read_to_end(&mut out)
                    .map_err(|err| CacheError::serialization(format!("gunzip failed: {err}")))?;
                Ok(Bytes::from(out))
            }
            Some(_) => Err(CacheError::serialization(
                "unknown compression header flag",
            )),
            None => Ok(value),
        }
    }
}

#[async_trait]
impl CacheContract for CompressionWrapper {
    async fn put(&self, key: &str, value: Bytes) -> CacheResult<()> {
        let encoded = self.encode(&value)?;
        self.inner.put(key, encoded).await
    }

    async fn put_with_ttl(&self, key: &str, value: Bytes, ttl: Duration) -> CacheResult<()> {
        let encoded = self.encode(&value)?;
        self.inner.put_with_ttl(key, encoded, ttl).await
    }

    async fn get(&self, key: &str) -> CacheResult<Option<Bytes>> {
        match self.inner.get(key).await? {
            Some(value) => Ok(Some(Self::decode(value)?)),
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
        let encoded = entries
            .into_iter()
            .map(|(key, value)| Ok((key, self.encode(&value)?)))
            .collect::<CacheResult<Vec<_>>>()?;
        self.inner.put_all(encoded).await
    }

    async fn get_all(&self, keys: &[String]) -> CacheResult<HashMap<String, Bytes>> {
        let results = self.inner.get_all(keys).await?;
        results
            .into_iter()
            .map(|(key, value)| Ok((key, Self::decode(value)?)))
            .collect()
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> CacheResult<bool> {
        let encoded = self.encode(&value)?;
        self.inner.put_if_absent(key, encoded, ttl).await
    }

    // Numeric counters live as backend-native integers and bypass encoding.
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
        "compression"
    }
}
