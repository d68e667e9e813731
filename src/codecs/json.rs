//! JSON codec using `serde_json`

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CacheError, CacheResult};
use crate::traits::CacheCodec;

/// Default value codec. Keys are always strings; values are JSON documents.
#[derive(Debug, Default, Clone)]
pub struct JsonCodec;

impl CacheCodec for JsonCodec {
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> CacheResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(CacheError::serialization)
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> CacheResult<T> {
        serde_json::from_slice(bytes).map_err(CacheError::serialization)
    }

    fn name(&self) -> &'static str {
        "serde_json"
    }
}
