use crate::types::BlobRef;
use anyhow::Result;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};

/// Content-addressed blob store. Refs are opaque to callers; the provided
/// implementations use the SHA-256 hex of the stored bytes, so equal content
/// shares a ref.
///
/// All large payloads (configs, outputs, frozen base documents) go through
/// here; hot-state keys store only refs.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, bytes: &[u8]) -> Result<BlobRef>;
    async fn get(&self, r: &BlobRef) -> Result<Vec<u8>>;
}

/// SHA-256 hex of a byte slice — the canonical ref for content-addressed
/// backends.
pub fn content_ref(bytes: &[u8]) -> BlobRef {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Store a value as canonical JSON, returning its ref.
pub async fn put_json<T: Serialize + Sync>(store: &dyn BlobStore, value: &T) -> Result<BlobRef> {
    let bytes = serde_json::to_vec(value)?;
    store.put(&bytes).await
}

/// Load and deserialize a JSON blob.
pub async fn get_json<T: DeserializeOwned>(store: &dyn BlobStore, r: &BlobRef) -> Result<T> {
    let bytes = store.get(r).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refs_are_stable_and_content_derived() {
        let a = content_ref(b"{\"x\":1}");
        let b = content_ref(b"{\"x\":1}");
        let c = content_ref(b"{\"x\":2}");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
