//! An in-process [`BlobStore`] backed by a `HashMap`, used by tests and
//! benches in place of a real cloud backend (the same role
//! `object_store::memory::InMemory` plays for that crate's own test suite).
//! Never constructed by [`Blob::from_config`]; no `WALE_*_PREFIX` scheme
//! selects it.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};

use super::{BlobStore, ObjectMeta};
use crate::error::{Error, Result};

#[derive(Default)]
pub struct MemoryBackend {
    objects: Mutex<HashMap<String, Bytes>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBackend {
    async fn put(&self, key: &str, _length: u64, body: Bytes) -> Result<()> {
        self.objects.lock().unwrap().insert(key.to_string(), body);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<BoxStream<'static, Result<Bytes>>> {
        let body = self
            .objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        Ok(stream::once(async move { Ok(body) }).boxed())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| ObjectMeta { key: k.clone(), size: v.len() as u64 })
            .collect())
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        let mut objects = self.objects.lock().unwrap();
        for key in keys {
            objects.remove(key);
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.objects.lock().unwrap().contains_key(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_round_trips() {
        let backend = MemoryBackend::new();
        backend.put("a/b", 3, Bytes::from_static(b"abc")).await.unwrap();
        assert!(backend.exists("a/b").await.unwrap());
        let mut stream = backend.get("a/b").await.unwrap();
        let chunk = stream.next().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"abc");
    }

    #[tokio::test]
    async fn get_missing_key_is_not_found() {
        let backend = MemoryBackend::new();
        assert!(matches!(backend.get("missing").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let backend = MemoryBackend::new();
        backend.delete(&["missing".to_string()]).await.unwrap();
        backend.put("k", 1, Bytes::from_static(b"x")).await.unwrap();
        backend.delete(&["k".to_string(), "k".to_string()]).await.unwrap();
        assert!(!backend.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn list_filters_by_prefix() {
        let backend = MemoryBackend::new();
        backend.put("wal_005/a", 1, Bytes::from_static(b"x")).await.unwrap();
        backend.put("wal_005/b", 1, Bytes::from_static(b"x")).await.unwrap();
        backend.put("basebackups_005/c", 1, Bytes::from_static(b"x")).await.unwrap();
        let listed = backend.list("wal_005/").await.unwrap();
        assert_eq!(listed.len(), 2);
    }
}
