use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::path::Path as ObjPath;
use object_store::{ObjectStore, PutPayload};

use super::{with_retry, BlobStore, ObjectMeta};
use crate::config::{ArchiveConfig, BackendCredentials};
use crate::error::{Error, Result};

/// Google Cloud Storage (`gs://` prefix), via `object_store`'s `gcp`
/// feature. See [`super::azure`] for why this crate leans on `object_store`
/// for the backends the teacher crate never had to speak to.
pub struct GcsBackend {
    store: Box<dyn ObjectStore>,
    path_prefix: String,
}

fn classify(e: object_store::Error) -> Error {
    match e {
        object_store::Error::NotFound { .. } => Error::NotFound(e.to_string()),
        object_store::Error::Unauthenticated { .. } | object_store::Error::PermissionDenied { .. } => {
            Error::Fatal(e.to_string())
        }
        other => Error::Transient(other.to_string()),
    }
}

impl GcsBackend {
    pub fn new(config: &ArchiveConfig) -> Result<Self> {
        let BackendCredentials::Gs { application_credentials_path } = &config.credentials else {
            return Err(Error::Fatal("GcsBackend requires Gs credentials".into()));
        };

        let store = GoogleCloudStorageBuilder::new()
            .with_service_account_path(application_credentials_path)
            .with_bucket_name(&config.prefix.bucket)
            .build()
            .map_err(|e| Error::Fatal(e.to_string()))?;

        Ok(Self { store: Box::new(store), path_prefix: config.prefix.path.clone() })
    }

    fn full_path(&self, key: &str) -> ObjPath {
        if self.path_prefix.is_empty() {
            ObjPath::from(key)
        } else {
            ObjPath::from(format!("{}/{}", self.path_prefix, key))
        }
    }

    fn strip_prefix<'a>(&self, key: &'a str) -> &'a str {
        if self.path_prefix.is_empty() {
            key
        } else {
            key.strip_prefix(&format!("{}/", self.path_prefix)).unwrap_or(key)
        }
    }
}

#[async_trait]
impl BlobStore for GcsBackend {
    async fn put(&self, key: &str, _length: u64, body: Bytes) -> Result<()> {
        let path = self.full_path(key);
        with_retry(|| async {
            self.store
                .put(&path, PutPayload::from_bytes(body.clone()))
                .await
                .map(|_| ())
                .map_err(classify)
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<BoxStream<'static, Result<Bytes>>> {
        let path = self.full_path(key);
        let result = with_retry(|| async { self.store.get(&path).await.map_err(classify) }).await?;
        let stream = result.into_stream().map_err(classify);
        Ok(stream.boxed())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let full = self.full_path(prefix);
        let metas = with_retry(|| async {
            let mut stream = self.store.list(Some(&full));
            let mut metas = Vec::new();
            while let Some(meta) = stream.next().await {
                metas.push(meta.map_err(classify)?);
            }
            Ok(metas)
        })
        .await?;

        Ok(metas
            .into_iter()
            .map(|meta| ObjectMeta {
                key: self.strip_prefix(&meta.location.to_string()).to_string(),
                size: meta.size as u64,
            })
            .collect())
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            let path = self.full_path(key);
            with_retry(|| async {
                match self.store.delete(&path).await {
                    Ok(()) => Ok(()),
                    Err(object_store::Error::NotFound { .. }) => Ok(()),
                    Err(e) => Err(classify(e)),
                }
            })
            .await?;
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.full_path(key);
        with_retry(|| async {
            match self.store.head(&path).await {
                Ok(_) => Ok(true),
                Err(object_store::Error::NotFound { .. }) => Ok(false),
                Err(e) => Err(classify(e)),
            }
        })
        .await
    }
}
