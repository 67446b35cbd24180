use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use object_store::azure::MicrosoftAzureBuilder;
use object_store::path::Path as ObjPath;
use object_store::{ObjectStore, PutPayload};

use super::{with_retry, BlobStore, ObjectMeta};
use crate::config::{ArchiveConfig, BackendCredentials};
use crate::error::{Error, Result};

/// Azure Blob Storage (`wabs://` prefix), backed by the `object_store`
/// crate's `azure` feature rather than a hand-rolled REST client — the same
/// abstraction this crate uses for GCS, since both are exposed through one
/// upstream trait.
pub struct AzureBackend {
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

impl AzureBackend {
    pub fn new(config: &ArchiveConfig) -> Result<Self> {
        let BackendCredentials::Wabs { account_name, access_key, sas_token } = &config.credentials else {
            return Err(Error::Fatal("AzureBackend requires Wabs credentials".into()));
        };

        let mut builder = MicrosoftAzureBuilder::new()
            .with_account(account_name)
            .with_container_name(&config.prefix.bucket);

        builder = if let Some(key) = access_key {
            builder.with_access_key(key)
        } else if let Some(token) = sas_token {
            builder.with_config(object_store::azure::AzureConfigKey::SasKey, token)
        } else {
            return Err(Error::Fatal("no WABS_ACCESS_KEY or WABS_SAS_TOKEN".into()));
        };

        let store = builder.build().map_err(|e| Error::Fatal(e.to_string()))?;
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
impl BlobStore for AzureBackend {
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
