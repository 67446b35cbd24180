//! Uniform interface over the supported blob-store backends (spec.md §4.1).
//!
//! Every higher layer sees only [`BlobStore`]; the active backend is a
//! tagged variant constructed once, from the prefix scheme, at startup
//! (spec.md §9 "Dynamic, scheme-dispatched storage backends").

mod azure;
mod gcs;
pub mod memory;
mod retry;
mod s3;
mod swift;

pub use retry::with_retry;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::config::{ArchiveConfig, BackendCredentials, StoreScheme};
use crate::error::{Error, Result};

/// One entry returned by [`BlobStore::list`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
}

/// put/get/list/delete/exists over whole objects with a known content
/// length (spec.md §4.1). Implemented once per backend and dispatched
/// through the [`Blob`] enum so every caller is backend-agnostic.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, length: u64, body: Bytes) -> Result<()>;

    /// Returns a restartable byte stream. Backends that support HTTP range
    /// requests re-issue on mid-stream disconnect internally; callers just
    /// see `Result<Bytes>` chunks.
    async fn get(&self, key: &str) -> Result<BoxStream<'static, Result<Bytes>>>;

    /// All keys under `prefix`, paginated transparently, no duplicates.
    /// Ordering is backend-native and not relied upon beyond "visited once".
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;

    /// Idempotent: deleting an absent key is a no-op. Bulk where the
    /// backend supports it.
    async fn delete(&self, keys: &[String]) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;
}

/// The active backend, tagged by scheme. Every method just forwards to the
/// wrapped implementation; this indirection is what keeps
/// `backup_engine`/`wal_engine`/`pruner` free of backend-specific code.
pub enum Blob {
    S3(s3::S3Backend),
    Azure(azure::AzureBackend),
    Gcs(gcs::GcsBackend),
    Swift(swift::SwiftBackend),
}

impl Blob {
    pub async fn from_config(config: &ArchiveConfig) -> Result<Self> {
        match (&config.prefix.scheme, &config.credentials) {
            (StoreScheme::S3, BackendCredentials::S3 { .. }) => {
                Ok(Self::S3(s3::S3Backend::new(config)?))
            }
            (StoreScheme::Wabs, BackendCredentials::Wabs { .. }) => {
                Ok(Self::Azure(azure::AzureBackend::new(config)?))
            }
            (StoreScheme::Gs, BackendCredentials::Gs { .. }) => {
                Ok(Self::Gcs(gcs::GcsBackend::new(config)?))
            }
            (StoreScheme::Swift, BackendCredentials::Swift { .. }) => {
                Ok(Self::Swift(swift::SwiftBackend::new(config)?))
            }
            _ => Err(Error::Fatal("prefix scheme and credentials kind disagree".into())),
        }
    }
}

#[async_trait]
impl BlobStore for Blob {
    async fn put(&self, key: &str, length: u64, body: Bytes) -> Result<()> {
        match self {
            Blob::S3(b) => b.put(key, length, body).await,
            Blob::Azure(b) => b.put(key, length, body).await,
            Blob::Gcs(b) => b.put(key, length, body).await,
            Blob::Swift(b) => b.put(key, length, body).await,
        }
    }

    async fn get(&self, key: &str) -> Result<BoxStream<'static, Result<Bytes>>> {
        match self {
            Blob::S3(b) => b.get(key).await,
            Blob::Azure(b) => b.get(key).await,
            Blob::Gcs(b) => b.get(key).await,
            Blob::Swift(b) => b.get(key).await,
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        match self {
            Blob::S3(b) => b.list(prefix).await,
            Blob::Azure(b) => b.list(prefix).await,
            Blob::Gcs(b) => b.list(prefix).await,
            Blob::Swift(b) => b.list(prefix).await,
        }
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        match self {
            Blob::S3(b) => b.delete(keys).await,
            Blob::Azure(b) => b.delete(keys).await,
            Blob::Gcs(b) => b.delete(keys).await,
            Blob::Swift(b) => b.delete(keys).await,
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        match self {
            Blob::S3(b) => b.exists(key).await,
            Blob::Azure(b) => b.exists(key).await,
            Blob::Gcs(b) => b.exists(key).await,
            Blob::Swift(b) => b.exists(key).await,
        }
    }
}

/// Parse the custom S3 endpoint format of spec.md §6:
/// `scheme+convention://host[:port]`.
pub(crate) struct CustomEndpoint {
    pub https: bool,
    pub convention: EndpointConvention,
    pub host: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum EndpointConvention {
    Path,
    VirtualHost,
    Subdomain,
}

pub(crate) fn parse_custom_endpoint(raw: &str) -> Result<CustomEndpoint> {
    let (scheme_part, host) = raw
        .split_once("://")
        .ok_or_else(|| Error::Fatal(format!("invalid endpoint {raw:?}: missing ://")))?;
    let (scheme, convention) = scheme_part
        .split_once('+')
        .ok_or_else(|| Error::Fatal(format!("invalid endpoint {raw:?}: missing +convention")))?;
    let https = match scheme {
        "https" => true,
        "http" => false,
        other => return Err(Error::Fatal(format!("unknown endpoint scheme {other:?}"))),
    };
    let convention = match convention {
        "path" => EndpointConvention::Path,
        "virtualhost" => EndpointConvention::VirtualHost,
        "subdomain" => EndpointConvention::Subdomain,
        other => return Err(Error::Fatal(format!("unknown endpoint convention {other:?}"))),
    };
    Ok(CustomEndpoint { https, convention, host: host.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_custom_endpoint_accepts_all_conventions() {
        let e = parse_custom_endpoint("https+path://minio.local:9000").unwrap();
        assert!(e.https);
        assert_eq!(e.convention, EndpointConvention::Path);
        assert_eq!(e.host, "minio.local:9000");

        let e = parse_custom_endpoint("http+virtualhost://store.local").unwrap();
        assert!(!e.https);
        assert_eq!(e.convention, EndpointConvention::VirtualHost);

        let e = parse_custom_endpoint("https+subdomain://s3.example.com").unwrap();
        assert_eq!(e.convention, EndpointConvention::Subdomain);
    }

    #[test]
    fn parse_custom_endpoint_rejects_malformed() {
        assert!(parse_custom_endpoint("minio.local:9000").is_err());
        assert!(parse_custom_endpoint("ftp+path://minio.local").is_err());
        assert!(parse_custom_endpoint("https://minio.local").is_err());
    }
}
