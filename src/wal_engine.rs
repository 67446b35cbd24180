//! Single-WAL-segment push/fetch with speculative prefetch (spec.md §4.7).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use tokio::fs;
use tokio_util::io::StreamReader;

use crate::blob::BlobStore;
use crate::error::{Error, Result};
use crate::name_layout::{self, WalSegmentName};
use crate::pipe_stager::{PipeStager, PipeUnstager};
use crate::worker_pool::{CancelGuard, WorkerPool};

/// Default pooled WAL push degree (spec.md §4.5).
pub const DEFAULT_WAL_PUSH_POOL_SIZE: usize = 8;
/// Default prefetch degree (spec.md §4.5).
pub const DEFAULT_PREFETCH_POOL_SIZE: usize = 8;

pub struct WalEngine {
    blob: Arc<dyn BlobStore>,
    gpg_key_id: Option<String>,
}

impl WalEngine {
    pub fn new(blob: Arc<dyn BlobStore>, gpg_key_id: Option<String>) -> Self {
        Self { blob, gpg_key_id }
    }

    /// `wal-push <SEGMENT_PATH>` (spec.md §4.7, §6). Reports success only
    /// once this segment's own upload is acknowledged by the Blob Layer.
    pub async fn push(&self, local_path: &Path) -> Result<()> {
        let segment = segment_name_from_path(local_path)?;
        self.push_segment(&segment, local_path, std::env::temp_dir()).await
    }

    /// Pooled push across several ready segments handed to one
    /// `archive_command` invocation (spec.md §4.7 "Pooling", §4.5
    /// `--pool-size`).
    pub async fn push_many(&self, local_paths: &[PathBuf], pool_size: usize) -> Result<()> {
        let mut pool = WorkerPool::new(pool_size.max(1));
        for path in local_paths {
            let path = path.clone();
            let segment = segment_name_from_path(&path)?;
            let blob = self.blob.clone();
            let gpg_key_id = self.gpg_key_id.clone();
            let stage_dir = std::env::temp_dir();
            pool.submit(move |guard| async move {
                if guard.is_cancelled() {
                    return Err(Error::Fatal("cancelled by a sibling WAL push's failure".into()));
                }
                push_segment_impl(&blob, gpg_key_id, &segment, &path, stage_dir, Some(guard)).await
            });
        }
        pool.wait_all().await
    }

    async fn push_segment(&self, segment: &WalSegmentName, local_path: &Path, stage_dir: PathBuf) -> Result<()> {
        push_segment_impl(&self.blob, self.gpg_key_id.clone(), segment, local_path, stage_dir, None).await
    }

    /// `wal-fetch <SEGMENT_NAME> <DEST_PATH>` (spec.md §4.7, §6). Serves
    /// from `prefetch_dir` via atomic rename if the segment already landed
    /// there; otherwise downloads directly. Either way, speculatively
    /// enqueues the next `prefetch_count` segments afterward.
    pub async fn fetch(
        &self,
        segment: &WalSegmentName,
        dest_path: &Path,
        prefetch_dir: Option<&Path>,
        prefetch_count: u32,
    ) -> Result<()> {
        if let Some(dir) = prefetch_dir {
            let prefetched = dir.join(segment.as_str());
            if fs::rename(&prefetched, dest_path).await.is_ok() {
                self.spawn_prefetch(segment, dir, prefetch_count);
                return Ok(());
            }
        }

        self.fetch_one(segment, dest_path).await?;
        if let Some(dir) = prefetch_dir {
            self.spawn_prefetch(segment, dir, prefetch_count);
        }
        Ok(())
    }

    async fn fetch_one(&self, segment: &WalSegmentName, dest_path: &Path) -> Result<()> {
        let key = name_layout::wal_key(segment);
        let stream = self.blob.get(&key).await?;
        let reader = StreamReader::new(stream.map(|r| r.map_err(std::io::Error::other)));
        // Staging in dest's own directory keeps the final rename atomic
        // (same filesystem).
        let stage_dir = dest_path.parent().map(Path::to_path_buf).unwrap_or_else(std::env::temp_dir);
        let unstager = PipeUnstager::new(&stage_dir, self.gpg_key_id.is_some());
        let staged = unstager.unstage(reader, None).await?;
        fs::rename(&staged.path, dest_path).await.map_err(Error::Io)
    }

    /// Enqueues the next `count` segments into `prefetch_dir`; best-effort,
    /// failures are logged and never surfaced (spec.md §4.7).
    fn spawn_prefetch(&self, start: &WalSegmentName, prefetch_dir: &Path, count: u32) {
        if count == 0 {
            return;
        }
        let blob = self.blob.clone();
        let gpg_key_id = self.gpg_key_id.clone();
        let prefetch_dir = prefetch_dir.to_path_buf();
        let segments = name_layout::next_segments(start, count);
        tokio::spawn(async move {
            if fs::create_dir_all(&prefetch_dir).await.is_err() {
                return;
            }
            let mut pool = WorkerPool::new(DEFAULT_PREFETCH_POOL_SIZE);
            for segment in segments {
                let blob = blob.clone();
                let gpg_key_id = gpg_key_id.clone();
                let prefetch_dir = prefetch_dir.clone();
                pool.submit(move |guard| async move {
                    if guard.is_cancelled() {
                        return Ok(());
                    }
                    prefetch_one(&blob, gpg_key_id, &segment, &prefetch_dir, Some(guard)).await
                });
            }
            if let Err(e) = pool.wait_all().await {
                tracing::warn!(error = %e, "wal prefetch failed; affected segments will be retried on next wal-fetch");
            }
        });
    }
}

async fn push_segment_impl(
    blob: &Arc<dyn BlobStore>,
    gpg_key_id: Option<String>,
    segment: &WalSegmentName,
    local_path: &Path,
    stage_dir: PathBuf,
    cancel: Option<CancelGuard>,
) -> Result<()> {
    let input = fs::File::open(local_path).await.map_err(Error::Io)?;
    let stager = PipeStager::new(stage_dir, gpg_key_id);
    let staged = stager.stage(input, cancel).await?;
    let bytes = fs::read(&staged.path).await.map_err(Error::Io)?;
    let key = name_layout::wal_key(segment);
    blob.put(&key, bytes.len() as u64, Bytes::from(bytes)).await
}

async fn prefetch_one(
    blob: &Arc<dyn BlobStore>,
    gpg_key_id: Option<String>,
    segment: &WalSegmentName,
    prefetch_dir: &Path,
    cancel: Option<CancelGuard>,
) -> Result<()> {
    let dest = prefetch_dir.join(segment.as_str());
    if fs::try_exists(&dest).await.unwrap_or(false) {
        return Ok(());
    }
    let key = name_layout::wal_key(segment);
    let stream = match blob.get(&key).await {
        Ok(s) => s,
        Err(Error::NotFound(_)) => return Ok(()),
        Err(e) => return Err(e),
    };
    let reader = StreamReader::new(stream.map(|r| r.map_err(std::io::Error::other)));
    let unstager = PipeUnstager::new(prefetch_dir, gpg_key_id.is_some());
    let staged = unstager.unstage(reader, cancel).await?;
    fs::rename(&staged.path, &dest).await.map_err(Error::Io)
}

fn segment_name_from_path(path: &Path) -> Result<WalSegmentName> {
    let stem = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Fatal(format!("cannot derive WAL segment name from path {}", path.display())))?;
    WalSegmentName::parse(stem)
}
