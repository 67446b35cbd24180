//! Deletes obsolete backups and WAL (spec.md §4.8, §8).
//!
//! Every target resolves to a [`PrunePlan`]; the CLI shell decides whether
//! to execute it (default is dry-run: the plan is only printed) or to call
//! [`Pruner::execute`] when `--confirm` was given. Deletion itself always
//! goes sentinel, then partitions, then WAL, so a crash mid-prune never
//! leaves a sentinel pointing at partitions that are already gone — the
//! sentinel's absence is the only thing that marks a backup as deleted,
//! mirroring the completion marker in `backup_engine`.

use std::sync::Arc;

use crate::blob::BlobStore;
use crate::error::Result;
use crate::name_layout::{self, BackupName, KeyKind, WalSegmentName};

/// Which backups (and their downstream WAL) a prune targets (spec.md
/// §4.8/§8 `delete` subcommands).
pub enum PruneTarget {
    /// Every backup whose name sorts strictly before `NAME`.
    Before(BackupName),
    /// All but the `n` most recent backups.
    Retain(usize),
    /// Every key recognized as belonging to a storage version other than
    /// the current one.
    OldVersions,
    /// Every sentinel, partition, and WAL segment under the current
    /// storage version.
    Everything,
}

struct BackupKeys {
    backup: BackupName,
    sentinel: String,
    partitions: Vec<String>,
}

/// What a prune would delete (or, after [`Pruner::execute`], did delete).
/// Grouped by the order deletion happens in.
#[derive(Clone, Debug, Default)]
pub struct PrunePlan {
    pub sentinel_keys: Vec<String>,
    pub partition_keys: Vec<String>,
    pub wal_keys: Vec<String>,
}

impl PrunePlan {
    pub fn is_empty(&self) -> bool {
        self.sentinel_keys.is_empty() && self.partition_keys.is_empty() && self.wal_keys.is_empty()
    }

    pub fn total_keys(&self) -> usize {
        self.sentinel_keys.len() + self.partition_keys.len() + self.wal_keys.len()
    }

    /// Rows for the CSV the CLI prints in dry-run mode (spec.md §8).
    pub fn rows(&self) -> impl Iterator<Item = (&'static str, &str)> {
        self.sentinel_keys
            .iter()
            .map(|k| ("sentinel", k.as_str()))
            .chain(self.partition_keys.iter().map(|k| ("partition", k.as_str())))
            .chain(self.wal_keys.iter().map(|k| ("wal", k.as_str())))
    }
}

pub struct Pruner {
    blob: Arc<dyn BlobStore>,
}

impl Pruner {
    pub fn new(blob: Arc<dyn BlobStore>) -> Self {
        Self { blob }
    }

    /// Computes, but does not execute, a prune (spec.md §8: dry-run is the
    /// default; `--confirm` is required to actually delete anything).
    pub async fn plan(&self, target: &PruneTarget) -> Result<PrunePlan> {
        match target {
            PruneTarget::Before(cutoff) => self.plan_before(cutoff).await,
            PruneTarget::Retain(keep) => self.plan_retain(*keep).await,
            PruneTarget::OldVersions => self.plan_old_versions().await,
            PruneTarget::Everything => self.plan_everything().await,
        }
    }

    /// Deletes a previously computed plan: sentinels first, then
    /// partitions, then WAL (spec.md §4.8 delete ordering).
    pub async fn execute(&self, plan: &PrunePlan) -> Result<()> {
        self.blob.delete(&plan.sentinel_keys).await?;
        self.blob.delete(&plan.partition_keys).await?;
        self.blob.delete(&plan.wal_keys).await?;
        Ok(())
    }

    async fn list_backups(&self) -> Result<Vec<BackupKeys>> {
        let objects = self.blob.list(&name_layout::sentinels_prefix()).await?;
        let mut backups = Vec::new();
        for object in objects {
            if let KeyKind::Sentinel { backup } = name_layout::classify(&object.key) {
                let partitions = self
                    .blob
                    .list(&name_layout::partitions_prefix(&backup))
                    .await?
                    .into_iter()
                    .map(|o| o.key)
                    .collect();
                backups.push(BackupKeys { sentinel: object.key, backup, partitions });
            }
        }
        backups.sort_by(|a, b| a.backup.cmp(&b.backup));
        Ok(backups)
    }

    async fn plan_before(&self, cutoff: &BackupName) -> Result<PrunePlan> {
        let backups = self.list_backups().await?;
        let doomed: Vec<&BackupKeys> = backups.iter().filter(|b| &b.backup < cutoff).collect();
        let wal_keys = self.wal_keys_before_segment(&cutoff.segment).await?;
        Ok(collect_plan(doomed, wal_keys))
    }

    async fn plan_retain(&self, keep: usize) -> Result<PrunePlan> {
        let backups = self.list_backups().await?;
        if backups.len() <= keep {
            return Ok(PrunePlan::default());
        }
        let cutoff_index = backups.len() - keep;
        let doomed: Vec<&BackupKeys> = backups[..cutoff_index].iter().collect();
        let wal_keys = match backups.get(cutoff_index) {
            Some(kept_oldest) => self.wal_keys_before_segment(&kept_oldest.backup.segment).await?,
            None => Vec::new(),
        };
        Ok(collect_plan(doomed, wal_keys))
    }

    /// Everything [`name_layout::classify`] recognizes as living under a
    /// storage-version prefix other than the current one.
    async fn plan_old_versions(&self) -> Result<PrunePlan> {
        let objects = self.blob.list("").await?;
        let partition_keys = objects
            .into_iter()
            .filter(|o| matches!(name_layout::classify(&o.key), KeyKind::OtherVersion))
            .map(|o| o.key)
            .collect();
        Ok(PrunePlan { sentinel_keys: Vec::new(), partition_keys, wal_keys: Vec::new() })
    }

    async fn plan_everything(&self) -> Result<PrunePlan> {
        let backups = self.list_backups().await?;
        let doomed: Vec<&BackupKeys> = backups.iter().collect();
        let wal_keys = self
            .blob
            .list(&name_layout::wal_prefix())
            .await?
            .into_iter()
            .map(|o| o.key)
            .collect();
        Ok(collect_plan(doomed, wal_keys))
    }

    /// WAL segments strictly older than `cutoff` — a backup's useful WAL
    /// horizon starts at its own `backup_start` segment, so anything before
    /// the oldest surviving backup's start segment is unreachable.
    async fn wal_keys_before_segment(&self, cutoff: &WalSegmentName) -> Result<Vec<String>> {
        let objects = self.blob.list(&name_layout::wal_prefix()).await?;
        Ok(objects
            .into_iter()
            .filter_map(|o| match name_layout::classify(&o.key) {
                KeyKind::Wal { segment } if &segment < cutoff => Some(o.key),
                _ => None,
            })
            .collect())
    }
}

fn collect_plan(doomed: Vec<&BackupKeys>, wal_keys: Vec<String>) -> PrunePlan {
    let mut sentinel_keys = Vec::with_capacity(doomed.len());
    let mut partition_keys = Vec::new();
    for backup in doomed {
        sentinel_keys.push(backup.sentinel.clone());
        partition_keys.extend(backup.partitions.iter().cloned());
    }
    PrunePlan { sentinel_keys, partition_keys, wal_keys }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::memory::MemoryBackend;
    use bytes::Bytes;

    fn seg(s: &str) -> WalSegmentName {
        WalSegmentName::parse(s).unwrap()
    }

    async fn seed_backup(blob: &MemoryBackend, segment: &str, offset: u64, partitions: u32) -> BackupName {
        let backup = BackupName::new(seg(segment), offset);
        for i in 0..partitions {
            let key = name_layout::partition_key(&backup, i);
            blob.put(&key, 4, Bytes::from_static(b"data")).await.unwrap();
        }
        let key = name_layout::sentinel_key(&backup);
        blob.put(&key, 2, Bytes::from_static(b"{}")).await.unwrap();
        backup
    }

    async fn seed_wal(blob: &MemoryBackend, segment: &str) {
        let key = name_layout::wal_key(&seg(segment));
        blob.put(&key, 1, Bytes::from_static(b"w")).await.unwrap();
    }

    #[tokio::test]
    async fn retain_keeps_the_n_most_recent_backups_and_their_wal() {
        let blob = MemoryBackend::new();
        let oldest = seed_backup(&blob, "0000000100000000000000A1", 0, 2).await;
        let middle = seed_backup(&blob, "0000000100000000000000A2", 0, 1).await;
        let newest = seed_backup(&blob, "0000000100000000000000A3", 0, 3).await;
        seed_wal(&blob, "0000000100000000000000A0").await;
        seed_wal(&blob, "0000000100000000000000A2").await;

        let blob: Arc<dyn BlobStore> = Arc::new(blob);
        let pruner = Pruner::new(blob.clone());
        let plan = pruner.plan(&PruneTarget::Retain(1)).await.unwrap();

        assert_eq!(plan.sentinel_keys, vec![name_layout::sentinel_key(&oldest), name_layout::sentinel_key(&middle)]);
        assert_eq!(plan.partition_keys.len(), 3);
        assert_eq!(plan.wal_keys, vec![name_layout::wal_key(&seg("0000000100000000000000A0"))]);

        pruner.execute(&plan).await.unwrap();
        assert!(!blob.exists(&name_layout::sentinel_key(&oldest)).await.unwrap());
        assert!(blob.exists(&name_layout::sentinel_key(&newest)).await.unwrap());
    }

    #[tokio::test]
    async fn retain_is_a_no_op_when_fewer_backups_exist_than_requested() {
        let blob = MemoryBackend::new();
        seed_backup(&blob, "0000000100000000000000A1", 0, 1).await;
        let blob: Arc<dyn BlobStore> = Arc::new(blob);
        let plan = Pruner::new(blob).plan(&PruneTarget::Retain(5)).await.unwrap();
        assert!(plan.is_empty());
    }

    #[tokio::test]
    async fn before_deletes_only_strictly_older_backups() {
        let blob = MemoryBackend::new();
        let older = seed_backup(&blob, "0000000100000000000000A1", 0, 1).await;
        let cutoff = seed_backup(&blob, "0000000100000000000000A2", 0, 1).await;
        let newer = seed_backup(&blob, "0000000100000000000000A3", 0, 1).await;
        let blob: Arc<dyn BlobStore> = Arc::new(blob);
        let plan = Pruner::new(blob).plan(&PruneTarget::Before(cutoff.clone())).await.unwrap();
        assert_eq!(plan.sentinel_keys, vec![name_layout::sentinel_key(&older)]);
        assert!(!plan.sentinel_keys.contains(&name_layout::sentinel_key(&cutoff)));
        assert!(!plan.sentinel_keys.contains(&name_layout::sentinel_key(&newer)));
    }

    #[tokio::test]
    async fn old_versions_targets_other_storage_version_prefixes_only() {
        let blob = MemoryBackend::new();
        blob.put("basebackups_004/stale/tar_partitions/part_00000000.tar.lzo", 1, Bytes::from_static(b"x"))
            .await
            .unwrap();
        blob.put("wal_006/future.lzo", 1, Bytes::from_static(b"x")).await.unwrap();
        seed_backup(&blob, "0000000100000000000000A1", 0, 1).await;
        let blob: Arc<dyn BlobStore> = Arc::new(blob);
        let plan = Pruner::new(blob).plan(&PruneTarget::OldVersions).await.unwrap();
        assert_eq!(plan.sentinel_keys.len(), 0);
        assert_eq!(plan.partition_keys.len(), 2);
    }

    #[tokio::test]
    async fn everything_targets_all_current_version_keys() {
        let blob = MemoryBackend::new();
        seed_backup(&blob, "0000000100000000000000A1", 0, 2).await;
        seed_wal(&blob, "0000000100000000000000A0").await;
        let blob: Arc<dyn BlobStore> = Arc::new(blob);
        let plan = Pruner::new(blob).plan(&PruneTarget::Everything).await.unwrap();
        assert_eq!(plan.total_keys(), 4);
    }

    #[tokio::test]
    async fn execute_is_a_noop_on_an_empty_plan() {
        let blob: Arc<dyn BlobStore> = Arc::new(MemoryBackend::new());
        Pruner::new(blob).execute(&PrunePlan::default()).await.unwrap();
    }
}
