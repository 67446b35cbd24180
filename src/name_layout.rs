//! Pure mapping between backup/WAL identifiers and blob-store keys.
//!
//! This is the single source of truth for on-store layout (storage version
//! `005`); nothing outside this module should format or parse a key.

use std::fmt;

use crate::error::{Error, Result};

/// The three-digit storage version tag embedded in every key path.
pub const STORAGE_VERSION: &str = "005";

const WAL_SEGMENT_LEN: usize = 24;

/// A validated 24-hex-character WAL segment name.
///
/// Lexicographic order within a timeline equals production order (spec.md
/// §3), so `WalSegmentName` derives `Ord` directly from its string form.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WalSegmentName(String);

impl WalSegmentName {
    pub fn parse(s: &str) -> Result<Self> {
        if s.len() == WAL_SEGMENT_LEN && s.bytes().all(|b| b.is_ascii_hexdigit()) {
            Ok(Self(s.to_ascii_uppercase()))
        } else {
            Err(Error::Fatal(format!("not a valid WAL segment name: {s:?}")))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WalSegmentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A backup identifier: `base_<SEGMENT>_<OFFSET_DECIMAL>`.
///
/// Totally ordered by `(segment, offset)`, which equals temporal order
/// within a timeline (spec.md §3).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BackupName {
    pub segment: WalSegmentName,
    pub offset: u64,
}

impl BackupName {
    pub fn new(segment: WalSegmentName, offset: u64) -> Self {
        Self { segment, offset }
    }

    /// Render as the `base_<SEGMENT>_<OFFSET_DECIMAL>` string used in keys.
    pub fn to_name_string(&self) -> String {
        format!("base_{}_{:08}", self.segment, self.offset)
    }

    /// Inverse of [`to_name_string`](Self::to_name_string).
    pub fn parse(s: &str) -> Result<Self> {
        let rest = s
            .strip_prefix("base_")
            .ok_or_else(|| Error::Fatal(format!("not a backup name: {s:?}")))?;
        let (segment, offset) = rest
            .rsplit_once('_')
            .ok_or_else(|| Error::Fatal(format!("not a backup name: {s:?}")))?;
        let segment = WalSegmentName::parse(segment)?;
        let offset: u64 = offset
            .parse()
            .map_err(|_| Error::Fatal(format!("not a backup name: {s:?}")))?;
        Ok(Self { segment, offset })
    }
}

impl fmt::Display for BackupName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_name_string())
    }
}

/// `<PREFIX>/basebackups_005/<BACKUP_NAME>/tar_partitions/part_<NNNNNNNN>.tar.lzo`
pub fn partition_key(backup: &BackupName, index: u32) -> String {
    format!(
        "basebackups_{STORAGE_VERSION}/{backup}/tar_partitions/part_{index:08}.tar.lzo"
    )
}

/// `<PREFIX>/basebackups_005/<BACKUP_NAME>_backup_stop_sentinel.json`
pub fn sentinel_key(backup: &BackupName) -> String {
    format!("basebackups_{STORAGE_VERSION}/{backup}_backup_stop_sentinel.json")
}

/// Prefix under which all of a backup's partitions live; used for listing.
pub fn partitions_prefix(backup: &BackupName) -> String {
    format!("basebackups_{STORAGE_VERSION}/{backup}/tar_partitions/")
}

/// Prefix under which every sentinel for this storage version lives.
pub fn sentinels_prefix() -> String {
    format!("basebackups_{STORAGE_VERSION}/")
}

/// `<PREFIX>/wal_005/<SEGMENT_NAME>.lzo`
pub fn wal_key(segment: &WalSegmentName) -> String {
    format!("wal_{STORAGE_VERSION}/{segment}.lzo")
}

/// Prefix under which every WAL object for this storage version lives.
pub fn wal_prefix() -> String {
    format!("wal_{STORAGE_VERSION}/")
}

/// A key's role, as recognized by [`classify`]. Anything that doesn't match
/// one of the closed-form patterns below is `Unknown` and must never be
/// treated as "known" by the Pruner (spec.md §4.3).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyKind {
    Partition { backup: BackupName, index: u32 },
    Sentinel { backup: BackupName },
    Wal { segment: WalSegmentName },
    /// Under the current storage-version prefix but not one of the three
    /// recognized forms.
    UnknownInCurrentVersion,
    /// Under a *different* storage-version prefix (`old-versions` target).
    OtherVersion,
    Unknown,
}

pub fn classify(key: &str) -> KeyKind {
    if let Some(rest) = key.strip_prefix(&format!("basebackups_{STORAGE_VERSION}/")) {
        if let Some(name) = rest.strip_suffix("_backup_stop_sentinel.json") {
            return match BackupName::parse(name) {
                Ok(backup) => KeyKind::Sentinel { backup },
                Err(_) => KeyKind::UnknownInCurrentVersion,
            };
        }
        if let Some((name, tail)) = rest.split_once("/tar_partitions/part_")
            && let Some(index_str) = tail.strip_suffix(".tar.lzo")
            && let Ok(index) = index_str.parse::<u32>()
            && let Ok(backup) = BackupName::parse(name)
        {
            return KeyKind::Partition { backup, index };
        }
        return KeyKind::UnknownInCurrentVersion;
    }
    if let Some(rest) = key.strip_prefix(&format!("wal_{STORAGE_VERSION}/")) {
        if let Some(seg) = rest.strip_suffix(".lzo")
            && let Ok(segment) = WalSegmentName::parse(seg)
        {
            return KeyKind::Wal { segment };
        }
        return KeyKind::UnknownInCurrentVersion;
    }
    if key.starts_with("basebackups_") || key.starts_with("wal_") {
        return KeyKind::OtherVersion;
    }
    KeyKind::Unknown
}

/// The next consecutive segment names on the same timeline, for prefetch.
///
/// WAL segment names encode `TTTTTTTTLLLLLLLLOOOOOOOO` (timeline, log file,
/// offset-within-log-file in the real format this layout is drawn from);
/// here we only need "monotonically increment the low 16 hex digits,
/// wrapping the segment-within-logfile counter", which is exactly
/// incrementing the name as a 24-digit hex number while holding the
/// 8-digit timeline prefix fixed.
pub fn next_segments(start: &WalSegmentName, count: u32) -> Vec<WalSegmentName> {
    let timeline = &start.as_str()[..8];
    let mut value = u64::from_str_radix(&start.as_str()[8..], 16).unwrap_or(0);
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        value += 1;
        out.push(WalSegmentName(format!("{timeline}{value:016X}")));
    }
    out
}
