//! Walks a cluster data directory and packs it into bounded-size tar
//! partitions (spec.md §4.4).
//!
//! Planning (which entries go in which partition) is pure and synchronous;
//! writing a partition's tar bytes touches the filesystem and is meant to be
//! run inside `tokio::task::spawn_blocking` from the Backup Engine, since
//! the `tar` crate's `Builder` is a synchronous `Write` consumer.

use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

const EXCLUDED_DIRS: &[&str] = &["pg_wal", "pg_xlog", "pg_log", "log"];
const EXCLUDED_ROOT_FILES: &[&str] = &["postmaster.pid", "postmaster.opts"];
const TMP_DIR_PREFIX: &str = "pgsql_tmp";
const TABLESPACE_DIR: &str = "pg_tblspc";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File,
}

/// One tar member, already resolved to its real on-disk source (tablespace
/// symlinks are followed at plan time; the symlink itself is never a
/// member).
#[derive(Clone, Debug)]
pub struct ClusterEntry {
    /// Path as it will appear inside the tar stream, relative to the
    /// cluster root (e.g. `base/16384/16385` or `pg_tblspc/16401/16385`).
    pub tar_path: PathBuf,
    /// Absolute path to read content from.
    pub source_path: PathBuf,
    pub kind: EntryKind,
    /// Size captured at plan time; the authoritative "declared length" for
    /// race handling during the write pass.
    pub size: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TablespaceDescriptor {
    pub oid: String,
    pub location: PathBuf,
}

#[derive(Debug)]
pub struct PartitionPlan {
    pub index: u32,
    pub entries: Vec<ClusterEntry>,
}

#[derive(Debug)]
pub struct WalkResult {
    pub partitions: Vec<PartitionPlan>,
    pub tablespaces: Vec<TablespaceDescriptor>,
    pub expanded_size_bytes: u64,
}

pub struct TarPartitioner {
    data_dir: PathBuf,
    soft_limit_bytes: u64,
}

impl TarPartitioner {
    pub fn new(data_dir: impl Into<PathBuf>, soft_limit_bytes: u64) -> Self {
        Self { data_dir: data_dir.into(), soft_limit_bytes }
    }

    /// Walk the cluster directory and pack the result into partitions,
    /// without touching file contents. Directory order is lexicographic
    /// per directory, matching spec.md §4.4.
    pub fn plan(&self) -> Result<WalkResult> {
        let mut entries = Vec::new();
        let mut tablespaces = Vec::new();
        walk_dir(&self.data_dir, &self.data_dir, Path::new(""), true, &mut entries, &mut tablespaces)?;

        let expanded_size_bytes = entries.iter().map(|e| e.size).sum();
        let partitions = pack(entries, self.soft_limit_bytes);
        Ok(WalkResult { partitions, tablespaces, expanded_size_bytes })
    }

    /// Write one partition's tar stream to `writer`. Intended to run inside
    /// `spawn_blocking`; `writer` is typically a pipe into the Pipe Stager.
    pub fn write_partition(&self, plan: &PartitionPlan, writer: impl Write) -> Result<()> {
        let mut builder = tar::Builder::new(writer);
        builder.mode(tar::HeaderMode::Deterministic);
        for entry in &plan.entries {
            match entry.kind {
                EntryKind::Directory => {
                    let mut header = tar::Header::new_gnu();
                    header.set_entry_type(tar::EntryType::Directory());
                    header.set_size(0);
                    header.set_mode(0o755);
                    header.set_cksum();
                    builder
                        .append_data(&mut header, &entry.tar_path, io::empty())
                        .map_err(Error::Io)?;
                }
                EntryKind::File => {
                    append_file_with_race_handling(&mut builder, entry)?;
                }
            }
        }
        builder.finish().map_err(Error::Io)
    }
}

/// Appends one file member, handling the two races spec.md §4.4 calls out:
/// growth (extra bytes past the declared length are discarded) and
/// shrink/disappearance (one-shot retry, then zero-pad per the resolved
/// open question — see SPEC_FULL.md §9).
fn append_file_with_race_handling<W: Write>(builder: &mut tar::Builder<W>, entry: &ClusterEntry) -> Result<()> {
    let body = match read_exact_or_shrink(&entry.source_path, entry.size) {
        Ok(body) => body,
        Err(Error::NotFound(_)) => match read_exact_or_shrink(&entry.source_path, entry.size) {
            Ok(body) => body,
            Err(_) => {
                return Err(Error::Integrity(format!(
                    "{} vanished during read and retry also failed",
                    entry.source_path.display()
                )));
            }
        },
        Err(e) => return Err(e),
    };

    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular());
    header.set_size(entry.size);
    header.set_mode(0o600);
    header.set_cksum();
    builder
        .append_data(&mut header, &entry.tar_path, body.as_slice())
        .map_err(Error::Io)
}

/// Reads up to `declared_size` bytes of `path`. If the file is shorter than
/// declared (shrunk mid-snapshot), the result is zero-padded out to
/// `declared_size` rather than aborting. If the file grew, bytes past
/// `declared_size` are discarded by simply not reading them.
fn read_exact_or_shrink(path: &Path, declared_size: u64) -> Result<Vec<u8>> {
    let mut file = fs::File::open(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => Error::NotFound(path.display().to_string()),
        _ => Error::Io(e),
    })?;
    let mut buf = vec![0u8; declared_size as usize];
    let mut filled = 0usize;
    loop {
        if filled == buf.len() {
            break;
        }
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Io(e)),
        }
    }
    // `buf` past `filled` stays zeroed; this is the shrink zero-pad.
    Ok(buf)
}

#[allow(clippy::too_many_arguments)]
fn walk_dir(
    root: &Path,
    dir: &Path,
    tar_prefix: &Path,
    is_cluster_root: bool,
    out: &mut Vec<ClusterEntry>,
    tablespaces: &mut Vec<TablespaceDescriptor>,
) -> Result<()> {
    let mut names: Vec<fs::DirEntry> = fs::read_dir(dir)
        .map_err(Error::Io)?
        .collect::<io::Result<Vec<_>>>()
        .map_err(Error::Io)?;
    names.sort_by_key(|e| e.file_name());

    for entry in names {
        let file_name = entry.file_name();
        let name = file_name.to_string_lossy().into_owned();
        let meta = entry.metadata().map_err(Error::Io)?;
        let abs_path = entry.path();
        let tar_path = tar_prefix.join(&name);

        if is_cluster_root && EXCLUDED_DIRS.contains(&name.as_str()) {
            continue;
        }
        if is_cluster_root && EXCLUDED_ROOT_FILES.contains(&name.as_str()) {
            continue;
        }
        if name.starts_with(TMP_DIR_PREFIX) && meta.is_dir() {
            continue;
        }

        let file_type = meta.file_type();
        if file_type.is_socket() || file_type.is_fifo() || file_type.is_char_device() || file_type.is_block_device() {
            continue;
        }

        if is_cluster_root && name == TABLESPACE_DIR && meta.is_dir() {
            walk_tablespaces(root, &abs_path, &tar_path, out, tablespaces)?;
            continue;
        }

        if file_type.is_symlink() {
            // Symlinks outside pg_tblspc are not part of the archived tree
            // (spec.md §4.4: only tablespace symlinks are given indirection;
            // nothing else defines symlink semantics for a Postgres cluster
            // directory).
            continue;
        }

        if meta.is_dir() {
            out.push(ClusterEntry { tar_path: tar_path.clone(), source_path: abs_path.clone(), kind: EntryKind::Directory, size: 0 });
            walk_dir(root, &abs_path, &tar_path, false, out, tablespaces)?;
        } else if meta.is_file() {
            out.push(ClusterEntry { tar_path, source_path: abs_path, kind: EntryKind::File, size: meta.len() });
        }
    }
    Ok(())
}

/// `pg_tblspc/<oid>` entries are symlinks to external tablespace roots; the
/// link itself is never archived. Its target subtree is walked as if rooted
/// at `pg_tblspc/<oid>/` inside the tar, and a descriptor is recorded for
/// the sentinel.
fn walk_tablespaces(
    root: &Path,
    tblspc_dir: &Path,
    tar_prefix: &Path,
    out: &mut Vec<ClusterEntry>,
    tablespaces: &mut Vec<TablespaceDescriptor>,
) -> Result<()> {
    let mut links: Vec<fs::DirEntry> = fs::read_dir(tblspc_dir)
        .map_err(Error::Io)?
        .collect::<io::Result<Vec<_>>>()
        .map_err(Error::Io)?;
    links.sort_by_key(|e| e.file_name());

    out.push(ClusterEntry {
        tar_path: tar_prefix.to_path_buf(),
        source_path: tblspc_dir.to_path_buf(),
        kind: EntryKind::Directory,
        size: 0,
    });

    for link in links {
        let oid = link.file_name().to_string_lossy().into_owned();
        let link_path = link.path();
        let meta = fs::symlink_metadata(&link_path).map_err(Error::Io)?;
        if !meta.file_type().is_symlink() {
            continue;
        }
        let target = fs::read_link(&link_path).map_err(Error::Io)?;
        let target = if target.is_absolute() { target } else { tblspc_dir.join(target) };
        let target = fs::canonicalize(&target).unwrap_or(target);

        tablespaces.push(TablespaceDescriptor { oid: oid.clone(), location: target.clone() });

        let inner_prefix = tar_prefix.join(&oid);
        walk_dir(root, &target, &inner_prefix, false, out, tablespaces)?;
    }
    Ok(())
}

/// Groups planned entries into partitions bounded by `soft_limit_bytes`
/// (spec.md §4.4): a partition is sealed when adding the next file would
/// exceed the limit and the partition is non-empty; a file larger than the
/// limit gets its own partition. Directories ride along in whichever
/// partition is open when they're encountered.
fn pack(entries: Vec<ClusterEntry>, soft_limit_bytes: u64) -> Vec<PartitionPlan> {
    let mut partitions = Vec::new();
    let mut current = Vec::new();
    let mut current_size = 0u64;
    let mut index = 0u32;

    for entry in entries {
        if entry.kind == EntryKind::File {
            if !current.is_empty() && current_size + entry.size > soft_limit_bytes {
                partitions.push(PartitionPlan { index, entries: std::mem::take(&mut current) });
                index += 1;
                current_size = 0;
            }
            current_size += entry.size;
            current.push(entry);
            if current_size > soft_limit_bytes {
                partitions.push(PartitionPlan { index, entries: std::mem::take(&mut current) });
                index += 1;
                current_size = 0;
            }
        } else {
            current.push(entry);
        }
    }
    if !current.is_empty() {
        partitions.push(PartitionPlan { index, entries: current });
    }
    partitions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_entry(name: &str, size: u64) -> ClusterEntry {
        ClusterEntry {
            tar_path: PathBuf::from(name),
            source_path: PathBuf::from(name),
            kind: EntryKind::File,
            size,
        }
    }

    #[test]
    fn pack_splits_large_file_into_its_own_partition() {
        let entries = vec![file_entry("small_a", 100), file_entry("small_b", 100), file_entry("big", 2_000_000)];
        let partitions = pack(entries, 1_048_576);
        assert_eq!(partitions.len(), 2);
        assert_eq!(partitions[0].entries.len(), 2);
        assert_eq!(partitions[1].entries.len(), 1);
        assert_eq!(partitions[1].entries[0].tar_path, PathBuf::from("big"));
    }

    #[test]
    fn pack_keeps_small_files_together_under_limit() {
        let entries = vec![file_entry("a", 1024), file_entry("b", 1024), file_entry("c", 1024)];
        let partitions = pack(entries, 1_048_576);
        assert_eq!(partitions.len(), 1);
        assert_eq!(partitions[0].entries.len(), 3);
    }

    #[test]
    fn pack_seals_partition_at_soft_limit_boundary() {
        let entries = vec![file_entry("a", 700_000), file_entry("b", 700_000), file_entry("c", 100)];
        let partitions = pack(entries, 1_048_576);
        assert_eq!(partitions.len(), 2);
        assert_eq!(partitions[0].entries.len(), 1);
        assert_eq!(partitions[1].entries.len(), 2);
    }

    #[test]
    fn directories_ride_along_with_open_partition() {
        let entries = vec![
            ClusterEntry { tar_path: "base".into(), source_path: "base".into(), kind: EntryKind::Directory, size: 0 },
            file_entry("base/1", 100),
        ];
        let partitions = pack(entries, 1_048_576);
        assert_eq!(partitions.len(), 1);
        assert_eq!(partitions[0].entries.len(), 2);
    }

    #[test]
    fn plan_excludes_wal_log_and_lock_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("pg_wal")).unwrap();
        fs::write(dir.path().join("pg_wal").join("000000010000000000000001"), b"x").unwrap();
        fs::create_dir(dir.path().join("log")).unwrap();
        fs::write(dir.path().join("log").join("server.log"), b"x").unwrap();
        fs::write(dir.path().join("postmaster.pid"), b"1234").unwrap();
        fs::write(dir.path().join("PG_VERSION"), b"16").unwrap();

        let partitioner = TarPartitioner::new(dir.path(), 1_048_576);
        let result = partitioner.plan().unwrap();
        let tar_paths: Vec<_> = result.partitions.iter().flat_map(|p| &p.entries).map(|e| e.tar_path.clone()).collect();
        assert!(tar_paths.contains(&PathBuf::from("PG_VERSION")));
        assert!(!tar_paths.iter().any(|p| p.starts_with("pg_wal")));
        assert!(!tar_paths.iter().any(|p| p.starts_with("log")));
        assert!(!tar_paths.contains(&PathBuf::from("postmaster.pid")));
    }

    #[test]
    fn plan_excludes_pgsql_tmp_directory_contents() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base").join("16384");
        fs::create_dir_all(&base).unwrap();
        fs::create_dir(base.join("pgsql_tmp")).unwrap();
        fs::write(base.join("pgsql_tmp").join("pgsql_tmp1.0"), b"x").unwrap();
        fs::write(base.join("16385"), b"data").unwrap();

        let partitioner = TarPartitioner::new(dir.path(), 1_048_576);
        let result = partitioner.plan().unwrap();
        let tar_paths: Vec<_> = result.partitions.iter().flat_map(|p| &p.entries).map(|e| e.tar_path.clone()).collect();
        assert!(!tar_paths.iter().any(|p| p.to_string_lossy().contains("pgsql_tmp")));
        assert!(tar_paths.contains(&PathBuf::from("base/16384/16385")));
    }

    #[test]
    fn plan_follows_tablespace_symlinks_and_records_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let tblspc = dir.path().join("pg_tblspc");
        fs::create_dir(&tblspc).unwrap();
        let ts_target = tempfile::tempdir().unwrap();
        fs::write(ts_target.path().join("16385"), b"tablespace-data").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink(ts_target.path(), tblspc.join("16401")).unwrap();

        let partitioner = TarPartitioner::new(dir.path(), 1_048_576);
        let result = partitioner.plan().unwrap();
        assert_eq!(result.tablespaces.len(), 1);
        assert_eq!(result.tablespaces[0].oid, "16401");
        let tar_paths: Vec<_> = result.partitions.iter().flat_map(|p| &p.entries).map(|e| e.tar_path.clone()).collect();
        assert!(tar_paths.contains(&PathBuf::from("pg_tblspc/16401/16385")));
    }

    #[test]
    fn write_partition_round_trips_small_tree() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a"), b"hello").unwrap();
        let partitioner = TarPartitioner::new(dir.path(), 1_048_576);
        let result = partitioner.plan().unwrap();
        assert_eq!(result.partitions.len(), 1);

        let mut out = Vec::new();
        partitioner.write_partition(&result.partitions[0], &mut out).unwrap();

        let mut archive = tar::Archive::new(out.as_slice());
        let mut found = false;
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            if entry.path().unwrap() == Path::new("a") {
                let mut content = Vec::new();
                entry.read_to_end(&mut content).unwrap();
                assert_eq!(content, b"hello");
                found = true;
            }
        }
        assert!(found);
    }

    #[test]
    fn write_partition_zero_pads_shrunk_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a");
        fs::write(&path, b"hello world").unwrap();
        let entry = ClusterEntry {
            tar_path: PathBuf::from("a"),
            source_path: path.clone(),
            kind: EntryKind::File,
            // Declare a size larger than the file's actual (shrunk) content.
            size: 20,
        };
        fs::write(&path, b"hi").unwrap();

        let mut out = Vec::new();
        let mut builder = tar::Builder::new(&mut out);
        append_file_with_race_handling(&mut builder, &entry).unwrap();
        builder.finish().unwrap();

        let mut archive = tar::Archive::new(out.as_slice());
        let mut entry = archive.entries().unwrap().next().unwrap().unwrap();
        let mut content = Vec::new();
        entry.read_to_end(&mut content).unwrap();
        assert_eq!(content.len(), 20);
        assert_eq!(&content[..2], b"hi");
        assert!(content[2..].iter().all(|&b| b == 0));
    }
}
