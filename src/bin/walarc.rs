use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

use walarc::backup_engine::{BackupEngine, RestoreSpec, TablespaceMode};
use walarc::blob::Blob;
use walarc::config::{ArchiveConfig, SyslogFacility};
use walarc::db_control::PgDatabaseControl;
use walarc::name_layout::{self, BackupName, KeyKind, WalSegmentName};
use walarc::pruner::{PruneTarget, Pruner};
use walarc::wal_engine::WalEngine;
use walarc::{BlobStore, Error, Result, Severity};

#[derive(Parser)]
#[command(name = "walarc", about = "Continuous WAL archiving and base-backup pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
#[command(rename_all = "kebab-case")]
enum Command {
    /// Take a base backup of a cluster data directory.
    BackupPush {
        data_dir: PathBuf,
        #[arg(long)]
        cluster_read_rate_limit: Option<u64>,
        #[arg(long)]
        pool_size: Option<usize>,
        #[arg(long)]
        gpg_key_id: Option<String>,
    },
    /// Restore a base backup into a cluster data directory.
    BackupFetch {
        data_dir: PathBuf,
        name: String,
        #[arg(long)]
        blind_restore: bool,
        #[arg(long)]
        restore_spec: Option<PathBuf>,
        #[arg(long)]
        pool_size: Option<usize>,
    },
    /// Push one WAL segment (the `archive_command` hook).
    WalPush {
        segment_path: PathBuf,
        #[arg(long)]
        pool_size: Option<usize>,
        #[arg(long)]
        gpg_key_id: Option<String>,
    },
    /// Fetch one WAL segment (the `restore_command` hook).
    WalFetch {
        segment_name: String,
        dest_path: PathBuf,
        #[arg(long, default_value_t = 8)]
        prefetch: u32,
    },
    /// List completed backups as CSV.
    BackupList {
        #[arg(long)]
        detail: bool,
    },
    /// Delete obsolete backups and WAL.
    Delete {
        #[command(subcommand)]
        target: DeleteTarget,
        #[arg(long)]
        confirm: bool,
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand)]
#[command(rename_all = "kebab-case")]
enum DeleteTarget {
    /// Everything ordered strictly before NAME.
    Before { name: String },
    /// All but the N most recent backups.
    Retain { n: usize },
    /// Keys under any storage-version prefix but the current one.
    OldVersions,
    /// Every sentinel, partition, and WAL segment.
    Everything,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match ArchiveConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("walarc: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = init_tracing(&config) {
        eprintln!("walarc: failed to initialize logging: {e:#}");
        std::process::exit(2);
    }

    match run(cli, &config).await {
        Ok(()) => {}
        Err(e) => {
            let code = match e.severity() {
                Severity::EndOfArchive => 0,
                Severity::UserError => 1,
                Severity::System => 2,
            };
            if code != 0 {
                eprintln!("walarc: {e}");
            }
            std::process::exit(code);
        }
    }
}

async fn run(cli: Cli, config: &ArchiveConfig) -> Result<()> {
    match cli.command {
        Command::BackupPush { data_dir, cluster_read_rate_limit, pool_size, gpg_key_id } => {
            // Rate limiting is accepted for interface parity with the
            // source but not enforced by this engine (spec.md §6 lists it
            // as an option; no core component throttles reads).
            let _ = cluster_read_rate_limit.or(config.cluster_read_rate_limit);

            let blob = Arc::new(Blob::from_config(config).await?);
            let db = Arc::new(PgDatabaseControl::connect().await?);
            let engine = BackupEngine::new(blob, db)
                .with_pool_size(pool_size.unwrap_or(config.pool_size))
                .with_gpg_key_id(gpg_key_id.or_else(|| config.gpg_key_id.clone()));

            let backup = engine.push(&data_dir, "walarc").await?;
            println!("{}", backup.to_name_string());
            Ok(())
        }

        Command::BackupFetch { data_dir, name, blind_restore, restore_spec, pool_size } => {
            let blob = Arc::new(Blob::from_config(config).await?);
            let db = Arc::new(PgDatabaseControl::connect().await?);
            let engine = BackupEngine::new(blob, db)
                .with_pool_size(pool_size.unwrap_or(config.pool_size))
                .with_gpg_key_id(config.gpg_key_id.clone());

            let mode = match restore_spec {
                Some(path) => {
                    let bytes = tokio::fs::read(&path).await.map_err(Error::Io)?;
                    let spec: RestoreSpec = serde_json::from_slice(&bytes).map_err(Error::Json)?;
                    TablespaceMode::SpecDriven(spec)
                }
                None if blind_restore => TablespaceMode::Blind,
                None => TablespaceMode::UserDirected,
            };

            let backup = engine.fetch(&data_dir, &name, mode).await?;
            println!("{}", backup.to_name_string());
            Ok(())
        }

        Command::WalPush { segment_path, pool_size, gpg_key_id } => {
            // A single CLI invocation pushes one segment; pooling across
            // several ready segments (spec.md §4.7 "Pooling") happens when
            // the archive hook itself queues a batch, via
            // `WalEngine::push_many` — not exercised by this one-shot call.
            let _ = pool_size;
            let blob = Arc::new(Blob::from_config(config).await?);
            let engine = WalEngine::new(blob, gpg_key_id.or_else(|| config.gpg_key_id.clone()));
            engine.push(&segment_path).await
        }

        Command::WalFetch { segment_name, dest_path, prefetch } => {
            let blob = Arc::new(Blob::from_config(config).await?);
            let engine = WalEngine::new(blob, config.gpg_key_id.clone());
            let segment = WalSegmentName::parse(&segment_name)?;
            let prefetch_dir = dest_path.parent().map(|dir| dir.join(".walarc-prefetch"));
            match engine.fetch(&segment, &dest_path, prefetch_dir.as_deref(), prefetch).await {
                Ok(()) => Ok(()),
                // spec.md §7: an absent WAL object is wal-fetch's own
                // end-of-archive signal to the database's restore loop, not
                // an operator-visible failure — exit 0 here, before
                // Error::severity()'s generic (UserError) mapping for
                // NotFound ever applies.
                Err(Error::NotFound(_)) => std::process::exit(0),
                Err(e) => Err(e),
            }
        }

        Command::BackupList { detail } => {
            let blob = Arc::new(Blob::from_config(config).await?);
            backup_list(blob, detail).await
        }

        Command::Delete { target, confirm, dry_run } => {
            let blob = Arc::new(Blob::from_config(config).await?);
            let pruner = Pruner::new(blob);
            let target = match target {
                DeleteTarget::Before { name } => PruneTarget::Before(BackupName::parse(&name)?),
                DeleteTarget::Retain { n } => PruneTarget::Retain(n),
                DeleteTarget::OldVersions => PruneTarget::OldVersions,
                DeleteTarget::Everything => PruneTarget::Everything,
            };

            let plan = pruner.plan(&target).await?;
            for (kind, key) in plan.rows() {
                println!("{kind}\t{key}");
            }

            // Passing both flags always selects dry-run (spec.md §4.8:
            // safety default wins).
            if confirm && !dry_run {
                pruner.execute(&plan).await?;
                println!("deleted {} keys", plan.total_keys());
            } else {
                println!("dry run: {} keys would be deleted (pass --confirm to delete)", plan.total_keys());
            }
            Ok(())
        }
    }
}

async fn backup_list(blob: Arc<Blob>, detail: bool) -> Result<()> {
    let objects = blob.list(&name_layout::sentinels_prefix()).await?;
    let mut backups: Vec<BackupName> = objects
        .iter()
        .filter_map(|o| match name_layout::classify(&o.key) {
            KeyKind::Sentinel { backup } => Some(backup),
            _ => None,
        })
        .collect();
    backups.sort();

    let mut writer = csv::Writer::from_writer(std::io::stdout());
    if detail {
        writer
            .write_record([
                "name",
                "wal_segment_backup_start",
                "wal_segment_offset_backup_start",
                "wal_segment_backup_stop",
                "wal_segment_offset_backup_stop",
                "expanded_size_bytes",
                "partition_count",
            ])
            .map_err(csv_err)?;
        for backup in &backups {
            let key = name_layout::sentinel_key(backup);
            // A sentinel can vanish between the `list` above and this `get`
            // if a `delete` runs concurrently (spec.md §9's open question:
            // `--detail` does not lock out concurrent deletes); skip that
            // row rather than aborting the whole listing.
            let mut stream = match blob.get(&key).await {
                Ok(stream) => stream,
                Err(Error::NotFound(_)) => {
                    tracing::warn!(
                        backup = %backup.to_name_string(),
                        "sentinel vanished mid-listing (concurrent delete); skipping row"
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };
            let mut buf = Vec::new();
            while let Some(chunk) = stream.next().await {
                buf.extend_from_slice(&chunk?);
            }
            let sentinel: walarc::Sentinel = serde_json::from_slice(&buf).map_err(Error::Json)?;
            writer
                .write_record([
                    backup.to_name_string(),
                    sentinel.wal_segment_backup_start.clone(),
                    sentinel.wal_segment_offset_backup_start.to_string(),
                    sentinel.wal_segment_backup_stop.clone(),
                    sentinel.wal_segment_offset_backup_stop.to_string(),
                    sentinel.expanded_size_bytes.to_string(),
                    sentinel.partition_count.to_string(),
                ])
                .map_err(csv_err)?;
        }
    } else {
        writer.write_record(["name"]).map_err(csv_err)?;
        for backup in &backups {
            writer.write_record([backup.to_name_string()]).map_err(csv_err)?;
        }
    }
    writer.flush().map_err(Error::Io)?;
    Ok(())
}

fn csv_err(e: csv::Error) -> Error {
    Error::Fatal(e.to_string())
}

fn init_tracing(config: &ArchiveConfig) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let destination = &config.log_destination;

    if destination.syslog {
        let syslog_writer = SyslogWriter::connect(config.syslog_facility)?;
        if destination.stderr {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr.and(syslog_writer))
                .init();
        } else {
            tracing_subscriber::fmt().with_env_filter(env_filter).with_writer(syslog_writer).init();
        }
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).with_writer(std::io::stderr).init();
    }
    Ok(())
}

/// Adapts a [`tracing_subscriber`] writer onto a syslog connection; each
/// formatted line is forwarded as one `LOG_INFO` message (spec.md §6
/// `WALE_LOG_DESTINATION=syslog`).
#[derive(Clone)]
struct SyslogWriter(Arc<Mutex<syslog::Logger<syslog::LoggerBackend, syslog::Formatter3164>>>);

impl SyslogWriter {
    fn connect(facility: Option<SyslogFacility>) -> anyhow::Result<Self> {
        let facility = match facility {
            Some(SyslogFacility::Local(n)) => local_facility(n),
            Some(SyslogFacility::User) | None => syslog::Facility::LOG_USER,
        };
        let formatter = syslog::Formatter3164 {
            facility,
            hostname: None,
            process: "walarc".to_string(),
            pid: std::process::id(),
        };
        let logger = syslog::unix(formatter).context("connecting to syslog")?;
        Ok(Self(Arc::new(Mutex::new(logger))))
    }
}

fn local_facility(n: u8) -> syslog::Facility {
    match n {
        0 => syslog::Facility::LOG_LOCAL0,
        1 => syslog::Facility::LOG_LOCAL1,
        2 => syslog::Facility::LOG_LOCAL2,
        3 => syslog::Facility::LOG_LOCAL3,
        4 => syslog::Facility::LOG_LOCAL4,
        5 => syslog::Facility::LOG_LOCAL5,
        6 => syslog::Facility::LOG_LOCAL6,
        _ => syslog::Facility::LOG_LOCAL7,
    }
}

impl std::io::Write for SyslogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let message = String::from_utf8_lossy(buf);
        let mut logger = self.0.lock().unwrap();
        for line in message.lines().filter(|l| !l.is_empty()) {
            let _ = logger.info(line);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SyslogWriter {
    type Writer = SyslogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
