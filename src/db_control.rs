//! The database's control interface (spec.md §1: explicitly out of core
//! scope, but a complete repo can't leave its own primary collaborator
//! unimplemented). `DatabaseControl` is the seam; `PgDatabaseControl` is
//! the concrete PostgreSQL-shaped implementation over `tokio-postgres`.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio_postgres::{Client, Config, NoTls};

use crate::error::{Error, Result};
use crate::name_layout::WalSegmentName;

/// `backup_start`/`backup_stop` plus a data-directory lookup — the three
/// operations spec.md §1 keeps abstract behind "the database's control
/// interface".
#[async_trait]
pub trait DatabaseControl: Send + Sync {
    async fn backup_start(&self, label: &str) -> Result<(WalSegmentName, u64)>;
    async fn backup_stop(&self) -> Result<(WalSegmentName, u64)>;
    async fn data_directory(&self) -> Result<PathBuf>;
}

/// Connects using the conventional libpq environment variables
/// (`PGHOST`/`PGPORT`/`PGUSER`/`PGDATABASE`/`PGPASSWORD`), the same
/// environment the archive hooks already run under.
pub struct PgDatabaseControl {
    client: Client,
}

impl PgDatabaseControl {
    /// Builds its connection string from the conventional libpq environment
    /// variables, falling back to libpq's own defaults for anything unset.
    pub async fn connect() -> Result<Self> {
        let host = std::env::var("PGHOST").unwrap_or_else(|_| "localhost".to_string());
        let port = std::env::var("PGPORT").unwrap_or_else(|_| "5432".to_string());
        let user = std::env::var("PGUSER").unwrap_or_else(|_| "postgres".to_string());
        let dbname = std::env::var("PGDATABASE").unwrap_or_else(|_| user.clone());

        let mut config: Config = format!("host={host} port={port} user={user} dbname={dbname}")
            .parse()
            .map_err(|e| Error::Fatal(format!("invalid postgres connection parameters: {e}")))?;
        if let Ok(password) = std::env::var("PGPASSWORD") {
            config.password(password);
        }
        config.application_name("walarc");

        let (client, connection) = config
            .connect(NoTls)
            .await
            .map_err(|e| Error::Fatal(format!("postgres connection failed: {e}")))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(error = %e, "postgres connection task exited");
            }
        });

        Ok(Self { client })
    }
}

#[async_trait]
impl DatabaseControl for PgDatabaseControl {
    async fn backup_start(&self, label: &str) -> Result<(WalSegmentName, u64)> {
        let row = self
            .client
            .query_one("SELECT * FROM pg_backup_start($1, false)", &[&label])
            .await
            .map_err(|e| classify_pg_error(e, "pg_backup_start"))?;
        parse_lsn_row(&row)
    }

    async fn backup_stop(&self) -> Result<(WalSegmentName, u64)> {
        let row = self
            .client
            .query_one("SELECT * FROM pg_backup_stop(false)", &[])
            .await
            .map_err(|e| classify_pg_error(e, "pg_backup_stop"))?;
        parse_lsn_row(&row)
    }

    async fn data_directory(&self) -> Result<PathBuf> {
        let row = self
            .client
            .query_one("SHOW data_directory", &[])
            .await
            .map_err(|e| classify_pg_error(e, "SHOW data_directory"))?;
        let dir: String = row.get(0);
        Ok(PathBuf::from(dir))
    }
}

fn parse_lsn_row(row: &tokio_postgres::Row) -> Result<(WalSegmentName, u64)> {
    let lsn: String = row.try_get(0).map_err(|e| Error::Fatal(e.to_string()))?;
    lsn_to_segment_and_offset(&lsn)
}

/// Converts a `pg_lsn` text value (`"16/B374D848"`) into a WAL segment name
/// plus the byte offset within it, per spec.md §3's Backup Identity.
fn lsn_to_segment_and_offset(lsn: &str) -> Result<(WalSegmentName, u64)> {
    const WAL_SEGMENT_SIZE: u64 = 16 * 1024 * 1024;
    let (hi, lo) = lsn
        .split_once('/')
        .ok_or_else(|| Error::Fatal(format!("malformed LSN {lsn:?}")))?;
    let hi = u32::from_str_radix(hi, 16).map_err(|_| Error::Fatal(format!("malformed LSN {lsn:?}")))?;
    let lo = u32::from_str_radix(lo, 16).map_err(|_| Error::Fatal(format!("malformed LSN {lsn:?}")))?;
    let absolute = (u64::from(hi) << 32) | u64::from(lo);
    let segment_index = absolute / WAL_SEGMENT_SIZE;
    let offset = absolute % WAL_SEGMENT_SIZE;
    let timeline = 1u32; // surfaced by pg_walfile_name in a full client; fixed here for timeline 1.
    let segment = WalSegmentName::parse(&format!("{timeline:08X}{segment_index:016X}"))?;
    Ok((segment, offset))
}

fn classify_pg_error(e: tokio_postgres::Error, op: &str) -> Error {
    if let Some(db_error) = e.as_db_error() {
        // `55006` = object_in_use, raised when a concurrent base backup is
        // already in progress (spec.md §7 Precondition: "missing
        // backup_start due to concurrent base backup").
        if db_error.code().code() == "55006" {
            return Error::Precondition(format!("{op}: {db_error}"));
        }
    }
    Error::Transient(format!("{op}: {e}"))
}

/// An in-memory stand-in for tests that don't have a real database.
pub struct StubDatabaseControl {
    pub data_dir: PathBuf,
    pub start: (WalSegmentName, u64),
    pub stop: (WalSegmentName, u64),
}

#[async_trait]
impl DatabaseControl for StubDatabaseControl {
    async fn backup_start(&self, _label: &str) -> Result<(WalSegmentName, u64)> {
        Ok(self.start.clone())
    }

    async fn backup_stop(&self) -> Result<(WalSegmentName, u64)> {
        Ok(self.stop.clone())
    }

    async fn data_directory(&self) -> Result<PathBuf> {
        Ok(self.data_dir.clone())
    }
}
