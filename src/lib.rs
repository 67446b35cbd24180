pub mod backup_engine;
pub mod blob;
pub mod config;
pub mod db_control;
pub mod error;
pub mod name_layout;
pub mod pipe_stager;
pub mod pruner;
pub mod tar_partitioner;
pub mod wal_engine;
pub mod worker_pool;

pub use backup_engine::{BackupEngine, RestoreSpec, Sentinel, TablespaceEntry, TablespaceMode};
pub use blob::{Blob, BlobStore, ObjectMeta};
pub use config::ArchiveConfig;
pub use db_control::{DatabaseControl, PgDatabaseControl};
pub use error::{Error, Result, Severity};
pub use name_layout::{BackupName, KeyKind, WalSegmentName};
pub use pruner::{PrunePlan, PruneTarget, Pruner};
pub use wal_engine::WalEngine;
pub use worker_pool::WorkerPool;
