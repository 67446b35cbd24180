use thiserror::Error;

/// The five error kinds from the archiver's error-handling design.
///
/// Every fallible operation in the crate ultimately resolves to one of
/// these. `Severity` (below) maps each to a process exit code.
#[derive(Error, Debug)]
pub enum Error {
    /// Network error, backend 5xx, throttling. Retried with backoff by the
    /// blob layer; only surfaces here once the retry budget is exhausted.
    #[error("transient: {0}")]
    Transient(String),

    /// Distinguished from `Transient` so `wal-fetch` can signal
    /// end-of-archive. That mapping is specific to `wal-fetch`: by default
    /// (see `severity` below) a `NotFound` is a genuine user-facing failure
    /// (e.g. a `backup-fetch` name that doesn't exist, or a sentinel
    /// vanishing out from under `backup-list --detail`), and only
    /// `wal-fetch`'s own command handler recognizes its absent-object case
    /// and exits 0 instead.
    #[error("not found: {0}")]
    NotFound(String),

    /// Missing symlinks in user-directed restore, concurrent base backup,
    /// key already exists where it must not.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// Tar member shorter than declared, decompressor exit non-zero,
    /// partition count mismatch vs sentinel.
    #[error("integrity violation: {0}")]
    Integrity(String),

    /// Authentication/authorization, configuration error, unknown storage
    /// version, unrecognized tar member type.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Exit-code class for the CLI shell (spec.md §6/§7).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    /// Exit code 0. Never produced by `severity()` itself — `wal-fetch`'s
    /// command handler recognizes its own `Error::NotFound` (the database's
    /// restore loop treats an absent WAL object as end-of-archive, not
    /// failure) and exits 0 directly, before the generic severity mapping
    /// below ever runs.
    EndOfArchive,
    /// Exit code 1.
    UserError,
    /// Exit code 2.
    System,
}

impl Error {
    /// The generic, command-agnostic severity. `NotFound` defaults to
    /// `UserError` here: for every command except `wal-fetch`, a missing
    /// object (an unknown backup name, a sentinel that vanished mid-listing)
    /// is a real failure, not end-of-archive. `wal-fetch` special-cases its
    /// own `NotFound` before this ever gets consulted.
    pub fn severity(&self) -> Severity {
        match self {
            Error::NotFound(_) | Error::Precondition(_) | Error::Fatal(_) => Severity::UserError,
            Error::Transient(_) | Error::Integrity(_) | Error::Io(_) | Error::Json(_) => {
                Severity::System
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient(_))
    }
}
