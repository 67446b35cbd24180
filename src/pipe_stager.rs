//! External-subprocess compression/encryption pipeline (spec.md §4.2).
//!
//! Bytes flow through OS pipes into `lzop` and, when a GPG key id is
//! configured, onward into `gpg --encrypt`; the result lands in a mode-0600
//! temp file the caller streams to the blob store. Filters are real
//! subprocesses, not in-process codecs, so staged output is byte-identical
//! to any other implementation of this layout (spec.md's Design Notes call
//! this out as the one piece of the pipeline requiring care).
//!
//! [`PipeUnstager`] runs the inverse chain (decrypt, then decompress) for
//! `backup-fetch`/`wal-fetch`.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};

use crate::error::{Error, Result};
use crate::worker_pool::CancelGuard;

/// How long a cancelled stage's subprocesses get to exit after `SIGTERM`
/// before being `SIGKILL`ed (spec.md §5: cancellation must not leave
/// orphaned filter processes behind).
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Send `SIGTERM` to `pid`, wait out the grace period, then `SIGKILL`
/// regardless of whether it's still alive (a signal to an already-exited
/// pid just errors, which is discarded). Used by [`run_chain`]'s
/// cancellation watcher when the Worker Pool's cancel-on-first-failure
/// fires while a stage's filters are mid-pipe; the process is reaped as
/// usual by `run_chain`'s own `Child::wait()` once its pipes close.
pub async fn terminate_with_grace(pid: u32) {
    let pid = Pid::from_raw(pid as i32);
    let _ = signal::kill(pid, Signal::SIGTERM);
    tokio::time::sleep(TERMINATE_GRACE).await;
    let _ = signal::kill(pid, Signal::SIGKILL);
}

enum Stage {
    Compress,
    Decompress,
    Encrypt { gpg_key_id: String },
    Decrypt,
}

impl Stage {
    fn program(&self) -> &'static str {
        match self {
            Stage::Compress | Stage::Decompress => "lzop",
            Stage::Encrypt { .. } | Stage::Decrypt => "gpg",
        }
    }

    fn command(&self) -> Command {
        match self {
            Stage::Compress => {
                let mut c = Command::new("lzop");
                c.arg("--stdout");
                c
            }
            Stage::Decompress => {
                let mut c = Command::new("lzop");
                c.args(["--decompress", "--stdout"]);
                c
            }
            Stage::Encrypt { gpg_key_id } => {
                let mut c = Command::new("gpg");
                c.args(["--batch", "--yes", "--encrypt", "--recipient", gpg_key_id]);
                c
            }
            Stage::Decrypt => {
                let mut c = Command::new("gpg");
                c.args(["--batch", "--yes", "--decrypt"]);
                c
            }
        }
    }
}

/// A staged file ready to be handed to the Blob Layer (push direction) or to
/// a tar extractor / atomic rename (fetch direction). `size` is the on-disk
/// size of the staged output.
pub struct StagedFile {
    pub path: PathBuf,
    pub size: u64,
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Runs `input` through `stages` in order, staging the terminal output to a
/// fresh mode-0600 temp file under `stage_dir`. Shared by [`PipeStager`]
/// (compress[+encrypt]) and [`PipeUnstager`] (decrypt[+decompress]).
///
/// `cancel`, when given, is the [`CancelGuard`] of the Worker Pool task this
/// chain is running inside of: a background watcher races it against the
/// chain's own completion and, if cancellation fires first, SIGTERMs (then,
/// after the grace period, SIGKILLs) every filter process via
/// [`terminate_with_grace`] rather than waiting on `kill_on_drop`'s bare
/// SIGKILL-on-drop to do it with no grace period at all.
async fn run_chain(
    stage_dir: &std::path::Path,
    stages: Vec<Stage>,
    input: impl AsyncRead + Unpin + Send + 'static,
    cancel: Option<CancelGuard>,
) -> Result<StagedFile> {
    let named = tempfile::NamedTempFile::new_in(stage_dir).map_err(Error::Io)?;
    let (_, path) = named.keep().map_err(|e| Error::Io(e.error))?;
    set_owner_only(&path).await?;

    let mut children: Vec<Child> = Vec::with_capacity(stages.len());
    for stage in &stages {
        let mut cmd = stage.command();
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = cmd
            .spawn()
            .map_err(|e| Error::Fatal(format!("failed to spawn {}: {e}", stage.program())))?;
        children.push(child);
    }

    let watcher = cancel.map(|guard| {
        let pids: Vec<u32> = children.iter().filter_map(Child::id).collect();
        tokio::spawn(async move {
            guard.cancelled().await;
            for pid in pids {
                terminate_with_grace(pid).await;
            }
        })
    });

    let result = run_chain_body(&path, &stages, &mut children, input).await;

    // Whichever way the body finished, the watcher's job is done: either
    // the chain is complete and there's nothing left to kill, or it already
    // fired and this just reaps the watcher task itself.
    if let Some(watcher) = watcher {
        watcher.abort();
    }

    result.map(|size| StagedFile { path, size })
}

/// The copy/wait plumbing shared by every [`run_chain`] invocation, split
/// out so the cancellation watcher above can be aborted on every exit path
/// (including `?`-propagated errors) without duplicating that cleanup.
async fn run_chain_body(
    path: &std::path::Path,
    stages: &[Stage],
    children: &mut [Child],
    mut input: impl AsyncRead + Unpin + Send + 'static,
) -> Result<u64> {
    let mut stderr_tasks = Vec::with_capacity(children.len());
    for child in children.iter_mut() {
        let mut stderr = child.stderr.take().expect("stderr piped above");
        stderr_tasks.push(tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        }));
    }

    let mut copy_tasks = Vec::with_capacity(children.len());

    let mut first_stdin = children[0].stdin.take().expect("stdin piped above");
    copy_tasks.push(tokio::spawn(async move {
        tokio::io::copy(&mut input, &mut first_stdin).await?;
        first_stdin.shutdown().await
    }));

    for i in 0..children.len() - 1 {
        let mut out = children[i].stdout.take().expect("stdout piped above");
        let mut next_in = children[i + 1].stdin.take().expect("stdin piped above");
        copy_tasks.push(tokio::spawn(async move {
            tokio::io::copy(&mut out, &mut next_in).await?;
            next_in.shutdown().await
        }));
    }

    let mut last_out = children.last_mut().unwrap().stdout.take().expect("stdout piped above");
    let mut out_file = fs::File::create(path).await.map_err(Error::Io)?;
    let size = tokio::io::copy(&mut last_out, &mut out_file).await.map_err(Error::Io)?;
    out_file.flush().await.map_err(Error::Io)?;
    drop(last_out);

    for task in copy_tasks {
        task.await
            .map_err(|e| Error::Fatal(format!("pipe copy task panicked: {e}")))?
            .map_err(Error::Io)?;
    }

    let stderrs = futures::future::join_all(stderr_tasks).await;

    for ((stage, child), stderr) in stages.iter().zip(children.iter_mut()).zip(stderrs) {
        let status = child.wait().await.map_err(Error::Io)?;
        if !status.success() {
            let stderr = stderr.unwrap_or_default();
            return Err(Error::Integrity(format!(
                "{} exited with {status}: {}",
                stage.program(),
                stderr.trim()
            )));
        }
    }

    Ok(size)
}

async fn set_owner_only(path: &std::path::Path) -> Result<()> {
    let mut perms = fs::metadata(path).await.map_err(Error::Io)?.permissions();
    perms.set_mode(0o600);
    fs::set_permissions(path, perms).await.map_err(Error::Io)
}

/// Builds a `lzop [| gpg --encrypt]` subprocess chain and stages its output
/// to a private temp file. Push direction (spec.md §4.2).
pub struct PipeStager {
    stage_dir: PathBuf,
    gpg_key_id: Option<String>,
}

impl PipeStager {
    pub fn new(stage_dir: impl Into<PathBuf>, gpg_key_id: Option<String>) -> Self {
        Self { stage_dir: stage_dir.into(), gpg_key_id }
    }

    fn stages(&self) -> Vec<Stage> {
        let mut stages = vec![Stage::Compress];
        if let Some(key) = &self.gpg_key_id {
            stages.push(Stage::Encrypt { gpg_key_id: key.clone() });
        }
        stages
    }

    /// Run `input` through the filter chain, writing the result to a fresh
    /// mode-0600 temp file under `stage_dir`. `cancel`, when running inside
    /// a Worker Pool task, lets the chain's filter processes be torn down
    /// promptly if a sibling task fails first.
    pub async fn stage(
        &self,
        input: impl AsyncRead + Unpin + Send + 'static,
        cancel: Option<CancelGuard>,
    ) -> Result<StagedFile> {
        run_chain(&self.stage_dir, self.stages(), input, cancel).await
    }
}

/// Inverse of [`PipeStager`]: `gpg --decrypt` (if a key is configured for
/// this archive) followed by `lzop --decompress`, staged the same way.
/// Fetch direction (spec.md §4.6/§4.7).
pub struct PipeUnstager {
    stage_dir: PathBuf,
    encrypted: bool,
}

impl PipeUnstager {
    pub fn new(stage_dir: impl Into<PathBuf>, encrypted: bool) -> Self {
        Self { stage_dir: stage_dir.into(), encrypted }
    }

    fn stages(&self) -> Vec<Stage> {
        let mut stages = Vec::with_capacity(2);
        if self.encrypted {
            stages.push(Stage::Decrypt);
        }
        stages.push(Stage::Decompress);
        stages
    }

    pub async fn unstage(
        &self,
        input: impl AsyncRead + Unpin + Send + 'static,
        cancel: Option<CancelGuard>,
    ) -> Result<StagedFile> {
        run_chain(&self.stage_dir, self.stages(), input, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Exercises the chain against real `lzop`/`gpg` binaries is not
    /// possible without them present in the test environment; these are
    /// covered by `tests/pipeline.rs` instead, which skips when the
    /// binaries are absent. This unit test only covers the pure,
    /// binary-free pieces: stage selection and temp-file permission bits.
    #[tokio::test]
    async fn stage_dir_creates_owner_only_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let stager = PipeStager::new(dir.path(), None);
        assert_eq!(stager.stages().len(), 1);
        let stager_with_gpg = PipeStager::new(dir.path(), Some("ABCDEF01".to_string()));
        assert_eq!(stager_with_gpg.stages().len(), 2);
    }

    #[tokio::test]
    async fn unstager_mirrors_stager_stage_count() {
        let dir = tempfile::tempdir().unwrap();
        let plain = PipeUnstager::new(dir.path(), false);
        assert_eq!(plain.stages().len(), 1);
        let encrypted = PipeUnstager::new(dir.path(), true);
        assert_eq!(encrypted.stages().len(), 2);
    }

    #[tokio::test]
    async fn set_owner_only_sets_mode_0600() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"x").await.unwrap();
        set_owner_only(&path).await.unwrap();
        let mode = fs::metadata(&path).await.unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[allow(dead_code)]
    fn _assert_stage_accepts_cursor(input: Cursor<Vec<u8>>) -> impl AsyncRead + Unpin + Send + 'static {
        input
    }
}
