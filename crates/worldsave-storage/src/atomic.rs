//! Crash-atomic file replacement (write-to-temp-then-rename).
//!
//! The temp file lives next to the target so `fs::rename` stays on one
//! filesystem and is atomic. Its name is deterministic
//! (`<file>.<pid>.tmp`) so interrupted writes can be found and swept later.

use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use worldsave_core::{Config, global_metrics};

use crate::dir_cache::DirCache;
use crate::{Result, StorageError};

/// Suffix shared by every temp sibling.
pub const TEMP_SUFFIX: &str = ".tmp";

/// Bounded retry of the rename step for transient, handle-release failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenameRetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub backoff: Duration,
    /// When false, every rename failure is final.
    pub enabled: bool,
}

impl Default for RenameRetryPolicy {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl RenameRetryPolicy {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.rename_attempts.max(1),
            backoff: config.rename_backoff(),
            enabled: config.rename_retry_enabled,
        }
    }

    /// Policy that never retries.
    #[must_use]
    pub const fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::ZERO,
            enabled: false,
        }
    }

    const fn attempts(&self) -> u32 {
        if self.enabled && self.max_attempts > 1 {
            self.max_attempts
        } else {
            1
        }
    }
}

/// Errors worth another rename attempt: the previous version of the target is
/// still held open by a handle the OS (or a scanner) has not released yet.
#[must_use]
pub fn is_transient_rename_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::PermissionDenied | io::ErrorKind::ResourceBusy
    )
}

/// Deterministic temp sibling of `target`.
#[must_use]
pub fn temp_path_for(target: &Path) -> PathBuf {
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_name = format!("{file_name}.{}{TEMP_SUFFIX}", std::process::id());
    match target.parent() {
        Some(parent) => parent.join(tmp_name),
        None => PathBuf::from(tmp_name),
    }
}

/// Write bytes to `path` atomically using the configured retry policy.
///
/// The parent directory must already exist.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    write_atomic_with(path, data, RenameRetryPolicy::from_config(&Config::get()))
}

/// Write bytes to `path` atomically with an explicit retry policy.
pub fn write_atomic_with(path: &Path, data: &[u8], policy: RenameRetryPolicy) -> Result<()> {
    write_atomic_using(path, data, policy, |from, to| fs::rename(from, to))
}

/// Serialize `value` as pretty JSON and write it atomically, creating the
/// parent directory through `dirs`.
pub fn write_json_atomic<T: Serialize + ?Sized>(
    path: &Path,
    value: &T,
    dirs: &DirCache,
    policy: RenameRetryPolicy,
) -> Result<()> {
    dirs.ensure_parent(path)?;
    let mut content = serde_json::to_vec_pretty(value)?;
    content.push(b'\n');
    write_atomic_with(path, &content, policy)
}

pub(crate) fn write_atomic_using<R>(
    path: &Path,
    data: &[u8],
    policy: RenameRetryPolicy,
    mut rename: R,
) -> Result<()>
where
    R: FnMut(&Path, &Path) -> io::Result<()>,
{
    let metrics = &global_metrics().storage;
    let tmp_path = temp_path_for(path);

    if let Err(e) = write_temp(&tmp_path, data) {
        let _ = fs::remove_file(&tmp_path);
        metrics.atomic_write_failures_total.inc();
        return Err(e.into());
    }

    let attempts = policy.attempts();
    let mut attempt = 1;
    loop {
        match rename(&tmp_path, path) {
            Ok(()) => {
                metrics.atomic_writes_total.inc();
                metrics
                    .atomic_write_bytes_total
                    .add(u64::try_from(data.len()).unwrap_or(u64::MAX));
                return Ok(());
            }
            Err(e) if attempt < attempts && is_transient_rename_error(&e) => {
                tracing::warn!(
                    path = %path.display(),
                    attempt,
                    max_attempts = attempts,
                    "transient rename failure, retrying: {e}"
                );
                metrics.rename_retries_total.inc();
                attempt += 1;
                std::thread::sleep(policy.backoff);
            }
            Err(e) => {
                // Best-effort cleanup of the temp file; the target is untouched.
                let _ = fs::remove_file(&tmp_path);
                metrics.atomic_write_failures_total.inc();
                if attempt > 1 {
                    return Err(StorageError::RenameExhausted {
                        path: path.to_path_buf(),
                        attempts: attempt,
                        source: e,
                    });
                }
                return Err(e.into());
            }
        }
    }
}

/// Remove temp siblings left behind by other (crashed) processes in `dir`.
///
/// Only names of the form `<file>.<pid>.tmp` whose pid differs from the
/// current process are touched; this process's own temps may be mid-write.
/// A missing directory counts as clean. Returns how many files were removed.
pub fn sweep_stale_temp_files(dir: &Path) -> Result<usize> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let own_pid = std::process::id();
    let mut removed = 0;
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(temp_owner_pid) else {
            continue;
        };
        if pid == own_pid {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => removed += 1,
            // Someone else swept it first.
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    if removed > 0 {
        tracing::info!(dir = %dir.display(), removed, "removed stale temp files");
    }
    Ok(removed)
}

/// Pid encoded in a temp sibling name, if `name` is one.
fn temp_owner_pid(name: &str) -> Option<u32> {
    let stem = name.strip_suffix(TEMP_SUFFIX)?;
    let (base, pid) = stem.rsplit_once('.')?;
    if base.is_empty() || pid.is_empty() || !pid.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    pid.parse().ok()
}

fn write_temp(tmp_path: &Path, data: &[u8]) -> io::Result<()> {
    // Scoped so the handle is closed before the rename.
    let mut f = fs::File::create(tmp_path)?;
    f.write_all(data)?;
    f.sync_data()
}
