use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;

const MAX_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("failed to open lock file {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not acquire lock on {path} after {attempts} attempts")]
    Contended { path: PathBuf, attempts: u32 },
}

/// Cross-process advisory lock on a path. Guards every mutation of shared
/// files (the feature list, the progress log). Released on drop, so it
/// survives early returns.
///
/// Lock acquisition retries with exponential backoff, 100ms doubling up to
/// 2s, and gives up after 5 attempts.
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Acquire the lock for `target`, creating a sidecar `<target>.lock`.
    pub fn acquire(target: &Path) -> Result<Self, LockError> {
        let path = lock_path(target);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| LockError::Open {
                path: path.clone(),
                source,
            })?;

        let mut backoff = INITIAL_BACKOFF;
        for attempt in 1..=MAX_ATTEMPTS {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(Self { file, path }),
                Err(_) if attempt < MAX_ATTEMPTS => {
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(_) => break,
            }
        }
        Err(LockError::Contended {
            path,
            attempts: MAX_ATTEMPTS,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

fn lock_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "shared".into());
    name.push_str(".lock");
    target.with_file_name(name)
}

/// In-process cooperative mutex with FIFO handoff: release wakes the
/// earliest waiter. Never fails an operation, only blocks.
///
/// Thin wrapper over `tokio::sync::Mutex`, which queues waiters fairly.
/// Exists as a named type so the two long-lived locks in this crate (the
/// git mutex and the verification mutex) read as what they are.
pub struct FifoMutex {
    inner: tokio::sync::Mutex<()>,
}

impl FifoMutex {
    pub fn new() -> Self {
        Self {
            inner: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.inner.lock().await
    }
}

impl Default for FifoMutex {
    fn default() -> Self {
        Self::new()
    }
}
