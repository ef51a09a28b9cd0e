//! Per-repository exclusive lock shared across processes.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use fs2::FileExt;
use tracing::{debug, warn};

/// File name of the lock inside `<data_dir>/locks/<full name>/`.
pub const LOCK_FILE_NAME: &str = "repo.lock";

/// Pause between two acquisition attempts.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Held lock on one repository. Released on [`RepositoryLock::unlock`] or drop.
#[derive(Debug)]
pub struct RepositoryLock {
    file: Option<File>,
    path: Option<PathBuf>,
}

impl RepositoryLock {
    /// Block until the lock of `full_name` is held.
    ///
    /// With no data directory, locking is a no-op. Waiting never times out;
    /// only filesystem errors fail.
    pub fn acquire(data_dir: Option<&Path>, full_name: &str) -> Result<Self> {
        Self::acquire_with_interval(data_dir, full_name, RETRY_INTERVAL)
    }

    pub fn acquire_with_interval(
        data_dir: Option<&Path>,
        full_name: &str,
        retry_interval: Duration,
    ) -> Result<Self> {
        let Some(data_dir) = data_dir.filter(|dir| !dir.as_os_str().is_empty()) else {
            return Ok(Self {
                file: None,
                path: None,
            });
        };

        let dir = data_dir.join("locks").join(full_name);
        fs::create_dir_all(&dir)
            .with_context(|| format!("create lock directory {}", dir.display()))?;
        let path = dir.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("open lock file {}", path.display()))?;

        let mut waited = false;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(err) if err.kind() == fs2::lock_contended_error().kind() => {
                    if !waited {
                        debug!(repository = full_name, "repository locked, waiting");
                        waited = true;
                    }
                    thread::sleep(retry_interval);
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("lock {}", path.display()));
                }
            }
        }

        debug!(repository = full_name, "repository lock acquired");
        Ok(Self {
            file: Some(file),
            path: Some(path),
        })
    }

    /// Release the lock. Calling it again, or on a no-op lock, does nothing.
    pub fn unlock(&mut self) -> Result<()> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        let path = self.path.take().unwrap_or_default();
        FileExt::unlock(&file).with_context(|| format!("unlock {}", path.display()))?;
        Ok(())
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }
}

impl Drop for RepositoryLock {
    fn drop(&mut self) {
        if let Err(err) = self.unlock() {
            warn!(err = %err, "failed to release repository lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Instant;

    #[test]
    fn empty_data_dir_is_a_noop() {
        let mut lock = RepositoryLock::acquire(None, "github.com/org/repo").expect("lock");
        assert!(!lock.is_held());
        lock.unlock().expect("unlock");
        lock.unlock().expect("unlock twice");
    }

    #[test]
    fn creates_lock_file_under_full_name() {
        let temp = tempfile::tempdir().expect("tempdir");
        let lock = RepositoryLock::acquire(Some(temp.path()), "github.com/org/repo").expect("lock");
        assert!(lock.is_held());
        assert!(
            temp.path()
                .join("locks/github.com/org/repo")
                .join(LOCK_FILE_NAME)
                .exists()
        );
    }

    #[test]
    fn second_holder_waits_for_release() {
        let temp = tempfile::tempdir().expect("tempdir");
        let data_dir = temp.path().to_path_buf();
        let mut first =
            RepositoryLock::acquire(Some(&data_dir), "github.com/org/repo").expect("first lock");

        let (tx, rx) = mpsc::channel();
        let waiter_dir = data_dir.clone();
        let waiter = thread::spawn(move || {
            let start = Instant::now();
            let lock = RepositoryLock::acquire_with_interval(
                Some(&waiter_dir),
                "github.com/org/repo",
                Duration::from_millis(20),
            )
            .expect("second lock");
            tx.send(start.elapsed()).expect("send");
            drop(lock);
        });

        thread::sleep(Duration::from_millis(200));
        assert!(rx.try_recv().is_err(), "second lock acquired while first held");
        first.unlock().expect("unlock");
        let waited = rx.recv_timeout(Duration::from_secs(5)).expect("second acquired");
        assert!(waited >= Duration::from_millis(150));
        waiter.join().expect("join");
    }
}
