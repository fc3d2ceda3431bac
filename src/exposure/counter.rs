//! Persisted exposure sequence number.
//!
//! A plain integer in a per-user state directory, read at daemon start and
//! advanced under an advisory file lock before the next exposure reads it.
//! The stored value is the number the *next* exposure will use; committing
//! exposure `n` persists `n + 1`. An aborted exposure never commits, so its
//! number is reused.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::core::CounterStore;
use crate::error::{ArchonError, ArchonResult};

/// How long to wait on a contended lock before giving up.
const LOCK_WAIT: Duration = Duration::from_secs(5);
const LOCK_RETRY: Duration = Duration::from_millis(50);

/// File-backed [`CounterStore`].
pub struct FileCounterStore {
    path: PathBuf,
}

impl FileCounterStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Places the counter in the per-user state directory
    /// (`~/.local/state/archond/next_exposure_no` on Linux).
    pub fn in_user_state_dir() -> ArchonResult<Self> {
        let base = dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .ok_or_else(|| {
                ArchonError::Persist("no user state directory available".to_string())
            })?;
        let dir = base.join("archond");
        fs::create_dir_all(&dir)?;
        Ok(Self::new(dir.join("next_exposure_no")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_sync(path: &Path) -> ArchonResult<u64> {
        match fs::read_to_string(path) {
            Ok(text) => {
                let text = text.trim();
                if text.is_empty() {
                    Ok(1)
                } else {
                    text.parse().map_err(|_| {
                        ArchonError::Persist(format!(
                            "exposure counter {path:?} is corrupt: {text:?}"
                        ))
                    })
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(1),
            Err(err) => Err(err.into()),
        }
    }

    fn write_sync(path: &Path, next: u64) -> ArchonResult<()> {
        let _lock = CounterLock::acquire(path)?;
        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            writeln!(file, "{next}")?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        debug!(?path, next, "exposure counter advanced");
        Ok(())
    }
}

#[async_trait]
impl CounterStore for FileCounterStore {
    async fn peek(&self) -> ArchonResult<u64> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || FileCounterStore::read_sync(&path))
            .await
            .map_err(|err| ArchonError::Persist(format!("counter task failed: {err}")))?
    }

    async fn commit(&self, used: u64) -> ArchonResult<()> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || FileCounterStore::write_sync(&path, used + 1))
            .await
            .map_err(|err| ArchonError::Persist(format!("counter task failed: {err}")))?
    }
}

/// Advisory sidecar lock (`<counter>.lck`), exclusive by `create_new`.
struct CounterLock {
    path: PathBuf,
}

impl CounterLock {
    fn acquire(counter_path: &Path) -> ArchonResult<CounterLock> {
        let path = counter_path.with_extension("lck");
        let deadline = std::time::Instant::now() + LOCK_WAIT;
        loop {
            match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(CounterLock { path }),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if std::time::Instant::now() > deadline {
                        return Err(ArchonError::Persist(format!(
                            "exposure counter is locked ({path:?})"
                        )));
                    }
                    std::thread::sleep(LOCK_RETRY);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

impl Drop for CounterLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
