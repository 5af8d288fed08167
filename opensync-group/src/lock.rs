//! Single-engine-per-group advisory lock.

use crate::error::{GroupError, GroupResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const LOCK_FILE: &str = "lock";

/// Held for the lifetime of an engine over a group config directory.
///
/// The lock file is created on acquire and removed on clean release. A
/// lock file that still exists but is lockable was left behind by an
/// engine that died uncleanly; [`was_unclean`](Self::was_unclean) reports
/// that so the engine can force a slow sync.
#[derive(Debug)]
pub struct GroupLock {
    file: Option<File>,
    path: PathBuf,
    unclean: bool,
}

impl GroupLock {
    /// Acquires the lock for a group config directory.
    ///
    /// Fails with [`GroupError::Locked`] if another live engine holds it.
    pub fn acquire(configdir: &Path) -> GroupResult<Self> {
        let path = configdir.join(LOCK_FILE);
        let unclean = path.exists();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        if file.try_lock_exclusive().is_err() {
            return Err(GroupError::Locked(configdir.to_path_buf()));
        }
        if unclean {
            warn!(path = %path.display(), "stale lock file found, previous sync ended uncleanly");
        }
        debug!(path = %path.display(), "group lock acquired");
        Ok(Self {
            file: Some(file),
            path,
            unclean,
        })
    }

    /// True if the previous engine over this group died without releasing
    /// its lock.
    #[must_use]
    pub fn was_unclean(&self) -> bool {
        self.unclean
    }
}

impl Drop for GroupLock {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = fs2::FileExt::unlock(&file);
            drop(file);
            if let Err(e) = fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), "failed to remove lock file: {e}");
            }
        }
    }
}
