//! Sentinel marker files
//!
//! A channel named `<name>` is announced on the filesystem by two empty
//! files, `<name>` and `<name>_mutex`. Their presence means "a channel with
//! this name was set up"; the System V backend additionally derives its
//! `ftok` keys from them.

use crate::error::ShmResult;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Suffix of the lock sentinel
pub const MUTEX_SUFFIX: &str = "_mutex";

/// Paths of the two sentinel files of one channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentinels {
    primary: PathBuf,
    lock: PathBuf,
}

impl Sentinels {
    /// Sentinel paths of channel `name`
    pub fn for_channel(name: &str) -> Self {
        Self {
            primary: PathBuf::from(name),
            lock: PathBuf::from(format!("{name}{MUTEX_SUFFIX}")),
        }
    }

    /// Marker named exactly like the channel
    pub fn primary(&self) -> &Path {
        &self.primary
    }

    /// Marker of the area lock
    pub fn lock(&self) -> &Path {
        &self.lock
    }

    /// Both markers are present
    pub fn exist(&self) -> bool {
        self.primary.exists() && self.lock.exists()
    }

    /// Create whichever marker is missing. Existing files are left untouched.
    pub fn create(&self) -> ShmResult<()> {
        for path in [&self.primary, &self.lock] {
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .mode(0o666)
                .open(path)?;
        }
        debug!("Sentinels present for {}", self.primary.display());
        Ok(())
    }

    /// Delete both markers, ignoring ones that are already gone
    pub fn clean(&self) -> ShmResult<()> {
        for path in [&self.primary, &self.lock] {
            match std::fs::remove_file(path) {
                Ok(()) => debug!("Removed sentinel {}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
