//! Advisory cross-process lock built on a sentinel file.
//!
//! Acquisition creates `<target>.lock` with `create_new`, which is atomic on
//! every filesystem we care about. Contenders poll until the sentinel is gone
//! or the timeout elapses. The returned [`LockGuard`] removes the sentinel on
//! drop, so early returns and `?` never leave a lock behind.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use log::{debug, warn};

use super::StoreError;

/// Timing knobs for sentinel acquisition, typically sourced from `[lock]` config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    pub timeout: Duration,
    pub poll_interval: Duration,
    /// A sentinel whose mtime is older than this is assumed to belong to a
    /// crashed process and is removed. `None` never breaks locks.
    pub stale_after: Option<Duration>,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(50),
            stale_after: Some(Duration::from_secs(120)),
        }
    }
}

/// Sentinel lock for one target file.
#[derive(Debug, Clone)]
pub struct FileLock {
    lock_path: PathBuf,
    opts: LockOptions,
}

/// Held lock; the sentinel is removed when this is dropped.
#[derive(Debug)]
pub struct LockGuard {
    lock_path: PathBuf,
    file: Option<File>,
}

impl FileLock {
    pub fn for_target(target: &Path, opts: LockOptions) -> Self {
        Self {
            lock_path: sentinel_path(target),
            opts,
        }
    }

    pub fn path(&self) -> &Path {
        &self.lock_path
    }

    /// Block (polling) until the sentinel is ours or the timeout expires.
    pub fn acquire(&self) -> Result<LockGuard, StoreError> {
        let started = Instant::now();
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.lock_path)
            {
                Ok(mut file) => {
                    let _ = writeln!(file, "{}", std::process::id());
                    return Ok(LockGuard {
                        lock_path: self.lock_path.clone(),
                        file: Some(file),
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if self.break_if_stale() {
                        continue;
                    }
                    let waited = started.elapsed();
                    if waited >= self.opts.timeout {
                        return Err(StoreError::LockTimeout {
                            path: self.lock_path.clone(),
                            waited,
                        });
                    }
                    std::thread::sleep(self.opts.poll_interval);
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    // Parent directory missing; the target cannot exist either.
                    if let Some(parent) = self.lock_path.parent() {
                        fs::create_dir_all(parent)?;
                    }
                }
                Err(e) => return Err(StoreError::Io(e)),
            }
        }
    }

    fn break_if_stale(&self) -> bool {
        let Some(stale_after) = self.opts.stale_after else {
            return false;
        };
        match age_of(&self.lock_path) {
            Some(age) if age >= stale_after => self.retire_stale(stale_after),
            _ => false,
        }
    }

    /// Move the sentinel aside and delete it only if the moved file is still
    /// stale. Another waiter may have replaced the stale sentinel with a live
    /// one between our age check and the rename; that one is put back.
    ///
    /// Returns true when acquisition should be retried immediately.
    fn retire_stale(&self, stale_after: Duration) -> bool {
        let tombstone = self.tombstone_path();
        match fs::rename(&self.lock_path, &tombstone) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return true,
            Err(e) => {
                debug!("Could not move stale lock {}: {}", self.lock_path.display(), e);
                return false;
            }
        }
        match age_of(&tombstone) {
            Some(age) if age >= stale_after => {
                warn!(
                    "Breaking stale lock {} (age {}s)",
                    self.lock_path.display(),
                    age.as_secs()
                );
                let _ = fs::remove_file(&tombstone);
                true
            }
            _ => {
                // hard_link never overwrites, so a sentinel created since stays
                if let Err(e) = fs::hard_link(&tombstone, &self.lock_path) {
                    warn!("Could not restore live lock {}: {}", self.lock_path.display(), e);
                }
                let _ = fs::remove_file(&tombstone);
                false
            }
        }
    }

    fn tombstone_path(&self) -> PathBuf {
        let mut name = self
            .lock_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(format!(".{}.stale", uuid::Uuid::new_v4().simple()));
        self.lock_path.with_file_name(name)
    }
}

fn age_of(path: &Path) -> Option<Duration> {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.lock_path
    }

    /// Release explicitly. Dropping the guard does the same thing.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.file.take().is_none() {
            return;
        }
        match fs::remove_file(&self.lock_path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Lock {} already gone at release", self.lock_path.display());
            }
            Err(e) => warn!("Failed to remove lock {}: {}", self.lock_path.display(), e),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// `thread.csv` → `thread.csv.lock`, `persona` → `persona.lock`.
pub fn sentinel_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    target.with_file_name(name)
}
