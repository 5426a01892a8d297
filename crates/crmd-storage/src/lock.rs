//! Advisory per-entity run lock around read-state, detect, write-state.
//!
//! The lock is an exclusive `flock` on `<dir>/<entity>.lock`, held through the open
//! file handle. The OS drops it when the holding process exits, so a crashed run never
//! blocks later ones. The file itself stays behind and only records the last holder.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use fs2::FileExt;
use thiserror::Error;
use tracing::{debug, warn};

use crate::state::file_stem;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another run holds the lock for {entity_type} ({path})")]
    Held { entity_type: String, path: PathBuf },
    #[error("lock file io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    /// Takes the lock without waiting; `LockError::Held` if a live run owns it.
    pub fn acquire(dir: &Path, entity_type: &str) -> Result<Self, LockError> {
        fs::create_dir_all(dir)?;
        let path = Self::path_for(dir, entity_type);
        // truncated only once the lock is ours
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::WouldBlock || is_contended(&err) => {
                return Err(LockError::Held {
                    entity_type: entity_type.to_string(),
                    path,
                })
            }
            Err(err) => return Err(err.into()),
        }

        file.set_len(0)?;
        writeln!(file, "pid={} acquired_at={}", std::process::id(), Utc::now().to_rfc3339())?;
        debug!(entity_type, path = %path.display(), "acquired run lock");
        Ok(Self { file, path })
    }

    pub fn path_for(dir: &Path, entity_type: &str) -> PathBuf {
        dir.join(format!("{}.lock", file_stem(entity_type)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(err) = self.file.unlock() {
            warn!(path = %self.path.display(), error = %err, "failed to release run lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn second_acquire_fails_until_release() {
        let dir = tempdir().expect("tempdir");
        let first = RunLock::acquire(dir.path(), "cases").expect("first lock");
        assert!(first.path().exists());

        let err = RunLock::acquire(dir.path(), "cases").expect_err("held");
        assert!(matches!(err, LockError::Held { .. }));

        // other entities are independent
        let _persons = RunLock::acquire(dir.path(), "persons").expect("persons lock");

        drop(first);
        RunLock::acquire(dir.path(), "cases").expect("reacquire");
    }

    #[test]
    fn lock_file_left_by_a_killed_run_does_not_block() {
        let dir = tempdir().expect("tempdir");
        let path = RunLock::path_for(dir.path(), "companies");
        std::fs::write(&path, "pid=4194303 acquired_at=2026-03-08T02:00:00+00:00\n")
            .expect("stale lock file");

        let lock = RunLock::acquire(dir.path(), "companies").expect("stale file is not a lock");
        let note = std::fs::read_to_string(lock.path()).expect("read");
        assert!(note.starts_with(&format!("pid={} ", std::process::id())));
    }

    #[test]
    fn lock_held_by_a_dead_handle_is_free_again() {
        let dir = tempdir().expect("tempdir");
        let path = RunLock::path_for(dir.path(), "companies");
        let holder = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .expect("open");
        holder.try_lock_exclusive().expect("holder lock");
        assert!(matches!(
            RunLock::acquire(dir.path(), "companies"),
            Err(LockError::Held { .. })
        ));

        // closing the descriptor without any unlock call is what process exit does
        drop(holder);
        RunLock::acquire(dir.path(), "companies").expect("reacquire after close");
    }
}
