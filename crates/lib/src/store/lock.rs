//! Advisory locking of a store root.
//!
//! Install and GC hold an exclusive `flock` on `<store>/.lock` while they run.
//! The exclusive holder writes a small JSON record into the file, which a
//! contending caller reads back to say who is in the way.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsFd;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use rustix::fs::{FlockOperation, flock};
use rustix::io::Errno;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::consts::STORE_LOCK_FILENAME;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
  Shared,
  Exclusive,
}

/// Who holds an exclusive store lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
  pub pid: u32,
  /// The kiln operation holding the lock, e.g. `install` or `gc`.
  pub command: String,
  /// Seconds since the Unix epoch.
  pub since: u64,
}

impl LockHolder {
  fn current(command: &str) -> Self {
    Self {
      pid: std::process::id(),
      command: command.to_string(),
      since: SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default(),
    }
  }
}

fn describe(holder: &Option<LockHolder>) -> String {
  match holder {
    Some(h) => format!(" by {} (pid {}, since {})", h.command, h.pid, h.since),
    None => String::new(),
  }
}

#[derive(Debug, Error)]
pub enum StoreLockError {
  #[error("store is locked{}; remove {} if no kiln process is running", describe(.holder), .lock_path.display())]
  Contention {
    lock_path: PathBuf,
    holder: Option<LockHolder>,
  },

  #[error("failed to {op} {path}: {source}")]
  Io {
    op: &'static str,
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

impl StoreLockError {
  fn io(op: &'static str, path: &Path, source: io::Error) -> Self {
    StoreLockError::Io {
      op,
      path: path.to_path_buf(),
      source,
    }
  }
}

/// A held store lock; released when dropped.
#[derive(Debug)]
pub struct StoreLock {
  file: File,
  path: PathBuf,
}

impl StoreLock {
  /// Takes the lock on `store` without waiting, creating the store if needed.
  pub fn acquire(store: &Path, mode: LockMode, command: &str) -> Result<Self, StoreLockError> {
    std::fs::create_dir_all(store).map_err(|e| StoreLockError::io("create", store, e))?;

    let path = store.join(STORE_LOCK_FILENAME);
    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(&path)
      .map_err(|e| StoreLockError::io("open", &path, e))?;

    let operation = match mode {
      LockMode::Shared => FlockOperation::NonBlockingLockShared,
      LockMode::Exclusive => FlockOperation::NonBlockingLockExclusive,
    };
    match flock(file.as_fd(), operation) {
      Ok(()) => {}
      Err(e) if e == Errno::WOULDBLOCK => {
        let holder = read_holder(&path);
        warn!(lock = ?path, command, "store lock is held elsewhere");
        return Err(StoreLockError::Contention { lock_path: path, holder });
      }
      Err(e) => return Err(StoreLockError::io("lock", &path, e.into())),
    }

    let lock = StoreLock { file, path };
    if mode == LockMode::Exclusive {
      lock.record(&LockHolder::current(command))?;
    }
    debug!(lock = ?lock.path, ?mode, command, "acquired store lock");
    Ok(lock)
  }

  fn record(&self, holder: &LockHolder) -> Result<(), StoreLockError> {
    let failed = |e: io::Error| StoreLockError::io("write", &self.path, e);
    let json = serde_json::to_vec(holder).map_err(|e| failed(io::Error::other(e)))?;
    let mut file = &self.file;
    file.set_len(0).map_err(failed)?;
    file.seek(SeekFrom::Start(0)).map_err(failed)?;
    file.write_all(&json).map_err(failed)
  }

  /// The record written by the exclusive holder, read through this handle.
  pub fn holder(&self) -> Result<LockHolder, StoreLockError> {
    let failed = |e: io::Error| StoreLockError::io("read", &self.path, e);
    let mut file = &self.file;
    file.seek(SeekFrom::Start(0)).map_err(failed)?;
    let mut contents = Vec::new();
    file.read_to_end(&mut contents).map_err(failed)?;
    serde_json::from_slice(&contents).map_err(|e| failed(io::Error::other(e)))
  }

  pub fn path(&self) -> &Path {
    &self.path
  }
}

/// Best effort: the holder may be mid-write or a shared locker with no record.
fn read_holder(path: &Path) -> Option<LockHolder> {
  let contents = std::fs::read(path).ok()?;
  serde_json::from_slice(&contents).ok()
}
