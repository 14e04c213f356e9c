//! The content-addressed package store.
//!
//! # Layout
//!
//! ```text
//! store/
//! ├── _parent -> /other/store     # optional, layers this store on another
//! ├── .lock                       # held by install and gc
//! ├── <id>/                       # package contents, read-only once complete
//! │   └── .pkg-info.json
//! └── <id>.json                   # archive info side-car for substituted packages
//! ```
//!
//! A store is a ranked list of directories. Lookups scan them in order and the
//! first hit wins; new entries are always written to the first (active) one.

pub mod info;
pub mod lock;

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use crate::consts::{PKG_INFO_FILENAME, STORE_LOCK_FILENAME, STORE_PARENT_LINK};
use crate::platform::immutable::ImmutableError;
use crate::util::hash::PackageId;

pub use info::PkgInfo;
pub use lock::{LockHolder, LockMode, StoreLock, StoreLockError};

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("failed to {op} {path}: {source}")]
  Io {
    op: &'static str,
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("package not found in store: {0}")]
  NotFound(PackageId),

  #[error("invalid package info at {path}: {source}")]
  InvalidInfo {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error(transparent)]
  Immutable(#[from] ImmutableError),
}

impl StoreError {
  pub(crate) fn io(op: &'static str, path: &Path, source: io::Error) -> Self {
    StoreError::Io {
      op,
      path: path.to_path_buf(),
      source,
    }
  }

  /// True for a missing package or a missing file, the normal control-flow misses.
  pub fn is_not_found(&self) -> bool {
    match self {
      StoreError::NotFound(_) => true,
      StoreError::Io { source, .. } => source.kind() == io::ErrorKind::NotFound,
      _ => false,
    }
  }
}

#[derive(Debug, Clone)]
pub struct Store {
  paths: Vec<PathBuf>,
}

impl Store {
  /// Opens (creating if needed) the store at `dir` and every store it is layered on.
  pub fn open(dir: &Path) -> Result<Self, StoreError> {
    std::fs::create_dir_all(dir).map_err(|e| StoreError::io("create", dir, e))?;
    let active = dunce::canonicalize(dir).map_err(|e| StoreError::io("canonicalize", dir, e))?;

    let mut paths = vec![active.clone()];
    let mut seen = HashSet::from([active.clone()]);
    let mut current = active;
    while let Ok(parent) = dunce::canonicalize(current.join(STORE_PARENT_LINK))
      && parent.is_dir()
    {
      if !seen.insert(parent.clone()) {
        warn!(store = ?current, parent = ?parent, "store parent chain loops; stopping");
        break;
      }
      paths.push(parent.clone());
      current = parent;
    }

    debug!(paths = ?paths, "opened store");
    Ok(Self { paths })
  }

  /// All store directories, the active one first.
  pub fn paths(&self) -> &[PathBuf] {
    &self.paths
  }

  /// The directory new entries are written to.
  pub fn active(&self) -> &Path {
    &self.paths[0]
  }

  /// Where `id` lives (or would be written) in the active store.
  pub fn entry_path(&self, id: &PackageId) -> PathBuf {
    self.active().join(id.as_str())
  }

  /// Archive info side-car for `id`.
  pub fn sidecar_path(&self, id: &PackageId) -> PathBuf {
    self.active().join(format!("{id}.json"))
  }

  /// First store directory holding `id`.
  pub fn lookup(&self, id: &PackageId) -> Result<PathBuf, StoreError> {
    self
      .paths
      .iter()
      .map(|store| store.join(id.as_str()))
      .find(|entry| entry.is_dir())
      .ok_or_else(|| StoreError::NotFound(id.clone()))
  }

  /// Whether `id` is present anywhere in the chain with its package record.
  ///
  /// An entry directory without `.pkg-info.json` is a build that never finished.
  pub fn is_installed(&self, id: &PackageId) -> bool {
    self
      .lookup(id)
      .is_ok_and(|entry| entry.join(PKG_INFO_FILENAME).is_file())
  }

  /// Reads the `.pkg-info.json` of an installed package.
  pub fn read_info(&self, id: &PackageId) -> Result<PkgInfo, StoreError> {
    PkgInfo::read(&self.lookup(id)?)
  }

  /// Makes `dir` the active store, layered on the current one.
  ///
  /// An existing `_parent` link in `dir` is replaced.
  pub fn pivot(&mut self, dir: &Path) -> Result<(), StoreError> {
    std::fs::create_dir_all(dir).map_err(|e| StoreError::io("create", dir, e))?;
    let link = dir.join(STORE_PARENT_LINK);
    if link.symlink_metadata().is_ok() {
      std::fs::remove_file(&link).map_err(|e| StoreError::io("remove", &link, e))?;
    }
    std::os::unix::fs::symlink(self.active(), &link).map_err(|e| StoreError::io("symlink", &link, e))?;

    let previous = self.active().to_path_buf();
    *self = Self::open(dir)?;
    debug!(active = ?self.active(), parent = ?previous, "pivoted store");
    Ok(())
  }

  /// IDs of the entries in the active store, sorted.
  ///
  /// Skips the parent link, side-car files, the lock file and anything whose
  /// name is not a package ID.
  pub fn ids(&self) -> Result<Vec<PackageId>, StoreError> {
    let active = self.active();
    let entries = std::fs::read_dir(active).map_err(|e| StoreError::io("read", active, e))?;

    let mut ids = Vec::new();
    for entry in entries {
      let entry = entry.map_err(|e| StoreError::io("read", active, e))?;
      let name = entry.file_name();
      let Some(name) = name.to_str() else { continue };
      if name == STORE_PARENT_LINK || name == STORE_LOCK_FILENAME || name.ends_with(".json") {
        continue;
      }
      let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
      if !is_dir {
        continue;
      }
      if let Ok(id) = PackageId::parse(name) {
        ids.push(id);
      }
    }
    ids.sort();
    Ok(ids)
  }
}
